pub mod bridge;
pub mod config;
pub mod mesh;
pub mod mqtt;

use crate::bridge::BridgeHandle;
use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, Registry};

/// Handle for raising or lowering the log level after startup
type LogLevelHandle = reload::Handle<LevelFilter, Registry>;

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = setup()?;

    // Settings are validated once; any error here is fatal
    let settings = config::load_settings()
        .await
        .map_err(|e| eyre!("Invalid configuration: {}", e))?;
    log_level.reload(LevelFilter::from_level(settings.log_level))?;

    info!("Starting Meshtastic MQTT Time Service");
    info!("  Broker   : {}", settings.mqtt.broker_address());
    info!("  Filter   : {}", settings.mqtt.subscription_filter);
    info!("  Timezone : {}", settings.timezone);
    info!("  Trigger  : {}", settings.trigger.as_str());
    match settings.identity {
        Some(id) => info!("  Node id  : {}", id),
        None => info!("  Node id  : uplinking gateway"),
    }

    let shutdown = CancellationToken::new();
    let bridge = BridgeHandle::spawn(&settings, shutdown.clone());

    shutdown_signal().await;
    bridge.shutdown();

    let stats = bridge.join().await;
    info!("Stopped: {}", stats);
    Ok(())
}

// Ctrl-C, or SIGTERM from a container runtime
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Interrupt received, shutting down"),
        _ = terminate => info!("Terminate received, shutting down"),
    }
}

fn setup() -> Result<LogLevelHandle> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(setup_logging_env())
}

// Starts at INFO so config loading is logged; the configured level is
// applied through the returned handle once settings are valid
fn setup_logging_env() -> LogLevelHandle {
    let (subscriber, handle) = build_subscriber(std::io::stdout);
    subscriber.init();
    handle
}

fn build_subscriber<W>(writer: W) -> (impl Subscriber + Send + Sync + 'static, LogLevelHandle)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let (filter, handle) = reload::Layer::new(LevelFilter::INFO);
    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(writer)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true),
    );
    (subscriber, handle)
}
