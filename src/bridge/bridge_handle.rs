//! Bridge Handle - starts and stops the whole bridge
//!
//! Spawns two tokio tasks that share nothing but channels:
//!
//! 1. **Session task**: owns the rumqttc event loop, connects, reconnects with
//!    backoff and forwards publishes
//! 2. **Controller task**: handles one message at a time and publishes replies
//!    through a cloned [`SessionHandle`]
//!
//! Cancelling the shutdown token stops the session. Its inbound sender is
//! dropped with it, which ends the controller loop.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::controller::{BridgeController, SystemClock};
use super::BridgeStats;
use crate::config::BridgeSettings;
use crate::mqtt::message_manager::inbound_channel;
use crate::mqtt::mqtt_handler::{run_session, BrokerSession, ConnectionState, SessionHandle};

pub struct BridgeHandle {
    session: SessionHandle,
    session_task: JoinHandle<()>,
    controller_task: JoinHandle<BridgeStats>,
    shutdown: CancellationToken,
}

impl BridgeHandle {
    /// Spawns session and controller with the validated settings.
    pub fn spawn(settings: &BridgeSettings, shutdown: CancellationToken) -> Self {
        info!(
            "Starting bridge: broker {}, filter {}, trigger {:?}, timezone {}",
            settings.mqtt.broker_address(),
            settings.mqtt.subscription_filter,
            settings.trigger.as_str(),
            settings.timezone
        );

        let (inbound_tx, inbound_rx) = inbound_channel(settings.mqtt.channel_capacity);
        debug!(
            "Created inbound channel with capacity {}",
            settings.mqtt.channel_capacity
        );

        let (session, session_handle) =
            BrokerSession::create(&settings.mqtt, inbound_tx, shutdown.clone());

        let controller = BridgeController::new(
            settings.trigger.clone(),
            settings.reply_builder(),
            session_handle.clone(),
            SystemClock,
        );

        info!("Spawning broker session task");
        let session_task = tokio::spawn(run_session(session));

        info!("Spawning bridge controller task");
        let controller_task = tokio::spawn(controller.run(inbound_rx));

        Self {
            session: session_handle,
            session_task,
            controller_task,
            shutdown,
        }
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.subscribe_state()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits for both tasks to finish and returns the controller's counters.
    pub async fn join(self) -> BridgeStats {
        if let Err(e) = self.session_task.await {
            error!("Broker session task failed: {}", e);
        }

        match self.controller_task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Bridge controller task failed: {}", e);
                BridgeStats::default()
            }
        }
    }
}
