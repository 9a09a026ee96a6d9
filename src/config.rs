//! # Configuration
//!
//! Settings come from three layers, later ones winning:
//!
//! 1. built-in defaults
//! 2. `meshtime.toml` (`$MESHTIME_CONFIG`, or `<config dir>/meshtime/meshtime.toml`)
//! 3. `.env` file and process environment (`MQTT_HOST`, `TIMEZONE`, ...)
//!
//! [`Config::validate`] turns the raw layers into [`BridgeSettings`]. Every
//! check happens there, once, at startup; a failure is fatal. Nothing is
//! re-validated per message.
//!
//! ```toml
//! log_level = "info"
//!
//! [broker]
//! host = "localhost"
//! port = 1883
//! username = "meshtime"
//! password = "secret"
//!
//! [bridge]
//! trigger = "!time"
//! timezone = "Europe/Berlin"
//! node_id = "!aabbccdd"
//! region = "EU_868"
//!
//! [reconnect]
//! initial_delay_ms = 1000
//! max_delay_secs = 60
//! factor = 2
//! ```

use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn, Level};

use crate::mesh::node::{NodeId, NodeIdError};
use crate::mesh::topic::uplink_subscription_filter;
use crate::mesh::trigger::{EmptyTrigger, TriggerPhrase};
use crate::mesh::ReplyBuilder;
use crate::mqtt::backoff::Backoff;
use crate::mqtt::config::{Credentials, MqttConfig};

pub const CONFIG_PATH_ENV: &str = "MESHTIME_CONFIG";
const CONFIG_DIR: &str = "meshtime";
const CONFIG_FILE: &str = "meshtime.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error(transparent)]
    EmptyTrigger(#[from] EmptyTrigger),

    #[error("Missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("Invalid bridge node id: {0}")]
    InvalidNodeId(#[from] NodeIdError),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Raw configuration as read from file and environment
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub broker: BrokerConfig,
    pub bridge: BridgeConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Capacity of both the rumqttc request queue and the inbound channel
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "mesh-time-service".to_string(),
            keep_alive_secs: 60,
            channel_capacity: 100,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub trigger: String,
    /// IANA timezone name
    pub timezone: String,
    /// Sender id for replies; the uplinking gateway is used when unset
    pub node_id: Option<String>,
    /// Region to subscribe to; all regions when unset
    pub region: Option<String>,
    pub reply_type: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            trigger: "!time".to_string(),
            timezone: "UTC".to_string(),
            node_id: None,
            region: None,
            reply_type: "text".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_secs: u64,
    pub factor: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_secs: 60,
            factor: 2,
        }
    }
}

/// Validated, immutable settings the bridge runs with
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub mqtt: MqttConfig,
    pub trigger: TriggerPhrase,
    pub timezone: Tz,
    pub identity: Option<NodeId>,
    pub reply_type: String,
    pub log_level: Level,
}

impl BridgeSettings {
    pub fn reply_builder(&self) -> ReplyBuilder {
        ReplyBuilder::new(self.identity, self.timezone).with_message_type(self.reply_type.clone())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Overrides file values with the environment variables of the original
    /// deployment. `lookup` is `std::env::var` outside of tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.broker.port = port.trim().parse().map_err(|e| ConfigError::InvalidValue {
                field: "MQTT_PORT",
                reason: format!("{port:?}: {e}"),
            })?;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(region) = lookup("MQTT_REGION") {
            self.bridge.region = Some(region);
        }
        if let Some(timezone) = lookup("TIMEZONE") {
            self.bridge.timezone = timezone;
        }
        if let Some(trigger) = lookup("TIME_TRIGGER") {
            self.bridge.trigger = trigger;
        }
        if let Some(node_id) = lookup("BOT_NODE_ID") {
            self.bridge.node_id = Some(node_id);
        }
        if let Some(level) = lookup("MESHTIME_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<BridgeSettings, ConfigError> {
        let timezone = Tz::from_str(self.bridge.timezone.trim())
            .map_err(|_| ConfigError::UnknownTimezone(self.bridge.timezone.clone()))?;
        let trigger = TriggerPhrase::new(&self.bridge.trigger)?;

        let identity = non_empty(&self.bridge.node_id)
            .map(NodeId::from_str)
            .transpose()?;

        let credentials = match (
            non_empty(&self.broker.username),
            non_empty(&self.broker.password),
        ) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingCredentials("password")),
            (None, Some(_)) => return Err(ConfigError::MissingCredentials("username")),
        };

        let region = non_empty(&self.bridge.region);
        if let Some(region) = region {
            if region.contains(['/', '+', '#']) {
                return Err(ConfigError::InvalidValue {
                    field: "region",
                    reason: format!("{region:?} must be a single topic level"),
                });
            }
        }

        if self.broker.host.trim().is_empty() {
            return Err(invalid("host", "must not be empty"));
        }
        if self.broker.client_id.trim().is_empty() {
            return Err(invalid("client_id", "must not be empty"));
        }
        if self.broker.keep_alive_secs == 0 {
            return Err(invalid("keep_alive_secs", "must be at least 1"));
        }
        if self.broker.channel_capacity == 0 {
            return Err(invalid("channel_capacity", "must be at least 1"));
        }
        if self.bridge.reply_type.trim().is_empty() {
            return Err(invalid("reply_type", "must not be empty"));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_delay_ms == 0 || reconnect.factor == 0 {
            return Err(invalid("reconnect", "delay and factor must be positive"));
        }
        let initial = Duration::from_millis(reconnect.initial_delay_ms);
        let max = Duration::from_secs(reconnect.max_delay_secs);
        if max < initial {
            return Err(invalid("reconnect", "max delay is below initial delay"));
        }

        let log_level = if self.log_level.trim().is_empty() {
            Level::INFO
        } else {
            Level::from_str(self.log_level.trim()).map_err(|e| ConfigError::InvalidValue {
                field: "log_level",
                reason: e.to_string(),
            })?
        };

        Ok(BridgeSettings {
            mqtt: MqttConfig {
                host: self.broker.host.trim().to_string(),
                port: self.broker.port,
                client_id: self.broker.client_id.clone(),
                credentials,
                keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
                channel_capacity: self.broker.channel_capacity,
                subscription_filter: uplink_subscription_filter(region),
                backoff: Backoff::new(initial, max, reconnect.factor),
            },
            trigger,
            timezone,
            identity,
            reply_type: self.bridge.reply_type.trim().to_string(),
            log_level,
        })
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }

    let mut path = dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

/// Reads `path` if it exists; a missing file means defaults.
pub async fn read_config_file(path: &Path) -> Result<Config, ConfigError> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if !exists {
        info!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    debug!("Loaded config file {}", path.display());
    Config::from_toml(&content)
}

/// Loads all layers and validates them.
pub async fn load_settings() -> Result<BridgeSettings, ConfigError> {
    if let Ok(path) = dotenvy::dotenv() {
        debug!("Loaded environment from {}", path.display());
    }

    let mut config = read_config_file(&config_path()).await?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()
}
