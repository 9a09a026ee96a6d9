use std::time::Duration;

use rumqttc::MqttOptions;

use super::backoff::Backoff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Everything the broker session needs to open and keep its connection
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub channel_capacity: usize,
    pub subscription_filter: String,
    pub backoff: Backoff,
}

impl MqttConfig {
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    // Clean session: nothing published during an outage is replayed
    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true);
        if let Some(credentials) = &self.credentials {
            options.set_credentials(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }
        options
    }
}
