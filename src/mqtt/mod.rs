//! # MQTT Integration Module
//!
//! Owns the single long-lived broker connection of the service. Built on
//! `rumqttc`, it adds a compile-time checked connection lifecycle, reconnects
//! with capped exponential backoff and hands every received publish to the
//! bridge controller over one ordered channel.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection settings and rumqttc options
//! ├── backoff.rs          - Reconnect delay schedule
//! ├── message_manager.rs  - Raw inbound messages and their channel
//! └── mqtt_handler.rs     - Connection state machine, publishing handle
//! ```
//!
//! ## Delivery Guarantees
//!
//! - QoS 0 in both directions, clean session
//! - Publishes that arrive during an outage are never replayed
//! - Replies are dropped, not queued, while the session is not connected

pub mod backoff;
pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
