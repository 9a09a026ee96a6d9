//! Bridge subsystem connecting the broker session to the mesh protocol layer
//!
//! 1. [`controller`] - per-message pipeline from uplink to reply
//! 2. [`bridge_handle`] - spawns session and controller tasks and owns shutdown
//!
//! # Architecture
//!
//! ```text
//! Broker ──► BrokerSession ──[InboundMessage]──► BridgeController ──► SessionHandle ──► Broker
//!            (session task)   (mpsc, ordered)    (controller task)    (try_publish)
//! ```

pub mod bridge_handle;
pub mod controller;

pub use bridge_handle::BridgeHandle;
pub use controller::{BridgeController, Clock, DiscardReason, MessageOutcome, SystemClock};

use std::fmt;

use crate::mesh::{CodecError, ReplyError, TopicError};
use crate::mqtt::mqtt_handler::SessionError;

/// Failures inside one pass through the controller pipeline
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Reply error: {0}")]
    Reply(#[from] ReplyError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Counters owned by the controller task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub received: u64,
    pub replied: u64,
    pub discarded: u64,
    pub publish_failures: u64,
}

impl fmt::Display for BridgeStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} received, {} replied, {} discarded, {} publish failures",
            self.received, self.replied, self.discarded, self.publish_failures
        )
    }
}
