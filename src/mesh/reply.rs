//! Reply construction
//!
//! A reply is always a direct message back to whoever asked: `to` is the
//! `from` of the request. The time is injected by the caller so rendering can
//! be tested against fixed instants.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::debug;

use super::codec::{IncomingMeshMessage, OutgoingReplyMessage, TEXT_MESSAGE_TYPE};
use super::node::NodeId;

pub const REPLY_PREFIX: &str = "Current time: ";

// Offset is kept next to the abbreviation so the text maps back to one instant
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z (%:z)";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplyError {
    /// Neither a configured bridge id nor a gateway id in the topic
    #[error("No sender identity available for reply to {0}")]
    NoSenderIdentity(i64),
}

#[derive(Debug, Clone)]
pub struct ReplyBuilder {
    identity: Option<NodeId>,
    timezone: Tz,
    message_type: String,
}

impl ReplyBuilder {
    pub fn new(identity: Option<NodeId>, timezone: Tz) -> Self {
        Self {
            identity,
            timezone,
            message_type: TEXT_MESSAGE_TYPE.to_string(),
        }
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Builds the reply for `incoming`. `gateway` is the node that uplinked the
    /// request and stands in as sender when no bridge identity is configured.
    pub fn build(
        &self,
        incoming: &IncomingMeshMessage,
        gateway: Option<NodeId>,
        now: DateTime<Utc>,
    ) -> Result<OutgoingReplyMessage, ReplyError> {
        let sender = self
            .identity
            .or(gateway)
            .ok_or(ReplyError::NoSenderIdentity(incoming.from))?;

        let payload_text = render_time(now, self.timezone);
        debug!("Rendered reply text for {}: {}", incoming.from, payload_text);

        Ok(OutgoingReplyMessage {
            from: sender.as_wire(),
            to: incoming.from,
            message_type: self.message_type.clone(),
            payload_text,
            channel_index: incoming.channel_index.unwrap_or(0),
        })
    }
}

pub fn render_time(now: DateTime<Utc>, timezone: Tz) -> String {
    format!(
        "{}{}",
        REPLY_PREFIX,
        now.with_timezone(&timezone).format(TIME_FORMAT)
    )
}
