//! JSON codec for mesh packets
//!
//! Both directions share one wire schema:
//!
//! ```text
//! {"from":2864434397,"to":-1,"type":"text","payload":"!time","sender":"!aabbccdd","channel":0}
//! ```
//!
//! Only these fields are kept. Firmware uplinks carry more (`id`,
//! `timestamp`, `rssi` and so on); decoding ignores them, so a decoded
//! uplink does not re-encode to its original bytes. Outgoing fields are
//! written in the order shown and absent optionals are omitted.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Message type that carries human-readable text
pub const TEXT_MESSAGE_TYPE: &str = "text";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Decode error: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Packet uplinked by a gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMeshMessage {
    pub from: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<i64>,

    #[serde(rename = "type")]
    pub message_type: String,

    // Non-text packets carry objects here; those decode as no text at all
    #[serde(
        rename = "payload",
        default,
        deserialize_with = "text_only",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_text: Option<String>,

    #[serde(rename = "sender", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,

    #[serde(rename = "channel", default, skip_serializing_if = "Option::is_none")]
    pub channel_index: Option<u32>,
}

impl IncomingMeshMessage {
    pub fn is_text(&self) -> bool {
        self.message_type == TEXT_MESSAGE_TYPE
    }
}

/// Direct reply sent back down to the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingReplyMessage {
    pub from: i64,
    pub to: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(rename = "payload")]
    pub payload_text: String,
    #[serde(rename = "channel")]
    pub channel_index: u32,
}

fn text_only<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(text)) => Some(text),
        _ => None,
    })
}

pub fn decode(bytes: &[u8]) -> Result<IncomingMeshMessage, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

pub fn encode<M: Serialize>(message: &M) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(CodecError::Encode)
}
