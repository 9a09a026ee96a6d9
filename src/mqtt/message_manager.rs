use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc;

/// Raw publish as received from the broker, before any parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(80).collect();
        write!(
            f,
            "{} {} ({} bytes) {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload.len(),
            preview
        )
    }
}

impl InboundMessage {
    pub fn from_topic(topic: String, payload: Vec<u8>) -> Self {
        InboundMessage {
            topic,
            payload,
            received_at: Local::now(),
        }
    }
}

/// Single ordered path from the broker session to the bridge controller
pub fn inbound_channel(
    capacity: usize,
) -> (mpsc::Sender<InboundMessage>, mpsc::Receiver<InboundMessage>) {
    mpsc::channel(capacity)
}
