//! Bridge controller - turns uplinked trigger messages into direct replies
//!
//! Processes exactly one message at a time, in the order the broker session
//! delivered them:
//!
//! ```text
//! (topic, payload) ─► TopicAddress ─► decode ─► trigger? ─► ReplyBuilder ─► encode ─► publish
//!                         │             │          │              │                     │
//!                         └─────────────┴──────────┴──────────────┴──── discard ────────┘
//! ```
//!
//! Discards never produce network traffic. The only trace of a non-match is
//! the missing reply and a log line.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{BridgeError, BridgeStats};
use crate::mesh::codec;
use crate::mesh::{ReplyBuilder, TopicAddress, TriggerPhrase};
use crate::mqtt::message_manager::InboundMessage;
use crate::mqtt::mqtt_handler::ReplyPublisher;

const STATS_INTERVAL: Duration = Duration::from_secs(300);

/// Source of the current instant
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    MalformedTopic,
    ReplyChannel,
    Undecodable,
    NotText,
    NoTrigger,
    NoSenderIdentity,
    Unencodable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Replied { topic: String, to: i64 },
    Discarded(DiscardReason),
    PublishFailed,
}

pub struct BridgeController<P: ReplyPublisher, C: Clock> {
    trigger: TriggerPhrase,
    builder: ReplyBuilder,
    publisher: P,
    clock: C,
    stats: BridgeStats,
}

impl<P: ReplyPublisher, C: Clock> BridgeController<P, C> {
    pub fn new(trigger: TriggerPhrase, builder: ReplyBuilder, publisher: P, clock: C) -> Self {
        info!(
            "Bridge controller ready: trigger {:?}, timezone {}",
            trigger.as_str(),
            builder.timezone()
        );
        Self {
            trigger,
            builder,
            publisher,
            clock,
            stats: BridgeStats::default(),
        }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Handles one raw broker message. Never fails; every error ends in a
    /// discard or a dropped reply.
    pub fn handle(&mut self, topic: &str, payload: &[u8]) -> MessageOutcome {
        self.stats.received += 1;

        let outcome = match self.process(topic, payload) {
            Ok(outcome) => outcome,
            Err(BridgeError::Topic(e)) => {
                debug!("Ignoring message: {}", e);
                MessageOutcome::Discarded(DiscardReason::MalformedTopic)
            }
            Err(BridgeError::Codec(codec::CodecError::Decode(e))) => {
                debug!("Cannot parse payload on {}: {}", topic, e);
                MessageOutcome::Discarded(DiscardReason::Undecodable)
            }
            Err(BridgeError::Codec(codec::CodecError::Encode(e))) => {
                warn!("Cannot encode reply for {}: {}", topic, e);
                MessageOutcome::Discarded(DiscardReason::Unencodable)
            }
            Err(BridgeError::Reply(e)) => {
                warn!("Time request on {} not answered: {}", topic, e);
                MessageOutcome::Discarded(DiscardReason::NoSenderIdentity)
            }
            Err(BridgeError::Session(e)) => {
                warn!("Reply dropped: {}", e);
                MessageOutcome::PublishFailed
            }
        };

        match &outcome {
            MessageOutcome::Replied { .. } => self.stats.replied += 1,
            MessageOutcome::Discarded(_) => self.stats.discarded += 1,
            MessageOutcome::PublishFailed => self.stats.publish_failures += 1,
        }
        outcome
    }

    fn process(&mut self, topic: &str, payload: &[u8]) -> Result<MessageOutcome, BridgeError> {
        let address = TopicAddress::parse(topic)?;

        // Our own downlink (and other bots') shows up under the uplink filter
        if address.is_reply_channel() {
            return Ok(MessageOutcome::Discarded(DiscardReason::ReplyChannel));
        }

        let message = codec::decode(payload)?;
        if !message.is_text() {
            return Ok(MessageOutcome::Discarded(DiscardReason::NotText));
        }

        let matched = message
            .payload_text
            .as_deref()
            .is_some_and(|text| self.trigger.is_in(text));
        if !matched {
            return Ok(MessageOutcome::Discarded(DiscardReason::NoTrigger));
        }

        info!(
            "Time request from node {:#x} via gateway {} on channel '{}' ({})",
            message.from,
            address.node_suffix.as_deref().unwrap_or("-"),
            address.channel_name,
            address.region
        );

        let reply = self
            .builder
            .build(&message, address.gateway_id(), self.clock.now())?;
        let bytes = codec::encode(&reply)?;
        let downlink = address.downlink_topic();

        self.publisher.publish(&downlink, bytes)?;
        info!("Published time reply to {}: {}", downlink, reply.payload_text);

        Ok(MessageOutcome::Replied {
            topic: downlink,
            to: reply.to,
        })
    }

    /// Consumes the inbound channel until the broker session closes it.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<InboundMessage>) -> BridgeStats {
        info!("Bridge controller started");
        let mut stats_timer = tokio::time::interval(STATS_INTERVAL);
        stats_timer.tick().await;

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => {
                        let outcome = self.handle(&message.topic, &message.payload);
                        debug!("{} -> {:?}", message.topic, outcome);
                    }
                    None => break,
                },
                _ = stats_timer.tick() => info!("Bridge stats: {}", self.stats),
            }
        }

        info!("Bridge controller stopped: {}", self.stats);
        self.stats
    }
}
