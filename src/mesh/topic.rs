//! Topic model for the Meshtastic JSON namespace
//!
//! ```text
//! Uplink  : msh/<REGION>/2/json/<CHANNEL>/!<gateway_id>
//! Downlink: msh/<REGION>/2/json/mqtt
//! ```
//!
//! Replies always go to the reserved `mqtt` channel, which is the entry point
//! gateways watch for broker-originated traffic. The channel a request arrived
//! on plays no part in where the reply is published.

use thiserror::Error;

use super::node::NodeId;

pub const TOPIC_ROOT: &str = "msh";
pub const PROTOCOL_VERSION: &str = "2";
pub const JSON_ENCODING: &str = "json";
pub const REPLY_CHANNEL: &str = "mqtt";
pub const ANY_REGION: &str = "+";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Malformed topic {topic:?}: {reason}")]
    Malformed { topic: String, reason: &'static str },
}

/// Structural segments of a mesh topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAddress {
    pub region: String,
    pub protocol_version: String,
    pub encoding: String,
    pub channel_name: String,
    pub node_suffix: Option<String>,
}

impl TopicAddress {
    /// Splits `topic` into its segments and checks the fixed markers.
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let malformed = |reason| TopicError::Malformed {
            topic: topic.to_string(),
            reason,
        };

        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 5 || parts.len() > 6 {
            return Err(malformed("unexpected segment count"));
        }
        if parts[0] != TOPIC_ROOT {
            return Err(malformed("unknown root"));
        }
        if parts[2] != PROTOCOL_VERSION {
            return Err(malformed("unsupported protocol version"));
        }
        if parts[3] != JSON_ENCODING {
            return Err(malformed("not a json topic"));
        }
        if parts[1].is_empty() {
            return Err(malformed("empty region"));
        }
        if parts[4].is_empty() {
            return Err(malformed("empty channel"));
        }

        let node_suffix = parts
            .get(5)
            .filter(|suffix| !suffix.is_empty())
            .map(|suffix| suffix.to_string());

        Ok(Self {
            region: parts[1].to_string(),
            protocol_version: parts[2].to_string(),
            encoding: parts[3].to_string(),
            channel_name: parts[4].to_string(),
            node_suffix,
        })
    }

    /// True for the reserved downlink channel. The uplink filter matches it
    /// too, so the bridge sees its own replies.
    pub fn is_reply_channel(&self) -> bool {
        self.channel_name == REPLY_CHANNEL
    }

    /// Gateway that uplinked the message, if the suffix is a `!hex` node id
    pub fn gateway_id(&self) -> Option<NodeId> {
        self.node_suffix
            .as_deref()
            .and_then(|suffix| NodeId::from_hex(suffix).ok())
    }

    pub fn downlink_topic(&self) -> String {
        downlink_topic(&self.region)
    }
}

pub fn downlink_topic(region: &str) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        TOPIC_ROOT, region, PROTOCOL_VERSION, JSON_ENCODING, REPLY_CHANNEL
    )
}

/// Filter for every channel and trailing segment under the JSON namespace.
/// `None` subscribes to all regions.
pub fn uplink_subscription_filter(region: Option<&str>) -> String {
    format!(
        "{}/{}/{}/{}/+/#",
        TOPIC_ROOT,
        region.unwrap_or(ANY_REGION),
        PROTOCOL_VERSION,
        JSON_ENCODING
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uplink_topic_with_gateway_suffix() {
        let address = TopicAddress::parse("msh/EU_868/2/json/LongFast/!aabbccdd").unwrap();
        assert_eq!(address.region, "EU_868");
        assert_eq!(address.protocol_version, "2");
        assert_eq!(address.encoding, "json");
        assert_eq!(address.channel_name, "LongFast");
        assert_eq!(address.node_suffix.as_deref(), Some("!aabbccdd"));
        assert_eq!(address.gateway_id(), Some(NodeId(0xaabbccdd)));
        assert!(!address.is_reply_channel());
    }

    #[test]
    fn suffix_is_optional() {
        let address = TopicAddress::parse("msh/US/2/json/mqtt").unwrap();
        assert_eq!(address.node_suffix, None);
        assert!(address.is_reply_channel());

        let trailing = TopicAddress::parse("msh/US/2/json/mqtt/").unwrap();
        assert_eq!(trailing.node_suffix, None);
    }

    #[test]
    fn rejects_wrong_layout() {
        for topic in [
            "msh/EU_868/2/json",
            "msh/EU_868/2/e/LongFast/!aabbccdd",
            "msh/EU_868/2/json/LongFast/!aabbccdd/extra",
            "foo/EU_868/2/json/LongFast/!aabbccdd",
            "msh/EU_868/1/json/LongFast/!aabbccdd",
            "msh//2/json/LongFast/!aabbccdd",
            "msh/EU_868/2/json//!aabbccdd",
            "",
        ] {
            assert!(
                matches!(TopicAddress::parse(topic), Err(TopicError::Malformed { .. })),
                "accepted {topic:?}"
            );
        }
    }

    #[test]
    fn downlink_ignores_request_channel() {
        for topic in [
            "msh/EU_868/2/json/LongFast/!aabbccdd",
            "msh/EU_868/2/json/MediumSlow/!11223344",
            "msh/EU_868/2/json/Private",
        ] {
            let address = TopicAddress::parse(topic).unwrap();
            assert_eq!(address.downlink_topic(), "msh/EU_868/2/json/mqtt");
        }
    }

    #[test]
    fn subscription_filter_covers_all_channels() {
        assert_eq!(uplink_subscription_filter(None), "msh/+/2/json/+/#");
        assert_eq!(
            uplink_subscription_filter(Some("EU_868")),
            "msh/EU_868/2/json/+/#"
        );
    }

    #[test]
    fn non_hex_suffix_has_no_gateway() {
        let address = TopicAddress::parse("msh/EU_868/2/json/LongFast/gateway").unwrap();
        assert_eq!(address.gateway_id(), None);
    }
}
