//! Mesh node identifiers
//!
//! Nodes appear in two forms: the numeric id used in JSON packets
//! (`2864434397`) and the hex form used in topics and `sender` fields
//! (`!aabbccdd`).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid node id: {0:?}")]
pub struct NodeIdError(pub String);

/// 32-bit mesh node number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Numeric form as it appears in the `from`/`to` fields of a packet
    pub fn as_wire(self) -> i64 {
        i64::from(self.0)
    }

    /// Parses the `!aabbccdd` form used in topic suffixes.
    pub fn from_hex(value: &str) -> Result<Self, NodeIdError> {
        let digits = value
            .strip_prefix('!')
            .ok_or_else(|| NodeIdError(value.to_string()))?;
        if digits.is_empty() || digits.len() > 8 {
            return Err(NodeIdError(value.to_string()));
        }
        u32::from_str_radix(digits, 16)
            .map(NodeId)
            .map_err(|_| NodeIdError(value.to_string()))
    }
}

// Accepts both `!aabbccdd` and plain decimal
impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.starts_with('!') {
            Self::from_hex(value)
        } else {
            value
                .parse::<u32>()
                .map(NodeId)
                .map_err(|_| NodeIdError(value.to_string()))
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}
