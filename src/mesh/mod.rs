//! # Mesh Protocol Layer
//!
//! Pure, stateless building blocks for the Meshtastic JSON namespace. Nothing
//! in here touches the network or the clock; the bridge controller feeds
//! topics, payload bytes and the current instant in from outside.
//!
//! ```text
//! mesh/
//! ├── topic.rs    - uplink/downlink topic parsing and construction
//! ├── node.rs     - `!aabbccdd` <-> numeric node ids
//! ├── codec.rs    - JSON packet decoding/encoding
//! ├── trigger.rs  - case-insensitive trigger phrase detection
//! └── reply.rs    - direct time reply construction
//! ```

pub mod codec;
pub mod node;
pub mod reply;
pub mod topic;
pub mod trigger;

pub use codec::{CodecError, IncomingMeshMessage, OutgoingReplyMessage};
pub use node::NodeId;
pub use reply::{ReplyBuilder, ReplyError};
pub use topic::{TopicAddress, TopicError};
pub use trigger::TriggerPhrase;
