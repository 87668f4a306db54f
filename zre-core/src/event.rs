//! Events emitted to the owner application. Each variant carries the
//! subject peer's UUID and name plus event-specific fields.

use std::collections::HashMap;

use crate::identity::NodeUuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A peer completed HELLO and is ready to talk.
    Enter {
        uuid: NodeUuid,
        name: String,
        headers: HashMap<String, String>,
        endpoint: String,
    },
    /// A peer was removed (farewell beacon, expiry, protocol violation,
    /// link closure or endpoint collision).
    Exit { uuid: NodeUuid, name: String },
    /// A peer went silent past the evasive deadline and was pinged.
    Evasive { uuid: NodeUuid, name: String },
    /// A peer joined a group.
    Join {
        uuid: NodeUuid,
        name: String,
        group: String,
    },
    /// A peer left a group.
    Leave {
        uuid: NodeUuid,
        name: String,
        group: String,
    },
    /// Unicast content from a peer.
    Whisper {
        uuid: NodeUuid,
        name: String,
        content: Vec<Vec<u8>>,
    },
    /// Group content from a peer.
    Shout {
        uuid: NodeUuid,
        name: String,
        group: String,
        content: Vec<Vec<u8>>,
    },
    /// This node stopped; carries our own identity.
    Stop { uuid: NodeUuid, name: String },
}
