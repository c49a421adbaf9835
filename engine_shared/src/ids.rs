//! Identity newtypes shared by the wire protocol and the object tree.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a client.
///
/// `-1` is the server (or nobody), `0` the local player of a singleplayer
/// session, and positive values are connected clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub i32);

impl ClientId {
    pub const SERVER: Self = ClientId(-1);
    pub const LOCAL: Self = ClientId(0);
}

impl Default for ClientId {
    fn default() -> Self {
        Self::SERVER
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network identity of a replicated object. `-1` until the authoritative
/// allocator assigns one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId(pub i32);

impl NetworkId {
    pub const UNASSIGNED: Self = NetworkId(-1);

    pub fn is_assigned(self) -> bool {
        self.0 >= 0
    }
}

impl Default for NetworkId {
    fn default() -> Self {
        Self::UNASSIGNED
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
