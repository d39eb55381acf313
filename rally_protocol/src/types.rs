// Core ID types for the session protocol.
//
// These are lightweight newtypes used by `message.rs` and by the session
// crate's directory, router, and sync engine. All of them serialize as bare
// strings (or a bare integer for `InputSequence`) so the JSON wire shape
// matches the `gameState` payload described in `message.rs`.
//
// Identity relationships worth keeping straight:
// - `PersistentId` is bound to one device install and survives restarts. It
//   is used for reconnect dedup only, never for routing.
// - `ConnectionId` is the transport address of the *current* connection.
//   Joiners get a fresh one on every (re)join.
// - `RoomId` is the host's `ConnectionId`, which in turn is the host's
//   `PersistentId`. That is what makes "resume = same room" work.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable per-install identity. Created once, immutable thereafter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistentId(pub String);

/// Transport-level peer address for the current connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

/// Address of a host's endpoint. Equal to the host's `ConnectionId`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

/// Host-assigned identifier for a world entity (enemy, pickup, projectile).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

/// Player color slot, e.g. `"#e74c3c"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColorTag(pub String);

/// Per-joiner monotonic input sequence number. Lets the host discard a
/// stale input that arrives after a newer one was already applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputSequence(pub u64);

impl PersistentId {
    /// The room a host with this identity listens on.
    pub fn as_room_id(&self) -> RoomId {
        RoomId(self.0.clone())
    }
}

impl RoomId {
    /// The transport address a joiner dials to reach this room.
    pub fn as_connection_id(&self) -> ConnectionId {
        ConnectionId(self.0.clone())
    }
}

impl fmt::Display for PersistentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ColorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for PersistentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for ColorTag {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
