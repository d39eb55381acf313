// Notifications a node raises for its application (UI, simulation glue).
//
// Sessions push these while handling transport events and timers; the
// application drains them with `Node::poll_events`. Nothing in the core
// waits on the application to consume them.

use rally_protocol::{ColorTag, ConnectionId, EntityId, HostStatus, Message, PersistentId, RoomId};

use crate::error::SessionError;
use crate::state::JoinerStatus;

#[derive(Debug)]
pub enum SessionEvent {
    // -- Joiner side --
    /// The joiner's user-visible status changed.
    StatusChanged(JoinerStatus),
    Welcomed {
        your_id: ConnectionId,
        color: ColorTag,
    },
    GameStarted,
    PeerJoined {
        id: ConnectionId,
    },
    PeerLeft {
        id: ConnectionId,
    },
    ColorsChanged,
    StateUpdated {
        full_sync: bool,
    },
    /// Host traffic the session does not interpret (skill casts, damage,
    /// experience, party bonus, forwarded invites). On the host, gameplay
    /// reports from joiners after authority checks.
    Gameplay {
        from: ConnectionId,
        message: Message,
    },
    /// A join or rejoin attempt failed.
    JoinFailed(SessionError),

    // -- Host side --
    JoinerJoined {
        id: ConnectionId,
        persistent_id: Option<PersistentId>,
        color: ColorTag,
    },
    /// A device rejoined and took over its old slot.
    JoinerReconnected {
        old: ConnectionId,
        new: ConnectionId,
        color: ColorTag,
    },
    JoinerLeft {
        id: ConnectionId,
    },
    EnemyKilled {
        enemy_id: EntityId,
        killer: Option<ConnectionId>,
        experience: u32,
    },
    /// Somebody invited this device into a room.
    InviteReceived {
        room_id: RoomId,
        from_name: Option<String>,
    },
    /// A status probe was answered.
    StatusProbed {
        from: ConnectionId,
        state: HostStatus,
    },

    // -- Both --
    /// A message was dropped as malformed or invalid.
    ProtocolError {
        from: ConnectionId,
        reason: String,
    },
}
