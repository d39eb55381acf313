// Message classification for both roles.
//
// Routing is split in two so that nothing here mutates session state:
//
// - Phase 0, `peek`: the first payload on an unadmitted host-side connection
//   decides what the connection is for. Status and invite probes are
//   answered and closed without ever touching the directory; anything else
//   is a join and proceeds to admission (phase 1, in `host.rs`).
// - Post-admission, `host_route` / `joiner_route` map each message to the
//   handler class that should see it, or to a reason for dropping it.
//
// Authority comes from `Message::direction()`, itself an exhaustive match,
// so a new wire tag does not compile until it has a direction. The host
// refuses downlink, the joiner refuses uplink (except the two kinds the host
// re-broadcasts), and a probe after admission is out of phase. A tag with
// the right direction but no handler is refused too.

use rally_protocol::{Message, MessageDirection, PersistentId, RoomId};

/// Per-connection handshake state on the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Channel open, first payload not yet seen. Holds the connect metadata
    /// until admission needs it.
    Probing { persistent_id: Option<PersistentId> },
    /// Admitted to the directory.
    Joined,
}

/// Intent of a connection, decided by its first payload.
#[derive(Clone, Debug, PartialEq)]
pub enum FirstContact {
    StatusProbe,
    InviteProbe {
        room_id: RoomId,
        from_name: Option<String>,
        target: Option<PersistentId>,
    },
    /// Admit, then dispatch the message as ordinary gameplay.
    Join(Message),
}

/// Decide what an unadmitted connection wants.
pub fn peek(msg: Message) -> FirstContact {
    match msg {
        Message::StatusRequest => FirstContact::StatusProbe,
        Message::InviteRequest {
            room_id,
            from_name,
            target,
        } => FirstContact::InviteProbe {
            room_id,
            from_name,
            target,
        },
        other => FirstContact::Join(other),
    }
}

/// How the host treats a message from an admitted joiner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostRoute {
    Input,
    Position,
    SkillCast,
    Damage,
    EnemyKilled,
    StartRequest,
    /// Host-to-joiner traffic arriving at the host.
    AuthorityViolation,
    /// A probe sent after admission.
    ProbeOutOfPhase,
}

pub fn host_route(msg: &Message) -> HostRoute {
    match (msg.direction(), msg) {
        (MessageDirection::Probe, _) => HostRoute::ProbeOutOfPhase,
        (MessageDirection::HostToJoiner, _) => HostRoute::AuthorityViolation,
        (_, Message::PlayerInput(_)) => HostRoute::Input,
        (_, Message::PlayerPosition { .. }) => HostRoute::Position,
        (_, Message::SkillCast(_)) => HostRoute::SkillCast,
        (_, Message::PlayerDamage { .. }) => HostRoute::Damage,
        (_, Message::EnemyKilled { .. }) => HostRoute::EnemyKilled,
        (_, Message::RequestStartGame) => HostRoute::StartRequest,
        // Uplink without a handler is refused.
        _ => HostRoute::AuthorityViolation,
    }
}

/// How a joiner treats a message from its host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinerRoute {
    Welcome,
    StartGame,
    Roster,
    Colors,
    State,
    /// Forwarded to the application untouched (skill casts, damage,
    /// experience, party bonus).
    Gameplay,
    /// An invite the host forwarded to us.
    Invite,
    HostLeft,
    Kicked,
    /// Joiner-only uplink traffic arriving at a joiner.
    AuthorityViolation,
    ProbeOutOfPhase,
}

pub fn joiner_route(msg: &Message) -> JoinerRoute {
    match (msg.direction(), msg) {
        (MessageDirection::Probe, _) => JoinerRoute::ProbeOutOfPhase,
        // The host re-broadcasts these two, so they are legal downlink even
        // though they originate as uplink.
        (_, Message::SkillCast(_) | Message::PlayerDamage { .. }) => JoinerRoute::Gameplay,
        (MessageDirection::JoinerToHost, _) => JoinerRoute::AuthorityViolation,
        (_, Message::Welcome { .. }) => JoinerRoute::Welcome,
        (_, Message::StartGame) => JoinerRoute::StartGame,
        (_, Message::PlayerJoined { .. } | Message::PlayerLeft { .. }) => JoinerRoute::Roster,
        (_, Message::PlayerColors { .. }) => JoinerRoute::Colors,
        (_, Message::GameState(_) | Message::EnemiesRemoved { .. }) => JoinerRoute::State,
        (_, Message::ShareExperience { .. } | Message::PartyBonusUpdate { .. }) => {
            JoinerRoute::Gameplay
        }
        (_, Message::InviteFromHost { .. }) => JoinerRoute::Invite,
        (_, Message::HostLeft) => JoinerRoute::HostLeft,
        (_, Message::Kicked { .. }) => JoinerRoute::Kicked,
        // Downlink without a handler is refused.
        _ => JoinerRoute::AuthorityViolation,
    }
}
