// Protocol messages exchanged between a host and its joiners.
//
// `Message` is one closed sum type covering every wire tag. The serde
// representation is internally tagged (`{"type": "gameState", ...}`) with
// camelCase variant and field names, so the JSON form is exactly what a
// browser peer would produce. The same derive drives the MessagePack codec
// (see `codec.rs`), which is why every struct serializes with named fields.
//
// Each tag belongs to one direction (`MessageDirection`): joiner→host
// gameplay uplink, host→joiner state/notifications, or the probe phase that
// happens before a connection is admitted. The session crate uses this to
// drop messages that arrive from the wrong side (authority violations)
// without having to repeat the classification per handler.
//
// Supporting structs (`PlayerState`, `EntityState`, `GameState`,
// `PlayerInput`, `SkillCast`) are shared by both directions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ColorTag, ConnectionId, EntityId, InputSequence, PersistentId, RoomId};

/// Every message that can travel over a session connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    /// Admission accepted. Sent once to a freshly admitted joiner.
    Welcome {
        your_id: ConnectionId,
        room_id: RoomId,
        color: ColorTag,
        colors: BTreeMap<ConnectionId, ColorTag>,
        players: Vec<ConnectionId>,
        game_running: bool,
    },
    /// The match is running; joiners leave the lobby.
    StartGame,
    /// Another participant was admitted.
    PlayerJoined {
        id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<ColorTag>,
    },
    /// A participant left, was kicked, or was superseded by a reconnect.
    PlayerLeft { id: ConnectionId },
    /// Current color assignment for every participant, host included.
    PlayerColors {
        colors: BTreeMap<ConnectionId, ColorTag>,
    },
    /// Latest coalesced input from a joiner.
    PlayerInput(PlayerInput),
    /// Joiner's true last-known location, sent once per (re)connection or
    /// resume so the host can re-seed its simulation.
    PlayerPosition { position: [f32; 3], rotation: f32 },
    /// A skill was used. The host re-broadcasts it with `caster` filled in.
    SkillCast(SkillCast),
    /// Damage dealt to a player.
    PlayerDamage {
        target: ConnectionId,
        amount: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// A joiner reports a kill. The host decides whether it counts.
    EnemyKilled {
        enemy_id: EntityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        killer: Option<ConnectionId>,
    },
    /// Experience awarded to every party member.
    ShareExperience {
        amount: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<EntityId>,
    },
    /// Party size changed; experience multiplier follows.
    PartyBonusUpdate { party_size: u32, multiplier: f32 },
    /// Per-tick snapshot of players and world entities.
    GameState(GameState),
    /// Entities the host removed authoritatively outside the tick cadence.
    EnemiesRemoved { ids: Vec<EntityId> },
    /// Ask the host to start (or confirm an already running) match.
    RequestStartGame,
    /// Probe: ask what the host is doing. Answered with `Status`, then closed.
    StatusRequest,
    /// Answer to `StatusRequest`.
    Status { state: HostStatus },
    /// Probe: invite the receiving device into `room_id`.
    InviteRequest {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_name: Option<String>,
        /// When set, the invite is meant for the device with this identity,
        /// which may currently be a joiner of the receiving host.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<PersistentId>,
    },
    /// An invite forwarded by the host to one of its joiners.
    InviteFromHost {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_name: Option<String>,
    },
    /// The host is closing this connection on purpose. Do not reconnect.
    Kicked {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The host is shutting the room down on purpose. Do not reconnect.
    HostLeft,
}

/// What a host reports when probed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// Room is open, match not started.
    Hosting,
    /// Match is running.
    Ingame,
}

/// Which side is allowed to originate a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageDirection {
    JoinerToHost,
    HostToJoiner,
    /// Only meaningful as the first payload on an unadmitted connection,
    /// or as the reply to one.
    Probe,
}

/// Player block entry of a `gameState` snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub position: [f32; 3],
    pub rotation: f32,
    pub animation: String,
    pub model_id: String,
    pub player_color: ColorTag,
}

/// Serializable state of one world entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub kind: String,
    pub position: [f32; 3],
    pub rotation: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation: Option<String>,
    /// Experience shared out when this entity is killed.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub experience: u32,
}

/// Body of a `gameState` message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub players: BTreeMap<ConnectionId, PlayerState>,
    pub entities: BTreeMap<EntityId, EntityState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_ids: Vec<EntityId>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub full_sync: bool,
}

/// Body of a `playerInput` message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInput {
    pub sequence: InputSequence,
    /// Planar movement intent, each axis in `-1.0..=1.0`.
    pub movement: [f32; 2],
    pub rotation: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

/// Body of a `skillCast` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillCast {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caster: Option<ConnectionId>,
    pub skill: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f32>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Message {
    /// The wire tag, identical to the serialized `type` field.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Welcome { .. } => "welcome",
            Message::StartGame => "startGame",
            Message::PlayerJoined { .. } => "playerJoined",
            Message::PlayerLeft { .. } => "playerLeft",
            Message::PlayerColors { .. } => "playerColors",
            Message::PlayerInput(_) => "playerInput",
            Message::PlayerPosition { .. } => "playerPosition",
            Message::SkillCast(_) => "skillCast",
            Message::PlayerDamage { .. } => "playerDamage",
            Message::EnemyKilled { .. } => "enemyKilled",
            Message::ShareExperience { .. } => "shareExperience",
            Message::PartyBonusUpdate { .. } => "partyBonusUpdate",
            Message::GameState(_) => "gameState",
            Message::EnemiesRemoved { .. } => "enemiesRemoved",
            Message::RequestStartGame => "requestStartGame",
            Message::StatusRequest => "statusRequest",
            Message::Status { .. } => "status",
            Message::InviteRequest { .. } => "inviteRequest",
            Message::InviteFromHost { .. } => "inviteFromHost",
            Message::Kicked { .. } => "kicked",
            Message::HostLeft => "hostLeft",
        }
    }

    /// Which side may originate this message.
    ///
    /// `skillCast` and `playerDamage` travel both ways (joiner reports, host
    /// re-broadcasts); they are classified by who is allowed to *send them to
    /// a host*, so they count as uplink here and the joiner router accepts
    /// them separately.
    pub fn direction(&self) -> MessageDirection {
        match self {
            Message::PlayerInput(_)
            | Message::PlayerPosition { .. }
            | Message::SkillCast(_)
            | Message::PlayerDamage { .. }
            | Message::EnemyKilled { .. }
            | Message::RequestStartGame => MessageDirection::JoinerToHost,
            Message::Welcome { .. }
            | Message::StartGame
            | Message::PlayerJoined { .. }
            | Message::PlayerLeft { .. }
            | Message::PlayerColors { .. }
            | Message::ShareExperience { .. }
            | Message::PartyBonusUpdate { .. }
            | Message::GameState(_)
            | Message::EnemiesRemoved { .. }
            | Message::InviteFromHost { .. }
            | Message::Kicked { .. }
            | Message::HostLeft => MessageDirection::HostToJoiner,
            Message::StatusRequest | Message::Status { .. } | Message::InviteRequest { .. } => {
                MessageDirection::Probe
            }
        }
    }
}
