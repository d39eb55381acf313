// State synchronization: host-side snapshot building and joiner-side merge.
//
// Host side, `SyncEngine` holds the authoritative copy of every player and
// world entity. Once per broadcast tick `build_snapshot` produces one
// `GameState`:
// - the player block always carries every participant;
// - the entity block is a delta (entities whose state differs from what was
//   last broadcast) plus the ids removed since the previous tick;
// - every `full_sync_interval`th tick (tick numbers start at 1) is a full
//   sync carrying every live entity, whatever the delta history says.
//
// A pluggable `LodPolicy` decides per entity how much detail it gets, using
// the player positions as the reference set. The default `DistanceLod` sends
// near entities exactly, quantizes mid-range ones, and leaves far ones out of
// delta ticks. An entity left out does not count as sent, so it goes out as
// soon as it comes into range (or at the next full sync at the latest).
//
// Joiner side, `RemoteView` is a pure consumer of host traffic: snapshots,
// removals, roster and color notices. Roster and colors are kept so that the
// arrival order of `playerJoined` / `playerColors` / `welcome` does not change
// the final state. `InputThrottle` coalesces local input for the uplink.
//
// See also: `host.rs` (drives `SyncEngine` from the tick timer),
// `joiner.rs` (feeds `RemoteView` and drains `InputThrottle`).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use log::trace;
use rally_protocol::{
    ColorTag, ConnectionId, EntityId, EntityState, GameState, InputSequence, PlayerInput,
    PlayerState,
};

use crate::config::{LodConfig, SyncConfig};
use crate::error::SessionError;

// ---------------------------------------------------------------------------
// Level of detail
// ---------------------------------------------------------------------------

/// How much of an entity goes into a snapshot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Detail {
    Full,
    /// Position quantized to this step.
    Reduced(f32),
    /// Left out of delta ticks.
    Omit,
}

/// Per-entity detail policy. `viewers` holds every player position.
pub trait LodPolicy {
    fn detail(&self, entity: [f32; 3], viewers: &[[f32; 3]]) -> Detail;
}

/// Distance bands around the nearest player.
#[derive(Clone, Debug)]
pub struct DistanceLod {
    near: f32,
    far: f32,
    step: f32,
}

impl DistanceLod {
    pub fn new(config: &LodConfig) -> Self {
        Self {
            near: config.near_radius,
            far: config.far_radius.max(config.near_radius),
            step: config.reduced_precision,
        }
    }
}

impl LodPolicy for DistanceLod {
    fn detail(&self, entity: [f32; 3], viewers: &[[f32; 3]]) -> Detail {
        let nearest = viewers
            .iter()
            .map(|v| distance(*v, entity))
            .fold(f32::INFINITY, f32::min);
        // With nobody to measure against, send everything exactly.
        if nearest.is_infinite() || nearest <= self.near {
            Detail::Full
        } else if nearest <= self.far {
            Detail::Reduced(self.step)
        } else {
            Detail::Omit
        }
    }
}

fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

fn quantize(state: &EntityState, step: f32) -> EntityState {
    if step <= 0.0 {
        return state.clone();
    }
    let mut out = state.clone();
    for axis in &mut out.position {
        *axis = (*axis / step).round() * step;
    }
    out
}

/// Experience multiplier for a party of `size` participants.
pub fn party_multiplier(size: usize, per_member: f32) -> f32 {
    1.0 + per_member * size.saturating_sub(1) as f32
}

// ---------------------------------------------------------------------------
// Host side
// ---------------------------------------------------------------------------

/// Authoritative world state and snapshot builder.
pub struct SyncEngine {
    full_sync_interval: u64,
    world_bound: f32,
    far_precision: f32,
    tick: u64,
    players: BTreeMap<ConnectionId, PlayerState>,
    entities: BTreeMap<EntityId, EntityState>,
    last_sent: HashMap<EntityId, EntityState>,
    pending_removed: Vec<EntityId>,
    inputs: HashMap<ConnectionId, PlayerInput>,
    position_seeded: HashSet<ConnectionId>,
    lod: Box<dyn LodPolicy>,
}

impl SyncEngine {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_lod(config, Box::new(DistanceLod::new(&config.lod)))
    }

    pub fn with_lod(config: &SyncConfig, lod: Box<dyn LodPolicy>) -> Self {
        Self {
            full_sync_interval: config.full_sync_interval,
            world_bound: config.world_bound,
            far_precision: config.lod.reduced_precision,
            tick: 0,
            players: BTreeMap::new(),
            entities: BTreeMap::new(),
            last_sent: HashMap::new(),
            pending_removed: Vec::new(),
            inputs: HashMap::new(),
            position_seeded: HashSet::new(),
            lod,
        }
    }

    /// Broadcast ticks built so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    // -- Players --

    /// Start tracking a participant. Re-adding resets its input and seed.
    pub fn add_player(&mut self, id: &ConnectionId, color: &ColorTag) {
        self.players.insert(
            id.clone(),
            PlayerState {
                position: [0.0; 3],
                rotation: 0.0,
                animation: "idle".into(),
                model_id: "default".into(),
                player_color: color.clone(),
            },
        );
        self.inputs.remove(id);
        self.position_seeded.remove(id);
    }

    pub fn remove_player(&mut self, id: &ConnectionId) {
        self.players.remove(id);
        self.inputs.remove(id);
        self.position_seeded.remove(id);
    }

    pub fn has_player(&self, id: &ConnectionId) -> bool {
        self.players.contains_key(id)
    }

    pub fn player(&self, id: &ConnectionId) -> Option<&PlayerState> {
        self.players.get(id)
    }

    /// Mutable access for the host's simulation.
    pub fn player_mut(&mut self, id: &ConnectionId) -> Option<&mut PlayerState> {
        self.players.get_mut(id)
    }

    /// Store a joiner's input unless a newer one was already applied.
    /// Returns whether it was kept.
    pub fn apply_input(&mut self, id: &ConnectionId, input: PlayerInput) -> bool {
        if !self.players.contains_key(id) {
            return false;
        }
        if let Some(current) = self.inputs.get(id) {
            if input.sequence <= current.sequence {
                return false;
            }
        }
        self.inputs.insert(id.clone(), input);
        true
    }

    pub fn latest_input(&self, id: &ConnectionId) -> Option<&PlayerInput> {
        self.inputs.get(id)
    }

    /// Seed a player's position from its own report. Accepted once per
    /// admission; later reports return `Ok(false)`. Non-finite or
    /// out-of-bounds positions are a protocol error and change nothing.
    pub fn seed_position(
        &mut self,
        id: &ConnectionId,
        position: [f32; 3],
        rotation: f32,
    ) -> Result<bool, SessionError> {
        let valid = position
            .iter()
            .chain(std::iter::once(&rotation))
            .all(|v| v.is_finite())
            && position.iter().all(|v| v.abs() <= self.world_bound);
        if !valid {
            return Err(SessionError::Protocol {
                from: id.clone(),
                reason: format!("position {position:?} out of bounds"),
            });
        }
        if self.position_seeded.contains(id) {
            return Ok(false);
        }
        let Some(player) = self.players.get_mut(id) else {
            return Ok(false);
        };
        player.position = position;
        player.rotation = rotation;
        self.position_seeded.insert(id.clone());
        Ok(true)
    }

    /// Allow one more position seed for `id`, after it resumes from a pause.
    pub fn reopen_position(&mut self, id: &ConnectionId) {
        self.position_seeded.remove(id);
    }

    // -- Entities --

    /// Insert or update an entity. An id removed earlier in the same tick
    /// is live again and no longer reported as removed.
    pub fn upsert_entity(&mut self, id: EntityId, state: EntityState) {
        self.pending_removed.retain(|removed| *removed != id);
        self.entities.insert(id, state);
    }

    /// Remove an entity. Returns the removed state, or `None` if it was
    /// already gone (duplicate kill reports land here).
    pub fn remove_entity(&mut self, id: &EntityId) -> Option<EntityState> {
        let state = self.entities.remove(id)?;
        self.last_sent.remove(id);
        self.pending_removed.push(id.clone());
        Some(state)
    }

    pub fn entity(&self, id: &EntityId) -> Option<&EntityState> {
        self.entities.get(id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // -- Snapshots --

    /// Advance the tick counter and build this tick's snapshot.
    pub fn build_snapshot(&mut self) -> GameState {
        self.tick += 1;
        let full_sync = self.full_sync_interval > 0 && self.tick % self.full_sync_interval == 0;
        let viewers: Vec<[f32; 3]> = self.players.values().map(|p| p.position).collect();

        let mut entities = BTreeMap::new();
        for (id, state) in &self.entities {
            let detail = self.lod.detail(state.position, &viewers);
            if !full_sync && (detail == Detail::Omit || self.last_sent.get(id) == Some(state)) {
                continue;
            }
            let wire = match detail {
                Detail::Full => state.clone(),
                Detail::Reduced(step) => quantize(state, step),
                // Full syncs carry far entities at reduced precision.
                Detail::Omit => quantize(state, self.far_precision),
            };
            entities.insert(id.clone(), wire);
            self.last_sent.insert(id.clone(), state.clone());
        }

        let removed_ids = std::mem::take(&mut self.pending_removed);
        trace!(
            "tick {}: {} players, {}/{} entities, {} removed, full={full_sync}",
            self.tick,
            self.players.len(),
            entities.len(),
            self.entities.len(),
            removed_ids.len()
        );

        GameState {
            players: self.players.clone(),
            entities,
            removed_ids,
            full_sync,
        }
    }
}

// ---------------------------------------------------------------------------
// Joiner side
// ---------------------------------------------------------------------------

/// A joiner's picture of the room, built only from host traffic.
#[derive(Clone, Debug, Default)]
pub struct RemoteView {
    players: BTreeMap<ConnectionId, PlayerState>,
    entities: BTreeMap<EntityId, EntityState>,
    roster: BTreeSet<ConnectionId>,
    colors: BTreeMap<ConnectionId, ColorTag>,
    departed: BTreeSet<ConnectionId>,
}

impl RemoteView {
    /// Forget everything. Used when (re)joining.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn apply_welcome(
        &mut self,
        colors: &BTreeMap<ConnectionId, ColorTag>,
        players: &[ConnectionId],
    ) {
        for id in players {
            if !self.departed.contains(id) {
                self.roster.insert(id.clone());
            }
        }
        self.apply_colors(colors);
    }

    pub fn apply_joined(&mut self, id: &ConnectionId, color: Option<&ColorTag>) {
        self.departed.remove(id);
        self.roster.insert(id.clone());
        if let Some(color) = color {
            self.colors.insert(id.clone(), color.clone());
        }
    }

    pub fn apply_left(&mut self, id: &ConnectionId) {
        self.roster.remove(id);
        self.colors.remove(id);
        self.players.remove(id);
        self.departed.insert(id.clone());
    }

    /// Merge a color map. Entries are inserted, never replaced wholesale, so
    /// a color notice racing a join notice converges to the same map.
    pub fn apply_colors(&mut self, colors: &BTreeMap<ConnectionId, ColorTag>) {
        for (id, color) in colors {
            if !self.departed.contains(id) {
                self.colors.insert(id.clone(), color.clone());
            }
        }
    }

    /// Merge a snapshot. Returns whether it was a full sync.
    ///
    /// Removals happened before the entity block was captured, so they are
    /// applied first; an id present in both is live.
    pub fn apply_state(&mut self, state: &GameState) -> bool {
        self.players = state.players.clone();
        if state.full_sync {
            self.entities = state.entities.clone();
        } else {
            self.apply_removed(&state.removed_ids);
            for (id, entity) in &state.entities {
                self.entities.insert(id.clone(), entity.clone());
            }
        }
        state.full_sync
    }

    pub fn apply_removed(&mut self, ids: &[EntityId]) {
        for id in ids {
            self.entities.remove(id);
        }
    }

    pub fn players(&self) -> &BTreeMap<ConnectionId, PlayerState> {
        &self.players
    }

    pub fn entities(&self) -> &BTreeMap<EntityId, EntityState> {
        &self.entities
    }

    pub fn roster(&self) -> &BTreeSet<ConnectionId> {
        &self.roster
    }

    /// Colors of current roster members.
    pub fn colors(&self) -> BTreeMap<ConnectionId, ColorTag> {
        self.colors
            .iter()
            .filter(|(id, _)| self.roster.contains(*id))
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect()
    }

    pub fn color_of(&self, id: &ConnectionId) -> Option<&ColorTag> {
        self.colors.get(id).filter(|_| self.roster.contains(id))
    }
}

/// Coalesces local input and releases at most one per interval.
#[derive(Clone, Debug)]
pub struct InputThrottle {
    interval: Duration,
    pending: Option<PlayerInput>,
    last_sent: Option<Instant>,
    next_sequence: u64,
}

impl InputThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            last_sent: None,
            next_sequence: 1,
        }
    }

    /// Replace any unsent input with `input`.
    pub fn push(&mut self, input: PlayerInput) {
        self.pending = Some(input);
    }

    /// Release the pending input if the interval has elapsed, stamped with
    /// the next sequence number.
    pub fn poll(&mut self, now: Instant) -> Option<PlayerInput> {
        if let Some(last) = self.last_sent {
            if now.duration_since(last) < self.interval {
                return None;
            }
        }
        let mut input = self.pending.take()?;
        input.sequence = InputSequence(self.next_sequence);
        self.next_sequence += 1;
        self.last_sent = Some(now);
        Some(input)
    }
}
