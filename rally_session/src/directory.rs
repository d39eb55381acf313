// Host-side session directory: who is in the room and with which color.
//
// `SessionDirectory` maps connection ids to `SessionEntry`s and keeps the
// reverse index from persistent id to the single live connection of that
// device. It is owned by one `HostSession` per hosting activation and is
// rebuilt from scratch on every `become_host`.
//
// Invariants maintained here:
// - At most one entry per persistent id. Admitting a connection whose
//   persistent id already owns a different live connection *supersedes* it:
//   the old entry is removed and returned in `Admission::superseded`, and
//   the new entry inherits its color. The caller closes the old connection
//   and notifies peers; the directory itself does no I/O besides the store.
// - Every admit/release is complete within one call. No intermediate state
//   is observable, so a caller can re-enter immediately.
// - The host's own slot is never released and owns the first palette color.
//
// Color choice on admit, first match wins:
//   1. the superseded entry's color,
//   2. the color remembered for this persistent id in the room's persisted
//      joiner list, if nobody holds it now,
//   3. the lowest unused palette color,
//   4. a random palette color (palette exhausted).
//
// Two live devices presenting the same persistent id (a cloned install) are
// indistinguishable from a reconnect, so the most recent connection wins.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use log::{info, warn};
use rally_protocol::{ColorTag, ConnectionId, PersistentId, RoomId};

use crate::store::{JoinerStore, KnownJoiners};

/// One admitted participant.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionEntry {
    pub persistent_id: Option<PersistentId>,
    pub connection_id: ConnectionId,
    pub color: ColorTag,
    pub joined_at: SystemTime,
}

/// Result of `admit`.
#[derive(Clone, Debug, PartialEq)]
pub struct Admission {
    pub color: ColorTag,
    /// The entry this admission replaced, if it was a reconnect.
    pub superseded: Option<SessionEntry>,
}

pub struct SessionDirectory {
    room: RoomId,
    host_id: ConnectionId,
    host_color: ColorTag,
    palette: Vec<ColorTag>,
    entries: BTreeMap<ConnectionId, SessionEntry>,
    by_persistent: HashMap<PersistentId, ConnectionId>,
    known: KnownJoiners,
    store: Box<dyn JoinerStore>,
}

impl SessionDirectory {
    /// Create the directory for a fresh hosting activation. Loads the
    /// room's persisted joiner list; a failed load starts empty.
    pub fn new(
        room: RoomId,
        host_id: ConnectionId,
        palette: Vec<ColorTag>,
        store: Box<dyn JoinerStore>,
    ) -> Self {
        let palette = if palette.is_empty() {
            vec![ColorTag::from("#ffffff")]
        } else {
            palette
        };
        let known = store.load(&room).unwrap_or_else(|e| {
            warn!("could not load joiner list for room {room}: {e}");
            KnownJoiners::default()
        });
        Self {
            host_color: palette[0].clone(),
            room,
            host_id,
            palette,
            entries: BTreeMap::new(),
            by_persistent: HashMap::new(),
            known,
            store,
        }
    }

    /// Admit `conn`, superseding any live connection of the same device.
    pub fn admit(
        &mut self,
        conn: &ConnectionId,
        persistent_id: Option<&PersistentId>,
    ) -> Admission {
        // Re-admitting the same connection is a no-op that reports its slot.
        if let Some(existing) = self.entries.get(conn) {
            return Admission {
                color: existing.color.clone(),
                superseded: None,
            };
        }

        let superseded = persistent_id
            .and_then(|pid| self.by_persistent.get(pid).cloned())
            .filter(|old| old != conn)
            .and_then(|old| self.remove_entry(&old));

        let color = match &superseded {
            Some(old) => old.color.clone(),
            None => self.pick_color(persistent_id),
        };

        if let Some(pid) = persistent_id {
            self.by_persistent.insert(pid.clone(), conn.clone());
            self.known.record(pid, &color, true);
        }
        self.entries.insert(
            conn.clone(),
            SessionEntry {
                persistent_id: persistent_id.cloned(),
                connection_id: conn.clone(),
                color: color.clone(),
                joined_at: SystemTime::now(),
            },
        );
        match &superseded {
            Some(old) => info!(
                "{conn} supersedes {} in room {} (color {color})",
                old.connection_id, self.room
            ),
            None => info!("admitted {conn} to room {} (color {color})", self.room),
        }
        self.persist();

        Admission { color, superseded }
    }

    /// Remove `conn`. Returns the removed entry, or `None` if it was not
    /// admitted (already released, superseded, or never admitted).
    pub fn release(&mut self, conn: &ConnectionId) -> Option<SessionEntry> {
        let entry = self.remove_entry(conn)?;
        if let Some(pid) = &entry.persistent_id {
            self.known.record(pid, &entry.color, false);
        }
        info!("released {conn} from room {}", self.room);
        self.persist();
        Some(entry)
    }

    pub fn lookup_by_persistent(&self, id: &PersistentId) -> Option<&ConnectionId> {
        self.by_persistent.get(id)
    }

    pub fn entry(&self, conn: &ConnectionId) -> Option<&SessionEntry> {
        self.entries.get(conn)
    }

    pub fn contains(&self, conn: &ConnectionId) -> bool {
        self.entries.contains_key(conn)
    }

    /// Admitted joiner connection ids (host excluded), in stable order.
    pub fn joiner_ids(&self) -> Vec<ConnectionId> {
        self.entries.keys().cloned().collect()
    }

    pub fn joiner_count(&self) -> usize {
        self.entries.len()
    }

    pub fn host_id(&self) -> &ConnectionId {
        &self.host_id
    }

    pub fn host_color(&self) -> &ColorTag {
        &self.host_color
    }

    pub fn color_of(&self, conn: &ConnectionId) -> Option<&ColorTag> {
        if conn == &self.host_id {
            return Some(&self.host_color);
        }
        self.entries.get(conn).map(|e| &e.color)
    }

    /// Color of every participant, host included.
    pub fn colors(&self) -> BTreeMap<ConnectionId, ColorTag> {
        let mut colors: BTreeMap<_, _> = self
            .entries
            .iter()
            .map(|(id, e)| (id.clone(), e.color.clone()))
            .collect();
        colors.insert(self.host_id.clone(), self.host_color.clone());
        colors
    }

    /// Participants, host first.
    pub fn participants(&self) -> Vec<ConnectionId> {
        std::iter::once(self.host_id.clone())
            .chain(self.entries.keys().cloned())
            .collect()
    }

    fn remove_entry(&mut self, conn: &ConnectionId) -> Option<SessionEntry> {
        let entry = self.entries.remove(conn)?;
        if let Some(pid) = &entry.persistent_id {
            if self.by_persistent.get(pid) == Some(conn) {
                self.by_persistent.remove(pid);
            }
        }
        Some(entry)
    }

    fn in_use(&self, color: &ColorTag) -> bool {
        color == &self.host_color || self.entries.values().any(|e| &e.color == color)
    }

    fn pick_color(&self, persistent_id: Option<&PersistentId>) -> ColorTag {
        if let Some(remembered) = persistent_id.and_then(|pid| self.known.color_of(pid)) {
            if !self.in_use(remembered) {
                return remembered.clone();
            }
        }
        if let Some(free) = self.palette.iter().find(|c| !self.in_use(c)) {
            return free.clone();
        }
        self.palette[fastrand::usize(..self.palette.len())].clone()
    }

    fn persist(&mut self) {
        if let Err(e) = self.store.save(&self.room, &self.known) {
            warn!("could not persist joiner list for room {}: {e}", self.room);
        }
    }
}
