// Persistence for the two things that outlive a process: the device's
// persistent identity and, per hosted room, the list of joiners seen so far
// (used to give a returning device its old color in the next session).
//
// Both stores are small traits with a JSON-file implementation and an
// in-memory one for tests and ephemeral hosts. Nothing else about a session
// is persisted.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::debug;
use rally_protocol::{ColorTag, PersistentId, RoomId};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Where the device identity is kept.
pub trait IdentityStore {
    fn load(&self) -> Result<Option<PersistentId>, StoreError>;
    fn save(&mut self, id: &PersistentId) -> Result<(), StoreError>;
}

/// One remembered joiner of a room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownJoiner {
    pub persistent_id: PersistentId,
    pub color: ColorTag,
    pub connected: bool,
}

/// Persisted joiner list of one room.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownJoiners {
    pub joiners: Vec<KnownJoiner>,
}

impl KnownJoiners {
    pub fn color_of(&self, id: &PersistentId) -> Option<&ColorTag> {
        self.joiners
            .iter()
            .find(|j| &j.persistent_id == id)
            .map(|j| &j.color)
    }

    /// Insert or update the record for `id`.
    pub fn record(&mut self, id: &PersistentId, color: &ColorTag, connected: bool) {
        match self.joiners.iter_mut().find(|j| &j.persistent_id == id) {
            Some(j) => {
                j.color = color.clone();
                j.connected = connected;
            }
            None => self.joiners.push(KnownJoiner {
                persistent_id: id.clone(),
                color: color.clone(),
                connected,
            }),
        }
    }
}

/// Where per-room joiner lists are kept.
pub trait JoinerStore {
    fn load(&self, room: &RoomId) -> Result<KnownJoiners, StoreError>;
    fn save(&mut self, room: &RoomId, joiners: &KnownJoiners) -> Result<(), StoreError>;
}

/// A store shared between a node and each of its hosting activations.
impl<S: JoinerStore + ?Sized> JoinerStore for Rc<RefCell<S>> {
    fn load(&self, room: &RoomId) -> Result<KnownJoiners, StoreError> {
        self.borrow().load(room)
    }

    fn save(&mut self, room: &RoomId, joiners: &KnownJoiners) -> Result<(), StoreError> {
        self.borrow_mut().save(room, joiners)
    }
}

// ---------------------------------------------------------------------------
// File-backed stores
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    persistent_id: PersistentId,
}

/// Identity kept in a small JSON file.
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<PersistentId>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)?;
        let file: IdentityFile = serde_json::from_str(&text)?;
        Ok(Some(file.persistent_id))
    }

    fn save(&mut self, id: &PersistentId) -> Result<(), StoreError> {
        ensure_parent(&self.path)?;
        let json = serde_json::to_string_pretty(&IdentityFile {
            persistent_id: id.clone(),
        })?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

/// Joiner lists as one JSON file per room inside a directory.
pub struct JsonFileJoinerStore {
    dir: PathBuf,
}

impl JsonFileJoinerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, room: &RoomId) -> PathBuf {
        // Room ids are generated alphanumerics, but a hand-typed one could
        // contain path separators.
        let safe: String = room
            .0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("joiners-{safe}.json"))
    }
}

impl JoinerStore for JsonFileJoinerStore {
    fn load(&self, room: &RoomId) -> Result<KnownJoiners, StoreError> {
        let path = self.path_for(room);
        if !path.exists() {
            debug!("no joiner list for room {room} yet");
            return Ok(KnownJoiners::default());
        }
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn save(&mut self, room: &RoomId, joiners: &KnownJoiners) -> Result<(), StoreError> {
        let path = self.path_for(room);
        ensure_parent(&path)?;
        fs::write(path, serde_json::to_string_pretty(joiners)?)?;
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory stores
// ---------------------------------------------------------------------------

/// Identity held in memory. Cloning shares nothing; tests that need "the
/// same install across restarts" reuse one instance.
#[derive(Clone, Debug, Default)]
pub struct MemoryIdentityStore {
    id: Option<PersistentId>,
}

impl MemoryIdentityStore {
    pub fn with_id(id: &str) -> Self {
        Self {
            id: Some(PersistentId::from(id)),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<PersistentId>, StoreError> {
        Ok(self.id.clone())
    }

    fn save(&mut self, id: &PersistentId) -> Result<(), StoreError> {
        self.id = Some(id.clone());
        Ok(())
    }
}

/// Joiner lists held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryJoinerStore {
    rooms: BTreeMap<RoomId, KnownJoiners>,
}

impl JoinerStore for MemoryJoinerStore {
    fn load(&self, room: &RoomId) -> Result<KnownJoiners, StoreError> {
        Ok(self.rooms.get(room).cloned().unwrap_or_default())
    }

    fn save(&mut self, room: &RoomId, joiners: &KnownJoiners) -> Result<(), StoreError> {
        self.rooms.insert(room.clone(), joiners.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rally-store-{name}-{}-{}",
            std::process::id(),
            fastrand::u32(..)
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn file_identity_roundtrips_across_instances() {
        let dir = scratch_dir("identity");
        let path = dir.join("identity.json");

        let mut first = FileIdentityStore::new(&path);
        assert_eq!(first.load().unwrap(), None);
        first.save(&PersistentId::from("abc123")).unwrap();

        let second = FileIdentityStore::new(&path);
        assert_eq!(second.load().unwrap(), Some(PersistentId::from("abc123")));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn joiner_list_record_updates_in_place() {
        let mut list = KnownJoiners::default();
        let p = PersistentId::from("p1");
        list.record(&p, &ColorTag::from("#111"), true);
        list.record(&p, &ColorTag::from("#222"), false);
        assert_eq!(list.joiners.len(), 1);
        assert_eq!(list.color_of(&p), Some(&ColorTag::from("#222")));
        assert!(!list.joiners[0].connected);
    }

    #[test]
    fn file_joiner_store_is_keyed_by_room() {
        let dir = scratch_dir("joiners");
        let mut store = JsonFileJoinerStore::new(&dir);
        let mut list = KnownJoiners::default();
        list.record(&PersistentId::from("p1"), &ColorTag::from("#111"), true);
        store.save(&RoomId::from("room-a"), &list).unwrap();

        assert_eq!(store.load(&RoomId::from("room-a")).unwrap(), list);
        assert!(store.load(&RoomId::from("room-b")).unwrap().joiners.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn hostile_room_id_stays_inside_store_dir() {
        let store = JsonFileJoinerStore::new("/tmp/rally");
        let path = store.path_for(&RoomId::from("../../etc/passwd"));
        assert!(path.starts_with("/tmp/rally"));
        assert_eq!(path.parent().unwrap(), Path::new("/tmp/rally"));
    }
}
