// Device identity and role vocabulary.
//
// A device has exactly one `PersistentId`, generated on first use and kept
// in an `IdentityStore`. Hosting binds the endpoint to that id, so the room
// id is the same across restarts. Joining always uses a fresh transient id
// from `transient_connection_id`, so a device that was hosting a moment ago
// cannot collide with its own old address.
//
// See also: `node.rs`, which owns the identity and enforces "one role at a
// time".

use log::info;
use rally_protocol::{ConnectionId, PersistentId};

use crate::error::StoreError;
use crate::store::IdentityStore;

/// Length of generated identifiers.
const ID_LEN: usize = 16;

/// The role a node currently plays. Exactly one at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Unconnected,
    Host,
    Joiner,
}

/// Load this install's identity, creating and persisting one on first use.
pub fn load_or_create_identity(store: &mut dyn IdentityStore) -> Result<PersistentId, StoreError> {
    if let Some(id) = store.load()? {
        return Ok(id);
    }
    let id = PersistentId(random_alphanumeric(ID_LEN));
    store.save(&id)?;
    info!("created persistent identity {id}");
    Ok(id)
}

/// A fresh connection id for one join attempt.
pub fn transient_connection_id() -> ConnectionId {
    ConnectionId(format!("j-{}", random_alphanumeric(ID_LEN)))
}

fn random_alphanumeric(len: usize) -> String {
    std::iter::repeat_with(fastrand::alphanumeric)
        .take(len)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryIdentityStore;

    #[test]
    fn identity_is_created_once() {
        let mut store = MemoryIdentityStore::default();
        let first = load_or_create_identity(&mut store).unwrap();
        let second = load_or_create_identity(&mut store).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.0.len(), ID_LEN);
    }

    #[test]
    fn transient_ids_never_repeat_and_never_look_persistent() {
        let a = transient_connection_id();
        let b = transient_connection_id();
        assert_ne!(a, b);
        assert!(a.0.starts_with("j-"));
    }
}
