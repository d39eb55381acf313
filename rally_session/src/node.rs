// A device's participation in rooms: identity plus exactly one role.
//
// `Node` is the entry point applications use. It owns the persistent
// identity, the transport factory, the configuration, the codec, and the
// joiner store, and holds at most one role session at a time:
//
//   Unconnected ──become_host──> Host(HostSession)
//        ^    └───become_joiner─> Joiner(JoinerSession)
//        └──── leave / terminal joiner / failed init ───┘
//
// Every role change tears the previous role down first (a host announces
// `hostLeft`, a joiner leaves), so two roles never coexist and nothing from
// the previous activation leaks into the next. Hosting binds the endpoint
// to the persistent id, which makes the room id stable across restarts;
// joining always binds a fresh transient id.
//
// Driving: call `pump(now)` from the application's loop. It drains the
// active endpoint, dispatches every event, and runs timers (host broadcast
// cadence, join timeout, input uplink, rejoin backoff). External drivers can
// instead feed events through `handle_event` and call `tick`. Every entry
// point takes the caller's `now`; the node never reads the clock itself, so
// deadlines armed by a role change are checked against the same clock.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use log::{info, warn};
use rally_protocol::{Codec, ConnectionId, FallbackCodec, PersistentId, PlayerInput, RoomId};

use crate::config::SyncConfig;
use crate::error::{SessionError, SessionResult};
use crate::event::SessionEvent;
use crate::host::HostSession;
use crate::identity::{Role, load_or_create_identity, transient_connection_id};
use crate::joiner::JoinerSession;
use crate::store::{IdentityStore, JoinerStore};
use crate::transport::{Endpoint, EndpointKind, Transport, TransportEvent};

/// The active role session.
pub enum RoleState<E: Endpoint> {
    Unconnected,
    Host(HostSession<E>),
    Joiner(JoinerSession<E>),
}

pub struct Node<T: Transport> {
    identity: PersistentId,
    transport: T,
    config: SyncConfig,
    codec: Rc<dyn Codec>,
    joiner_store: Rc<RefCell<dyn JoinerStore>>,
    role: RoleState<T::Endpoint>,
    events: Vec<SessionEvent>,
}

impl<T: Transport> Node<T> {
    /// Create a node, loading (or creating) this install's identity.
    pub fn new<S: JoinerStore + 'static>(
        transport: T,
        identity_store: &mut dyn IdentityStore,
        joiner_store: S,
        config: SyncConfig,
    ) -> SessionResult<Self> {
        let identity = load_or_create_identity(identity_store)?;
        Ok(Self {
            identity,
            transport,
            config,
            codec: Rc::new(FallbackCodec),
            joiner_store: Rc::new(RefCell::new(joiner_store)),
            role: RoleState::Unconnected,
            events: Vec::new(),
        })
    }

    /// Replace the payload codec. Takes effect from the next role change.
    pub fn with_codec(mut self, codec: Rc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn persistent_id(&self) -> &PersistentId {
        &self.identity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn current_role(&self) -> Role {
        match self.role {
            RoleState::Unconnected => Role::Unconnected,
            RoleState::Host(_) => Role::Host,
            RoleState::Joiner(_) => Role::Joiner,
        }
    }

    pub fn host(&self) -> Option<&HostSession<T::Endpoint>> {
        match &self.role {
            RoleState::Host(host) => Some(host),
            _ => None,
        }
    }

    pub fn host_mut(&mut self) -> Option<&mut HostSession<T::Endpoint>> {
        match &mut self.role {
            RoleState::Host(host) => Some(host),
            _ => None,
        }
    }

    pub fn joiner(&self) -> Option<&JoinerSession<T::Endpoint>> {
        match &self.role {
            RoleState::Joiner(joiner) => Some(joiner),
            _ => None,
        }
    }

    pub fn joiner_mut(&mut self) -> Option<&mut JoinerSession<T::Endpoint>> {
        match &mut self.role {
            RoleState::Joiner(joiner) => Some(joiner),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Role changes
    // -----------------------------------------------------------------------

    /// Start hosting the room named after this device's identity.
    pub fn become_host(&mut self, now: Instant) -> SessionResult<RoomId> {
        self.teardown(now);
        let room = self.identity.as_room_id();
        let endpoint = self
            .transport
            .open(&room.as_connection_id(), EndpointKind::Hosting)
            .map_err(|e| SessionError::HostInit(e.to_string()))?;
        let store: Box<dyn JoinerStore> = Box::new(self.joiner_store.clone());
        let host = HostSession::new(
            endpoint,
            self.config.clone(),
            self.codec.clone(),
            store,
            now,
        );
        self.role = RoleState::Host(host);
        Ok(room)
    }

    /// Join `room` from a fresh transient address.
    pub fn become_joiner(&mut self, room: &RoomId, now: Instant) -> SessionResult<()> {
        self.teardown(now);
        if *room == self.identity.as_room_id() {
            return Err(SessionError::JoinInit("cannot join our own room".into()));
        }
        let endpoint = self
            .transport
            .open(&transient_connection_id(), EndpointKind::Joining)
            .map_err(|e| SessionError::JoinInit(e.to_string()))?;
        let joiner = JoinerSession::start(
            endpoint,
            room.clone(),
            self.identity.clone(),
            self.config.clone(),
            self.codec.clone(),
            now,
        )?;
        self.role = RoleState::Joiner(joiner);
        Ok(())
    }

    /// Drop whatever role is active. Idempotent.
    pub fn leave(&mut self, now: Instant) {
        self.teardown(now);
    }

    fn teardown(&mut self, now: Instant) {
        match std::mem::replace(&mut self.role, RoleState::Unconnected) {
            RoleState::Unconnected => {}
            RoleState::Host(mut host) => {
                host.shutdown();
                self.events.extend(host.drain_events());
            }
            RoleState::Joiner(mut joiner) => {
                joiner.leave(now);
                self.events.extend(joiner.drain_events());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Drain the active endpoint, dispatch its events, then run timers.
    pub fn pump(&mut self, now: Instant) {
        let events = match &mut self.role {
            RoleState::Unconnected => Vec::new(),
            RoleState::Host(host) => host.endpoint_mut().poll(),
            RoleState::Joiner(joiner) => joiner.poll_endpoint(),
        };
        for event in events {
            self.dispatch(event, now);
        }
        self.tick(now);
    }

    /// Dispatch one transport event to the active role.
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        self.dispatch(event, now);
        self.reap_finished_joiner();
    }

    fn dispatch(&mut self, event: TransportEvent, now: Instant) {
        match &mut self.role {
            RoleState::Unconnected => {}
            RoleState::Host(host) => host.handle_event(event, now),
            RoleState::Joiner(joiner) => joiner.handle_event(event, now),
        }
    }

    /// Run timers: host broadcast, join timeout, input uplink, rejoin.
    pub fn tick(&mut self, now: Instant) {
        match &mut self.role {
            RoleState::Unconnected => {}
            RoleState::Host(host) => {
                host.tick(now);
            }
            RoleState::Joiner(joiner) => {
                joiner.tick(now);
                if let Some(attempt) = joiner.take_due_retry(now) {
                    match self
                        .transport
                        .open(&transient_connection_id(), EndpointKind::Joining)
                    {
                        Ok(endpoint) => joiner.begin_retry(endpoint, now),
                        Err(e) => {
                            warn!("could not open endpoint for retry {attempt}: {e}");
                            joiner.retry_open_failed(SessionError::JoinFailed(e.to_string()), now);
                        }
                    }
                }
            }
        }
        self.reap_finished_joiner();
    }

    /// A joiner that reached a terminal phase hands the node back to
    /// `Unconnected` so the application can play locally or pick a new room.
    fn reap_finished_joiner(&mut self) {
        let finished = matches!(&self.role, RoleState::Joiner(j) if j.is_finished());
        if finished {
            if let RoleState::Joiner(mut joiner) =
                std::mem::replace(&mut self.role, RoleState::Unconnected)
            {
                info!("joiner session for {} ended", joiner.room_id());
                self.events.extend(joiner.drain_events());
            }
        }
    }

    /// Notifications raised since the last call.
    pub fn poll_events(&mut self) -> Vec<SessionEvent> {
        let mut events = std::mem::take(&mut self.events);
        match &mut self.role {
            RoleState::Unconnected => {}
            RoleState::Host(host) => events.extend(host.drain_events()),
            RoleState::Joiner(joiner) => events.extend(joiner.drain_events()),
        }
        events
    }

    // -----------------------------------------------------------------------
    // Role-checked shortcuts
    // -----------------------------------------------------------------------

    pub fn start_game(&mut self) -> SessionResult<()> {
        let host = self.host_mut().ok_or(SessionError::WrongRole("host"))?;
        host.start_game();
        Ok(())
    }

    pub fn kick(&mut self, conn: &ConnectionId, reason: Option<String>) -> SessionResult<bool> {
        let host = self.host_mut().ok_or(SessionError::WrongRole("host"))?;
        Ok(host.kick(conn, reason))
    }

    pub fn send_input(&mut self, input: PlayerInput) -> SessionResult<()> {
        let joiner = self.joiner_mut().ok_or(SessionError::WrongRole("joiner"))?;
        joiner.send_input(input);
        Ok(())
    }
}
