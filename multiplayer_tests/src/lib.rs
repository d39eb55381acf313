// Test-only in-process network for multiplayer integration tests.
//
// `MemoryNetwork` implements the session layer's transport seam with
// per-endpoint inboxes instead of sockets, so a whole room (host plus any
// number of joiners) runs deterministically on one thread under a manual
// clock. It honors the same contract as the TCP transport: per-connection
// send order, `Opened` carrying the dialer's persistent id, and no events
// for a connection after its owner closes it.
//
// On top of the plain transport it offers fault injection the real network
// only produces by accident: severing a link with or without the far side
// noticing, and rearranging an endpoint's pending events to model the lack
// of cross-connection ordering. Every delivered message is also decoded into
// a wire log so tests can assert on exactly what each peer received.
//
// `Room` wraps the network with a set of `Node`s and a fake clock and
// provides `settle()`, the synchronous "run until quiet" loop the scenarios
// are written against.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::debug;
use rally_protocol::{ConnectionId, FallbackCodec, Message, Payload, RoomId, decode};
use rally_session::{
    ConnectMeta, Endpoint, EndpointKind, MemoryIdentityStore, MemoryJoinerStore, Node,
    SessionEvent, SessionResult, SyncConfig, Transport, TransportError, TransportEvent,
};

/// Upper bound on pump rounds in `Room::settle`.
const MAX_SETTLE_ROUNDS: usize = 200;

struct Slot {
    kind: EndpointKind,
    inbox: VecDeque<TransportEvent>,
    links: BTreeSet<ConnectionId>,
}

#[derive(Default)]
struct NetState {
    slots: BTreeMap<ConnectionId, Slot>,
    /// (from, to, message) for every delivered payload.
    wire: Vec<(ConnectionId, ConnectionId, Message)>,
    /// Events ever queued, for quiescence detection.
    posted: u64,
}

impl NetState {
    fn post(&mut self, to: &ConnectionId, event: TransportEvent) {
        if let Some(slot) = self.slots.get_mut(to) {
            slot.inbox.push_back(event);
            self.posted += 1;
        }
    }

    /// Remove `from`'s link to `to`. If `to` still links back, it learns of
    /// the close.
    fn unlink(&mut self, from: &ConnectionId, to: &ConnectionId) {
        let had = self
            .slots
            .get_mut(from)
            .is_some_and(|slot| slot.links.remove(to));
        if let Some(slot) = self.slots.get_mut(from) {
            slot.inbox.retain(|event| !concerns(event, to));
        }
        if !had {
            return;
        }
        let linked_back = self
            .slots
            .get_mut(to)
            .is_some_and(|remote| remote.links.remove(from));
        if linked_back {
            self.post(to, TransportEvent::Closed { conn: from.clone() });
        }
    }
}

fn concerns(event: &TransportEvent, conn: &ConnectionId) -> bool {
    match event {
        TransportEvent::Opened { conn: c, .. }
        | TransportEvent::Data { conn: c, .. }
        | TransportEvent::Closed { conn: c } => c == conn,
        TransportEvent::Error { conn: c, .. } => c.as_ref() == Some(conn),
    }
}

/// Shared in-process network. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Rc<RefCell<NetState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport factory opening endpoints on this network.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { net: self.clone() }
    }

    /// Events waiting in any inbox.
    pub fn pending(&self) -> usize {
        self.state.borrow().slots.values().map(|s| s.inbox.len()).sum()
    }

    fn posted(&self) -> u64 {
        self.state.borrow().posted
    }

    /// Whether an endpoint is open at `id`.
    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.state.borrow().slots.contains_key(id)
    }

    /// Break the link between `a` and `b` without either side closing it.
    /// Both learn of the loss.
    pub fn sever(&self, a: &ConnectionId, b: &ConnectionId) {
        self.sever_one_sided(a, b);
        self.sever_one_sided(b, a);
    }

    /// Break the link so that only `notices` learns of it. The other side
    /// keeps a half-open connection whose sends go nowhere.
    pub fn sever_one_sided(&self, notices: &ConnectionId, other: &ConnectionId) {
        let mut state = self.state.borrow_mut();
        let linked = state
            .slots
            .get_mut(notices)
            .is_some_and(|slot| slot.links.remove(other));
        if linked {
            state.post(notices, TransportEvent::Closed { conn: other.clone() });
        }
    }

    /// Rearrange the events waiting for `id`.
    pub fn with_inbox(&self, id: &ConnectionId, f: impl FnOnce(&mut VecDeque<TransportEvent>)) {
        if let Some(slot) = self.state.borrow_mut().slots.get_mut(id) {
            f(&mut slot.inbox);
        }
    }

    /// Messages delivered to `to`, with their sender, in delivery order.
    pub fn received_by(&self, to: &ConnectionId) -> Vec<(ConnectionId, Message)> {
        self.state
            .borrow()
            .wire
            .iter()
            .filter(|(_, t, _)| t == to)
            .map(|(from, _, msg)| (from.clone(), msg.clone()))
            .collect()
    }

    /// Forget the wire log.
    pub fn clear_log(&self) {
        self.state.borrow_mut().wire.clear();
    }
}

/// Transport factory for a `MemoryNetwork`.
pub struct MemoryTransport {
    net: MemoryNetwork,
}

impl Transport for MemoryTransport {
    type Endpoint = MemoryEndpoint;

    fn open(
        &mut self,
        local_id: &ConnectionId,
        kind: EndpointKind,
    ) -> Result<MemoryEndpoint, TransportError> {
        let mut state = self.net.state.borrow_mut();
        if state.slots.contains_key(local_id) {
            return Err(TransportError::Open {
                id: local_id.0.clone(),
                reason: "address in use".into(),
            });
        }
        state.slots.insert(
            local_id.clone(),
            Slot {
                kind,
                inbox: VecDeque::new(),
                links: BTreeSet::new(),
            },
        );
        debug!("opened {local_id} ({kind:?})");
        Ok(MemoryEndpoint {
            net: self.net.clone(),
            id: local_id.clone(),
        })
    }
}

/// One endpoint on a `MemoryNetwork`. Dropping it shuts it down.
pub struct MemoryEndpoint {
    net: MemoryNetwork,
    id: ConnectionId,
}

impl Endpoint for MemoryEndpoint {
    fn local_id(&self) -> &ConnectionId {
        &self.id
    }

    fn connect(&mut self, remote: &ConnectionId, meta: ConnectMeta) -> Result<(), TransportError> {
        let mut state = self.net.state.borrow_mut();
        if !state.slots.contains_key(&self.id) {
            return Err(TransportError::Shutdown);
        }
        let reachable = state
            .slots
            .get(remote)
            .is_some_and(|slot| slot.kind == EndpointKind::Hosting);
        if !reachable {
            // Dial failures arrive asynchronously, like a real connect.
            state.post(
                &self.id,
                TransportEvent::Error {
                    conn: Some(remote.clone()),
                    reason: format!("{remote} is not reachable"),
                },
            );
            return Ok(());
        }
        for (side, other) in [(&self.id, remote), (remote, &self.id)] {
            if let Some(slot) = state.slots.get_mut(side) {
                slot.links.insert(other.clone());
            }
        }
        state.post(
            &self.id,
            TransportEvent::Opened {
                conn: remote.clone(),
                persistent_id: None,
            },
        );
        state.post(
            remote,
            TransportEvent::Opened {
                conn: self.id.clone(),
                persistent_id: meta.persistent_id,
            },
        );
        Ok(())
    }

    fn send(&mut self, conn: &ConnectionId, payload: Payload) -> Result<(), TransportError> {
        let mut state = self.net.state.borrow_mut();
        let linked = state
            .slots
            .get(&self.id)
            .is_some_and(|slot| slot.links.contains(conn));
        if !linked {
            return Err(TransportError::NotConnected(conn.clone()));
        }
        // A half-open link accepts the send and loses it.
        let delivered = state
            .slots
            .get(conn)
            .is_some_and(|remote| remote.links.contains(&self.id));
        if delivered {
            if let Ok(msg) = decode(&FallbackCodec, &payload) {
                state.wire.push((self.id.clone(), conn.clone(), msg));
            }
            state.post(
                conn,
                TransportEvent::Data {
                    conn: self.id.clone(),
                    payload,
                },
            );
        }
        Ok(())
    }

    fn close(&mut self, conn: &ConnectionId) {
        self.net.state.borrow_mut().unlink(&self.id, conn);
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        self.net
            .state
            .borrow_mut()
            .slots
            .get_mut(&self.id)
            .map(|slot| slot.inbox.drain(..).collect())
            .unwrap_or_default()
    }

    fn shutdown(&mut self) {
        let mut state = self.net.state.borrow_mut();
        let links: Vec<ConnectionId> = state
            .slots
            .get(&self.id)
            .map(|slot| slot.links.iter().cloned().collect())
            .unwrap_or_default();
        for link in links {
            state.unlink(&self.id, &link);
        }
        state.slots.remove(&self.id);
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A hand-driven connection to a host, for sending traffic a well-behaved
/// joiner never would (probes, garbage, downlink tags).
pub struct RawPeer {
    endpoint: MemoryEndpoint,
    host: ConnectionId,
    pub closed: bool,
}

impl RawPeer {
    /// Open an endpoint at `id` and dial `host`.
    pub fn dial(net: &MemoryNetwork, id: &str, host: &ConnectionId, meta: ConnectMeta) -> Self {
        let mut endpoint = net
            .transport()
            .open(&ConnectionId::from(id), EndpointKind::Joining)
            .expect("raw peer id in use");
        endpoint.connect(host, meta).expect("raw peer dial failed");
        let mut peer = Self {
            endpoint,
            host: host.clone(),
            closed: false,
        };
        peer.receive();
        peer
    }

    pub fn send(&mut self, msg: &Message) {
        let payload = rally_protocol::encode(&FallbackCodec, msg);
        self.send_payload(payload);
    }

    pub fn send_payload(&mut self, payload: Payload) {
        if let Err(e) = self.endpoint.send(&self.host, payload) {
            debug!("raw peer send dropped: {e}");
        }
    }

    /// Drain the endpoint: decoded messages from the host, in order.
    pub fn receive(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        for event in self.endpoint.poll() {
            match event {
                TransportEvent::Data { payload, .. } => {
                    if let Ok(msg) = decode(&FallbackCodec, &payload) {
                        messages.push(msg);
                    }
                }
                TransportEvent::Closed { .. } | TransportEvent::Error { .. } => {
                    self.closed = true;
                }
                TransportEvent::Opened { .. } => {}
            }
        }
        messages
    }
}

// ---------------------------------------------------------------------------
// Room harness
// ---------------------------------------------------------------------------

/// Session config for tests: fast cadence, short timeouts.
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig {
        tick_interval_ms: 50,
        join_timeout_ms: 2_000,
        ..SyncConfig::default()
    };
    config.reconnect.initial_delay_ms = 100;
    config.reconnect.max_delay_ms = 400;
    config.reconnect.max_attempts = 3;
    config
}

/// A set of nodes on one `MemoryNetwork`, driven by a manual clock.
pub struct Room {
    pub net: MemoryNetwork,
    nodes: Vec<Node<MemoryTransport>>,
    identities: Vec<MemoryIdentityStore>,
    events: Vec<Vec<SessionEvent>>,
    now: Instant,
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

impl Room {
    pub fn new() -> Self {
        Self {
            net: MemoryNetwork::new(),
            nodes: Vec::new(),
            identities: Vec::new(),
            events: Vec::new(),
            now: Instant::now(),
        }
    }

    /// Add a device whose persistent identity is `name`. Returns its index.
    pub fn add_node(&mut self, name: &str) -> usize {
        self.add_node_with(name, test_config())
    }

    pub fn add_node_with(&mut self, name: &str, config: SyncConfig) -> usize {
        let mut identity = MemoryIdentityStore::with_id(name);
        let node = Node::new(
            self.net.transport(),
            &mut identity,
            MemoryJoinerStore::default(),
            config,
        )
        .expect("memory stores never fail");
        self.nodes.push(node);
        self.identities.push(identity);
        self.events.push(Vec::new());
        self.nodes.len() - 1
    }

    /// Tear a device down and bring it back with the same identity, as if
    /// the process restarted.
    pub fn restart_node(&mut self, index: usize) {
        self.nodes[index].leave(self.now);
        let node = Node::new(
            self.net.transport(),
            &mut self.identities[index],
            MemoryJoinerStore::default(),
            test_config(),
        )
        .expect("memory stores never fail");
        self.nodes[index] = node;
    }

    pub fn node(&self, index: usize) -> &Node<MemoryTransport> {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut Node<MemoryTransport> {
        &mut self.nodes[index]
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    // Role changes on the room clock.

    pub fn host(&mut self, index: usize) -> SessionResult<RoomId> {
        self.nodes[index].become_host(self.now)
    }

    pub fn join(&mut self, index: usize, room: &RoomId) -> SessionResult<()> {
        self.nodes[index].become_joiner(room, self.now)
    }

    pub fn leave(&mut self, index: usize) {
        self.nodes[index].leave(self.now);
    }

    /// Move the clock forward, then settle.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.settle();
    }

    /// Advance in `step`s until `total` has passed, settling after each.
    pub fn run_for(&mut self, total: Duration, step: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.advance(step);
            elapsed += step;
        }
    }

    /// Pump one node once, without advancing the clock.
    pub fn pump(&mut self, index: usize) {
        self.nodes[index].pump(self.now);
        self.events[index].extend(self.nodes[index].poll_events());
    }

    /// Pump every node until a round queues no new events. Events waiting
    /// for endpoints outside the room (a `RawPeer`) do not hold this up.
    pub fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let before = self.net.posted();
            for index in 0..self.nodes.len() {
                self.pump(index);
            }
            if self.net.posted() == before {
                return;
            }
        }
        panic!("network did not settle: {} events pending", self.net.pending());
    }

    /// Take the events node `index` raised so far.
    pub fn take_events(&mut self, index: usize) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events[index])
    }
}
