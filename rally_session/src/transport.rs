// Transport seam: the abstract reliable-ordered channel the core runs on.
//
// The session layer never touches sockets. It talks to an `Endpoint` (one
// per role activation) obtained from a `Transport` factory, and consumes
// the endpoint's events by polling. That keeps the core single-threaded:
// whatever threads a concrete transport uses internally (see `tcp.rs`),
// events surface only through `poll()` on the owning thread.
//
// Contract every implementation must honor:
// - Messages on one connection arrive in send order. No ordering across
//   connections.
// - A connection's id is the remote endpoint's local id. For a joiner, the
//   connection to the host is therefore the room id.
// - After `close(conn)` returns, `poll()` yields no further events for
//   `conn`. This is what lets reconnect supersession close an old
//   connection without its late `Closed` event undoing the new slot.
// - `Opened` carries the dialer's connect metadata (its persistent id) on
//   the accepting side.

use rally_protocol::{ConnectionId, Payload, PersistentId};

use crate::error::TransportError;

/// What an endpoint is opened for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    /// Accepts inbound connections at its local id.
    Hosting,
    /// Only dials out.
    Joining,
}

/// Metadata attached to an outbound connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectMeta {
    pub persistent_id: Option<PersistentId>,
}

/// Something that happened on an endpoint.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A connection finished opening (either direction).
    Opened {
        conn: ConnectionId,
        persistent_id: Option<PersistentId>,
    },
    Data {
        conn: ConnectionId,
        payload: Payload,
    },
    /// The remote side went away or the channel broke.
    Closed { conn: ConnectionId },
    /// A connection-level (`conn` set) or endpoint-level error.
    Error {
        conn: Option<ConnectionId>,
        reason: String,
    },
}

/// Factory for endpoints.
pub trait Transport {
    type Endpoint: Endpoint;

    /// Open an endpoint addressed as `local_id`.
    fn open(
        &mut self,
        local_id: &ConnectionId,
        kind: EndpointKind,
    ) -> Result<Self::Endpoint, TransportError>;
}

/// One open transport endpoint.
pub trait Endpoint {
    fn local_id(&self) -> &ConnectionId;

    /// Start dialing `remote`. Completion arrives as `Opened` or `Error`.
    fn connect(&mut self, remote: &ConnectionId, meta: ConnectMeta) -> Result<(), TransportError>;

    fn send(&mut self, conn: &ConnectionId, payload: Payload) -> Result<(), TransportError>;

    /// Close one connection and stop delivering its events.
    fn close(&mut self, conn: &ConnectionId);

    /// Drain pending events without blocking.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Close everything and release the local address.
    fn shutdown(&mut self);
}
