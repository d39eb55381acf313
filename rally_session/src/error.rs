// Error taxonomy for the session layer.
//
// `SessionError` mirrors the failure classes a caller can observe:
// - init failures (`HostInit`, `JoinInit`) leave the node `Unconnected`;
// - handshake failures (`JoinTimeout`, `JoinFailed`) are surfaced to the UI
//   as `SessionEvent::JoinFailed` and are retriable;
// - `Protocol` and `AuthorityViolation` describe dropped messages and are
//   logged, never propagated out of the event loop;
// - `SessionSuperseded` is the expected outcome of reconnect dedup.
//
// `TransportError` and `StoreError` are the leaf errors of the transport
// seam and the persistence stores.

use std::io;

use rally_protocol::{CodecError, ConnectionId};
use thiserror::Error;

/// Failures reported by a `Transport` or `Endpoint`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not open endpoint {id}: {reason}")]
    Open { id: String, reason: String },
    #[error("no open connection to {0}")]
    NotConnected(ConnectionId),
    #[error("could not reach {id}: {reason}")]
    Connect { id: String, reason: String },
    #[error("endpoint is shut down")]
    Shutdown,
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the identity and joiner-list stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(#[from] io::Error),
    #[error("store contents are not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by role changes and session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not start hosting: {0}")]
    HostInit(String),
    #[error("could not start joining: {0}")]
    JoinInit(String),
    #[error("timed out waiting for the host")]
    JoinTimeout,
    #[error("join failed: {0}")]
    JoinFailed(String),
    #[error("protocol error from {from}: {reason}")]
    Protocol { from: ConnectionId, reason: String },
    #[error("{from} may not send {tag}")]
    AuthorityViolation { from: ConnectionId, tag: &'static str },
    #[error("session for {0} superseded by a newer connection")]
    SessionSuperseded(ConnectionId),
    #[error("operation requires the {0} role")]
    WrongRole(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type SessionResult<T> = Result<T, SessionError>;
