// rally_session: host-authoritative party sessions over a pluggable
// transport.
//
// One device hosts a room named after its persistent identity; other devices
// join it. The host owns all shared game state and periodically broadcasts
// snapshots; joiners send inputs and discrete gameplay reports upward and
// mirror what the host tells them. Joiners that lose the host without being
// told why rejoin automatically with backoff, and a rejoining device takes
// over its previous slot and color.
//
// Module overview:
// - `node.rs`:       `Node`, the application entry point. Owns identity,
//                    transport, config, and exactly one role session.
// - `host.rs`:       `HostSession`: admission, dispatch of joiner traffic,
//                    kicks, snapshot cadence.
// - `joiner.rs`:     `JoinerSession`: handshake, remote view, input uplink,
//                    rejoin scheduling.
// - `state.rs`:      Pure joiner connection state machine.
// - `directory.rs`:  Connected joiners, dedup by persistent id, colors.
// - `router.rs`:     First-contact classification and per-role message
//                    routing.
// - `sync.rs`:       Authoritative `SyncEngine`, LOD policy, joiner-side
//                    `RemoteView`, input throttle.
// - `reconnect.rs`:  Exponential backoff and retry timer.
// - `identity.rs`:   Persistent and transient ids, `Role`.
// - `store.rs`:      Identity and known-joiner persistence (file, memory).
// - `transport.rs`:  `Transport` / `Endpoint` seam and `TransportEvent`.
// - `tcp.rs`:        `std::net` implementation of the transport seam.
// - `config.rs`:     `SyncConfig` and nested tuning groups.
// - `event.rs`:      `SessionEvent` notifications for the application.
// - `error.rs`:      Error taxonomy.
//
// Dependencies: `rally_protocol` (messages, codecs, framing). The core is
// single-threaded and driven by `Node::pump`; only `tcp.rs` spawns threads,
// and their events surface through `poll()` on the owning thread.
//
// The host can run as a standalone binary (`main.rs`) or be embedded in a
// game process through `Node`.

pub mod config;
pub mod directory;
pub mod error;
pub mod event;
pub mod host;
pub mod identity;
pub mod joiner;
pub mod node;
pub mod reconnect;
pub mod router;
pub mod state;
pub mod store;
pub mod sync;
pub mod tcp;
pub mod transport;

pub use config::{LodConfig, ReconnectConfig, SyncConfig};
pub use error::{SessionError, SessionResult, StoreError, TransportError};
pub use event::SessionEvent;
pub use identity::Role;
pub use node::Node;
pub use state::{EndReason, JoinerPhase, JoinerStatus};
pub use store::{
    FileIdentityStore, IdentityStore, JoinerStore, JsonFileJoinerStore, KnownJoiner,
    KnownJoiners, MemoryIdentityStore, MemoryJoinerStore,
};
pub use tcp::{TcpEndpoint, TcpTransport};
pub use transport::{ConnectMeta, Endpoint, EndpointKind, Transport, TransportEvent};
