// rally_protocol: wire protocol for host-authoritative party sessions.
//
// This crate defines the message vocabulary, identifiers, codecs, and stream
// framing shared by a hosting device and its joiners. It has no notion of
// roles, connections, or timing; that lives in `rally_session`.
//
// Module overview:
// - `types.rs`:    ID newtypes: `PersistentId`, `ConnectionId`, `RoomId`,
//                  `EntityId`, `ColorTag`, `InputSequence`.
// - `message.rs`:  The closed `Message` sum type (one variant per wire tag),
//                  snapshot payload structs, and direction classification.
// - `codec.rs`:    `Codec` trait, MessagePack/JSON codecs, and the `Payload`
//                  carrier with structured fallback.
// - `framing.rs`:  Length-delimited frames for byte-stream transports.
//
// Design decisions:
// - **Internally tagged serde enum.** The JSON form (`{"type": ...}`) is
//   what browser peers speak; exhaustive matching on `Message` makes adding
//   a tag a compile-checked change in every router.
// - **Binary first, JSON fallback.** MessagePack keeps per-tick snapshots
//   small; anything it cannot encode still goes out as a structured payload.
// - **No async runtime.** Framing uses `std::io::Read`/`Write`.

pub mod codec;
pub mod framing;
pub mod message;
pub mod types;

pub use codec::{Codec, CodecError, FallbackCodec, JsonCodec, MsgPackCodec, Payload, decode, encode};
pub use framing::{FrameKind, HelloFrame, MAX_FRAME_SIZE, read_frame, write_frame};
pub use message::{
    EntityState, GameState, HostStatus, Message, MessageDirection, PlayerInput, PlayerState,
    SkillCast,
};
pub use types::{ColorTag, ConnectionId, EntityId, InputSequence, PersistentId, RoomId};
