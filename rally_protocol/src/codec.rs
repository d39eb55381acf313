// Pluggable message codecs and the payload carrier handed to transports.
//
// A `Codec` turns a `Message` into bytes and back. `serialize` returning
// `None` is not an error: the caller falls back to handing the structured
// message to the transport directly (`Payload::Structured`), which is how a
// browser data channel accepts plain objects. `encode` wraps that decision.
//
// Provided codecs:
// - `MsgPackCodec`: compact binary (rmp-serde, named fields so the
//   internally tagged `Message` representation survives).
// - `JsonCodec`: serde_json text, the interoperable fallback.
// - `FallbackCodec`: MessagePack first, JSON when MessagePack cannot encode.
//   Decoding sniffs the first byte: JSON messages always start with `{`,
//   which in MessagePack would be a bare positive integer and is never a
//   valid message.
//
// `Payload` holds its bytes (or message) behind an `Arc` so a broadcast can
// encode once and hand the identical payload to every peer.

use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::message::Message;

/// Errors raised while decoding a payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed binary payload: {0}")]
    MsgPack(#[from] rmp_serde::decode::Error),
    #[error("malformed json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty payload")]
    Empty,
}

/// Message serializer contract.
pub trait Codec {
    /// Encode a message, or `None` when this codec cannot represent it.
    fn serialize(&self, msg: &Message) -> Option<Vec<u8>>;

    /// Decode bytes produced by `serialize` (or by a compatible peer).
    fn deserialize(&self, bytes: &[u8]) -> Result<Message, CodecError>;
}

/// What actually travels through a transport.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Binary(Arc<[u8]>),
    Structured(Arc<Message>),
}

/// Binary codec over MessagePack.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgPackCodec;

/// Text codec over JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

/// MessagePack with JSON fallback. The default for sessions.
#[derive(Clone, Copy, Debug, Default)]
pub struct FallbackCodec;

impl Codec for MsgPackCodec {
    fn serialize(&self, msg: &Message) -> Option<Vec<u8>> {
        match rmp_serde::to_vec_named(msg) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("msgpack encode of {} failed: {e}", msg.tag());
                None
            }
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl Codec for JsonCodec {
    fn serialize(&self, msg: &Message) -> Option<Vec<u8>> {
        match serde_json::to_vec(msg) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("json encode of {} failed: {e}", msg.tag());
                None
            }
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Codec for FallbackCodec {
    fn serialize(&self, msg: &Message) -> Option<Vec<u8>> {
        MsgPackCodec
            .serialize(msg)
            .or_else(|| JsonCodec.serialize(msg))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        match bytes.first() {
            None => Err(CodecError::Empty),
            Some(b'{') => JsonCodec.deserialize(bytes),
            Some(_) => MsgPackCodec.deserialize(bytes),
        }
    }
}

/// Encode a message for sending. Never fails: a codec that declines the
/// message yields a structured payload instead.
pub fn encode(codec: &dyn Codec, msg: &Message) -> Payload {
    match codec.serialize(msg) {
        Some(bytes) => Payload::Binary(bytes.into()),
        None => Payload::Structured(Arc::new(msg.clone())),
    }
}

/// Decode a received payload.
pub fn decode(codec: &dyn Codec, payload: &Payload) -> Result<Message, CodecError> {
    match payload {
        Payload::Binary(bytes) => codec.deserialize(bytes),
        Payload::Structured(msg) => Ok(Message::clone(msg)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::message::{EntityState, GameState, PlayerState};
    use crate::types::{ColorTag, ConnectionId, EntityId};

    /// A codec that refuses everything, standing in for a serializer that
    /// cannot handle some payload.
    struct RefusingCodec;

    impl Codec for RefusingCodec {
        fn serialize(&self, _msg: &Message) -> Option<Vec<u8>> {
            None
        }

        fn deserialize(&self, bytes: &[u8]) -> Result<Message, CodecError> {
            JsonCodec.deserialize(bytes)
        }
    }

    fn snapshot() -> Message {
        let mut players = BTreeMap::new();
        players.insert(
            ConnectionId::from("room"),
            PlayerState {
                position: [0.5, 1.0, 2.0],
                rotation: 1.25,
                animation: "idle".into(),
                model_id: "mage".into(),
                player_color: ColorTag::from("#3498db"),
            },
        );
        let mut entities = BTreeMap::new();
        entities.insert(
            EntityId::from("slime-3"),
            EntityState {
                kind: "slime".into(),
                position: [4.0, 0.0, 4.0],
                rotation: 0.0,
                health: Some(7.5),
                animation: Some("hop".into()),
                experience: 12,
            },
        );
        Message::GameState(GameState {
            players,
            entities,
            removed_ids: vec![EntityId::from("slime-1")],
            full_sync: true,
        })
    }

    #[test]
    fn msgpack_preserves_tagged_snapshot() {
        let msg = snapshot();
        let bytes = MsgPackCodec.serialize(&msg).unwrap();
        assert_ne!(bytes[0], b'{');
        assert_eq!(MsgPackCodec.deserialize(&bytes).unwrap(), msg);
    }

    #[test]
    fn fallback_codec_reads_both_formats() {
        let msg = snapshot();
        let binary = MsgPackCodec.serialize(&msg).unwrap();
        let text = JsonCodec.serialize(&msg).unwrap();
        assert_eq!(FallbackCodec.deserialize(&binary).unwrap(), msg);
        assert_eq!(FallbackCodec.deserialize(&text).unwrap(), msg);
    }

    #[test]
    fn refusing_codec_degrades_to_structured() {
        let msg = Message::HostLeft;
        let payload = encode(&RefusingCodec, &msg);
        assert!(matches!(payload, Payload::Structured(_)));
        assert_eq!(decode(&RefusingCodec, &payload).unwrap(), msg);
    }

    #[test]
    fn garbage_is_a_decode_error_not_a_panic() {
        assert!(FallbackCodec.deserialize(&[0xc1, 0x00, 0x13]).is_err());
        assert!(FallbackCodec.deserialize(b"{not json").is_err());
        assert!(matches!(
            FallbackCodec.deserialize(&[]),
            Err(CodecError::Empty)
        ));
    }
}
