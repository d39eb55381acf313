// Length-delimited frame format for byte-stream transports.
//
// Datagram-style channels (WebRTC data channels) preserve message boundaries
// on their own; a TCP stream does not, so stream transports wrap each
// payload in a frame:
//
//   [4-byte big-endian length][1-byte kind][body]
//
// The length counts the kind byte plus the body. `FrameKind` tells the
// receiver how to interpret the body:
// - `Hello`:  first frame on every connection, JSON `HelloFrame` carrying
//             the dialer's transport id and optional persistent id (the
//             channel's connect metadata).
// - `Binary`: codec output (`Payload::Binary`).
// - `Json`:   a structured message written as JSON (`Payload::Structured`).
//
// A `MAX_FRAME_SIZE` constant (16 MB) protects against unbounded allocation
// from malformed or malicious length prefixes. Full-sync snapshots are the
// largest expected frames.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::types::{ConnectionId, PersistentId};

/// Maximum allowed frame size (16 MB), kind byte included.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Interpretation of a frame body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Hello,
    Binary,
    Json,
}

impl FrameKind {
    fn to_byte(self) -> u8 {
        match self {
            FrameKind::Hello => 0,
            FrameKind::Binary => 1,
            FrameKind::Json => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(FrameKind::Hello),
            1 => Some(FrameKind::Binary),
            2 => Some(FrameKind::Json),
            _ => None,
        }
    }
}

/// Body of a `Hello` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloFrame {
    pub peer_id: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_id: Option<PersistentId>,
}

/// Write one frame: length, kind, body.
pub fn write_frame<W: Write>(writer: &mut W, kind: FrameKind, body: &[u8]) -> io::Result<()> {
    let len = body.len() + 1;
    if len > MAX_FRAME_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(&[kind.to_byte()])?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
///
/// Returns `UnexpectedEof` if the stream closes before or during a frame,
/// `InvalidData` if the length exceeds `MAX_FRAME_SIZE`, is zero, or the
/// kind byte is unknown.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<(FrameKind, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame length: {len} bytes (max {MAX_FRAME_SIZE})"),
        ));
    }
    let mut kind_buf = [0u8; 1];
    reader.read_exact(&mut kind_buf)?;
    let kind = FrameKind::from_byte(kind_buf[0]).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame kind {}", kind_buf[0]),
        )
    })?;
    let mut body = vec![0u8; len as usize - 1];
    reader.read_exact(&mut body)?;
    Ok((kind, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_in_sequence_keep_kind_and_body() {
        let frames: Vec<(FrameKind, &[u8])> = vec![
            (FrameKind::Hello, br#"{"peerId":"j-1"}"#),
            (FrameKind::Binary, &[0x81, 0xa4]),
            (FrameKind::Json, b""),
        ];
        let mut buf = Vec::new();
        for (kind, body) in &frames {
            write_frame(&mut buf, *kind, body).unwrap();
        }

        let mut cursor = Cursor::new(&buf);
        for (kind, body) in &frames {
            let (k, b) = read_frame(&mut cursor).unwrap();
            assert_eq!(k, *kind);
            assert_eq!(b, *body);
        }
    }

    #[test]
    fn rejects_oversized_write() {
        let big = vec![0u8; MAX_FRAME_SIZE as usize];
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, FrameKind::Binary, &big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn rejects_oversized_read() {
        let fake_len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(fake_len.to_vec());
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut wire = 2u32.to_be_bytes().to_vec();
        wire.extend_from_slice(&[9, 0]);
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_unexpected_eof() {
        let mut cursor = Cursor::new(vec![0u8, 1]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn hello_frame_omits_missing_identity() {
        let hello = HelloFrame {
            peer_id: ConnectionId::from("j-abc"),
            persistent_id: None,
        };
        let json = serde_json::to_string(&hello).unwrap();
        assert_eq!(json, r#"{"peerId":"j-abc"}"#);
    }
}
