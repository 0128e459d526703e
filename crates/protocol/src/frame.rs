//! Length-prefixed message framing.
//!
//! A frame is a little-endian `u32` length followed by a body: the message
//! code and the payload. The length counts the body, not itself.

use std::io::Write;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;
use crate::wire::{Encodable, PayloadCursor};

/// Upper bound on accepted frame bodies. Anything larger is treated as a
/// corrupted stream rather than a message.
pub const MAX_FRAME_LENGTH: u32 = 16 * 1024 * 1024;

/// Width of the code field at the head of a frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Server and distributed frames: four code bytes.
    Server,
    /// Peer frames: one code byte.
    Peer,
}

impl FrameKind {
    pub fn code_len(self) -> usize {
        match self {
            FrameKind::Server => 4,
            FrameKind::Peer => 1,
        }
    }
}

/// A whole decoded frame: message code plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode a frame ready to be written to the wire.
    pub fn encode(kind: FrameKind, code: u32, payload: &[u8]) -> Vec<u8> {
        if kind == FrameKind::Peer {
            debug_assert!(code <= u8::MAX as u32, "peer frame codes are one byte");
        }

        let body_len = kind.code_len() + payload.len();
        let mut out = Vec::with_capacity(4 + body_len);
        (body_len as u32)
            .encode(&mut out)
            .expect("in-memory writers don't error");
        match kind {
            FrameKind::Server => code.encode(&mut out),
            FrameKind::Peer => (code as u8).encode(&mut out),
        }
        .expect("in-memory writers don't error");
        out.write_all(payload).expect("in-memory writers don't error");
        out
    }

    /// Split a length-delimited body (code field plus payload) into a frame.
    pub fn parse(kind: FrameKind, body: &[u8]) -> Result<Self, Error> {
        let mut cursor = PayloadCursor::new(body);
        let code = match kind {
            FrameKind::Server => cursor.read_u32()?,
            FrameKind::Peer => cursor.read_u8()? as u32,
        };
        Ok(Self {
            code,
            payload: body[kind.code_len()..].to_vec(),
        })
    }

    /// Read one whole frame off the reader: four length bytes, then the body.
    pub async fn read<R>(kind: FrameKind, reader: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes);
        if len < kind.code_len() as u32 {
            return Err(Error::malformed(
                0,
                format!("frame length {len} is shorter than the code field"),
            ));
        }
        if len > MAX_FRAME_LENGTH {
            return Err(Error::malformed(
                0,
                format!("frame length {len} exceeds the {MAX_FRAME_LENGTH} byte cap"),
            ));
        }

        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;
        Self::parse(kind, &body)
    }

    /// Decode the payload through a bounds-checked cursor.
    pub fn cursor(&self) -> PayloadCursor<'_> {
        PayloadCursor::new(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_frame_round_trip() {
        let encoded = Frame::encode(FrameKind::Server, 18, &[1, 2, 3]);
        // length = 4 code bytes + 3 payload bytes
        assert_eq!(&encoded[..4], &[7, 0, 0, 0]);

        let frame = Frame::read(FrameKind::Server, &mut encoded.as_slice())
            .await
            .unwrap();
        assert_eq!(frame.code, 18);
        assert_eq!(frame.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn peer_frame_round_trip() {
        let encoded = Frame::encode(FrameKind::Peer, 40, b"xyz");
        assert_eq!(&encoded[..4], &[4, 0, 0, 0]);
        assert_eq!(encoded[4], 40);

        let frame = Frame::read(FrameKind::Peer, &mut encoded.as_slice())
            .await
            .unwrap();
        assert_eq!(frame.code, 40);
        assert_eq!(frame.payload, b"xyz".to_vec());
    }

    #[tokio::test]
    async fn empty_payload_round_trip() {
        let encoded = Frame::encode(FrameKind::Server, 71, &[]);
        let frame = Frame::read(FrameKind::Server, &mut encoded.as_slice())
            .await
            .unwrap();
        assert_eq!(frame.code, 71);
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn undersized_length_is_malformed() {
        // Peer frames need at least one code byte; a zero-length body can
        // never hold one.
        let bytes = [0u8, 0, 0, 0];
        let err = Frame::read(FrameKind::Peer, &mut bytes.as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FrameMalformed { .. }));
    }

    #[tokio::test]
    async fn oversized_length_is_malformed() {
        let bytes = [0xff, 0xff, 0xff, 0xff];
        let err = Frame::read(FrameKind::Server, &mut bytes.as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FrameMalformed { .. }));
    }

    #[tokio::test]
    async fn truncated_body_is_io_error() {
        let mut encoded = Frame::encode(FrameKind::Server, 1, &[9, 9, 9]);
        encoded.truncate(encoded.len() - 1);

        let err = Frame::read(FrameKind::Server, &mut encoded.as_slice())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
