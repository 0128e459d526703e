//! Messages exchanged directly between peers.

use std::io::{self, Write};

use crate::error::Error;
use crate::frame::{Frame, FrameKind};
use crate::messages::ConnectionType;
use crate::wire::{serialize, Decodable, Encodable, PayloadCursor};

/// Codes of the two handshake messages that may open a peer socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PeerInitCode {
    PierceFirewall = 0,
    PeerInit = 1,
}

/// Peer message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PeerCode {
    TransferRequest = 40,
    TransferResponse = 41,
}

impl PeerCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            40 => Some(Self::TransferRequest),
            41 => Some(Self::TransferResponse),
            _ => None,
        }
    }
}

fn to_frame<T: Encodable>(code: u32, message: &T) -> Vec<u8> {
    Frame::encode(FrameKind::Peer, code, &serialize(message))
}

/// First frame on an unsolicited peer socket: who we are and why we dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInit {
    pub username: String,
    pub conn_type: ConnectionType,
    pub token: u32,
}

impl PeerInit {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(PeerInitCode::PeerInit as u32, self)
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, Error> {
        Self::decode(&mut PayloadCursor::new(payload))
    }
}

impl Encodable for PeerInit {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.username.encode(writer)?;
        len += self.conn_type.encode(writer)?;
        len += self.token.encode(writer)?;
        Ok(len)
    }
}

impl Decodable for PeerInit {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        Ok(Self {
            username: reader.read_string()?,
            conn_type: ConnectionType::decode(reader)?,
            token: reader.read_u32()?,
        })
    }
}

/// First frame on a solicited socket: the token we were asked to echo back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PierceFirewall {
    pub token: u32,
}

impl PierceFirewall {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(PeerInitCode::PierceFirewall as u32, self)
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, Error> {
        Self::decode(&mut PayloadCursor::new(payload))
    }
}

impl Encodable for PierceFirewall {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.token.encode(writer)
    }
}

impl Decodable for PierceFirewall {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        Ok(Self {
            token: reader.read_u32()?,
        })
    }
}

/// Which way the bytes of a transfer flow, from the requester's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransferDirection {
    Download = 0,
    Upload = 1,
}

impl Decodable for TransferDirection {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        let position = reader.position();
        match reader.read_u32()? {
            0 => Ok(Self::Download),
            1 => Ok(Self::Upload),
            other => Err(Error::malformed(
                position,
                format!("unknown transfer direction {other}"),
            )),
        }
    }
}

/// Ask a peer for a file, or a peer offering one to us.
///
/// Upload-direction requests carry the file size; download-direction
/// requests do not, the size arrives with the peer's answering request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub token: u32,
    pub filename: String,
    pub size: Option<u64>,
}

impl TransferRequest {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(PeerCode::TransferRequest as u32, self)
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, Error> {
        Self::decode(&mut PayloadCursor::new(payload))
    }
}

impl Encodable for TransferRequest {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += (self.direction as u32).encode(writer)?;
        len += self.token.encode(writer)?;
        len += self.filename.encode(writer)?;
        if self.direction == TransferDirection::Upload {
            len += self.size.unwrap_or(0).encode(writer)?;
        }
        Ok(len)
    }
}

impl Decodable for TransferRequest {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        let direction = TransferDirection::decode(reader)?;
        let token = reader.read_u32()?;
        let filename = reader.read_string()?;
        let size = if direction == TransferDirection::Upload {
            Some(reader.read_u64()?)
        } else {
            None
        };
        Ok(Self {
            direction,
            token,
            filename,
            size,
        })
    }
}

/// Answer to a [`TransferRequest`].
///
/// An allowing response may carry the file size; a refusing response carries
/// the reason (commonly `"Queued"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub token: u32,
    pub allowed: bool,
    pub size: Option<u64>,
    pub message: Option<String>,
}

impl TransferResponse {
    pub fn allowed(token: u32, size: Option<u64>) -> Self {
        Self {
            token,
            allowed: true,
            size,
            message: None,
        }
    }

    pub fn queued(token: u32, message: impl Into<String>) -> Self {
        Self {
            token,
            allowed: false,
            size: None,
            message: Some(message.into()),
        }
    }

    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(PeerCode::TransferResponse as u32, self)
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, Error> {
        Self::decode(&mut PayloadCursor::new(payload))
    }
}

impl Encodable for TransferResponse {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.token.encode(writer)?;
        len += self.allowed.encode(writer)?;
        if self.allowed {
            if let Some(size) = self.size {
                len += size.encode(writer)?;
            }
        } else if let Some(message) = &self.message {
            len += message.encode(writer)?;
        }
        Ok(len)
    }
}

impl Decodable for TransferResponse {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        let token = reader.read_u32()?;
        let allowed = reader.read_bool()?;
        let mut size = None;
        let mut message = None;
        if allowed {
            if reader.remaining() >= 8 {
                size = Some(reader.read_u64()?);
            }
        } else if reader.remaining() > 0 {
            message = Some(reader.read_string()?);
        }
        Ok(Self {
            token,
            allowed,
            size,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_frame(bytes: &[u8]) -> Frame {
        Frame::parse(FrameKind::Peer, &bytes[4..]).unwrap()
    }

    #[test]
    fn peer_init_round_trip() {
        let init = PeerInit {
            username: "alice".into(),
            conn_type: ConnectionType::Peer,
            token: 31,
        };
        let frame = parse_frame(&init.to_frame());
        assert_eq!(frame.code, PeerInitCode::PeerInit as u32);
        assert_eq!(PeerInit::decode(&mut frame.cursor()).unwrap(), init);
    }

    #[test]
    fn pierce_firewall_round_trip() {
        let pierce = PierceFirewall { token: 77 };
        let frame = parse_frame(&pierce.to_frame());
        assert_eq!(frame.code, PeerInitCode::PierceFirewall as u32);
        assert_eq!(PierceFirewall::decode(&mut frame.cursor()).unwrap(), pierce);
    }

    #[test]
    fn download_request_has_no_size() {
        let request = TransferRequest {
            direction: TransferDirection::Download,
            token: 7,
            filename: "x".into(),
            size: None,
        };
        let frame = parse_frame(&request.to_frame());
        let decoded = TransferRequest::decode_payload(&frame.payload).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn upload_request_carries_size() {
        let request = TransferRequest {
            direction: TransferDirection::Upload,
            token: 99,
            filename: "x".into(),
            size: Some(1024),
        };
        let frame = parse_frame(&request.to_frame());
        let decoded = TransferRequest::decode_payload(&frame.payload).unwrap();
        assert_eq!(decoded.size, Some(1024));
    }

    #[test]
    fn queued_response_round_trip() {
        let response = TransferResponse::queued(7, "Queued");
        let frame = parse_frame(&response.to_frame());
        let decoded = TransferResponse::decode_payload(&frame.payload).unwrap();
        assert!(!decoded.allowed);
        assert_eq!(decoded.message.as_deref(), Some("Queued"));
    }

    #[test]
    fn allowed_response_round_trip() {
        let response = TransferResponse::allowed(99, Some(1024));
        let frame = parse_frame(&response.to_frame());
        let decoded = TransferResponse::decode_payload(&frame.payload).unwrap();
        assert!(decoded.allowed);
        assert_eq!(decoded.size, Some(1024));
        assert_eq!(decoded.message, None);
    }

    #[test]
    fn bare_allowed_response_decodes() {
        let response = TransferResponse::allowed(5, None);
        let frame = parse_frame(&response.to_frame());
        let decoded = TransferResponse::decode_payload(&frame.payload).unwrap();
        assert!(decoded.allowed);
        assert_eq!(decoded.size, None);
    }
}
