//! Typed message payloads exchanged with the server and with peers.

use std::io::{self, Write};

use crate::error::Error;
use crate::wire::{Decodable, Encodable, PayloadCursor};

pub mod distributed;
pub mod peer;
pub mod server;

/// Connection-type tag carried in `PeerInit` and `ConnectToPeer` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// `"P"` - a peer message connection.
    Peer,
    /// `"F"` - a file transfer connection.
    Transfer,
    /// `"D"` - a distributed network connection.
    Distributed,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Peer => "P",
            ConnectionType::Transfer => "F",
            ConnectionType::Distributed => "D",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "P" => Some(ConnectionType::Peer),
            "F" => Some(ConnectionType::Transfer),
            "D" => Some(ConnectionType::Distributed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Encodable for ConnectionType {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_str().encode(writer)
    }
}

impl Decodable for ConnectionType {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        let position = reader.position();
        let tag = reader.read_string()?;
        Self::from_tag(&tag)
            .ok_or_else(|| Error::malformed(position, format!("unknown connection type {tag:?}")))
    }
}
