//! Messages exchanged with the central server.

use std::io::{self, Write};
use std::net::Ipv4Addr;

use crate::error::Error;
use crate::frame::{Frame, FrameKind};
use crate::messages::ConnectionType;
use crate::wire::{serialize, Decodable, Encodable, PayloadCursor};

/// Server message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServerCode {
    SetListenPort = 2,
    GetPeerAddress = 3,
    ConnectToPeer = 18,
    PrivateMessage = 22,
    AckPrivateMessage = 23,
    HaveNoParents = 71,
    ParentsIp = 73,
    AcceptChildren = 100,
    NetInfo = 102,
    BranchLevel = 126,
    BranchRoot = 127,
    ChildDepth = 129,
}

impl ServerCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            2 => Some(Self::SetListenPort),
            3 => Some(Self::GetPeerAddress),
            18 => Some(Self::ConnectToPeer),
            22 => Some(Self::PrivateMessage),
            23 => Some(Self::AckPrivateMessage),
            71 => Some(Self::HaveNoParents),
            73 => Some(Self::ParentsIp),
            100 => Some(Self::AcceptChildren),
            102 => Some(Self::NetInfo),
            126 => Some(Self::BranchLevel),
            127 => Some(Self::BranchRoot),
            129 => Some(Self::ChildDepth),
            _ => None,
        }
    }
}

fn to_frame<T: Encodable>(code: ServerCode, message: &T) -> Vec<u8> {
    Frame::encode(FrameKind::Server, code as u32, &serialize(message))
}

/// Announce the port our listener accepts peer connections on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetListenPort {
    pub port: u32,
}

impl SetListenPort {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(ServerCode::SetListenPort, self)
    }
}

impl Encodable for SetListenPort {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.port.encode(writer)
    }
}

/// Ask the server where a user can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddressRequest {
    pub username: String,
}

impl PeerAddressRequest {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(ServerCode::GetPeerAddress, self)
    }
}

impl Encodable for PeerAddressRequest {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.username.encode(writer)
    }
}

/// The server's answer to [`PeerAddressRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddressResponse {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u32,
}

impl Decodable for PeerAddressResponse {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        Ok(Self {
            username: reader.read_string()?,
            ip: reader.read_ipv4()?,
            port: reader.read_u32()?,
        })
    }
}

/// Ask the server to have `username` dial us back with `token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToPeerRequest {
    pub token: u32,
    pub username: String,
    pub conn_type: ConnectionType,
}

impl ConnectToPeerRequest {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(ServerCode::ConnectToPeer, self)
    }
}

impl Encodable for ConnectToPeerRequest {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.token.encode(writer)?;
        len += self.username.encode(writer)?;
        len += self.conn_type.encode(writer)?;
        Ok(len)
    }
}

/// The server relaying another user's request that we dial them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToPeerNotification {
    pub username: String,
    pub conn_type: ConnectionType,
    pub ip: Ipv4Addr,
    pub port: u32,
    pub token: u32,
    pub privileged: bool,
}

impl Decodable for ConnectToPeerNotification {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        Ok(Self {
            username: reader.read_string()?,
            conn_type: ConnectionType::decode(reader)?,
            ip: reader.read_ipv4()?,
            port: reader.read_u32()?,
            token: reader.read_u32()?,
            // Some server implementations omit the trailing flag.
            privileged: if reader.remaining() > 0 {
                reader.read_bool()?
            } else {
                false
            },
        })
    }
}

#[cfg(test)]
impl Encodable for ConnectToPeerNotification {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.username.encode(writer)?;
        len += self.conn_type.encode(writer)?;
        len += self.ip.encode(writer)?;
        len += self.port.encode(writer)?;
        len += self.token.encode(writer)?;
        len += self.privileged.encode(writer)?;
        Ok(len)
    }
}

/// A private chat message relayed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    pub id: u32,
    pub timestamp: u32,
    pub username: String,
    pub message: String,
    pub is_admin: bool,
}

impl Decodable for PrivateMessage {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        Ok(Self {
            id: reader.read_u32()?,
            timestamp: reader.read_u32()?,
            username: reader.read_string()?,
            message: reader.read_string()?,
            is_admin: if reader.remaining() > 0 {
                reader.read_bool()?
            } else {
                false
            },
        })
    }
}

/// Confirm receipt of a private message so the server stops re-sending it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPrivateMessage {
    pub id: u32,
}

impl AckPrivateMessage {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(ServerCode::AckPrivateMessage, self)
    }
}

impl Encodable for AckPrivateMessage {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.id.encode(writer)
    }
}

/// One endpoint in the server's distributed parent candidate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentCandidate {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u32,
}

/// The server's pool of potential distributed parents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInfo {
    pub parents: Vec<ParentCandidate>,
}

impl Decodable for NetInfo {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        let count = reader.read_u32()?;
        let mut parents = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            parents.push(ParentCandidate {
                username: reader.read_string()?,
                ip: reader.read_ipv4()?,
                port: reader.read_u32()?,
            });
        }
        Ok(Self { parents })
    }
}

#[cfg(test)]
impl Encodable for NetInfo {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = (self.parents.len() as u32).encode(writer)?;
        for parent in &self.parents {
            len += parent.username.encode(writer)?;
            len += parent.ip.encode(writer)?;
            len += parent.port.encode(writer)?;
        }
        Ok(len)
    }
}

/// Whether we are still looking for a distributed parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaveNoParents(pub bool);

impl HaveNoParents {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(ServerCode::HaveNoParents, &self.0)
    }
}

/// The address of our adopted parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentsIp(pub Ipv4Addr);

impl ParentsIp {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(ServerCode::ParentsIp, &self.0)
    }
}

/// Our level in the distributed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchLevel(pub u32);

impl BranchLevel {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(ServerCode::BranchLevel, &self.0)
    }
}

/// The username at the root of our branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRoot(pub String);

impl BranchRoot {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(ServerCode::BranchRoot, &self.0)
    }
}

/// Depth of the subtree hanging off our children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildDepth(pub u32);

impl ChildDepth {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(ServerCode::ChildDepth, &self.0)
    }
}

/// Whether we currently take on new distributed children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptChildren(pub bool);

impl AcceptChildren {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(ServerCode::AcceptChildren, &self.0)
    }
}
