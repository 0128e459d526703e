//! Messages flowing over distributed parent and child connections.

use std::io::{self, Write};

use crate::error::Error;
use crate::frame::{Frame, FrameKind};
use crate::wire::{serialize, Decodable, Encodable, PayloadCursor};

/// Distributed message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DistributedCode {
    Ping = 0,
    SearchRequest = 3,
    BranchLevel = 4,
    BranchRoot = 5,
    ChildDepth = 7,
}

impl DistributedCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Ping),
            3 => Some(Self::SearchRequest),
            4 => Some(Self::BranchLevel),
            5 => Some(Self::BranchRoot),
            7 => Some(Self::ChildDepth),
            _ => None,
        }
    }
}

fn to_frame<T: Encodable>(code: DistributedCode, message: &T) -> Vec<u8> {
    Frame::encode(FrameKind::Server, code as u32, &serialize(message))
}

/// A search propagated down the distributed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedSearchRequest {
    pub unknown: u32,
    pub username: String,
    pub token: u32,
    pub query: String,
}

impl DistributedSearchRequest {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(DistributedCode::SearchRequest, self)
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, Error> {
        Self::decode(&mut PayloadCursor::new(payload))
    }
}

impl Encodable for DistributedSearchRequest {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = 0;
        len += self.unknown.encode(writer)?;
        len += self.username.encode(writer)?;
        len += self.token.encode(writer)?;
        len += self.query.encode(writer)?;
        Ok(len)
    }
}

impl Decodable for DistributedSearchRequest {
    fn decode(reader: &mut PayloadCursor<'_>) -> Result<Self, Error> {
        Ok(Self {
            unknown: reader.read_u32()?,
            username: reader.read_string()?,
            token: reader.read_u32()?,
            query: reader.read_string()?,
        })
    }
}

/// The sender's level in the distributed tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedBranchLevel(pub u32);

impl DistributedBranchLevel {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(DistributedCode::BranchLevel, &self.0)
    }
}

/// The username at the root of the sender's branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedBranchRoot(pub String);

impl DistributedBranchRoot {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(DistributedCode::BranchRoot, &self.0)
    }
}

/// Depth of the subtree below the sending child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedChildDepth(pub u32);

impl DistributedChildDepth {
    pub fn to_frame(&self) -> Vec<u8> {
        to_frame(DistributedCode::ChildDepth, &self.0)
    }
}
