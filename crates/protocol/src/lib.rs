//! Soulseek wire protocol: little-endian frames and typed message payloads.
//!
//! The network speaks length-prefixed binary frames. Server and distributed
//! frames carry a four-byte message code, peer frames a single code byte.
//! This crate knows how to frame, unframe and (de)serialize the payloads the
//! client core exchanges; it knows nothing about sockets or sessions.

pub use error::Error;
pub use frame::{Frame, FrameKind, MAX_FRAME_LENGTH};
pub use wire::{serialize, Decodable, Encodable, PayloadCursor};

pub mod error;
pub mod frame;
pub mod messages;
pub mod wire;
