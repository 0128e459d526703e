//! Soulseek client core: connections, waiters, peer and distributed
//! connection management, and the download engine.
//!
//! The [`session::Session`] owns one long-lived server connection and the
//! managers around it; peers are reached over short-lived connections
//! established directly or, for firewalled peers, through a server-relayed
//! pierce handshake, whichever wins the race.

pub use conn::{
    ConnKey, Connection, ConnectionState, FrameHandler, Governor, MessageConnection,
};
pub use error::Error;
pub use options::Options;
pub use waiter::{WaitKey, Waiter};

pub mod conn;
pub mod distributed;
pub mod error;
pub mod events;
pub mod listener;
pub mod options;
pub mod peer;
pub mod session;
pub mod solicitations;
pub mod token;
pub mod transfer;
pub mod waiter;
