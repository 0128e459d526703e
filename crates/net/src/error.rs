//! Client error kinds.

use thiserror::Error;

/// An error occurring in the connection, waiter or transfer subsystems.
#[derive(Error, Debug)]
pub enum Error {
    /// The connect deadline elapsed before the socket was established.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The remote host could not be reached.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The socket was handed off and the connection is no longer usable.
    #[error("connection detached")]
    Detached,

    /// No bytes arrived within the read-inactivity window.
    #[error("read timed out")]
    ReadTimeout,

    /// A socket read failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// A socket write failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Framing or payload decoding failed.
    #[error(transparent)]
    Protocol(#[from] slsk_protocol::Error),

    /// The operation, or the wait backing it, was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A bounded wait ran out of time.
    #[error("wait timed out")]
    WaitTimedOut,

    /// A wait was failed by the completing side.
    #[error("wait failed: {0}")]
    WaitFailed(String),

    /// A peer offered an immediate send for a download request.
    #[error("an allowed transfer response is unreachable for downloads")]
    TransferAllowedUnreachable,

    /// The token generator gave up after too many collisions.
    #[error("no free token available")]
    TokenExhausted,

    /// The remote side violated the protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}
