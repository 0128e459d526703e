//! Protocol-level errors.

use std::io;

use thiserror::Error;

/// An error produced while framing or decoding wire data.
#[derive(Error, Debug)]
pub enum Error {
    /// The frame or a payload field is malformed.
    #[error("malformed frame at byte {position}: {reason}")]
    FrameMalformed { position: usize, reason: String },

    /// An I/O error from the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for [`Error::FrameMalformed`].
    pub fn malformed(position: usize, reason: impl Into<String>) -> Self {
        Self::FrameMalformed {
            position,
            reason: reason.into(),
        }
    }
}
