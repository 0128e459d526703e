//! Event and diagnostic types emitted by the client core.

use serde::Deserialize;

use crate::conn::{ConnKey, ConnectionState};

/// Events emitted by a single connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The socket reached `Connected`.
    Connected { id: u64, key: ConnKey },

    /// The socket reached `Disconnected`. Fired exactly once per connection.
    Disconnected {
        id: u64,
        key: ConnKey,
        reason: String,
    },

    /// The connection moved between lifecycle states.
    StateChanged {
        id: u64,
        key: ConnKey,
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Bytes arrived on the socket.
    DataRead { id: u64, key: ConnKey, bytes: usize },

    /// Bytes were written to the socket.
    DataWritten { id: u64, key: ConnKey, bytes: usize },
}

/// Severity of a diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warning,
}

/// A human-readable diagnostic from the client internals.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
}

/// Filtering sink for diagnostics.
///
/// Events below the configured minimum are dropped. Delivery failures are
/// ignored; the receiver may already be gone during shutdown.
#[derive(Clone)]
pub struct DiagnosticSink {
    minimum: DiagnosticLevel,
    tx: flume::Sender<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new(minimum: DiagnosticLevel) -> (Self, flume::Receiver<Diagnostic>) {
        let (tx, rx) = flume::unbounded();
        (Self { minimum, tx }, rx)
    }

    pub fn emit(&self, level: DiagnosticLevel, message: impl Into<String>) {
        if level < self.minimum {
            return;
        }
        let _ = self.tx.send(Diagnostic {
            level,
            message: message.into(),
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(DiagnosticLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(DiagnosticLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(DiagnosticLevel::Warning, message);
    }
}
