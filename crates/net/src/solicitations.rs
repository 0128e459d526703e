//! Pending solicitation tokens awaiting a pierce-back.

use std::collections::HashMap;
use std::sync::Mutex;

use slsk_protocol::messages::ConnectionType;

/// What a solicitation token was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solicitation {
    pub username: String,
    pub conn_type: ConnectionType,
}

/// Tokens we have asked the server to relay, keyed by token.
///
/// An entry is added before the `ConnectToPeer` request goes out and removed
/// when the pierced connection is routed back or the attempt is abandoned.
/// Tokens are unique across the process for as long as they are pending.
#[derive(Debug, Default)]
pub struct SolicitationTable {
    inner: Mutex<HashMap<u32, Solicitation>>,
}

impl SolicitationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending solicitation. Returns `false` when the token is
    /// already taken.
    pub fn insert(&self, token: u32, solicitation: Solicitation) -> bool {
        let mut inner = self.inner.lock().expect("solicitation table poisoned");
        if inner.contains_key(&token) {
            return false;
        }
        inner.insert(token, solicitation);
        true
    }

    pub fn remove(&self, token: u32) -> Option<Solicitation> {
        self.inner
            .lock()
            .expect("solicitation table poisoned")
            .remove(&token)
    }

    pub fn contains(&self, token: u32) -> bool {
        self.inner
            .lock()
            .expect("solicitation table poisoned")
            .contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("solicitation table poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
