//! Keyed promise registry correlating requests with their responses.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::trace;

use crate::error::Error;

/// Correlation key for a wait.
///
/// Waits on equal keys form a FIFO queue and are completed one at a time, in
/// registration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitKey {
    /// A server message with the given code.
    ServerMessage { code: u32 },

    /// A peer message with the given code from the given user.
    PeerMessage { username: String, code: u32 },

    /// The peer's answer to a transfer request we sent with `token`.
    TransferResponse { username: String, token: u32 },

    /// The peer-initiated transfer request naming a file we queued.
    TransferRequest { username: String, filename: String },

    /// An inbound pierced connection for a peer or transfer solicitation.
    SolicitedPeerConnection { token: u32 },

    /// An inbound pierced connection for a distributed solicitation.
    SolicitedDistributedConnection { token: u32 },

    /// A transfer connection that produced the peer's token for us.
    DirectTransfer { username: String, token: u32 },
}

impl WaitKey {
    /// The username this key is scoped to, when it is scoped to one.
    pub fn username(&self) -> Option<&str> {
        match self {
            WaitKey::PeerMessage { username, .. }
            | WaitKey::TransferResponse { username, .. }
            | WaitKey::TransferRequest { username, .. }
            | WaitKey::DirectTransfer { username, .. } => Some(username),
            _ => None,
        }
    }
}

struct WaitEntry<T> {
    id: u64,
    tx: oneshot::Sender<Result<T, Error>>,
}

struct Registry<T> {
    waits: HashMap<WaitKey, VecDeque<WaitEntry<T>>>,
    next_id: u64,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            waits: HashMap::new(),
            next_id: 0,
        }
    }
}

/// FIFO promise registry.
///
/// `complete` and `fail` resolve the oldest pending wait for a key and are
/// no-ops when nothing is pending. A wait that timed out removes itself, so
/// a later completion flows to the next registrant instead.
pub struct Waiter<T> {
    registry: Mutex<Registry<T>>,
    default_timeout: Duration,
}

impl<T: Send + 'static> Waiter<T> {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            default_timeout,
        }
    }

    /// Register a wait and block until it is completed, failed, cancelled or
    /// the deadline passes. `timeout` falls back to the configured default.
    pub async fn wait(&self, key: WaitKey, timeout: Option<Duration>) -> Result<T, Error> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (id, rx) = self.register(key.clone());

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.remove(&key, id);
                trace!(?key, "wait timed out");
                Err(Error::WaitTimedOut)
            }
            Ok(Err(_)) => Err(Error::Cancelled),
            Ok(Ok(result)) => result,
        }
    }

    /// Register a wait with no deadline. Only completion, failure or
    /// [`Waiter::cancel_all`] resolves it.
    pub async fn wait_indefinitely(&self, key: WaitKey) -> Result<T, Error> {
        let (_id, rx) = self.register(key);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Resolve the oldest pending wait for `key` with `value`.
    pub fn complete(&self, key: &WaitKey, value: T) {
        let mut value = Some(value);
        // Skip over waits whose futures were dropped; their receivers are
        // gone and the value would be lost.
        while let Some(entry) = self.pop(key) {
            match entry.tx.send(Ok(value.take().expect("value present until sent"))) {
                Ok(()) => return,
                Err(Ok(returned)) => value = Some(returned),
                Err(Err(_)) => unreachable!("sent value was Ok"),
            }
        }
    }

    /// Fail the oldest pending wait for `key` with `err`.
    pub fn fail(&self, key: &WaitKey, err: Error) {
        let mut err = Some(err);
        while let Some(entry) = self.pop(key) {
            match entry.tx.send(Err(err.take().expect("error present until sent"))) {
                Ok(()) => return,
                Err(Err(returned)) => err = Some(returned),
                Err(Ok(_)) => unreachable!("sent value was Err"),
            }
        }
    }

    /// Fail every pending wait whose key matches the predicate.
    pub fn fail_where(
        &self,
        predicate: impl Fn(&WaitKey) -> bool,
        err: impl Fn() -> Error,
    ) {
        let drained: Vec<WaitEntry<T>> = {
            let mut registry = self.registry.lock().expect("waiter registry poisoned");
            let keys: Vec<WaitKey> = registry
                .waits
                .keys()
                .filter(|key| predicate(key))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| registry.waits.remove(&key))
                .flatten()
                .collect()
        };
        for entry in drained {
            let _ = entry.tx.send(Err(err()));
        }
    }

    /// Fail every pending wait with [`Error::Cancelled`].
    pub fn cancel_all(&self) {
        self.fail_where(|_| true, || Error::Cancelled);
    }

    /// Number of pending waits for `key`.
    pub fn pending(&self, key: &WaitKey) -> usize {
        self.registry
            .lock()
            .expect("waiter registry poisoned")
            .waits
            .get(key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    fn register(&self, key: WaitKey) -> (u64, oneshot::Receiver<Result<T, Error>>) {
        let (tx, rx) = oneshot::channel();
        let mut registry = self.registry.lock().expect("waiter registry poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .waits
            .entry(key)
            .or_default()
            .push_back(WaitEntry { id, tx });
        (id, rx)
    }

    fn pop(&self, key: &WaitKey) -> Option<WaitEntry<T>> {
        let mut registry = self.registry.lock().expect("waiter registry poisoned");
        let queue = registry.waits.get_mut(key)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            registry.waits.remove(key);
        }
        entry
    }

    fn remove(&self, key: &WaitKey, id: u64) {
        let mut registry = self.registry.lock().expect("waiter registry poisoned");
        if let Some(queue) = registry.waits.get_mut(key) {
            queue.retain(|entry| entry.id != id);
            if queue.is_empty() {
                registry.waits.remove(key);
            }
        }
    }
}
