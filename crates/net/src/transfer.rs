//! Download state machine and byte streaming.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use slsk_protocol::messages::peer::{
    TransferDirection, TransferRequest as TransferRequestMsg, TransferResponse,
};
use slsk_protocol::Frame;

use crate::conn::{Connection, Governor};
use crate::error::Error;
use crate::peer::PeerConnectionManager;
use crate::token::TokenGenerator;
use crate::waiter::{WaitKey, Waiter};

/// Bytes pulled off a transfer connection per progress tick.
const TRANSFER_CHUNK: usize = 32 * 1024;

/// The start-of-stream marker the downloader writes before the uploader
/// begins sending. Eight zero bytes, preserved bit-exact for compatibility.
const TRANSFER_START_MARKER: [u8; 8] = [0u8; 8];

/// Bitmask of transfer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStates(u32);

impl TransferStates {
    pub const NONE: Self = Self(0);
    pub const QUEUED: Self = Self(1);
    pub const INITIALIZING: Self = Self(1 << 1);
    pub const IN_PROGRESS: Self = Self(1 << 2);
    pub const COMPLETED: Self = Self(1 << 3);
    pub const SUCCEEDED: Self = Self(1 << 4);
    pub const CANCELLED: Self = Self(1 << 5);
    pub const TIMED_OUT: Self = Self(1 << 6);
    pub const ERRORED: Self = Self(1 << 7);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_terminal(self) -> bool {
        self.contains(Self::COMPLETED)
    }
}

impl BitOr for TransferStates {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TransferStates {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for TransferStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TransferStates, &str); 8] = [
            (TransferStates::QUEUED, "queued"),
            (TransferStates::INITIALIZING, "initializing"),
            (TransferStates::IN_PROGRESS, "in-progress"),
            (TransferStates::COMPLETED, "completed"),
            (TransferStates::SUCCEEDED, "succeeded"),
            (TransferStates::CANCELLED, "cancelled"),
            (TransferStates::TIMED_OUT, "timed-out"),
            (TransferStates::ERRORED, "errored"),
        ];
        let mut first = true;
        for (state, name) in NAMES {
            if self.contains(state) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Descriptor of one download.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub username: String,
    pub filename: String,
    pub token: u32,
    pub remote_token: Option<u32>,
    pub size: Option<u64>,
    pub state: TransferStates,
    pub bytes_transferred: u64,
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
}

impl Transfer {
    fn new(username: &str, filename: &str, token: u32) -> Self {
        Self {
            username: username.to_string(),
            filename: filename.to_string(),
            token,
            remote_token: None,
            size: None,
            state: TransferStates::NONE,
            bytes_transferred: 0,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Events emitted while a transfer runs.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    StateChanged {
        transfer: Transfer,
        previous: TransferStates,
    },
    ProgressUpdated {
        username: String,
        filename: String,
        token: u32,
        bytes_transferred: u64,
        size: Option<u64>,
    },
}

/// Drives downloads through the multi-stage handshake and the byte pull.
pub struct TransferEngine {
    peer_manager: Arc<PeerConnectionManager>,
    msg_waiter: Arc<Waiter<Frame>>,
    conn_waiter: Arc<Waiter<Arc<Connection>>>,
    tokens: Arc<TokenGenerator>,
    active: StdMutex<HashMap<u32, Transfer>>,
    events: flume::Sender<TransferEvent>,
}

impl TransferEngine {
    pub fn new(
        peer_manager: Arc<PeerConnectionManager>,
        msg_waiter: Arc<Waiter<Frame>>,
        conn_waiter: Arc<Waiter<Arc<Connection>>>,
        tokens: Arc<TokenGenerator>,
        events: flume::Sender<TransferEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_manager,
            msg_waiter,
            conn_waiter,
            tokens,
            active: StdMutex::new(HashMap::new()),
            events,
        })
    }

    /// Snapshots of the transfers currently in flight.
    pub fn active_transfers(&self) -> Vec<Transfer> {
        self.active
            .lock()
            .expect("transfer table poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Download `filename` from `username`, streaming the payload into
    /// `sink`. Returns the finalized descriptor; the terminal state is also
    /// delivered as a `StateChanged` event.
    pub async fn download<W>(
        self: &Arc<Self>,
        username: &str,
        addr: SocketAddr,
        filename: &str,
        sink: &mut W,
        governor: Option<&dyn Governor>,
        cancel: &CancellationToken,
    ) -> Result<Transfer, Error>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let token = {
            let active = &self.active;
            self.tokens
                .next_token(|token| active.lock().expect("transfer table poisoned").contains_key(&token))?
        };
        let mut transfer = Transfer::new(username, filename, token);
        self.active
            .lock()
            .expect("transfer table poisoned")
            .insert(token, transfer.clone());

        let result = self
            .run_download(&mut transfer, addr, sink, governor, cancel)
            .await;

        let terminal = match &result {
            Ok(()) => TransferStates::SUCCEEDED,
            Err(Error::Cancelled) => TransferStates::CANCELLED,
            Err(Error::ReadTimeout) | Err(Error::WaitTimedOut) => TransferStates::TIMED_OUT,
            Err(_) => TransferStates::ERRORED,
        };
        transfer.ended_at = Some(Instant::now());
        self.set_state(&mut transfer, terminal | TransferStates::COMPLETED);
        self.active
            .lock()
            .expect("transfer table poisoned")
            .remove(&token);

        debug!(
            username,
            filename,
            token,
            state = %transfer.state,
            "download finished"
        );
        result.map(|()| transfer)
    }

    async fn run_download<W>(
        self: &Arc<Self>,
        transfer: &mut Transfer,
        addr: SocketAddr,
        sink: &mut W,
        governor: Option<&dyn Governor>,
        cancel: &CancellationToken,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let username = transfer.username.clone();
        let filename = transfer.filename.clone();

        // Stage 1: a message connection to the peer.
        let conn = self
            .peer_manager
            .get_message_connection(&username, addr, cancel)
            .await?;

        // Stage 2: ask for the file.
        let request = TransferRequestMsg {
            direction: TransferDirection::Download,
            token: transfer.token,
            filename: filename.clone(),
            size: None,
        };
        conn.send(&request.to_frame(), cancel).await?;

        // Stage 3: the peer either queues us or, unreachably for downloads,
        // offers an immediate send.
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            frame = self.msg_waiter.wait(
                WaitKey::TransferResponse {
                    username: username.clone(),
                    token: transfer.token,
                },
                None,
            ) => frame?,
        };
        let response = TransferResponse::decode_payload(&frame.payload)?;
        if response.allowed {
            return Err(Error::TransferAllowedUnreachable);
        }
        trace!(
            username,
            filename,
            reason = response.message.as_deref().unwrap_or(""),
            "transfer queued by peer"
        );
        self.set_state(transfer, TransferStates::QUEUED);

        // Stage 4: the peer comes back with its own transfer request when it
        // is our turn. No deadline; queues can be long.
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            frame = self.msg_waiter.wait_indefinitely(WaitKey::TransferRequest {
                username: username.clone(),
                filename: filename.clone(),
            }) => frame?,
        };
        let peer_request = TransferRequestMsg::decode_payload(&frame.payload)?;
        transfer.remote_token = Some(peer_request.token);
        transfer.size = peer_request.size;
        self.set_state(transfer, TransferStates::INITIALIZING);

        // Stage 5: accept.
        let accept = TransferResponse::allowed(peer_request.token, peer_request.size);
        conn.send(&accept.to_frame(), cancel).await?;

        // Stage 6: a transfer connection that has exchanged tokens, however
        // it reaches us.
        let transfer_conn = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            conn = self.conn_waiter.wait(
                WaitKey::DirectTransfer {
                    username: username.clone(),
                    token: peer_request.token,
                },
                None,
            ) => conn?,
        };
        transfer.started_at = Some(Instant::now());
        self.set_state(transfer, TransferStates::IN_PROGRESS);

        // Stage 7: the start marker opens the byte stream.
        let result = async {
            transfer_conn
                .write(&TRANSFER_START_MARKER, cancel, None)
                .await?;

            // Stage 8: pull exactly `size` bytes into the sink.
            let size = transfer.size.unwrap_or(0);
            self.stream_bytes(transfer, &transfer_conn, sink, size, governor, cancel)
                .await
        }
        .await;

        // Stage 9: the transfer connection is single-use.
        let reason = match &result {
            Ok(()) => "transfer complete".to_string(),
            Err(err) => format!("transfer failed: {err}"),
        };
        transfer_conn.disconnect(&reason).await;
        result
    }

    async fn stream_bytes<W>(
        &self,
        transfer: &mut Transfer,
        conn: &Arc<Connection>,
        sink: &mut W,
        size: u64,
        governor: Option<&dyn Governor>,
        cancel: &CancellationToken,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut received: u64 = 0;
        while received < size {
            let want = ((size - received) as usize).min(TRANSFER_CHUNK);
            let bytes = conn.read(want, cancel, governor).await?;
            sink.write_all(&bytes)
                .await
                .map_err(|err| Error::WriteFailed(err.to_string()))?;
            received += bytes.len() as u64;

            transfer.bytes_transferred = received;
            self.update_snapshot(transfer);
            let _ = self.events.send(TransferEvent::ProgressUpdated {
                username: transfer.username.clone(),
                filename: transfer.filename.clone(),
                token: transfer.token,
                bytes_transferred: received,
                size: transfer.size,
            });
        }
        sink.flush()
            .await
            .map_err(|err| Error::WriteFailed(err.to_string()))?;
        Ok(())
    }

    fn set_state(&self, transfer: &mut Transfer, state: TransferStates) {
        let previous = transfer.state;
        transfer.state = state;
        self.update_snapshot(transfer);
        let _ = self.events.send(TransferEvent::StateChanged {
            transfer: transfer.clone(),
            previous,
        });
    }

    fn update_snapshot(&self, transfer: &Transfer) {
        let mut active = self.active.lock().expect("transfer table poisoned");
        if let Some(entry) = active.get_mut(&transfer.token) {
            *entry = transfer.clone();
        }
    }
}
