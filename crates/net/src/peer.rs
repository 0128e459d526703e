//! Per-user peer message connections and transfer connections.
//!
//! Acquisition for one user is serialized by that user's record lock; the
//! number of distinct message connections is bounded by a global semaphore
//! whose permit lives inside the record, so release happens exactly once,
//! when the record is actually torn down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use slsk_protocol::messages::peer::{PeerCode, PeerInit, PierceFirewall, TransferDirection, TransferRequest};
use slsk_protocol::messages::server::ConnectToPeerNotification;
use slsk_protocol::messages::ConnectionType;
use slsk_protocol::{Frame, FrameKind};

use crate::conn::{ConnKey, Connection, ConnectionState, FrameHandler, MessageConnection};
use crate::error::Error;
use crate::events::{ConnectionEvent, DiagnosticSink};
use crate::options::Options;
use crate::session::ServerLink;
use crate::solicitations::{Solicitation, SolicitationTable};
use crate::token::TokenGenerator;
use crate::waiter::{WaitKey, Waiter};

/// How an established peer connection came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMethod {
    /// We dialed the peer ourselves.
    Direct,
    /// The peer dialed us back after a server-relayed solicitation.
    Indirect,
}

#[derive(Default)]
struct Slot {
    conn: Option<Arc<MessageConnection>>,
    method: Option<ConnectMethod>,
    permit: Option<OwnedSemaphorePermit>,
}

/// One record per username; the mutex serializes all acquisition work for
/// that user, the slot inside it holds the live connection.
#[derive(Default)]
struct Record {
    slot: Arc<Mutex<Slot>>,
}

/// Supplies live peer connections, reusing and bounding them.
pub struct PeerConnectionManager {
    local_username: String,
    options: Arc<Options>,
    records: StdMutex<HashMap<String, Arc<Record>>>,
    semaphore: Arc<Semaphore>,
    waiting_count: AtomicUsize,
    solicitations: Arc<SolicitationTable>,
    tokens: Arc<TokenGenerator>,
    server: Arc<dyn ServerLink>,
    conn_waiter: Arc<Waiter<Arc<Connection>>>,
    msg_waiter: Arc<Waiter<Frame>>,
    diag: DiagnosticSink,
    conn_events: flume::Sender<ConnectionEvent>,
}

impl PeerConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_username: String,
        options: Arc<Options>,
        server: Arc<dyn ServerLink>,
        solicitations: Arc<SolicitationTable>,
        tokens: Arc<TokenGenerator>,
        conn_waiter: Arc<Waiter<Arc<Connection>>>,
        msg_waiter: Arc<Waiter<Frame>>,
        diag: DiagnosticSink,
        conn_events: flume::Sender<ConnectionEvent>,
    ) -> Arc<Self> {
        let capacity = options.concurrent_peer_message_connections;
        Arc::new(Self {
            local_username,
            options,
            records: StdMutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(capacity)),
            waiting_count: AtomicUsize::new(0),
            solicitations,
            tokens,
            server,
            conn_waiter,
            msg_waiter,
            diag,
            conn_events,
        })
    }

    /// Callers currently blocked on the global connection bound.
    pub fn waiting_count(&self) -> usize {
        self.waiting_count.load(Ordering::SeqCst)
    }

    /// Records currently holding a live connection.
    pub fn active_count(&self) -> usize {
        self.options.concurrent_peer_message_connections - self.semaphore.available_permits()
    }

    /// Get a live message connection to `username`, reusing the recorded one
    /// when possible, otherwise racing the direct path against the indirect
    /// path.
    pub async fn get_message_connection(
        self: &Arc<Self>,
        username: &str,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<Arc<MessageConnection>, Error> {
        let mut slot = self.lock_record(username).await;

        if let Some(conn) = Self::live_connection(&mut slot) {
            trace!(username, "reusing peer message connection");
            return Ok(conn);
        }

        let permit = self.acquire_permit(cancel).await?;
        let (conn, method) = self.establish_message_connection(username, addr, cancel).await?;

        slot.conn = Some(Arc::clone(&conn));
        slot.method = Some(method);
        slot.permit = Some(permit);
        drop(slot);

        debug!(username, ?method, "peer message connection established");
        self.diag.debug(format!(
            "message connection to {username} established ({method:?})"
        ));
        conn.start_read_loop(self.frame_handler());
        Ok(conn)
    }

    /// The method that produced the recorded connection for `username`, if a
    /// connection is recorded.
    pub async fn connect_method(&self, username: &str) -> Option<ConnectMethod> {
        let record = {
            let records = self.records.lock().expect("records poisoned");
            records.get(username).cloned()
        }?;
        let slot = record.slot.lock().await;
        slot.method
    }

    /// Handle a `ConnectToPeer` the server relayed: the peer cannot accept
    /// inbound connections and asked us to dial them with their token.
    pub async fn connect_to(
        self: &Arc<Self>,
        notification: &ConnectToPeerNotification,
        cancel: &CancellationToken,
    ) -> Result<Arc<MessageConnection>, Error> {
        let username = notification.username.as_str();
        let mut slot = self.lock_record(username).await;

        if let Some(conn) = Self::live_connection(&mut slot) {
            trace!(username, "solicited connect: record already has a connection");
            return Ok(conn);
        }

        let permit = self.acquire_permit(cancel).await?;

        let key = ConnKey {
            username: Some(username.to_string()),
            addr: SocketAddr::from((notification.ip, notification.port as u16)),
        };
        let conn = MessageConnection::outbound(
            key,
            FrameKind::Peer,
            Arc::clone(&self.options),
            Some(self.options.read_inactivity_timeout),
            Some(self.conn_events.clone()),
        );
        conn.bind_handler(self.frame_handler());
        conn.connect(cancel).await?;
        conn.send(
            &PierceFirewall {
                token: notification.token,
            }
            .to_frame(),
            cancel,
        )
        .await?;

        slot.conn = Some(Arc::clone(&conn));
        slot.method = Some(ConnectMethod::Direct);
        slot.permit = Some(permit);
        drop(slot);

        debug!(username, token = notification.token, "pierced back to peer");
        Ok(conn)
    }

    /// Establish a fresh transfer connection to a peer and exchange transfer
    /// tokens: read theirs, write ours. Transfer connections are never
    /// reused and do not count against the message-connection bound.
    pub async fn get_transfer_connection(
        self: &Arc<Self>,
        username: &str,
        addr: SocketAddr,
        local_token: u32,
        cancel: &CancellationToken,
    ) -> Result<(Arc<Connection>, u32, ConnectMethod), Error> {
        let direct_cancel = cancel.child_token();
        let indirect_cancel = cancel.child_token();

        let direct = {
            let this = Arc::clone(self);
            let username = username.to_string();
            let cancel = direct_cancel.clone();
            tokio::spawn(async move {
                this.connect_transfer_direct(&username, addr, local_token, &cancel)
                    .await
            })
        };
        let indirect = {
            let this = Arc::clone(self);
            let username = username.to_string();
            let cancel = indirect_cancel.clone();
            tokio::spawn(async move {
                this.connect_indirect(&username, ConnectionType::Transfer, &cancel)
                    .await
            })
        };

        let (conn, method) = race(direct, direct_cancel, indirect, indirect_cancel).await?;

        let token_bytes = conn.read(4, cancel, None).await?;
        let remote_token = u32::from_le_bytes(
            token_bytes[..]
                .try_into()
                .expect("read returns exactly four bytes"),
        );
        conn.write(&local_token.to_le_bytes(), cancel, None).await?;

        debug!(username, local_token, remote_token, "transfer connection ready");
        Ok((conn, remote_token, method))
    }

    /// Handle a `ConnectToPeer` with the transfer tag: dial back, pierce,
    /// read the peer's token and hand the connection to the waiting
    /// download.
    pub async fn connect_to_transfer(
        self: &Arc<Self>,
        notification: &ConnectToPeerNotification,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let key = ConnKey {
            username: Some(notification.username.clone()),
            addr: SocketAddr::from((notification.ip, notification.port as u16)),
        };
        let conn = Arc::new(Connection::outbound(
            key,
            Arc::clone(&self.options),
            Some(self.options.read_inactivity_timeout),
            Some(self.conn_events.clone()),
        ));
        conn.connect(cancel).await?;
        conn.write(
            &PierceFirewall {
                token: notification.token,
            }
            .to_frame(),
            cancel,
            None,
        )
        .await?;

        let token_bytes = conn.read(4, cancel, None).await?;
        let remote_token = u32::from_le_bytes(
            token_bytes[..]
                .try_into()
                .expect("read returns exactly four bytes"),
        );

        trace!(
            username = %notification.username,
            remote_token,
            "solicited transfer connection pierced"
        );
        self.conn_waiter.complete(
            &WaitKey::DirectTransfer {
                username: notification.username.clone(),
                token: remote_token,
            },
            conn,
        );
        Ok(())
    }

    /// Accept an inbound peer message socket routed over from the listener.
    pub async fn accept_message(
        self: &Arc<Self>,
        username: &str,
        conn: Arc<Connection>,
        cancel: &CancellationToken,
    ) -> Result<Arc<MessageConnection>, Error> {
        let mut slot = self.lock_record(username).await;

        if let Some(existing) = slot.conn.take() {
            if existing.connection().state() == ConnectionState::Connected {
                // The remote end re-established; prefer the socket that works
                // for them.
                existing
                    .disconnect("superseded by inbound connection")
                    .await;
            }
        }

        let permit = match slot.permit.take() {
            Some(permit) => permit,
            None => self.acquire_permit(cancel).await?,
        };

        let msg_conn = MessageConnection::from_connection(conn, FrameKind::Peer);
        slot.conn = Some(Arc::clone(&msg_conn));
        slot.method = Some(ConnectMethod::Indirect);
        slot.permit = Some(permit);
        drop(slot);

        debug!(username, "accepted inbound peer message connection");
        msg_conn.start_read_loop(self.frame_handler());
        Ok(msg_conn)
    }

    /// Accept an inbound transfer socket: read the peer's token off it and
    /// satisfy the download waiting on `(username, remote_token)`.
    pub async fn accept_transfer(
        &self,
        username: &str,
        init_token: u32,
        conn: Arc<Connection>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let token_bytes = conn.read(4, cancel, None).await?;
        let remote_token = u32::from_le_bytes(
            token_bytes[..]
                .try_into()
                .expect("read returns exactly four bytes"),
        );

        trace!(username, init_token, remote_token, "accepted inbound transfer connection");
        self.conn_waiter.complete(
            &WaitKey::DirectTransfer {
                username: username.to_string(),
                token: remote_token,
            },
            conn,
        );
        Ok(())
    }

    /// Remove the record matching a disconnected connection and release its
    /// semaphore permit. The session's event router calls this for every
    /// `Disconnected` event.
    pub async fn handle_disconnect(&self, key: &ConnKey, conn_id: u64) {
        let Some(username) = key.username.clone() else {
            return;
        };
        let record = {
            let records = self.records.lock().expect("records poisoned");
            records.get(&username).cloned()
        };
        let Some(record) = record else { return };

        let mut slot = record.slot.lock().await;
        let matches = slot
            .conn
            .as_ref()
            .map(|conn| conn.id() == conn_id)
            .unwrap_or(false);
        if !matches {
            return;
        }

        slot.conn = None;
        slot.method = None;
        // Dropping the permit is the release; the removal outcome above
        // guarantees it happens once per record teardown. The map entry goes
        // while the slot is still locked so a concurrent acquirer cannot
        // repopulate a record that is about to be orphaned.
        slot.permit = None;
        self.records
            .lock()
            .expect("records poisoned")
            .remove(&username);
        drop(slot);

        // Correlated request/response waits for this user can no longer be
        // answered by this connection. Queued-transfer waits survive: the
        // peer may reconnect and still honor the queue.
        self.msg_waiter.fail_where(
            |wait_key| {
                wait_key.username() == Some(username.as_str())
                    && !matches!(wait_key, WaitKey::TransferRequest { .. })
            },
            || Error::WaitFailed("peer connection disconnected".into()),
        );

        trace!(username, "peer record removed");
    }

    /// Disconnect everything and refuse new acquisitions.
    pub async fn shutdown(&self) {
        self.semaphore.close();
        let records: Vec<Arc<Record>> = {
            let mut map = self.records.lock().expect("records poisoned");
            map.drain().map(|(_, record)| record).collect()
        };
        for record in records {
            let mut slot = record.slot.lock().await;
            if let Some(conn) = slot.conn.take() {
                conn.disconnect("client disconnected").await;
            }
            slot.permit = None;
        }
    }

    fn record_for(&self, username: &str) -> Arc<Record> {
        let mut records = self.records.lock().expect("records poisoned");
        Arc::clone(
            records
                .entry(username.to_string())
                .or_insert_with(|| Arc::new(Record::default())),
        )
    }

    /// Get-or-insert the record for `username` and lock its slot. A record
    /// torn down while we waited for the lock is detected and retried, so a
    /// locked slot always belongs to the mapped record.
    async fn lock_record(&self, username: &str) -> OwnedMutexGuard<Slot> {
        loop {
            let record = self.record_for(username);
            let slot = Arc::clone(&record.slot).lock_owned().await;
            let current = {
                let records = self.records.lock().expect("records poisoned");
                records
                    .get(username)
                    .map(|mapped| Arc::ptr_eq(mapped, &record))
                    .unwrap_or(false)
            };
            if current {
                return slot;
            }
        }
    }

    fn live_connection(slot: &mut Slot) -> Option<Arc<MessageConnection>> {
        match &slot.conn {
            Some(conn) if conn.connection().state() == ConnectionState::Connected => {
                Some(Arc::clone(conn))
            }
            Some(_) => {
                // A dead connection whose disconnect event has not been
                // processed yet; clear the slot and re-acquire.
                slot.conn = None;
                slot.method = None;
                slot.permit = None;
                None
            }
            None => None,
        }
    }

    async fn acquire_permit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, Error> {
        self.waiting_count.fetch_add(1, Ordering::SeqCst);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| Error::Cancelled)
            }
        };
        self.waiting_count.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn establish_message_connection(
        self: &Arc<Self>,
        username: &str,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<(Arc<MessageConnection>, ConnectMethod), Error> {
        let direct_cancel = cancel.child_token();
        let indirect_cancel = cancel.child_token();

        let direct = {
            let this = Arc::clone(self);
            let username = username.to_string();
            let cancel = direct_cancel.clone();
            tokio::spawn(async move { this.connect_message_direct(&username, addr, &cancel).await })
        };
        let indirect = {
            let this = Arc::clone(self);
            let username = username.to_string();
            let cancel = indirect_cancel.clone();
            tokio::spawn(async move {
                let conn = this
                    .connect_indirect(&username, ConnectionType::Peer, &cancel)
                    .await?;
                Ok(MessageConnection::from_connection(conn, FrameKind::Peer))
            })
        };

        race(direct, direct_cancel, indirect, indirect_cancel).await
    }

    async fn connect_message_direct(
        self: &Arc<Self>,
        username: &str,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<Arc<MessageConnection>, Error> {
        let key = ConnKey {
            username: Some(username.to_string()),
            addr,
        };
        let conn = MessageConnection::outbound(
            key,
            FrameKind::Peer,
            Arc::clone(&self.options),
            Some(self.options.read_inactivity_timeout),
            Some(self.conn_events.clone()),
        );
        conn.bind_handler(self.frame_handler());
        conn.connect(cancel).await?;

        let token = self
            .tokens
            .next_token(|token| self.solicitations.contains(token))?;
        let init = PeerInit {
            username: self.local_username.clone(),
            conn_type: ConnectionType::Peer,
            token,
        };
        conn.send(&init.to_frame(), cancel).await?;
        Ok(conn)
    }

    async fn connect_transfer_direct(
        self: &Arc<Self>,
        username: &str,
        addr: SocketAddr,
        local_token: u32,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>, Error> {
        let key = ConnKey {
            username: Some(username.to_string()),
            addr,
        };
        let conn = Arc::new(Connection::outbound(
            key,
            Arc::clone(&self.options),
            Some(self.options.read_inactivity_timeout),
            Some(self.conn_events.clone()),
        ));
        conn.connect(cancel).await?;

        let init = PeerInit {
            username: self.local_username.clone(),
            conn_type: ConnectionType::Transfer,
            token: local_token,
        };
        conn.write(&init.to_frame(), cancel, None).await?;
        Ok(conn)
    }

    /// The indirect path: register a solicitation token, ask the server to
    /// have the peer dial us, and wait for the pierced socket to be routed
    /// back by the listener.
    async fn connect_indirect(
        &self,
        username: &str,
        conn_type: ConnectionType,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>, Error> {
        let token = self
            .tokens
            .next_token(|token| self.solicitations.contains(token))?;
        let inserted = self.solicitations.insert(
            token,
            Solicitation {
                username: username.to_string(),
                conn_type,
            },
        );
        debug_assert!(inserted, "generator rejects pending tokens");

        let result = self.connect_indirect_inner(token, username, conn_type, cancel).await;
        if result.is_err() {
            // The listener removes the entry when the pierce arrives; on any
            // other outcome it is ours to clean up.
            self.solicitations.remove(token);
        }
        result
    }

    async fn connect_indirect_inner(
        &self,
        token: u32,
        username: &str,
        conn_type: ConnectionType,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>, Error> {
        self.server
            .request_connect_to_peer(token, username, conn_type)
            .await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            conn = self.conn_waiter.wait(WaitKey::SolicitedPeerConnection { token }, None) => conn,
        }
    }

    fn frame_handler(self: &Arc<Self>) -> Arc<dyn FrameHandler> {
        Arc::new(PeerFrameHandler {
            manager: Arc::downgrade(self),
        })
    }

    /// Route one whole peer message into the waiter.
    async fn dispatch_frame(&self, conn: &Arc<MessageConnection>, frame: Frame) {
        let Some(username) = conn.key().username else {
            warn!(conn = %conn.key(), "peer message on a connection with no username");
            return;
        };

        match PeerCode::from_u32(frame.code) {
            Some(PeerCode::TransferResponse) => {
                let token = match frame.cursor().read_u32() {
                    Ok(token) => token,
                    Err(err) => {
                        conn.disconnect(&format!("malformed transfer response: {err}"))
                            .await;
                        return;
                    }
                };
                self.msg_waiter.complete(
                    &WaitKey::TransferResponse {
                        username,
                        token,
                    },
                    frame,
                );
            }
            Some(PeerCode::TransferRequest) => {
                let request = match TransferRequest::decode_payload(&frame.payload) {
                    Ok(request) => request,
                    Err(err) => {
                        conn.disconnect(&format!("malformed transfer request: {err}"))
                            .await;
                        return;
                    }
                };
                match request.direction {
                    TransferDirection::Upload => {
                        // The peer is ready to send a file we queued.
                        self.msg_waiter.complete(
                            &WaitKey::TransferRequest {
                                username,
                                filename: request.filename.clone(),
                            },
                            frame,
                        );
                    }
                    TransferDirection::Download => {
                        // We share nothing; a download request from the peer
                        // has no queue to land in.
                        self.diag.info(format!(
                            "{username} requested {:?}; nothing is shared",
                            request.filename
                        ));
                    }
                }
            }
            None => {
                self.msg_waiter.complete(
                    &WaitKey::PeerMessage {
                        username,
                        code: frame.code,
                    },
                    frame,
                );
            }
        }
    }
}

struct PeerFrameHandler {
    manager: Weak<PeerConnectionManager>,
}

#[async_trait]
impl FrameHandler for PeerFrameHandler {
    async fn on_frame(&self, conn: &Arc<MessageConnection>, frame: Frame) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        manager.dispatch_frame(conn, frame).await;
    }
}

/// A raced connection that must be actively closed when its path loses.
#[async_trait]
pub(crate) trait CloseOnLoss {
    async fn close_lost(&self);
}

#[async_trait]
impl CloseOnLoss for Arc<Connection> {
    async fn close_lost(&self) {
        self.disconnect("lost connection race").await;
    }
}

#[async_trait]
impl CloseOnLoss for Arc<MessageConnection> {
    async fn close_lost(&self) {
        self.disconnect("lost connection race").await;
    }
}

enum First<T> {
    Direct(Result<Result<T, Error>, tokio::task::JoinError>),
    Indirect(Result<Result<T, Error>, tokio::task::JoinError>),
}

/// Race the direct path against the indirect path. The first sub-task to
/// succeed wins and the loser is cancelled (and drained) before returning;
/// the acquisition fails only when both paths fail.
pub(crate) async fn race<T>(
    mut direct: JoinHandle<Result<T, Error>>,
    direct_cancel: CancellationToken,
    mut indirect: JoinHandle<Result<T, Error>>,
    indirect_cancel: CancellationToken,
) -> Result<(T, ConnectMethod), Error>
where
    T: CloseOnLoss + Send + 'static,
{
    let first = tokio::select! {
        result = &mut direct => First::Direct(result),
        result = &mut indirect => First::Indirect(result),
    };

    match first {
        First::Direct(Ok(Ok(conn))) => {
            indirect_cancel.cancel();
            // A loser that still managed to connect is surplus.
            if let Ok(Ok(loser)) = indirect.await {
                loser.close_lost().await;
            }
            Ok((conn, ConnectMethod::Direct))
        }
        First::Indirect(Ok(Ok(conn))) => {
            direct_cancel.cancel();
            if let Ok(Ok(loser)) = direct.await {
                loser.close_lost().await;
            }
            Ok((conn, ConnectMethod::Indirect))
        }
        First::Direct(first) => {
            let direct_err = describe(first);
            match indirect.await {
                Ok(Ok(conn)) => Ok((conn, ConnectMethod::Indirect)),
                other => Err(Error::ConnectFailed(format!(
                    "direct: {direct_err}; indirect: {}",
                    describe(other)
                ))),
            }
        }
        First::Indirect(first) => {
            let indirect_err = describe(first);
            match direct.await {
                Ok(Ok(conn)) => Ok((conn, ConnectMethod::Direct)),
                other => Err(Error::ConnectFailed(format!(
                    "direct: {}; indirect: {indirect_err}",
                    describe(other)
                ))),
            }
        }
    }
}

fn describe<T>(result: Result<Result<T, Error>, tokio::task::JoinError>) -> String {
    match result {
        Ok(Ok(_)) => "succeeded".into(),
        Ok(Err(err)) => err.to_string(),
        Err(join_err) => format!("task failed: {join_err}"),
    }
}
