//! Distributed network membership: at most one parent, a capped set of
//! children, and the periodic status broadcast that keeps the server and the
//! children in sync.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use slsk_protocol::messages::distributed::{
    DistributedBranchLevel, DistributedBranchRoot, DistributedCode, DistributedSearchRequest,
};
use slsk_protocol::messages::peer::{PeerInit, PierceFirewall};
use slsk_protocol::messages::server::{ConnectToPeerNotification, ParentCandidate};
use slsk_protocol::messages::ConnectionType;
use slsk_protocol::{Frame, FrameKind};

use crate::conn::{ConnKey, Connection, FrameHandler, MessageConnection};
use crate::error::Error;
use crate::events::{ConnectionEvent, DiagnosticSink};
use crate::options::Options;
use crate::peer::{race, ConnectMethod};
use crate::session::ServerLink;
use crate::solicitations::{Solicitation, SolicitationTable};
use crate::token::TokenGenerator;
use crate::waiter::{WaitKey, Waiter};

/// A search request flowing down the distributed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub username: String,
    pub token: u32,
    pub query: String,
}

/// The payload of a status broadcast to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DistributedStatus {
    pub has_parent: bool,
    pub parent_ip: Option<Ipv4Addr>,
    pub branch_level: u32,
    pub branch_root: String,
    pub child_depth: u32,
    pub accept_children: bool,
}

struct Parent {
    conn: Arc<MessageConnection>,
    username: String,
    ip: Ipv4Addr,
}

struct Child {
    conn: Arc<MessageConnection>,
    depth: u32,
}

#[derive(Default)]
struct TreeState {
    parent: Option<Parent>,
    children: HashMap<String, Child>,
    branch_level: u32,
    branch_root: Option<String>,
}

/// What a probe learned before a candidate could be adopted.
struct AdoptableParent {
    conn: Arc<MessageConnection>,
    username: String,
    ip: Ipv4Addr,
    branch_level: u32,
    branch_root: String,
    first_search: DistributedSearchRequest,
}

/// Maintains our place in the distributed tree.
pub struct DistributedConnectionManager {
    local_username: String,
    options: Arc<Options>,
    server: Arc<dyn ServerLink>,
    solicitations: Arc<SolicitationTable>,
    tokens: Arc<TokenGenerator>,
    conn_waiter: Arc<Waiter<Arc<Connection>>>,
    state: StdMutex<TreeState>,
    last_parent_activity: StdMutex<Instant>,
    last_status_hash: StdMutex<Option<u64>>,
    status_trigger: Notify,
    searches: flume::Sender<SearchRequest>,
    diag: DiagnosticSink,
    conn_events: flume::Sender<ConnectionEvent>,
}

impl DistributedConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_username: String,
        options: Arc<Options>,
        server: Arc<dyn ServerLink>,
        solicitations: Arc<SolicitationTable>,
        tokens: Arc<TokenGenerator>,
        conn_waiter: Arc<Waiter<Arc<Connection>>>,
        searches: flume::Sender<SearchRequest>,
        diag: DiagnosticSink,
        conn_events: flume::Sender<ConnectionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_username,
            options,
            server,
            solicitations,
            tokens,
            conn_waiter,
            state: StdMutex::new(TreeState::default()),
            last_parent_activity: StdMutex::new(Instant::now()),
            last_status_hash: StdMutex::new(None),
            status_trigger: Notify::new(),
            searches,
            diag,
            conn_events,
        })
    }

    pub fn has_parent(&self) -> bool {
        self.state.lock().expect("tree state poisoned").parent.is_some()
    }

    pub fn child_count(&self) -> usize {
        self.state.lock().expect("tree state poisoned").children.len()
    }

    /// Snapshot of the fields that make up a status broadcast.
    pub fn current_status(&self) -> DistributedStatus {
        let state = self.state.lock().expect("tree state poisoned");
        let child_depth = state
            .children
            .values()
            .map(|child| child.depth + 1)
            .max()
            .unwrap_or(0);
        DistributedStatus {
            has_parent: state.parent.is_some(),
            parent_ip: state.parent.as_ref().map(|parent| parent.ip),
            branch_level: state.branch_level,
            branch_root: state
                .branch_root
                .clone()
                .unwrap_or_else(|| self.local_username.clone()),
            child_depth,
            accept_children: state.children.len() < self.options.concurrent_distributed_children,
        }
    }

    /// Try the candidate pool until one candidate delivers `BranchLevel`,
    /// `BranchRoot` and at least one search request; adopt it and close the
    /// rest. A no-op while a parent is adopted.
    pub async fn elect_parent(
        self: &Arc<Self>,
        candidates: Vec<ParentCandidate>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if self.has_parent() || candidates.is_empty() {
            return Ok(());
        }

        debug!(pool = candidates.len(), "electing a distributed parent");
        let election_cancel = cancel.child_token();
        let (results_tx, results_rx) = flume::bounded(candidates.len());
        let mut spawned = 0usize;

        for candidate in candidates {
            let this = Arc::clone(self);
            let probe_cancel = election_cancel.clone();
            let results = results_tx.clone();
            spawned += 1;
            tokio::spawn(async move {
                let outcome = this.probe_candidate(&candidate, &probe_cancel).await;
                let _ = results.send((candidate, outcome));
            });
        }
        drop(results_tx);

        let mut remaining = spawned;
        while remaining > 0 {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    election_cancel.cancel();
                    return Err(Error::Cancelled);
                }
                received = results_rx.recv_async() => received,
            };
            let Ok((candidate, outcome)) = received else {
                break;
            };
            remaining -= 1;
            match outcome {
                Ok(parent) => {
                    election_cancel.cancel();
                    // Close any candidate that still manages to finish.
                    let surplus = results_rx.clone();
                    tokio::spawn(async move {
                        while let Ok((_, outcome)) = surplus.recv_async().await {
                            if let Ok(unwanted) = outcome {
                                unwanted.conn.disconnect("parent already adopted").await;
                            }
                        }
                    });
                    self.adopt_parent(parent).await;
                    return Ok(());
                }
                Err(err) => {
                    trace!(candidate = %candidate.username, "parent candidate failed: {err}");
                }
            }
        }

        self.diag.info("no distributed parent candidate was adopted");
        Err(Error::ConnectFailed(
            "no distributed parent candidate was adopted".into(),
        ))
    }

    /// Connect to one candidate (direct/indirect race) and pull messages
    /// until it has proven itself as a parent.
    async fn probe_candidate(
        self: &Arc<Self>,
        candidate: &ParentCandidate,
        cancel: &CancellationToken,
    ) -> Result<AdoptableParent, Error> {
        let addr = SocketAddr::from((candidate.ip, candidate.port as u16));
        let (conn, _method) = self
            .establish_distributed_connection(&candidate.username, addr, cancel)
            .await?;

        let probe = self.collect_parent_proof(&conn, candidate, cancel);
        let result = tokio::time::timeout(self.options.distributed_inactivity_timeout, probe).await;
        match result {
            Ok(Ok(parent)) => Ok(parent),
            Ok(Err(err)) => {
                conn.disconnect("parent candidate rejected").await;
                Err(err)
            }
            Err(_) => {
                conn.disconnect("parent candidate too slow").await;
                Err(Error::WaitTimedOut)
            }
        }
    }

    async fn collect_parent_proof(
        &self,
        conn: &Arc<MessageConnection>,
        candidate: &ParentCandidate,
        cancel: &CancellationToken,
    ) -> Result<AdoptableParent, Error> {
        let mut branch_level = None;
        let mut branch_root = None;

        loop {
            let frame = conn.read_message(cancel).await?;
            match DistributedCode::from_u32(frame.code) {
                Some(DistributedCode::BranchLevel) => {
                    branch_level = Some(frame.cursor().read_u32().map_err(Error::from)?);
                }
                Some(DistributedCode::BranchRoot) => {
                    branch_root = Some(frame.cursor().read_string().map_err(Error::from)?);
                }
                Some(DistributedCode::SearchRequest) => {
                    if let (Some(level), Some(root)) = (branch_level, branch_root.clone()) {
                        let search = DistributedSearchRequest::decode_payload(&frame.payload)?;
                        return Ok(AdoptableParent {
                            conn: Arc::clone(conn),
                            username: candidate.username.clone(),
                            ip: candidate.ip,
                            branch_level: level,
                            branch_root: root,
                            first_search: search,
                        });
                    }
                    // A search before the branch info does not prove the
                    // candidate; keep reading.
                }
                Some(_) | None => {}
            }
        }
    }

    async fn adopt_parent(self: &Arc<Self>, parent: AdoptableParent) {
        let surplus = {
            let mut state = self.state.lock().expect("tree state poisoned");
            if state.parent.is_some() {
                true
            } else {
                state.branch_level = parent.branch_level + 1;
                state.branch_root = Some(parent.branch_root.clone());
                state.parent = Some(Parent {
                    conn: Arc::clone(&parent.conn),
                    username: parent.username.clone(),
                    ip: parent.ip,
                });
                false
            }
        };
        if surplus {
            // A concurrent probe won; this one is surplus.
            parent.conn.disconnect("parent already adopted").await;
            return;
        }
        *self
            .last_parent_activity
            .lock()
            .expect("activity clock poisoned") = Instant::now();

        debug!(parent = %parent.username, level = parent.branch_level, "adopted distributed parent");
        self.diag
            .info(format!("adopted distributed parent {}", parent.username));

        self.forward_search(&parent.first_search).await;
        parent.conn.start_read_loop(self.parent_handler());
        self.status_trigger.notify_one();
    }

    /// Accept an inbound distributed child, subject to the configured cap.
    pub async fn accept_child(
        self: &Arc<Self>,
        username: &str,
        conn: Arc<Connection>,
    ) -> Result<(), Error> {
        let msg_conn = MessageConnection::from_connection(conn, FrameKind::Server);
        self.add_child(username, msg_conn).await
    }

    /// Handle a `ConnectToPeer` with the distributed tag: the peer wants to
    /// become our child but cannot accept inbound connections.
    pub async fn connect_to_child(
        self: &Arc<Self>,
        notification: &ConnectToPeerNotification,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let key = ConnKey {
            username: Some(notification.username.clone()),
            addr: SocketAddr::from((notification.ip, notification.port as u16)),
        };
        let conn = MessageConnection::outbound(
            key,
            FrameKind::Server,
            Arc::clone(&self.options),
            Some(self.options.read_inactivity_timeout),
            Some(self.conn_events.clone()),
        );
        conn.connect(cancel).await?;
        conn.send(
            &PierceFirewall {
                token: notification.token,
            }
            .to_frame(),
            cancel,
        )
        .await?;
        self.add_child(&notification.username, conn).await
    }

    async fn add_child(
        self: &Arc<Self>,
        username: &str,
        conn: Arc<MessageConnection>,
    ) -> Result<(), Error> {
        let accepted = {
            let mut state = self.state.lock().expect("tree state poisoned");
            if state.children.len() >= self.options.concurrent_distributed_children {
                false
            } else {
                state.children.insert(
                    username.to_string(),
                    Child {
                        conn: Arc::clone(&conn),
                        depth: 0,
                    },
                );
                true
            }
        };

        if !accepted {
            self.diag.warning(format!(
                "rejected distributed child {username}: at capacity"
            ));
            conn.disconnect("distributed child limit reached").await;
            return Ok(());
        }

        debug!(username, "accepted distributed child");
        conn.start_read_loop(self.child_handler(username.to_string()));
        self.status_trigger.notify_one();
        Ok(())
    }

    /// Periodic driver: parent watchdog plus the hash-guarded status
    /// broadcast, re-run early on structural changes.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.status_broadcast_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!("cancellation received, stopping distributed manager");
                    return;
                }
                _ = ticker.tick() => {}
                _ = self.status_trigger.notified() => {}
            }

            self.check_parent_watchdog().await;
            if let Err(err) = self.broadcast_status(&cancel).await {
                warn!("status broadcast failed: {err}");
            }
        }
    }

    /// Drop the parent when it has been silent past the inactivity window.
    /// The next candidate pool from the server drives re-election.
    async fn check_parent_watchdog(&self) {
        let stale = {
            let state = self.state.lock().expect("tree state poisoned");
            state.parent.is_some()
                && self
                    .last_parent_activity
                    .lock()
                    .expect("activity clock poisoned")
                    .elapsed()
                    > self.options.distributed_inactivity_timeout
        };
        if !stale {
            return;
        }

        self.diag
            .warning("distributed parent went silent; dropping it");
        if let Some(parent) = self.take_parent() {
            parent.conn.disconnect("distributed parent inactive").await;
        }
    }

    /// Send the status payload unless it hashes identically to the last one
    /// while a parent is adopted; mirror the branch info to every child.
    pub async fn broadcast_status(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let status = self.current_status();
        let hash = {
            let mut hasher = DefaultHasher::new();
            status.hash(&mut hasher);
            hasher.finish()
        };
        {
            let mut last = self.last_status_hash.lock().expect("status hash poisoned");
            if *last == Some(hash) && status.has_parent {
                return Ok(());
            }
            *last = Some(hash);
        }

        trace!(?status, "broadcasting distributed status");
        self.server.send_status(&status).await?;

        let children: Vec<Arc<MessageConnection>> = {
            let state = self.state.lock().expect("tree state poisoned");
            state
                .children
                .values()
                .map(|child| Arc::clone(&child.conn))
                .collect()
        };
        let level = DistributedBranchLevel(status.branch_level).to_frame();
        let root = DistributedBranchRoot(status.branch_root.clone()).to_frame();
        for child in children {
            if child.send(&level, cancel).await.is_err() {
                continue;
            }
            let _ = child.send(&root, cancel).await;
        }
        Ok(())
    }

    /// Remove whichever member matches a disconnected connection. The
    /// session's event router calls this for every `Disconnected` event.
    pub async fn handle_disconnect(&self, key: &ConnKey, conn_id: u64) {
        let parent_lost = {
            let state = self.state.lock().expect("tree state poisoned");
            state
                .parent
                .as_ref()
                .map(|parent| parent.conn.id() == conn_id)
                .unwrap_or(false)
        };
        if parent_lost {
            if let Some(parent) = self.take_parent() {
                self.diag.warning(format!(
                    "distributed parent {} disconnected",
                    parent.username
                ));
            }
            self.status_trigger.notify_one();
            return;
        }

        let removed = {
            let mut state = self.state.lock().expect("tree state poisoned");
            let username = state
                .children
                .iter()
                .find(|(_, child)| child.conn.id() == conn_id)
                .map(|(username, _)| username.clone());
            if let Some(username) = &username {
                state.children.remove(username);
            }
            username
        };
        if let Some(username) = removed {
            trace!(username, conn = %key, "distributed child removed");
            self.status_trigger.notify_one();
        }
    }

    /// Disconnect the parent and all children.
    pub async fn shutdown(&self) {
        let (parent, children) = {
            let mut state = self.state.lock().expect("tree state poisoned");
            let parent = state.parent.take();
            let children: Vec<Arc<MessageConnection>> = state
                .children
                .drain()
                .map(|(_, child)| child.conn)
                .collect();
            state.branch_level = 0;
            state.branch_root = None;
            (parent, children)
        };
        if let Some(parent) = parent {
            parent.conn.disconnect("client disconnected").await;
        }
        for child in children {
            child.disconnect("client disconnected").await;
        }
    }

    fn take_parent(&self) -> Option<Parent> {
        let mut state = self.state.lock().expect("tree state poisoned");
        let parent = state.parent.take();
        if parent.is_some() {
            state.branch_level = 0;
            state.branch_root = None;
        }
        parent
    }

    async fn establish_distributed_connection(
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
            tokio::spawn(async move { this.connect_direct(&username, addr, &cancel).await })
        };
        let indirect = {
            let this = Arc::clone(self);
            let username = username.to_string();
            let cancel = indirect_cancel.clone();
            tokio::spawn(async move { this.connect_indirect(&username, &cancel).await })
        };

        race(direct, direct_cancel, indirect, indirect_cancel).await
    }

    async fn connect_direct(
        &self,
        username: &str,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<Arc<MessageConnection>, Error> {
        let key = ConnKey {
            username: Some(username.to_string()),
            addr,
        };
        // The manager-level watchdog governs parent liveness; the socket
        // itself carries no read timeout.
        let conn = MessageConnection::outbound(
            key,
            FrameKind::Server,
            Arc::clone(&self.options),
            None,
            Some(self.conn_events.clone()),
        );
        conn.connect(cancel).await?;

        let token = self
            .tokens
            .next_token(|token| self.solicitations.contains(token))?;
        let init = PeerInit {
            username: self.local_username.clone(),
            conn_type: ConnectionType::Distributed,
            token,
        };
        conn.send(&init.to_frame(), cancel).await?;
        Ok(conn)
    }

    async fn connect_indirect(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<MessageConnection>, Error> {
        let token = self
            .tokens
            .next_token(|token| self.solicitations.contains(token))?;
        let inserted = self.solicitations.insert(
            token,
            Solicitation {
                username: username.to_string(),
                conn_type: ConnectionType::Distributed,
            },
        );
        debug_assert!(inserted, "generator rejects pending tokens");

        let result: Result<Arc<Connection>, Error> = async {
            self.server
                .request_connect_to_peer(token, username, ConnectionType::Distributed)
                .await?;
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                conn = self
                    .conn_waiter
                    .wait(WaitKey::SolicitedDistributedConnection { token }, None) => conn,
            }
        }
        .await;

        match result {
            Ok(conn) => Ok(MessageConnection::from_connection(conn, FrameKind::Server)),
            Err(err) => {
                self.solicitations.remove(token);
                Err(err)
            }
        }
    }

    async fn forward_search(&self, search: &DistributedSearchRequest) {
        let _ = self.searches.send(SearchRequest {
            username: search.username.clone(),
            token: search.token,
            query: search.query.clone(),
        });

        // Propagate down the tree.
        let children: Vec<Arc<MessageConnection>> = {
            let state = self.state.lock().expect("tree state poisoned");
            state
                .children
                .values()
                .map(|child| Arc::clone(&child.conn))
                .collect()
        };
        if children.is_empty() {
            return;
        }
        let frame = search.to_frame();
        let cancel = CancellationToken::new();
        for child in children {
            let _ = child.send(&frame, &cancel).await;
        }
    }

    fn parent_handler(self: &Arc<Self>) -> Arc<dyn FrameHandler> {
        Arc::new(DistributedFrameHandler {
            manager: Arc::downgrade(self),
            role: Role::Parent,
        })
    }

    fn child_handler(self: &Arc<Self>, username: String) -> Arc<dyn FrameHandler> {
        Arc::new(DistributedFrameHandler {
            manager: Arc::downgrade(self),
            role: Role::Child { username },
        })
    }

    async fn on_parent_frame(&self, conn: &Arc<MessageConnection>, frame: Frame) {
        *self
            .last_parent_activity
            .lock()
            .expect("activity clock poisoned") = Instant::now();

        match DistributedCode::from_u32(frame.code) {
            Some(DistributedCode::SearchRequest) => {
                match DistributedSearchRequest::decode_payload(&frame.payload) {
                    Ok(search) => self.forward_search(&search).await,
                    Err(err) => {
                        conn.disconnect(&format!("malformed search request: {err}"))
                            .await;
                    }
                }
            }
            Some(DistributedCode::BranchLevel) => {
                if let Ok(level) = frame.cursor().read_u32() {
                    let mut state = self.state.lock().expect("tree state poisoned");
                    state.branch_level = level + 1;
                    drop(state);
                    self.status_trigger.notify_one();
                }
            }
            Some(DistributedCode::BranchRoot) => {
                if let Ok(root) = frame.cursor().read_string() {
                    let mut state = self.state.lock().expect("tree state poisoned");
                    state.branch_root = Some(root);
                    drop(state);
                    self.status_trigger.notify_one();
                }
            }
            Some(DistributedCode::Ping) | Some(DistributedCode::ChildDepth) | None => {}
        }
    }

    async fn on_child_frame(&self, username: &str, frame: Frame) {
        if let Some(DistributedCode::ChildDepth) = DistributedCode::from_u32(frame.code) {
            if let Ok(depth) = frame.cursor().read_u32() {
                let mut state = self.state.lock().expect("tree state poisoned");
                if let Some(child) = state.children.get_mut(username) {
                    child.depth = depth;
                }
                drop(state);
                self.status_trigger.notify_one();
            }
        }
    }
}

enum Role {
    Parent,
    Child { username: String },
}

struct DistributedFrameHandler {
    manager: Weak<DistributedConnectionManager>,
    role: Role,
}

#[async_trait]
impl FrameHandler for DistributedFrameHandler {
    async fn on_frame(&self, conn: &Arc<MessageConnection>, frame: Frame) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        match &self.role {
            Role::Parent => manager.on_parent_frame(conn, frame).await,
            Role::Child { username } => manager.on_child_frame(username, frame).await,
        }
    }
}
