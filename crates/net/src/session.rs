//! The client session: server connection ownership, inbound dispatch, and
//! full teardown when the server link drops.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use slsk_protocol::messages::server::{
    AcceptChildren, AckPrivateMessage, BranchLevel, BranchRoot, ChildDepth,
    ConnectToPeerNotification, ConnectToPeerRequest, HaveNoParents, NetInfo, ParentsIp,
    PeerAddressRequest, PeerAddressResponse, PrivateMessage, ServerCode, SetListenPort,
};
use slsk_protocol::messages::ConnectionType;
use slsk_protocol::wire::Decodable;
use slsk_protocol::{Frame, FrameKind, PayloadCursor};

use crate::conn::{ConnKey, Connection, FrameHandler, MessageConnection};
use crate::distributed::{DistributedConnectionManager, DistributedStatus, SearchRequest};
use crate::error::Error;
use crate::events::{ConnectionEvent, Diagnostic, DiagnosticSink};
use crate::listener::Listener;
use crate::options::Options;
use crate::peer::PeerConnectionManager;
use crate::solicitations::SolicitationTable;
use crate::token::TokenGenerator;
use crate::transfer::{Transfer, TransferEngine, TransferEvent};
use crate::waiter::{WaitKey, Waiter};

/// Commands the managers send up through the server connection.
#[async_trait]
pub trait ServerLink: Send + Sync {
    /// Ask the server to have `username` dial us back with `token`.
    async fn request_connect_to_peer(
        &self,
        token: u32,
        username: &str,
        conn_type: ConnectionType,
    ) -> Result<(), Error>;

    /// Publish the distributed status payload.
    async fn send_status(&self, status: &DistributedStatus) -> Result<(), Error>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub ServerLink {}

    #[async_trait]
    impl ServerLink for ServerLink {
        async fn request_connect_to_peer(
            &self,
            token: u32,
            username: &str,
            conn_type: ConnectionType,
        ) -> Result<(), Error>;

        async fn send_status(&self, status: &DistributedStatus) -> Result<(), Error>;
    }
}

/// [`ServerLink`] backed by the live server message connection.
struct ServerConnectionLink {
    conn: Arc<MessageConnection>,
    cancel: CancellationToken,
}

#[async_trait]
impl ServerLink for ServerConnectionLink {
    async fn request_connect_to_peer(
        &self,
        token: u32,
        username: &str,
        conn_type: ConnectionType,
    ) -> Result<(), Error> {
        let request = ConnectToPeerRequest {
            token,
            username: username.to_string(),
            conn_type,
        };
        self.conn.send(&request.to_frame(), &self.cancel).await
    }

    async fn send_status(&self, status: &DistributedStatus) -> Result<(), Error> {
        // The wire form is the concatenation of the individual status
        // frames, written as one block.
        let mut payload = HaveNoParents(!status.has_parent).to_frame();
        if let Some(ip) = status.parent_ip {
            payload.extend_from_slice(&ParentsIp(ip).to_frame());
        }
        payload.extend_from_slice(&BranchLevel(status.branch_level).to_frame());
        payload.extend_from_slice(&BranchRoot(status.branch_root.clone()).to_frame());
        payload.extend_from_slice(&ChildDepth(status.child_depth).to_frame());
        payload.extend_from_slice(&AcceptChildren(status.accept_children).to_frame());
        self.conn.send(&payload, &self.cancel).await
    }
}

/// A connected client core: the server link, both connection managers, the
/// listener and the transfer engine, plus the dispatch plumbing between
/// them.
pub struct Session {
    options: Arc<Options>,
    server: Arc<MessageConnection>,
    msg_waiter: Arc<Waiter<Frame>>,
    conn_waiter: Arc<Waiter<Arc<Connection>>>,
    peer_manager: Arc<PeerConnectionManager>,
    distributed: Arc<DistributedConnectionManager>,
    listener: Arc<Listener>,
    engine: Arc<TransferEngine>,
    cancel: CancellationToken,
    diagnostics: flume::Receiver<Diagnostic>,
    searches: flume::Receiver<SearchRequest>,
    transfer_events: flume::Receiver<TransferEvent>,
}

impl Session {
    /// Connect to the server and bring up the whole client core.
    pub async fn connect(
        server_addr: SocketAddr,
        local_username: impl Into<String>,
        options: Options,
    ) -> Result<Arc<Self>, Error> {
        let local_username = local_username.into();
        let options = Arc::new(options);
        let cancel = CancellationToken::new();

        let (conn_events_tx, conn_events_rx) = flume::unbounded::<ConnectionEvent>();
        let (diag, diagnostics) = DiagnosticSink::new(options.minimum_diagnostic_level);
        let (searches_tx, searches) = flume::unbounded();
        let (transfer_events_tx, transfer_events) = flume::unbounded();

        let msg_waiter = Arc::new(Waiter::<Frame>::new(options.message_timeout));
        let conn_waiter = Arc::new(Waiter::<Arc<Connection>>::new(options.message_timeout));
        let solicitations = Arc::new(SolicitationTable::new());
        let tokens = Arc::new(TokenGenerator::new());

        // The server connection carries no read watchdog; it is expected to
        // idle for long stretches.
        let server = MessageConnection::outbound(
            ConnKey {
                username: None,
                addr: server_addr,
            },
            FrameKind::Server,
            Arc::clone(&options),
            None,
            Some(conn_events_tx.clone()),
        );
        let link: Arc<dyn ServerLink> = Arc::new(ServerConnectionLink {
            conn: Arc::clone(&server),
            cancel: cancel.clone(),
        });

        let peer_manager = PeerConnectionManager::new(
            local_username.clone(),
            Arc::clone(&options),
            Arc::clone(&link),
            Arc::clone(&solicitations),
            Arc::clone(&tokens),
            Arc::clone(&conn_waiter),
            Arc::clone(&msg_waiter),
            diag.clone(),
            conn_events_tx.clone(),
        );
        let distributed = DistributedConnectionManager::new(
            local_username,
            Arc::clone(&options),
            Arc::clone(&link),
            Arc::clone(&solicitations),
            Arc::clone(&tokens),
            Arc::clone(&conn_waiter),
            searches_tx,
            diag.clone(),
            conn_events_tx.clone(),
        );
        let engine = TransferEngine::new(
            Arc::clone(&peer_manager),
            Arc::clone(&msg_waiter),
            Arc::clone(&conn_waiter),
            Arc::clone(&tokens),
            transfer_events_tx,
        );
        let listener = Listener::bind(
            Arc::clone(&options),
            Arc::clone(&peer_manager),
            Arc::clone(&distributed),
            Arc::clone(&solicitations),
            Arc::clone(&conn_waiter),
            diag.clone(),
            conn_events_tx,
        )
        .await?;

        let session = Arc::new(Self {
            options,
            server: Arc::clone(&server),
            msg_waiter,
            conn_waiter,
            peer_manager,
            distributed,
            listener: Arc::clone(&listener),
            engine,
            cancel: cancel.clone(),
            diagnostics,
            searches,
            transfer_events,
        });

        server.bind_handler(Arc::new(ServerFrameHandler {
            session: Arc::downgrade(&session),
        }));
        server.connect(&cancel).await?;

        tokio::spawn(Arc::clone(&listener).run(cancel.clone()));
        tokio::spawn(Arc::clone(&session.distributed).run(cancel.clone()));
        tokio::spawn(Arc::clone(&session).route_connection_events(conn_events_rx));

        Ok(session)
    }

    /// Tell the server which port our listener accepts peer connections on.
    pub async fn announce_listen_port(&self) -> Result<(), Error> {
        let port = self.listener.local_addr()?.port();
        let message = SetListenPort { port: port as u32 };
        self.server.send(&message.to_frame(), &self.cancel).await
    }

    /// Ask the server where `username` can be reached.
    pub async fn peer_address(&self, username: &str) -> Result<SocketAddr, Error> {
        let request = PeerAddressRequest {
            username: username.to_string(),
        };
        self.server.send(&request.to_frame(), &self.cancel).await?;
        let frame = self
            .msg_waiter
            .wait(
                WaitKey::ServerMessage {
                    code: ServerCode::GetPeerAddress as u32,
                },
                None,
            )
            .await?;
        let response = PeerAddressResponse::decode(&mut PayloadCursor::new(&frame.payload))?;
        if response.ip == Ipv4Addr::UNSPECIFIED && response.port == 0 {
            return Err(Error::ConnectFailed(format!(
                "server has no address for {username}"
            )));
        }
        Ok(SocketAddr::from((response.ip, response.port as u16)))
    }

    /// Download `filename` from `username` into `sink`, looking the peer's
    /// address up through the server.
    pub async fn download<W>(
        &self,
        username: &str,
        filename: &str,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<Transfer, Error>
    where
        W: tokio::io::AsyncWrite + Unpin + Send + ?Sized,
    {
        let addr = self.peer_address(username).await?;
        self.engine
            .download(username, addr, filename, sink, None, cancel)
            .await
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn peer_manager(&self) -> &Arc<PeerConnectionManager> {
        &self.peer_manager
    }

    pub fn distributed(&self) -> &Arc<DistributedConnectionManager> {
        &self.distributed
    }

    pub fn transfers(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    /// Diagnostics stream, filtered by the configured minimum level.
    pub fn diagnostics(&self) -> flume::Receiver<Diagnostic> {
        self.diagnostics.clone()
    }

    /// Search requests arriving over the distributed tree.
    pub fn searches(&self) -> flume::Receiver<SearchRequest> {
        self.searches.clone()
    }

    /// Progress and state events for running transfers.
    pub fn transfer_events(&self) -> flume::Receiver<TransferEvent> {
        self.transfer_events.clone()
    }

    /// Cancellation token covering everything this session spawned.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Tear the whole client down: cancel all waits, stop the managers and
    /// close every connection. A server transport error triggers this
    /// automatically.
    pub async fn shutdown(&self) {
        debug!("shutting down session");
        self.cancel.cancel();
        self.msg_waiter.cancel_all();
        self.conn_waiter.cancel_all();
        self.peer_manager.shutdown().await;
        self.distributed.shutdown().await;
        self.server.disconnect("client disconnected").await;
    }

    /// Funnel connection events to the managers that own the records, and
    /// watch for the server link dropping.
    async fn route_connection_events(
        self: Arc<Self>,
        events: flume::Receiver<ConnectionEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => return,
                },
            };
            if let ConnectionEvent::Disconnected { id, key, reason } = event {
                if id == self.server.id() {
                    warn!(reason, "server connection lost; tearing down");
                    self.shutdown().await;
                    return;
                }
                self.peer_manager.handle_disconnect(&key, id).await;
                self.distributed.handle_disconnect(&key, id).await;
            }
        }
    }

    async fn dispatch_server_frame(self: &Arc<Self>, frame: Frame) {
        match ServerCode::from_u32(frame.code) {
            Some(ServerCode::ConnectToPeer) => {
                let notification =
                    match ConnectToPeerNotification::decode(&mut PayloadCursor::new(&frame.payload)) {
                        Ok(notification) => notification,
                        Err(err) => {
                            warn!("malformed ConnectToPeer from server: {err}");
                            return;
                        }
                    };
                self.handle_connect_to_peer(notification);
            }
            Some(ServerCode::NetInfo) => {
                match NetInfo::decode(&mut PayloadCursor::new(&frame.payload)) {
                    Ok(info) => {
                        let distributed = Arc::clone(&self.distributed);
                        let cancel = self.cancel.clone();
                        tokio::spawn(async move {
                            if let Err(err) = distributed.elect_parent(info.parents, &cancel).await
                            {
                                debug!("parent election round failed: {err}");
                            }
                        });
                    }
                    Err(err) => warn!("malformed NetInfo from server: {err}"),
                }
            }
            Some(ServerCode::PrivateMessage)
                if self.options.auto_acknowledge_private_messages =>
            {
                match PrivateMessage::decode(&mut PayloadCursor::new(&frame.payload)) {
                    Ok(message) => {
                        trace!(from = %message.username, "acknowledging private message");
                        let ack = AckPrivateMessage { id: message.id }.to_frame();
                        let server = Arc::clone(&self.server);
                        let cancel = self.cancel.clone();
                        tokio::spawn(async move {
                            if let Err(err) = server.send(&ack, &cancel).await {
                                debug!("private message ack failed: {err}");
                            }
                        });
                    }
                    Err(err) => warn!("malformed private message: {err}"),
                }
                self.msg_waiter
                    .complete(&WaitKey::ServerMessage { code: frame.code }, frame);
            }
            _ => {
                self.msg_waiter
                    .complete(&WaitKey::ServerMessage { code: frame.code }, frame);
            }
        }
    }

    /// Route a `ConnectToPeer` by its connection-type tag, off the dispatch
    /// path.
    fn handle_connect_to_peer(self: &Arc<Self>, notification: ConnectToPeerNotification) {
        trace!(
            username = %notification.username,
            conn_type = %notification.conn_type,
            token = notification.token,
            "server relayed ConnectToPeer"
        );
        let session = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let result = match notification.conn_type {
                ConnectionType::Peer => session
                    .peer_manager
                    .connect_to(&notification, &cancel)
                    .await
                    .map(|_| ()),
                ConnectionType::Transfer => {
                    session
                        .peer_manager
                        .connect_to_transfer(&notification, &cancel)
                        .await
                }
                ConnectionType::Distributed => {
                    session
                        .distributed
                        .connect_to_child(&notification, &cancel)
                        .await
                }
            };
            if let Err(err) = result {
                debug!(
                    username = %notification.username,
                    "solicited connect-back failed: {err}"
                );
            }
        });
    }
}

struct ServerFrameHandler {
    session: Weak<Session>,
}

#[async_trait]
impl FrameHandler for ServerFrameHandler {
    async fn on_frame(&self, _conn: &Arc<MessageConnection>, frame: Frame) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        session.dispatch_server_frame(frame).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Everything spawned by this session watches the token.
        self.cancel.cancel();
    }
}
