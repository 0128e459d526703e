//! Shared wiring for the loopback integration tests: the managers, the
//! listener on an ephemeral port, and a stub server link that records what
//! the core asks of the server.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use slsk_protocol::messages::ConnectionType;
use slsk_protocol::Frame;

use slsk_net::distributed::{DistributedConnectionManager, DistributedStatus, SearchRequest};
use slsk_net::events::{ConnectionEvent, DiagnosticLevel, DiagnosticSink};
use slsk_net::listener::Listener;
use slsk_net::peer::PeerConnectionManager;
use slsk_net::session::ServerLink;
use slsk_net::solicitations::SolicitationTable;
use slsk_net::token::TokenGenerator;
use slsk_net::transfer::{TransferEngine, TransferEvent};
use slsk_net::waiter::Waiter;
use slsk_net::{Connection, Error, Options};

/// A recorded `ConnectToPeer` request.
pub type ConnectRequest = (u32, String, ConnectionType);

/// Server link that records requests instead of talking to a server.
pub struct StubServerLink {
    connects: flume::Sender<ConnectRequest>,
    statuses: flume::Sender<DistributedStatus>,
}

#[async_trait]
impl ServerLink for StubServerLink {
    async fn request_connect_to_peer(
        &self,
        token: u32,
        username: &str,
        conn_type: ConnectionType,
    ) -> Result<(), Error> {
        let _ = self.connects.send((token, username.to_string(), conn_type));
        Ok(())
    }

    async fn send_status(&self, status: &DistributedStatus) -> Result<(), Error> {
        let _ = self.statuses.send(status.clone());
        Ok(())
    }
}

pub struct Harness {
    pub options: Arc<Options>,
    pub peer_manager: Arc<PeerConnectionManager>,
    pub distributed: Arc<DistributedConnectionManager>,
    pub engine: Arc<TransferEngine>,
    pub listener_addr: SocketAddr,
    pub solicitations: Arc<SolicitationTable>,
    pub msg_waiter: Arc<Waiter<Frame>>,
    pub conn_waiter: Arc<Waiter<Arc<Connection>>>,
    pub connect_requests: flume::Receiver<ConnectRequest>,
    pub statuses: flume::Receiver<DistributedStatus>,
    pub searches: flume::Receiver<SearchRequest>,
    pub transfer_events: flume::Receiver<TransferEvent>,
    pub cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

static TRACING: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
});

/// Timeouts tight enough to keep the suite quick but loose enough not to
/// flake on a loaded machine.
pub fn test_options() -> Options {
    Options {
        message_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        read_inactivity_timeout: Duration::from_secs(2),
        listen_port: 0,
        ..Options::default()
    }
}

pub async fn build() -> Harness {
    build_with(test_options()).await
}

pub async fn build_with(options: Options) -> Harness {
    once_cell::sync::Lazy::force(&TRACING);
    let options = Arc::new(options);
    let cancel = CancellationToken::new();

    let (conn_events_tx, conn_events_rx) = flume::unbounded::<ConnectionEvent>();
    let (connects_tx, connect_requests) = flume::unbounded();
    let (statuses_tx, statuses) = flume::unbounded();
    let (searches_tx, searches) = flume::unbounded();
    let (transfer_events_tx, transfer_events) = flume::unbounded();
    let (diag, _diag_rx) = DiagnosticSink::new(DiagnosticLevel::Debug);

    let link: Arc<dyn ServerLink> = Arc::new(StubServerLink {
        connects: connects_tx,
        statuses: statuses_tx,
    });
    let msg_waiter = Arc::new(Waiter::<Frame>::new(options.message_timeout));
    let conn_waiter = Arc::new(Waiter::<Arc<Connection>>::new(options.message_timeout));
    let solicitations = Arc::new(SolicitationTable::new());
    let tokens = Arc::new(TokenGenerator::new());

    let peer_manager = PeerConnectionManager::new(
        "localuser".to_string(),
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
        "localuser".to_string(),
        Arc::clone(&options),
        link,
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
        tokens,
        transfer_events_tx,
    );
    let listener = Listener::bind(
        Arc::clone(&options),
        Arc::clone(&peer_manager),
        Arc::clone(&distributed),
        Arc::clone(&solicitations),
        Arc::clone(&conn_waiter),
        diag,
        conn_events_tx,
    )
    .await
    .expect("listener binds an ephemeral port");
    let listener_addr = listener.local_addr().expect("listener has a local address");

    tokio::spawn(Arc::clone(&listener).run(cancel.clone()));

    // Stand-in for the session's event router: feed disconnects back to the
    // managers so records are torn down.
    {
        let peer_manager = Arc::clone(&peer_manager);
        let distributed = Arc::clone(&distributed);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = conn_events_rx.recv_async() => match event {
                        Ok(event) => event,
                        Err(_) => return,
                    },
                };
                if let ConnectionEvent::Disconnected { id, key, .. } = event {
                    peer_manager.handle_disconnect(&key, id).await;
                    distributed.handle_disconnect(&key, id).await;
                }
            }
        });
    }

    Harness {
        options,
        peer_manager,
        distributed,
        engine,
        listener_addr,
        solicitations,
        msg_waiter,
        conn_waiter,
        connect_requests,
        statuses,
        searches,
        transfer_events,
        cancel,
    }
}

/// An address nothing is listening on: bind an ephemeral port and drop the
/// socket again.
pub async fn dead_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind for dead address");
    listener.local_addr().expect("local address")
}
