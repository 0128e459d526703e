//! Inbound connection router.
//!
//! Every accepted socket must open with either `PeerInit` (an unsolicited
//! caller announcing itself) or `PierceFirewall` (the answer to one of our
//! solicitations). Everything else is a protocol violation and the socket is
//! closed.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use slsk_protocol::messages::peer::{PeerInit, PeerInitCode, PierceFirewall};
use slsk_protocol::messages::ConnectionType;
use slsk_protocol::FrameKind;

use crate::conn::{read_frame, ConnKey, Connection};
use crate::distributed::DistributedConnectionManager;
use crate::error::Error;
use crate::events::{ConnectionEvent, DiagnosticSink};
use crate::options::Options;
use crate::peer::PeerConnectionManager;
use crate::solicitations::SolicitationTable;
use crate::waiter::{WaitKey, Waiter};

/// Accepts inbound peer sockets and routes them by their first frame.
pub struct Listener {
    listener: TcpListener,
    options: Arc<Options>,
    peer_manager: Arc<PeerConnectionManager>,
    distributed: Arc<DistributedConnectionManager>,
    solicitations: Arc<SolicitationTable>,
    conn_waiter: Arc<Waiter<Arc<Connection>>>,
    diag: DiagnosticSink,
    conn_events: flume::Sender<ConnectionEvent>,
}

impl Listener {
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        options: Arc<Options>,
        peer_manager: Arc<PeerConnectionManager>,
        distributed: Arc<DistributedConnectionManager>,
        solicitations: Arc<SolicitationTable>,
        conn_waiter: Arc<Waiter<Arc<Connection>>>,
        diag: DiagnosticSink,
        conn_events: flume::Sender<ConnectionEvent>,
    ) -> Result<Arc<Self>, Error> {
        let listener = TcpListener::bind(("0.0.0.0", options.listen_port))
            .await
            .map_err(|err| Error::ConnectFailed(format!("listener bind failed: {err}")))?;
        Ok(Arc::new(Self {
            listener,
            options,
            peer_manager,
            distributed,
            solicitations,
            conn_waiter,
            diag,
            conn_events,
        }))
    }

    /// The locally bound address; useful when the configured port was `0`.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener
            .local_addr()
            .map_err(|err| Error::ConnectFailed(err.to_string()))
    }

    /// Accept loop. Each socket is routed on its own task.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        match self.local_addr() {
            Ok(addr) => info!(%addr, "listening for peer connections"),
            Err(_) => info!("listening for peer connections"),
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!("cancellation received, stopping listener");
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let this = Arc::clone(&self);
                            let cancel = cancel.child_token();
                            tokio::spawn(async move {
                                if let Err(err) = this.route_inbound(stream, addr, &cancel).await {
                                    debug!(%addr, "inbound connection dropped: {err}");
                                }
                            });
                        }
                        Err(err) => warn!("accept failed: {err}"),
                    }
                }
            }
        }
    }

    async fn route_inbound(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let key = ConnKey {
            username: None,
            addr,
        };
        let conn = Arc::new(Connection::from_stream(
            key,
            stream,
            Arc::clone(&self.options),
            Some(self.options.read_inactivity_timeout),
            Some(self.conn_events.clone()),
        ));

        let frame = read_frame(&conn, FrameKind::Peer, cancel).await?;
        match frame.code {
            code if code == PeerInitCode::PierceFirewall as u32 => {
                let pierce = PierceFirewall::decode_payload(&frame.payload)?;
                self.route_pierce(pierce, conn).await
            }
            code if code == PeerInitCode::PeerInit as u32 => {
                let init = PeerInit::decode_payload(&frame.payload)?;
                self.route_init(init, conn, cancel).await
            }
            other => {
                conn.disconnect("unexpected first frame").await;
                Err(Error::ProtocolViolation(format!(
                    "unexpected first frame code {other}"
                )))
            }
        }
    }

    async fn route_pierce(
        &self,
        pierce: PierceFirewall,
        conn: Arc<Connection>,
    ) -> Result<(), Error> {
        let Some(solicitation) = self.solicitations.remove(pierce.token) else {
            self.diag.warning(format!(
                "pierce with unknown token {} from {}",
                pierce.token,
                conn.addr()
            ));
            conn.disconnect("unknown pierce token").await;
            return Err(Error::ProtocolViolation(format!(
                "unknown pierce token {}",
                pierce.token
            )));
        };

        conn.set_username(&solicitation.username);
        trace!(
            username = %solicitation.username,
            token = pierce.token,
            conn_type = %solicitation.conn_type,
            "pierced connection routed"
        );

        let wait_key = match solicitation.conn_type {
            ConnectionType::Distributed => WaitKey::SolicitedDistributedConnection {
                token: pierce.token,
            },
            ConnectionType::Peer | ConnectionType::Transfer => WaitKey::SolicitedPeerConnection {
                token: pierce.token,
            },
        };
        self.conn_waiter.complete(&wait_key, conn);
        Ok(())
    }

    async fn route_init(
        &self,
        init: PeerInit,
        conn: Arc<Connection>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        conn.set_username(&init.username);
        trace!(
            username = %init.username,
            conn_type = %init.conn_type,
            "inbound connection initialized"
        );

        match init.conn_type {
            ConnectionType::Peer => {
                self.peer_manager
                    .accept_message(&init.username, conn, cancel)
                    .await?;
            }
            ConnectionType::Transfer => {
                self.peer_manager
                    .accept_transfer(&init.username, init.token, conn, cancel)
                    .await?;
            }
            ConnectionType::Distributed => {
                self.distributed.accept_child(&init.username, conn).await?;
            }
        }
        Ok(())
    }
}
