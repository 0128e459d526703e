//! Message-oriented connection: a framing loop over a [`Connection`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use slsk_protocol::{Frame, FrameKind, MAX_FRAME_LENGTH};

use crate::conn::{ConnKey, Connection};
use crate::error::Error;
use crate::events::ConnectionEvent;
use crate::options::Options;

/// Receiver for whole messages coming off a [`MessageConnection`].
///
/// Handlers must be bound before the read loop starts, or early messages
/// would be lost. Handlers must not re-enter the connection's read path.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn on_frame(&self, conn: &Arc<MessageConnection>, frame: Frame);
}

/// Pull one whole frame off a raw connection.
pub(crate) async fn read_frame(
    conn: &Connection,
    kind: FrameKind,
    cancel: &CancellationToken,
) -> Result<Frame, Error> {
    let len_bytes = conn.read(4, cancel, None).await?;
    let len = u32::from_le_bytes(
        len_bytes[..]
            .try_into()
            .expect("read returns exactly four bytes"),
    );
    if len < kind.code_len() as u32 || len > MAX_FRAME_LENGTH {
        return Err(slsk_protocol::Error::FrameMalformed {
            position: 0,
            reason: format!("unacceptable frame length {len}"),
        }
        .into());
    }
    let body = conn.read(len as usize, cancel, None).await?;
    Frame::parse(kind, &body).map_err(Error::from)
}

/// A connection that exchanges whole framed messages.
///
/// For outbound connections the read loop starts at the `Connected`
/// transition, provided a handler was bound beforehand. Handed-off sockets
/// and connections driven in pull mode first need an explicit
/// [`MessageConnection::start_read_loop`].
pub struct MessageConnection {
    conn: Arc<Connection>,
    kind: FrameKind,
    handler: StdMutex<Option<Arc<dyn FrameHandler>>>,
    loop_started: AtomicBool,
    loop_cancel: CancellationToken,
}

impl MessageConnection {
    /// A message connection that will dial out on
    /// [`MessageConnection::connect`].
    pub fn outbound(
        key: ConnKey,
        kind: FrameKind,
        options: Arc<Options>,
        read_timeout: Option<Duration>,
        events: Option<flume::Sender<ConnectionEvent>>,
    ) -> Arc<Self> {
        Self::wrap(
            Arc::new(Connection::outbound(key, options, read_timeout, events)),
            kind,
        )
    }

    /// Upgrade an accepted socket into a message connection.
    pub fn from_stream(
        key: ConnKey,
        kind: FrameKind,
        stream: TcpStream,
        options: Arc<Options>,
        read_timeout: Option<Duration>,
        events: Option<flume::Sender<ConnectionEvent>>,
    ) -> Arc<Self> {
        Self::wrap(
            Arc::new(Connection::from_stream(
                key,
                stream,
                options,
                read_timeout,
                events,
            )),
            kind,
        )
    }

    /// Wrap a connection that already exchanged its handshake elsewhere.
    pub fn from_connection(conn: Arc<Connection>, kind: FrameKind) -> Arc<Self> {
        Self::wrap(conn, kind)
    }

    fn wrap(conn: Arc<Connection>, kind: FrameKind) -> Arc<Self> {
        Arc::new(Self {
            conn,
            kind,
            handler: StdMutex::new(None),
            loop_started: AtomicBool::new(false),
            loop_cancel: CancellationToken::new(),
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn key(&self) -> ConnKey {
        self.conn.key()
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    /// Bind the message handler. Must happen before the read loop starts.
    pub fn bind_handler(&self, handler: Arc<dyn FrameHandler>) {
        *self.handler.lock().expect("handler slot poisoned") = Some(handler);
    }

    /// Open the socket. If a handler is already bound the read loop starts
    /// as soon as the connection is up.
    pub async fn connect(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), Error> {
        self.conn.connect(cancel).await?;
        let has_handler = self
            .handler
            .lock()
            .expect("handler slot poisoned")
            .is_some();
        if has_handler {
            self.spawn_read_loop();
        }
        Ok(())
    }

    /// Bind `handler` and start the continuous read loop. Starting twice is
    /// a no-op.
    pub fn start_read_loop(self: &Arc<Self>, handler: Arc<dyn FrameHandler>) {
        self.bind_handler(handler);
        self.spawn_read_loop();
    }

    fn spawn_read_loop(self: &Arc<Self>) {
        if self.loop_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let handler = this
                .handler
                .lock()
                .expect("handler slot poisoned")
                .clone();
            let Some(handler) = handler else {
                return;
            };
            loop {
                match read_frame(&this.conn, this.kind, &this.loop_cancel).await {
                    Ok(frame) => {
                        trace!(conn = %this.key(), code = frame.code, "message read");
                        handler.on_frame(&this, frame).await;
                    }
                    Err(err) => {
                        // The failed read has already started the disconnect;
                        // this settles the reason for loop-initiated exits.
                        this.conn
                            .disconnect(&format!("read loop ended: {err}"))
                            .await;
                        break;
                    }
                }
            }
        });
    }

    /// Pull one whole message off the wire. Used before the loop starts
    /// (listener handshakes, distributed parent election).
    pub async fn read_message(&self, cancel: &CancellationToken) -> Result<Frame, Error> {
        read_frame(&self.conn, self.kind, cancel).await
    }

    /// Write an already-encoded frame.
    pub async fn send(&self, frame: &[u8], cancel: &CancellationToken) -> Result<(), Error> {
        self.conn.write(frame, cancel, None).await
    }

    /// Stop the read loop and tear down the socket.
    pub async fn disconnect(&self, reason: &str) {
        self.loop_cancel.cancel();
        self.conn.disconnect(reason).await;
    }
}

impl std::fmt::Debug for MessageConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConnection")
            .field("key", &self.key())
            .field("kind", &self.kind)
            .finish()
    }
}
