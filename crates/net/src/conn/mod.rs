//! A single TCP connection: connect with a deadline, exact-length reads and
//! writes under an inactivity watchdog, idempotent disconnect, and hand-off
//! of the underlying socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Error;
use crate::events::ConnectionEvent;
use crate::options::Options;

mod message;

pub use message::{FrameHandler, MessageConnection};
pub(crate) use message::read_frame;

/// Bytes moved per socket operation; the inactivity watchdog is re-armed
/// after every chunk.
const CHUNK_SIZE: usize = 16 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a peer connection.
///
/// Equality ignores the username when either side has none, so a socket
/// accepted before its owner announced itself still matches.
#[derive(Debug, Clone, Eq)]
pub struct ConnKey {
    pub username: Option<String>,
    pub addr: SocketAddr,
}

impl PartialEq for ConnKey {
    fn eq(&self, other: &Self) -> bool {
        if self.addr != other.addr {
            return false;
        }
        match (&self.username, &other.username) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(username) => write!(f, "{username}@{}", self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

/// Lifecycle of a connection. Only `Connected` permits reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Pacing hook consulted before every transfer chunk.
#[async_trait]
pub trait Governor: Send + Sync {
    async fn pace(&self);
}

/// One TCP socket plus the state machine around it.
pub struct Connection {
    id: u64,
    addr: SocketAddr,
    username: OnceLock<String>,
    options: Arc<Options>,
    /// `None` disables the read/write inactivity watchdog.
    read_timeout: Option<Duration>,
    state: StdMutex<ConnectionState>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    detached: AtomicBool,
    events: Option<flume::Sender<ConnectionEvent>>,
}

impl Connection {
    /// A connection that will dial `addr` when [`Connection::connect`] runs.
    pub fn outbound(
        key: ConnKey,
        options: Arc<Options>,
        read_timeout: Option<Duration>,
        events: Option<flume::Sender<ConnectionEvent>>,
    ) -> Self {
        Self::new(key, None, ConnectionState::Pending, options, read_timeout, events)
    }

    /// Wrap an already-accepted socket. The connection starts `Connected`.
    pub fn from_stream(
        key: ConnKey,
        stream: TcpStream,
        options: Arc<Options>,
        read_timeout: Option<Duration>,
        events: Option<flume::Sender<ConnectionEvent>>,
    ) -> Self {
        Self::new(
            key,
            Some(stream),
            ConnectionState::Connected,
            options,
            read_timeout,
            events,
        )
    }

    fn new(
        key: ConnKey,
        stream: Option<TcpStream>,
        state: ConnectionState,
        options: Arc<Options>,
        read_timeout: Option<Duration>,
        events: Option<flume::Sender<ConnectionEvent>>,
    ) -> Self {
        let (reader, writer) = match stream {
            Some(stream) => {
                let (reader, writer) = stream.into_split();
                (Some(reader), Some(writer))
            }
            None => (None, None),
        };
        let username = OnceLock::new();
        if let Some(name) = key.username {
            let _ = username.set(name);
        }
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            addr: key.addr,
            username,
            options,
            read_timeout,
            state: StdMutex::new(state),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            detached: AtomicBool::new(false),
            events,
        }
    }

    /// Process-unique identifier, stable across the connection's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> ConnKey {
        ConnKey {
            username: self.username.get().cloned(),
            addr: self.addr,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Attach the username once it is learned (accepted sockets only know it
    /// after the first frame). Later calls are ignored.
    pub fn set_username(&self, username: &str) {
        let _ = self.username.set(username.to_string());
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state poisoned")
    }

    /// Open the socket. Fails with [`Error::ConnectTimeout`] when the
    /// configured deadline elapses and [`Error::Cancelled`] on cancellation.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), Error> {
        {
            let mut state = self.state.lock().expect("connection state poisoned");
            if *state != ConnectionState::Pending {
                return Err(Error::ConnectFailed(format!(
                    "connection is {:?}, not pending",
                    *state
                )));
            }
            *state = ConnectionState::Connecting;
        }
        self.emit_state_change(ConnectionState::Pending, ConnectionState::Connecting);

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            connected = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(self.addr)) => {
                match connected {
                    Err(_) => Err(Error::ConnectTimeout),
                    Ok(Err(err)) => Err(Error::ConnectFailed(err.to_string())),
                    Ok(Ok(stream)) => Ok(stream),
                }
            }
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                self.disconnect(&format!("connect failed: {err}")).await;
                return Err(err);
            }
        };

        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);

        {
            let mut state = self.state.lock().expect("connection state poisoned");
            *state = ConnectionState::Connected;
        }
        self.emit_state_change(ConnectionState::Connecting, ConnectionState::Connected);
        self.emit(ConnectionEvent::Connected {
            id: self.id,
            key: self.key(),
        });
        trace!(conn = %self.key(), "connected");
        Ok(())
    }

    /// Read exactly `n` bytes. A failed read force-disconnects the
    /// connection; no bytes for the inactivity window fails with
    /// [`Error::ReadTimeout`].
    pub async fn read(
        &self,
        n: usize,
        cancel: &CancellationToken,
        governor: Option<&dyn Governor>,
    ) -> Result<Vec<u8>, Error> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(Error::Detached);
        }
        if self.state() != ConnectionState::Connected {
            return Err(Error::ReadFailed("connection is not connected".into()));
        }
        if n == 0 {
            return Ok(Vec::new());
        }

        let result = self.read_inner(n, cancel, governor).await;
        if let Err(err) = &result {
            self.disconnect(&format!("read failed: {err}")).await;
        }
        result
    }

    async fn read_inner(
        &self,
        n: usize,
        cancel: &CancellationToken,
        governor: Option<&dyn Governor>,
    ) -> Result<Vec<u8>, Error> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| Error::ReadFailed("connection is not connected".into()))?;

        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            if let Some(governor) = governor {
                governor.pace().await;
            }
            let want = (n - filled).min(CHUNK_SIZE);
            let read = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                read = maybe_timeout(self.read_timeout, reader.read(&mut out[filled..filled + want])) => {
                    match read {
                        Err(_) => return Err(Error::ReadTimeout),
                        Ok(Err(err)) => return Err(Error::ReadFailed(err.to_string())),
                        Ok(Ok(0)) => {
                            return Err(Error::ReadFailed(
                                "connection closed by remote host".into(),
                            ))
                        }
                        Ok(Ok(read)) => read,
                    }
                }
            };
            filled += read;
            self.emit(ConnectionEvent::DataRead {
                id: self.id,
                key: self.key(),
                bytes: read,
            });
        }
        Ok(out)
    }

    /// Write all of `bytes`. Symmetric with [`Connection::read`].
    pub async fn write(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
        governor: Option<&dyn Governor>,
    ) -> Result<(), Error> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(Error::Detached);
        }
        if self.state() != ConnectionState::Connected {
            return Err(Error::WriteFailed("connection is not connected".into()));
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let result = self.write_inner(bytes, cancel, governor).await;
        if let Err(err) = &result {
            self.disconnect(&format!("write failed: {err}")).await;
        }
        result
    }

    async fn write_inner(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
        governor: Option<&dyn Governor>,
    ) -> Result<(), Error> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::WriteFailed("connection is not connected".into()))?;

        let mut written = 0;
        while written < bytes.len() {
            if let Some(governor) = governor {
                governor.pace().await;
            }
            let until = (written + CHUNK_SIZE).min(bytes.len());
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = maybe_timeout(self.read_timeout, writer.write_all(&bytes[written..until])) => result,
            };
            match result {
                Err(_) => return Err(Error::WriteFailed("write timed out".into())),
                Ok(Err(err)) => return Err(Error::WriteFailed(err.to_string())),
                Ok(Ok(())) => {}
            }
            let chunk = until - written;
            written = until;
            self.emit(ConnectionEvent::DataWritten {
                id: self.id,
                key: self.key(),
                bytes: chunk,
            });
        }
        Ok(())
    }

    /// Tear the socket down. Idempotent; the `Disconnected` event fires
    /// exactly once, carrying `reason`.
    pub async fn disconnect(&self, reason: &str) {
        {
            let mut state = self.state.lock().expect("connection state poisoned");
            if matches!(
                *state,
                ConnectionState::Disconnecting | ConnectionState::Disconnected
            ) {
                return;
            }
            let from = *state;
            *state = ConnectionState::Disconnecting;
            drop(state);
            self.emit_state_change(from, ConnectionState::Disconnecting);
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
        self.reader.lock().await.take();

        {
            let mut state = self.state.lock().expect("connection state poisoned");
            *state = ConnectionState::Disconnected;
        }
        self.emit_state_change(ConnectionState::Disconnecting, ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected {
            id: self.id,
            key: self.key(),
            reason: reason.to_string(),
        });
        debug!(conn = %self.key(), reason, "disconnected");
    }

    /// Relinquish ownership of the underlying socket. All subsequent
    /// operations on this connection fail with [`Error::Detached`].
    pub async fn hand_off(&self) -> Result<TcpStream, Error> {
        if self.detached.swap(true, Ordering::SeqCst) {
            return Err(Error::Detached);
        }
        let reader = self.reader.lock().await.take().ok_or(Error::Detached)?;
        let writer = self.writer.lock().await.take().ok_or(Error::Detached)?;
        reader.reunite(writer).map_err(|_| Error::Detached)
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn emit_state_change(&self, from: ConnectionState, to: ConnectionState) {
        self.emit(ConnectionEvent::StateChanged {
            id: self.id,
            key: self.key(),
            from,
            to,
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key())
            .field("state", &self.state())
            .finish()
    }
}

async fn maybe_timeout<F: std::future::Future>(
    window: Option<Duration>,
    future: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    match window {
        Some(window) => tokio::time::timeout(window, future).await,
        None => Ok(future.await),
    }
}
