//! Loopback tests for the connection primitive.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use slsk_net::events::ConnectionEvent;
use slsk_net::{ConnKey, Connection, ConnectionState, Error, Options};

mod common;

fn options() -> Arc<Options> {
    Arc::new(common::test_options())
}

async fn connected_pair(
    options: Arc<Options>,
    read_timeout: Option<Duration>,
    events: Option<flume::Sender<ConnectionEvent>>,
) -> (Arc<Connection>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

    let conn = Arc::new(Connection::outbound(
        ConnKey {
            username: Some("peer".into()),
            addr,
        },
        options,
        read_timeout,
        events,
    ));
    conn.connect(&CancellationToken::new()).await.unwrap();
    let remote = accept.await.unwrap();
    (conn, remote)
}

#[tokio::test]
async fn read_returns_exactly_n_bytes_across_chunks() {
    let (conn, mut remote) = connected_pair(options(), Some(Duration::from_secs(2)), None).await;
    let cancel = CancellationToken::new();

    let writer = tokio::spawn(async move {
        remote.write_all(b"hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        remote.write_all(b" world").await.unwrap();
        remote
    });

    let bytes = conn.read(11, &cancel, None).await.unwrap();
    assert_eq!(bytes, b"hello world");
    writer.await.unwrap();
}

#[tokio::test]
async fn zero_byte_read_succeeds_immediately() {
    let (conn, _remote) = connected_pair(options(), Some(Duration::from_secs(2)), None).await;
    let bytes = conn
        .read(0, &CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(bytes.is_empty());
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn stalled_read_times_out_and_disconnects() {
    let (events_tx, events_rx) = flume::unbounded();
    let (conn, mut remote) =
        connected_pair(options(), Some(Duration::from_millis(200)), Some(events_tx)).await;
    let cancel = CancellationToken::new();

    // Four of the five requested bytes arrive, then nothing.
    remote.write_all(b"1234").await.unwrap();
    let err = conn.read(5, &cancel, None).await.unwrap_err();
    assert!(matches!(err, Error::ReadTimeout));
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    let disconnects: Vec<_> = events_rx
        .drain()
        .filter(|event| matches!(event, ConnectionEvent::Disconnected { .. }))
        .collect();
    assert_eq!(disconnects.len(), 1);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (events_tx, events_rx) = flume::unbounded();
    let (conn, _remote) =
        connected_pair(options(), Some(Duration::from_secs(2)), Some(events_tx)).await;

    conn.disconnect("first").await;
    conn.disconnect("second").await;

    let disconnects: Vec<_> = events_rx
        .drain()
        .filter_map(|event| match event {
            ConnectionEvent::Disconnected { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(disconnects, vec!["first".to_string()]);
}

#[tokio::test]
async fn reads_after_disconnect_fail() {
    let (conn, _remote) = connected_pair(options(), Some(Duration::from_secs(2)), None).await;
    conn.disconnect("done").await;

    let err = conn
        .read(1, &CancellationToken::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadFailed(_)));
}

#[tokio::test]
async fn hand_off_detaches_the_connection() {
    let (conn, mut remote) = connected_pair(options(), Some(Duration::from_secs(2)), None).await;
    let cancel = CancellationToken::new();

    let mut stream = conn.hand_off().await.unwrap();

    // The socket itself still works for whoever took it over.
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // The connection object is dead.
    assert!(matches!(
        conn.read(1, &cancel, None).await.unwrap_err(),
        Error::Detached
    ));
    assert!(matches!(
        conn.write(b"x", &cancel, None).await.unwrap_err(),
        Error::Detached
    ));
    assert!(matches!(conn.hand_off().await.unwrap_err(), Error::Detached));
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    let addr = common::dead_addr().await;
    let conn = Connection::outbound(
        ConnKey {
            username: None,
            addr,
        },
        options(),
        None,
        None,
    );
    let err = conn.connect(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::ConnectFailed(_) | Error::ConnectTimeout));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_honors_cancellation() {
    // An unroutable address keeps the connect pending long enough to cancel.
    let addr = "10.255.255.1:2234".parse().unwrap();
    let conn = Connection::outbound(
        ConnKey {
            username: None,
            addr,
        },
        options(),
        None,
        None,
    );
    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let err = conn.connect(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled | Error::ConnectFailed(_)));
    canceller.await.unwrap();
}

#[tokio::test]
async fn governor_paces_every_chunk() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGovernor(AtomicUsize);

    #[async_trait::async_trait]
    impl slsk_net::Governor for CountingGovernor {
        async fn pace(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let (conn, mut remote) = connected_pair(options(), Some(Duration::from_secs(2)), None).await;
    let cancel = CancellationToken::new();
    let governor = CountingGovernor(AtomicUsize::new(0));

    remote.write_all(b"abcdef").await.unwrap();
    let bytes = conn.read(6, &cancel, Some(&governor)).await.unwrap();
    assert_eq!(bytes, b"abcdef");
    // Six bytes fit one chunk: one consultation before the read.
    assert_eq!(governor.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn write_round_trips_to_the_remote() {
    let (conn, mut remote) = connected_pair(options(), Some(Duration::from_secs(2)), None).await;
    let cancel = CancellationToken::new();

    conn.write(b"framed payload", &cancel, None).await.unwrap();
    let mut buf = vec![0u8; 14];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, b"framed payload");
}
