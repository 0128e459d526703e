//! End-to-end download scenarios against a scripted uploader peer.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use slsk_protocol::messages::peer::{
    PeerInit, TransferDirection, TransferRequest, TransferResponse,
};
use slsk_protocol::messages::ConnectionType;
use slsk_protocol::{Frame, FrameKind};

use slsk_net::transfer::{TransferEvent, TransferStates};
use slsk_net::Error;

mod common;

fn test_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Drive the uploader side of the handshake up to the point where the
/// transfer connection opens: accept the message connection, queue the
/// request, then offer the file with `remote_token` and `size`.
async fn uploader_handshake(
    listener: TcpListener,
    remote_token: u32,
    size: u64,
) -> (TcpStream, String) {
    let (mut stream, _) = listener.accept().await.unwrap();

    let frame = Frame::read(FrameKind::Peer, &mut stream).await.unwrap();
    let init = PeerInit::decode_payload(&frame.payload).unwrap();
    assert_eq!(init.conn_type, ConnectionType::Peer);

    let frame = Frame::read(FrameKind::Peer, &mut stream).await.unwrap();
    let request = TransferRequest::decode_payload(&frame.payload).unwrap();
    assert_eq!(request.direction, TransferDirection::Download);

    stream
        .write_all(&TransferResponse::queued(request.token, "Queued").to_frame())
        .await
        .unwrap();

    stream
        .write_all(
            &TransferRequest {
                direction: TransferDirection::Upload,
                token: remote_token,
                filename: request.filename.clone(),
                size: Some(size),
            }
            .to_frame(),
        )
        .await
        .unwrap();

    let frame = Frame::read(FrameKind::Peer, &mut stream).await.unwrap();
    let response = TransferResponse::decode_payload(&frame.payload).unwrap();
    assert!(response.allowed);
    assert_eq!(response.token, remote_token);

    (stream, request.filename)
}

/// Open the transfer connection into the downloader's listener and exchange
/// the token preamble.
async fn open_transfer_connection(
    listener_addr: SocketAddr,
    username: &str,
    remote_token: u32,
) -> TcpStream {
    let mut transfer = TcpStream::connect(listener_addr).await.unwrap();
    transfer
        .write_all(
            &PeerInit {
                username: username.into(),
                conn_type: ConnectionType::Transfer,
                token: remote_token,
            }
            .to_frame(),
        )
        .await
        .unwrap();
    transfer
        .write_all(&remote_token.to_le_bytes())
        .await
        .unwrap();

    let mut marker = [0xffu8; 8];
    transfer.read_exact(&mut marker).await.unwrap();
    assert_eq!(marker, [0u8; 8], "start marker must be eight zero bytes");
    transfer
}

fn final_state(events: &flume::Receiver<TransferEvent>) -> TransferStates {
    let mut state = TransferStates::NONE;
    for event in events.drain() {
        if let TransferEvent::StateChanged { transfer, .. } = event {
            state = transfer.state;
        }
    }
    state
}

#[tokio::test]
async fn download_happy_path() {
    let harness = common::build().await;
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();
    let listener_addr = harness.listener_addr;

    let payload = test_payload(1024);
    let uploader = {
        let payload = payload.clone();
        tokio::spawn(async move {
            let (_msg_conn, _filename) = uploader_handshake(peer_listener, 99, 1024).await;
            let mut transfer = open_transfer_connection(listener_addr, "alice", 99).await;
            transfer.write_all(&payload).await.unwrap();
            transfer.flush().await.unwrap();
            // Linger so neither socket drops before the downloader is done.
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
    };

    let mut sink = Vec::new();
    let transfer = harness
        .engine
        .download("alice", peer_addr, "x", &mut sink, None, &harness.cancel)
        .await
        .unwrap();

    assert!(transfer.state.contains(TransferStates::SUCCEEDED));
    assert!(transfer.state.contains(TransferStates::COMPLETED));
    assert_eq!(transfer.remote_token, Some(99));
    assert_eq!(transfer.size, Some(1024));
    assert_eq!(transfer.bytes_transferred, 1024);
    assert_eq!(sink, payload);

    // The transfer ran through the full state ladder.
    let mut seen = Vec::new();
    for event in harness.transfer_events.drain() {
        if let TransferEvent::StateChanged { transfer, .. } = event {
            seen.push(transfer.state);
        }
    }
    assert!(seen.iter().any(|s| s.contains(TransferStates::QUEUED)));
    assert!(seen.iter().any(|s| s.contains(TransferStates::INITIALIZING)));
    assert!(seen.iter().any(|s| s.contains(TransferStates::IN_PROGRESS)));
    uploader.abort();
}

#[tokio::test]
async fn download_with_allowed_response_errors() {
    let harness = common::build().await;
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();

    let uploader = tokio::spawn(async move {
        let (mut stream, _) = peer_listener.accept().await.unwrap();
        let _init = Frame::read(FrameKind::Peer, &mut stream).await.unwrap();
        let frame = Frame::read(FrameKind::Peer, &mut stream).await.unwrap();
        let request = TransferRequest::decode_payload(&frame.payload).unwrap();

        // An uploader must never allow a download request outright; the
        // engine treats it as a dead end.
        stream
            .write_all(&TransferResponse::allowed(request.token, Some(1024)).to_frame())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut sink = Vec::new();
    let err = harness
        .engine
        .download("alice", peer_addr, "x", &mut sink, None, &harness.cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TransferAllowedUnreachable));
    let state = final_state(&harness.transfer_events);
    assert!(state.contains(TransferStates::ERRORED));
    assert!(state.contains(TransferStates::COMPLETED));
    uploader.abort();
}

#[tokio::test]
async fn download_times_out_when_bytes_stop_flowing() {
    let mut options = common::test_options();
    options.read_inactivity_timeout = Duration::from_millis(500);
    let harness = common::build_with(options).await;

    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();
    let listener_addr = harness.listener_addr;

    let uploader = tokio::spawn(async move {
        let (_msg_conn, _filename) = uploader_handshake(peer_listener, 7, 1024).await;
        let mut transfer = open_transfer_connection(listener_addr, "alice", 7).await;
        // Only half the promised bytes, then silence.
        transfer.write_all(&test_payload(500)).await.unwrap();
        transfer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut sink = Vec::new();
    let err = harness
        .engine
        .download("alice", peer_addr, "x", &mut sink, None, &harness.cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ReadTimeout));
    let state = final_state(&harness.transfer_events);
    assert!(state.contains(TransferStates::TIMED_OUT));
    assert!(state.contains(TransferStates::COMPLETED));
    assert_eq!(sink.len(), 500);
    uploader.abort();
}

#[tokio::test]
async fn download_cancellation_is_terminal() {
    let harness = common::build().await;
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer_listener.local_addr().unwrap();

    let uploader = tokio::spawn(async move {
        let (mut stream, _) = peer_listener.accept().await.unwrap();
        let _init = Frame::read(FrameKind::Peer, &mut stream).await.unwrap();
        let frame = Frame::read(FrameKind::Peer, &mut stream).await.unwrap();
        let request = TransferRequest::decode_payload(&frame.payload).unwrap();
        stream
            .write_all(&TransferResponse::queued(request.token, "Queued").to_frame())
            .await
            .unwrap();
        // Never our turn; the downloader gives up instead.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let cancel = harness.cancel.child_token();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        })
    };

    let mut sink = Vec::new();
    let err = harness
        .engine
        .download("alice", peer_addr, "x", &mut sink, None, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    let state = final_state(&harness.transfer_events);
    assert!(state.contains(TransferStates::CANCELLED));
    assert!(state.contains(TransferStates::COMPLETED));
    canceller.await.unwrap();
    uploader.abort();
}
