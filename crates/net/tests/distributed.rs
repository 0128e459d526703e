//! Distributed membership: parent election, the child cap, and the
//! hash-guarded status broadcast.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use slsk_protocol::messages::distributed::{
    DistributedBranchLevel, DistributedBranchRoot, DistributedSearchRequest,
};
use slsk_protocol::messages::peer::PeerInit;
use slsk_protocol::messages::server::ParentCandidate;
use slsk_protocol::messages::ConnectionType;
use slsk_protocol::{Frame, FrameKind};

mod common;

/// A scripted peer that proves itself as a parent as soon as we connect.
async fn scripted_parent(
    branch_level: u32,
    branch_root: &str,
    query: &str,
) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let branch_root = branch_root.to_string();
    let query = query.to_string();

    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let frame = Frame::read(FrameKind::Peer, &mut stream).await.unwrap();
        let init = PeerInit::decode_payload(&frame.payload).unwrap();
        assert_eq!(init.conn_type, ConnectionType::Distributed);

        stream
            .write_all(&DistributedBranchLevel(branch_level).to_frame())
            .await
            .unwrap();
        stream
            .write_all(&DistributedBranchRoot(branch_root).to_frame())
            .await
            .unwrap();
        stream
            .write_all(
                &DistributedSearchRequest {
                    unknown: 0x31,
                    username: "seeker".into(),
                    token: 1,
                    query,
                }
                .to_frame(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });
    (addr, task)
}

#[tokio::test]
async fn parent_is_adopted_after_branch_info_and_a_search() {
    let harness = common::build().await;
    let (parent_addr, parent_task) = scripted_parent(5, "rootuser", "blue train").await;

    harness
        .distributed
        .elect_parent(
            vec![ParentCandidate {
                username: "papa".into(),
                ip: Ipv4Addr::LOCALHOST,
                port: parent_addr.port() as u32,
            }],
            &harness.cancel,
        )
        .await
        .unwrap();

    assert!(harness.distributed.has_parent());
    let status = harness.distributed.current_status();
    assert!(status.has_parent);
    assert_eq!(status.parent_ip, Some(Ipv4Addr::LOCALHOST));
    // Our level is one below the parent's; its root is our root.
    assert_eq!(status.branch_level, 6);
    assert_eq!(status.branch_root, "rootuser");

    // The search that proved the candidate is delivered, not swallowed.
    let search = tokio::time::timeout(Duration::from_secs(2), harness.searches.recv_async())
        .await
        .expect("search forwarded")
        .unwrap();
    assert_eq!(search.query, "blue train");
    assert_eq!(search.username, "seeker");
    parent_task.abort();
}

#[tokio::test]
async fn election_fails_when_no_candidate_proves_itself() {
    let mut options = common::test_options();
    options.distributed_inactivity_timeout = Duration::from_millis(500);
    let harness = common::build_with(options).await;

    // A candidate that accepts but never sends branch info.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let err = harness
        .distributed
        .elect_parent(
            vec![ParentCandidate {
                username: "mute".into(),
                ip: Ipv4Addr::LOCALHOST,
                port: addr.port() as u32,
            }],
            &harness.cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, slsk_net::Error::ConnectFailed(_)));
    assert!(!harness.distributed.has_parent());
    silent.abort();
}

#[tokio::test]
async fn children_beyond_the_cap_are_rejected() {
    let mut options = common::test_options();
    options.concurrent_distributed_children = 1;
    let harness = common::build_with(options).await;

    let mut first = TcpStream::connect(harness.listener_addr).await.unwrap();
    first
        .write_all(
            &PeerInit {
                username: "kid1".into(),
                conn_type: ConnectionType::Distributed,
                token: 0,
            }
            .to_frame(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.distributed.child_count(), 1);

    let mut second = TcpStream::connect(harness.listener_addr).await.unwrap();
    second
        .write_all(
            &PeerInit {
                username: "kid2".into(),
                conn_type: ConnectionType::Distributed,
                token: 0,
            }
            .to_frame(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Still one child, and the surplus socket was closed on us.
    assert_eq!(harness.distributed.child_count(), 1);
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
        .await
        .expect("rejected socket closes");
    assert!(matches!(read, Ok(0) | Err(_)));
    drop(first);
}

#[tokio::test]
async fn status_broadcast_repeats_while_parentless_and_suppresses_with_parent() {
    let harness = common::build().await;

    // With no parent, identical statuses keep going out.
    harness
        .distributed
        .broadcast_status(&harness.cancel)
        .await
        .unwrap();
    harness
        .distributed
        .broadcast_status(&harness.cancel)
        .await
        .unwrap();
    assert_eq!(harness.statuses.drain().count(), 2);

    // Adopt a parent, then the hash guard kicks in.
    let (parent_addr, parent_task) = scripted_parent(3, "rootuser", "query").await;
    harness
        .distributed
        .elect_parent(
            vec![ParentCandidate {
                username: "papa".into(),
                ip: Ipv4Addr::LOCALHOST,
                port: parent_addr.port() as u32,
            }],
            &harness.cancel,
        )
        .await
        .unwrap();

    harness
        .distributed
        .broadcast_status(&harness.cancel)
        .await
        .unwrap();
    let sent_with_parent = harness.statuses.drain().count();
    assert_eq!(sent_with_parent, 1);

    // Unchanged status with a live parent: suppressed.
    harness
        .distributed
        .broadcast_status(&harness.cancel)
        .await
        .unwrap();
    assert_eq!(harness.statuses.drain().count(), 0);
    parent_task.abort();
}

#[tokio::test]
async fn statusless_child_depth_defaults_to_zero() {
    let harness = common::build().await;
    let status = harness.distributed.current_status();
    assert!(!status.has_parent);
    assert_eq!(status.child_depth, 0);
    assert_eq!(status.branch_level, 0);
    // With no adopted root we are our own branch root.
    assert_eq!(status.branch_root, "localuser");
    assert!(status.accept_children);
}
