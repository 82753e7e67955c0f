//! Exercises the distributed overlay's verbatim search-request forwarding
//! across two real child connections, each backed by a loopback socket
//! pair rather than a mock.

mod support;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use soulseek::codec::CodeWidth;
use soulseek::collaborators::{RandomTokenGenerator, TcpTransportFactory};
use soulseek::config::ConnectionOptions;
use soulseek::connection::{MessageConnection, RawConnection};
use soulseek::distributed_manager::DistributedManager;
use soulseek::error::{SlskError, SlskResult};
use soulseek::events::TracingDiagnosticSink;
use soulseek::messages::common::PeerConnectionType;
use soulseek::messages::distributed::{BranchLevel, DistributedPayload, SearchRequest};
use soulseek::peer_handler::PeerHandler;
use soulseek::peer_manager::{PeerManager, ServerLink};
use soulseek::search::SearchEngine;
use soulseek::waiter::Waiter;
use tokio::net::{TcpListener, TcpStream};

use support::FrameReader;

struct NullFactory;
#[async_trait]
impl TcpTransportFactory for NullFactory {
    async fn connect(&self, _addr: SocketAddr) -> std::io::Result<TcpStream> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "unused in test"))
    }
    async fn bind(&self, _addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "unused in test"))
    }
}

struct NullServerLink;
#[async_trait]
impl ServerLink for NullServerLink {
    async fn peer_address(&self, _username: &str) -> SlskResult<(Ipv4Addr, u16)> {
        Err(SlskError::ConnectionTimeout)
    }
    async fn request_indirect_connection(
        &self,
        _token: u32,
        _username: &str,
        _connection_type: PeerConnectionType,
    ) -> SlskResult<()> {
        Err(SlskError::ConnectionTimeout)
    }
}

struct NullTokens;
impl RandomTokenGenerator for NullTokens {
    fn next_token(&self) -> u32 {
        0
    }
}

fn dummy_peer_manager() -> Arc<PeerManager> {
    let waiter = Waiter::new();
    let search_engine = SearchEngine::new(Arc::new(TracingDiagnosticSink));
    let peer_handler = PeerHandler::new(waiter, search_engine, Arc::new(TracingDiagnosticSink), None, None, None);
    PeerManager::new(
        "self".to_string(),
        10,
        Arc::new(NullFactory),
        Arc::new(NullTokens),
        Arc::new(NullServerLink),
        peer_handler,
        ConnectionOptions::default(),
        ConnectionOptions::default(),
    )
}

/// Produces one end of a real loopback socket pair wrapped as the library's
/// own [`MessageConnection`] (the side `DistributedManager` drives) and the
/// other end as a plain [`TcpStream`] (the side the test reads from).
async fn child_connection_pair() -> (Arc<MessageConnection>, TcpStream) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let remote = TcpStream::connect(addr).await.unwrap();
    let (accepted, _) = listener.accept().await.unwrap();
    let raw = Arc::new(RawConnection::from_stream(accepted, &ConnectionOptions::default()));
    (Arc::new(MessageConnection::spawn(raw, CodeWidth::Narrow, None)), remote)
}

#[tokio::test]
async fn search_request_forwards_verbatim_to_every_child() {
    let manager = DistributedManager::new("self".to_string(), dummy_peer_manager(), true, 10, None);

    let (child_a, mut remote_a) = child_connection_pair().await;
    let (child_b, mut remote_b) = child_connection_pair().await;
    manager.add_child("child_a".to_string(), child_a).await;
    manager.add_child("child_b".to_string(), child_b).await;

    let mut reader_a = FrameReader::new(&mut remote_a, CodeWidth::Narrow);
    let mut reader_b = FrameReader::new(&mut remote_b, CodeWidth::Narrow);

    // Every new child is synced with current branch state first.
    let level_a = BranchLevel::from_frame(&reader_a.next_frame().await).unwrap();
    let level_b = BranchLevel::from_frame(&reader_b.next_frame().await).unwrap();
    assert_eq!(level_a.level, 0);
    assert_eq!(level_b.level, 0);

    let request = SearchRequest {
        username: "carol".to_string(),
        token: 77,
        query: "rare groove".to_string(),
    };
    manager.handle_search_request(request.clone()).await;

    let forwarded_a = reader_a.next_frame().await;
    let forwarded_b = reader_b.next_frame().await;

    let decoded_a = SearchRequest::from_frame(&forwarded_a).unwrap();
    let decoded_b = SearchRequest::from_frame(&forwarded_b).unwrap();
    assert_eq!(decoded_a.to_bytes(), request.to_bytes());
    assert_eq!(decoded_b.to_bytes(), request.to_bytes());
}

#[tokio::test]
async fn a_child_beyond_capacity_is_disconnected_not_admitted() {
    let manager = DistributedManager::new("self".to_string(), dummy_peer_manager(), true, 1, None);

    let (child_a, mut remote_a) = child_connection_pair().await;
    let (child_b, mut remote_b) = child_connection_pair().await;
    manager.add_child("child_a".to_string(), child_a).await;
    manager.add_child("child_b".to_string(), child_b).await;

    let mut reader_a = FrameReader::new(&mut remote_a, CodeWidth::Narrow);
    BranchLevel::from_frame(&reader_a.next_frame().await).unwrap();

    // The second child exceeds `max_children`; it's disconnected without
    // ever receiving the branch-level push the first child got.
    let mut buf = [0u8; 1];
    use tokio::io::AsyncReadExt;
    let n = remote_b.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "over-capacity child should see the socket closed");
}

#[tokio::test]
async fn a_child_is_rejected_outright_when_children_are_not_accepted() {
    let manager = DistributedManager::new("self".to_string(), dummy_peer_manager(), false, 10, None);

    let (child_a, mut remote_a) = child_connection_pair().await;
    manager.add_child("child_a".to_string(), child_a).await;

    // Never admitted, so it never receives the branch-level push either.
    let mut buf = [0u8; 1];
    use tokio::io::AsyncReadExt;
    let n = remote_a.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "child should see the socket closed when children are disabled");
}
