//! Drives `Client::connect`/`Client::login` against a hand-rolled TCP
//! fixture playing the server side of the login handshake, end to end over
//! a real loopback socket.

mod support;

use std::net::Ipv4Addr;

use soulseek::client::{Client, ClientState};
use soulseek::codec::CodeWidth;
use soulseek::config::ClientOptionsBuilder;
use soulseek::error::SlskError;
use soulseek::messages::server::{LoginRequest, LoginResponse, ServerPayload};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use support::FrameReader;

#[tokio::test]
async fn login_round_trip_establishes_a_logged_in_session() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut reader = FrameReader::new(&mut stream, CodeWidth::Wide);

        let frame = reader.next_frame().await;
        let request = LoginRequest::from_frame(&frame).unwrap();
        assert_eq!(request.username, "alice");
        assert_eq!(request.hash, format!("{:x}", md5::compute("alicesecret")));

        let response = LoginResponse {
            success: true,
            message: "Welcome to SoulSeek".into(),
            ip: Some(Ipv4Addr::new(127, 0, 0, 1)),
        };
        stream.write_all(&response.to_bytes()).await.unwrap();

        // The client pushes SetListenPort/HaveNoParents/SetSharedCounts/
        // SetOnlineStatus immediately after a successful login; drain them
        // without choking so the session assembly above isn't blocked on a
        // full duplex write buffer.
        loop {
            reader.next_frame().await;
        }
    });

    let options = ClientOptionsBuilder::new().enable_listener(false).build();
    let client = Client::new(options);
    client.connect(addr).await.unwrap();
    let response = client.login("alice", "secret", 160, 1).await.unwrap();

    assert!(response.success);
    assert_eq!(response.message, "Welcome to SoulSeek");
    assert_eq!(client.state().await, ClientState::LoggedIn);

    client.disconnect().await;
    assert_eq!(client.state().await, ClientState::Disconnected);
    server_task.abort();
}

#[tokio::test]
async fn login_refusal_surfaces_as_an_auth_error() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut reader = FrameReader::new(&mut stream, CodeWidth::Wide);
        reader.next_frame().await;

        let response = LoginResponse {
            success: false,
            message: "INVALIDUSERNAME".into(),
            ip: None,
        };
        stream.write_all(&response.to_bytes()).await.unwrap();
    });

    let options = ClientOptionsBuilder::new().enable_listener(false).build();
    let client = Client::new(options);
    client.connect(addr).await.unwrap();
    let err = client.login("ghost", "wrong", 160, 1).await.unwrap_err();

    assert!(matches!(err, SlskError::Auth { .. }));
    assert_eq!(client.state().await, ClientState::Disconnected);
    server_task.await.unwrap();
}
