//! Dependency-injected collaborators named by the runtime's external
//! scope: a clock, a TCP transport factory, a random-token generator. Byte
//! stream sources/sinks are supplied ad hoc as `tokio::io::{AsyncRead,
//! AsyncWrite}` trait objects at the transfer call sites rather than
//! through a named trait here, since their shape is just "a stream".
//!
//! Passed through construction (see [`crate::client::Client::with_collaborators`]),
//! following the re-architecture note against process-wide singletons.

use std::net::SocketAddr;
use std::time::Instant;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

/// A source of the current instant, injectable so tests can control time
/// without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Outbound dialing and inbound binding, injectable so tests can swap in
/// an in-memory transport instead of real sockets.
#[async_trait]
pub trait TcpTransportFactory: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<TcpStream>;
    async fn bind(&self, addr: SocketAddr) -> std::io::Result<TcpListener>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTcpTransportFactory;

#[async_trait]
impl TcpTransportFactory for TokioTcpTransportFactory {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }

    async fn bind(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }
}

/// A source of 32-bit tokens used to correlate connection-establishment
/// attempts and transfer negotiations.
pub trait RandomTokenGenerator: Send + Sync {
    fn next_token(&self) -> u32;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTokenGenerator;

impl RandomTokenGenerator for DefaultTokenGenerator {
    fn next_token(&self) -> u32 {
        rand::random()
    }
}
