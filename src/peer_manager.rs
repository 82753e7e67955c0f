//! Peer connection manager: owns the mapping from username to message
//! connection, serializes writes per username, and runs the
//! connection-establishment race whenever no healthy connection exists yet.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex, Semaphore};

use crate::codec::CodeWidth;
use crate::collaborators::{RandomTokenGenerator, TcpTransportFactory};
use crate::config::ConnectionOptions;
use crate::connection::{race_until_first_success, ConnectionState, MessageConnection, RawConnection};
use crate::error::{SlskError, SlskResult};
use crate::messages::init::PeerInit;
use crate::messages::PeerConnectionType;
use crate::peer_handler::PeerHandler;

/// What the peer manager needs from the server channel to run the
/// establishment race. Kept as a trait, grounded the same way
/// [`crate::collaborators`] decouples the runtime from concrete transports,
/// so the peer manager doesn't depend on the client façade or the server
/// handler directly.
#[async_trait]
pub trait ServerLink: Send + Sync {
    async fn peer_address(&self, username: &str) -> SlskResult<(Ipv4Addr, u16)>;
    async fn request_indirect_connection(
        &self,
        token: u32,
        username: &str,
        connection_type: PeerConnectionType,
    ) -> SlskResult<()>;
}

/// Owns per-username message connections and runs connection establishment.
/// Transfer connections are handed back to the caller (the transfer engine)
/// rather than tracked here, since their lifecycle is owned by the
/// individual upload/download state machine.
pub struct PeerManager {
    self_username: String,
    message_connections: DashMap<String, Arc<MessageConnection>>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
    pending_pierce: DashMap<u32, oneshot::Sender<Arc<RawConnection>>>,
    admission: Arc<Semaphore>,
    tcp_factory: Arc<dyn TcpTransportFactory>,
    token_generator: Arc<dyn RandomTokenGenerator>,
    server: Arc<dyn ServerLink>,
    peer_handler: Arc<PeerHandler>,
    peer_connection_options: ConnectionOptions,
    transfer_connection_options: ConnectionOptions,
}

impl PeerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_username: String,
        concurrent_peer_message_connection_limit: u32,
        tcp_factory: Arc<dyn TcpTransportFactory>,
        token_generator: Arc<dyn RandomTokenGenerator>,
        server: Arc<dyn ServerLink>,
        peer_handler: Arc<PeerHandler>,
        peer_connection_options: ConnectionOptions,
        transfer_connection_options: ConnectionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_username,
            message_connections: DashMap::new(),
            write_locks: DashMap::new(),
            pending_pierce: DashMap::new(),
            admission: Arc::new(Semaphore::new(
                concurrent_peer_message_connection_limit as usize,
            )),
            tcp_factory,
            token_generator,
            server,
            peer_handler,
            peer_connection_options,
            transfer_connection_options,
        })
    }

    /// The write-serializing lock for `username`, created on first use.
    pub fn write_lock(&self, username: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Look up a healthy existing message connection, or run the
    /// establishment race to create one. Admission against
    /// `concurrent_peer_message_connection_limit` queues fairly: the
    /// semaphore's own waiter queue is FIFO by arrival.
    pub async fn get_or_add_message_connection(
        self: &Arc<Self>,
        username: &str,
    ) -> SlskResult<Arc<MessageConnection>> {
        if let Some(existing) = self.message_connections.get(username) {
            if existing.state() == ConnectionState::Connected {
                return Ok(existing.clone());
            }
        }

        let _permit = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SlskError::OperationCanceled)?;

        let raw = self.establish(username, PeerConnectionType::Message).await?;
        let connection = Arc::new(MessageConnection::spawn(raw, CodeWidth::Wide, None));
        self.message_connections
            .insert(username.to_string(), connection.clone());
        self.peer_handler
            .spawn_for_connection(username.to_string(), connection.clone());
        Ok(connection)
    }

    /// Create a transfer-type connection to `username`, correlated by
    /// `token` so the remote side's handshake (or the listener's
    /// `PierceFirewall` adoption) can be matched back to this attempt.
    pub async fn add_transfer_connection(
        self: &Arc<Self>,
        username: &str,
        token: u32,
    ) -> SlskResult<Arc<RawConnection>> {
        self.establish_with_token(username, PeerConnectionType::Transfer, token)
            .await
    }

    /// Adopt a socket the listener classified as `PierceFirewall(token)`,
    /// completing whichever establishment attempt is waiting on that token.
    /// A token with no pending attempt means the remote solicited a
    /// connection we've since abandoned or never requested; the socket is
    /// dropped.
    pub fn adopt_pierced_connection(&self, token: u32, raw: Arc<RawConnection>) {
        match self.pending_pierce.remove(&token) {
            Some((_, sender)) => {
                let _ = sender.send(raw);
            }
            None => tracing::warn!(token, "PierceFirewall for unknown token, dropping connection"),
        }
    }

    /// Adopt a socket the listener classified as `PeerInit` — the remote
    /// dialed us directly. Message connections are tracked here; transfer
    /// and distributed connections are returned to the caller, which owns
    /// those engines.
    pub fn adopt_peer_init_message_connection(
        &self,
        username: String,
        raw: Arc<RawConnection>,
    ) -> Arc<MessageConnection> {
        let connection = Arc::new(MessageConnection::spawn(raw, CodeWidth::Wide, None));
        self.message_connections.insert(username.clone(), connection.clone());
        self.peer_handler.spawn_for_connection(username, connection.clone());
        connection
    }

    /// Establish a distributed-channel (`"D"`) connection to `username`,
    /// for use by the distributed connection manager during parent
    /// acquisition.
    pub async fn establish_distributed_connection(
        self: &Arc<Self>,
        username: &str,
    ) -> SlskResult<Arc<RawConnection>> {
        self.establish(username, PeerConnectionType::Distributed)
            .await
    }

    async fn establish(
        self: &Arc<Self>,
        username: &str,
        connection_type: PeerConnectionType,
    ) -> SlskResult<Arc<RawConnection>> {
        let token = self.token_generator.next_token();
        self.establish_with_token(username, connection_type, token)
            .await
    }

    /// Run the direct/indirect race. The loser is aborted by
    /// [`race_until_first_success`] on a best-effort basis: if it had
    /// already produced a connected socket in the instant before losing,
    /// that socket is simply dropped rather than explicitly closed with
    /// `AbandonedAfterRace` — the remote end times out it on its own.
    async fn establish_with_token(
        self: &Arc<Self>,
        username: &str,
        connection_type: PeerConnectionType,
        token: u32,
    ) -> SlskResult<Arc<RawConnection>> {
        let (sender, receiver) = oneshot::channel();
        self.pending_pierce.insert(token, sender);

        let direct = {
            let this = self.clone();
            let username = username.to_string();
            async move { this.attempt_direct(&username, connection_type, token).await }
        };
        let indirect = {
            let this = self.clone();
            let username = username.to_string();
            async move {
                this.attempt_indirect(&username, connection_type, token, receiver)
                    .await
            }
        };

        let result = race_until_first_success(direct, indirect).await;
        self.pending_pierce.remove(&token);
        result
    }

    async fn attempt_direct(
        self: &Arc<Self>,
        username: &str,
        connection_type: PeerConnectionType,
        token: u32,
    ) -> SlskResult<Arc<RawConnection>> {
        let (ip, port) = self.server.peer_address(username).await?;
        let addr = SocketAddr::from((ip, port));
        let options = self.options_for(connection_type);
        let raw = Arc::new(
            RawConnection::connect(self.tcp_factory.as_ref(), addr, options, None).await?,
        );

        let init = PeerInit {
            username: self.self_username.clone(),
            connection_type,
            token,
        };
        raw.write_all(&init.to_bytes(), None).await?;
        Ok(raw)
    }

    async fn attempt_indirect(
        self: &Arc<Self>,
        username: &str,
        connection_type: PeerConnectionType,
        token: u32,
        receiver: oneshot::Receiver<Arc<RawConnection>>,
    ) -> SlskResult<Arc<RawConnection>> {
        self.server
            .request_indirect_connection(token, username, connection_type)
            .await?;
        receiver.await.map_err(|_| SlskError::ConnectionTimeout)
    }

    fn options_for(&self, connection_type: PeerConnectionType) -> &ConnectionOptions {
        match connection_type {
            PeerConnectionType::Transfer => &self.transfer_connection_options,
            PeerConnectionType::Message | PeerConnectionType::Distributed => {
                &self.peer_connection_options
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_lock_is_stable_per_username() {
        let manager = PeerManagerTestHarness::manager();
        let a = manager.write_lock("alice");
        let b = manager.write_lock("alice");
        assert!(Arc::ptr_eq(&a, &b));
    }

    struct PeerManagerTestHarness;

    impl PeerManagerTestHarness {
        fn manager() -> Arc<PeerManager> {
            struct NullFactory;
            #[async_trait]
            impl TcpTransportFactory for NullFactory {
                async fn connect(&self, _addr: SocketAddr) -> std::io::Result<tokio::net::TcpStream> {
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

            let waiter = crate::waiter::Waiter::new();
            let search_engine = crate::search::SearchEngine::new(Arc::new(crate::events::TracingDiagnosticSink));
            let peer_handler = PeerHandler::new(
                waiter,
                search_engine,
                Arc::new(crate::events::TracingDiagnosticSink),
                None,
                None,
                None,
            );

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
    }
}
