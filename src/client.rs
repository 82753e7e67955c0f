//! The client façade: the single entry point a host constructs,
//! wiring together the waiter, peer manager, distributed manager, search
//! engine, server handler, peer handler, token buckets, and inbound
//! listener behind one `connect`/`login`/`disconnect` lifecycle.
//!
//! Assembly order exists to break a real cycle: [`PeerManager`] needs a
//! [`ServerLink`] to run its connection-establishment race, but the only
//! implementation is [`ServerHandler`], which itself needs an
//! `Arc<PeerManager>`. [`ServerLinkCell`] is the indirection that lets both
//! sides construct: the peer manager is built against a cell with nothing
//! in it yet, and the cell is filled in once the server handler exists.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, OnceCell, RwLock};
use tokio::task::JoinHandle;

use crate::codec::CodeWidth;
use crate::collaborators::{
    Clock, DefaultTokenGenerator, RandomTokenGenerator, SystemClock, TcpTransportFactory,
    TokioTcpTransportFactory,
};
use crate::config::ClientOptions;
use crate::connection::{ClassifiedConnection, Listener, MessageConnection, RawConnection};
use crate::distributed_manager::DistributedManager;
use crate::error::{AuthErrorKind, DisconnectReason, SlskError, SlskResult};
use crate::events::{DiagnosticSink, TracingDiagnosticSink};
use crate::messages::common::{PeerConnectionType, RoomEntry, UserStatus};
use crate::messages::server::{
    AddUserResponse, GetStatusResponse, GetUserStatsResponse, JoinRoomResponse, LoginResponse,
    PrivilegedUsersResponse, RoomListResponse,
};
use crate::peer_handler::PeerHandler;
use crate::peer_manager::{PeerManager, ServerLink};
use crate::search::{Scope, SearchEngine, SearchOptions, SearchResultEntry};
use crate::server_handler::{ServerHandler, UserStats};
use crate::token_bucket::{TokenBucket, UNLIMITED};
use crate::transfer::{Download, TransferContext, Upload, UploadQueue};
use crate::waiter::{Cancellation, Waiter};

const TOKEN_BUCKET_INTERVAL: Duration = Duration::from_millis(100);
const LISTENER_DISPATCH_CAPACITY: usize = 64;

/// Where the client currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    LoggedIn,
    Disconnecting,
}

/// Scale a configured bytes-per-second limit down to the bucket's actual
/// refill interval. The bucket refills to `capacity` every `interval`, so
/// a `capacity` of `bytes_per_s` itself would enforce `bytes_per_s /
/// interval` per second — at `TOKEN_BUCKET_INTERVAL = 100ms` that's 10x
/// the configured limit. Never rounds a non-zero limit down to 0, which
/// would make every `wait` fail outright instead of merely throttling.
fn speed_limit_to_capacity(bytes_per_s: u32) -> u64 {
    if bytes_per_s == 0 {
        UNLIMITED
    } else {
        let scaled = (bytes_per_s as u64 * TOKEN_BUCKET_INTERVAL.as_millis() as u64) / 1000;
        scaled.max(1)
    }
}

/// Resolves to the server handler once `login` constructs one, letting
/// [`PeerManager`] be built before the handler exists. See the module doc
/// comment for why this indirection is needed.
struct ServerLinkCell {
    inner: OnceCell<Arc<ServerHandler>>,
}

impl ServerLinkCell {
    fn new() -> Arc<Self> {
        Arc::new(Self { inner: OnceCell::new() })
    }

    fn set(&self, handler: Arc<ServerHandler>) {
        // `login` only ever calls this once per cell.
        let _ = self.inner.set(handler);
    }

    fn handler(&self) -> SlskResult<&Arc<ServerHandler>> {
        self.inner.get().ok_or(SlskError::ConnectionClosed {
            reason: DisconnectReason::RemoteClosed,
        })
    }
}

#[async_trait]
impl ServerLink for ServerLinkCell {
    async fn peer_address(&self, username: &str) -> SlskResult<(Ipv4Addr, u16)> {
        self.handler()?.peer_address(username).await
    }

    async fn request_indirect_connection(
        &self,
        token: u32,
        username: &str,
        connection_type: PeerConnectionType,
    ) -> SlskResult<()> {
        self.handler()?
            .request_indirect_connection(token, username, connection_type)
            .await
    }
}

/// Everything assembled once `login` succeeds. Torn down wholesale by
/// `disconnect`.
struct ClientSession {
    #[allow(dead_code)]
    self_username: String,
    waiter: Arc<Waiter>,
    peer_manager: Arc<PeerManager>,
    #[allow(dead_code)]
    distributed_manager: Arc<DistributedManager>,
    search_engine: Arc<SearchEngine>,
    server_handler: Arc<ServerHandler>,
    #[allow(dead_code)]
    peer_handler: Arc<PeerHandler>,
    server_dispatch: JoinHandle<()>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.server_dispatch.abort();
        for task in &self.background_tasks {
            task.abort();
        }
    }
}

/// The SoulSeek client. Construct with [`Client::new`] (or
/// [`Client::with_collaborators`] to inject test doubles), `connect` to the
/// server, then `login`. Every other public method requires a logged-in
/// session and returns [`SlskError::ConnectionClosed`] otherwise.
pub struct Client {
    options: ClientOptions,
    clock: Arc<dyn Clock>,
    tcp_factory: Arc<dyn TcpTransportFactory>,
    token_generator: Arc<dyn RandomTokenGenerator>,
    sink: Arc<dyn DiagnosticSink>,
    state: RwLock<ClientState>,
    pending_connection: RwLock<Option<Arc<RawConnection>>>,
    session: RwLock<Option<Arc<ClientSession>>>,
    download_bucket: Arc<TokenBucket>,
    upload_bucket: Arc<TokenBucket>,
    upload_queue: Arc<UploadQueue>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Arc<Self> {
        Self::with_collaborators(
            options,
            Arc::new(SystemClock),
            Arc::new(TokioTcpTransportFactory),
            Arc::new(DefaultTokenGenerator),
            Arc::new(TracingDiagnosticSink),
        )
    }

    pub fn with_collaborators(
        options: ClientOptions,
        clock: Arc<dyn Clock>,
        tcp_factory: Arc<dyn TcpTransportFactory>,
        token_generator: Arc<dyn RandomTokenGenerator>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Arc<Self> {
        let download_bucket = Arc::new(TokenBucket::new(
            speed_limit_to_capacity(options.download_speed_limit_bytes_per_s),
            TOKEN_BUCKET_INTERVAL,
        ));
        let upload_bucket = Arc::new(TokenBucket::new(
            speed_limit_to_capacity(options.upload_speed_limit_bytes_per_s),
            TOKEN_BUCKET_INTERVAL,
        ));
        let upload_queue = Arc::new(UploadQueue::new(options.upload_slot_limit));

        Arc::new(Self {
            options,
            clock,
            tcp_factory,
            token_generator,
            sink,
            state: RwLock::new(ClientState::Disconnected),
            pending_connection: RwLock::new(None),
            session: RwLock::new(None),
            download_bucket,
            upload_bucket,
            upload_queue,
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Dial the server. Does not perform the login handshake — call
    /// [`Client::login`] next.
    pub async fn connect(&self, server_addr: SocketAddr) -> SlskResult<()> {
        *self.state.write().await = ClientState::Connecting;
        let raw = RawConnection::connect(
            self.tcp_factory.as_ref(),
            server_addr,
            &self.options.server_connection_options,
            None,
        )
        .await?;
        *self.pending_connection.write().await = Some(Arc::new(raw));
        Ok(())
    }

    /// Perform the login handshake, assembling the full session on success.
    /// After this returns `Ok`, pushes `SetListenPort`, `HaveNoParents`,
    /// `SetSharedCounts`, and `SetOnlineStatus(Online)` as configured.
    pub async fn login(
        self: &Arc<Self>,
        username: &str,
        password: &str,
        version: u32,
        minor_version: u32,
    ) -> SlskResult<LoginResponse> {
        let raw = self
            .pending_connection
            .write()
            .await
            .take()
            .ok_or(SlskError::ConnectionClosed {
                reason: DisconnectReason::RemoteClosed,
            })?;

        let connection = Arc::new(MessageConnection::spawn(raw, CodeWidth::Wide, None));
        let waiter = Waiter::new();
        let server_link = ServerLinkCell::new();
        let search_engine = SearchEngine::new(self.sink.clone());
        let peer_handler = PeerHandler::new(
            waiter.clone(),
            search_engine.clone(),
            self.sink.clone(),
            self.options.browse_resolver.clone(),
            self.options.info_resolver.clone(),
            self.options.folder_contents_resolver.clone(),
        );

        let peer_manager = PeerManager::new(
            username.to_string(),
            self.options.concurrent_peer_message_connection_limit,
            self.tcp_factory.clone(),
            self.token_generator.clone(),
            server_link.clone() as Arc<dyn ServerLink>,
            peer_handler.clone(),
            self.options.peer_connection_options.clone(),
            self.options.transfer_connection_options.clone(),
        );
        let distributed_manager = DistributedManager::new(
            username.to_string(),
            peer_manager.clone(),
            self.options.accept_distributed_children,
            self.options.distributed_child_limit,
            self.options.search_response_resolver.clone(),
        );
        let server_handler = ServerHandler::new(
            username.to_string(),
            connection.clone(),
            waiter.clone(),
            self.sink.clone(),
            peer_manager.clone(),
            distributed_manager.clone(),
            search_engine.clone(),
            self.options.search_response_resolver.clone(),
            self.tcp_factory.clone(),
            self.options.peer_connection_options.clone(),
            self.options.transfer_connection_options.clone(),
            self.options.listen_port,
            self.options.auto_acknowledge_private_messages,
            self.options.auto_acknowledge_privilege_notifications,
        );
        server_link.set(server_handler.clone());
        let server_dispatch = server_handler.spawn();

        let response = match server_handler.login(username, password, version, minor_version).await {
            Ok(response) => response,
            Err(err) => {
                server_dispatch.abort();
                *self.state.write().await = ClientState::Disconnected;
                return Err(err);
            }
        };

        if !response.success {
            server_dispatch.abort();
            *self.state.write().await = ClientState::Disconnected;
            return Err(SlskError::Auth {
                kind: AuthErrorKind::LoginRefused(response.message.clone()),
            });
        }

        let mut background_tasks = Vec::new();
        if self.options.enable_listener {
            match self.spawn_listener(peer_manager.clone(), distributed_manager.clone()).await {
                Ok(tasks) => background_tasks.extend(tasks),
                Err(err) => tracing::warn!(error = %err, "failed to start inbound listener"),
            }
        }

        *self.session.write().await = Some(Arc::new(ClientSession {
            self_username: username.to_string(),
            waiter,
            peer_manager,
            distributed_manager,
            search_engine,
            server_handler: server_handler.clone(),
            peer_handler,
            server_dispatch,
            background_tasks,
        }));
        *self.state.write().await = ClientState::LoggedIn;

        if let Err(err) = server_handler.set_listen_port(self.options.listen_port).await {
            tracing::warn!(error = %err, "failed to push listen port after login");
        }
        if let Err(err) = server_handler.have_no_parents(true).await {
            tracing::warn!(error = %err, "failed to announce HaveNoParents after login");
        }
        if let Err(err) = server_handler.set_shared_counts(0, 0).await {
            tracing::warn!(error = %err, "failed to push shared counts after login");
        }
        if let Err(err) = server_handler.set_online_status(UserStatus::Online).await {
            tracing::warn!(error = %err, "failed to push online status after login");
        }

        Ok(response)
    }

    async fn spawn_listener(
        &self,
        peer_manager: Arc<PeerManager>,
        distributed_manager: Arc<DistributedManager>,
    ) -> SlskResult<Vec<JoinHandle<()>>> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.options.listen_port));
        let listener = Arc::new(
            Listener::bind(self.tcp_factory.as_ref(), addr, self.options.peer_connection_options.clone()).await?,
        );

        let (sender, mut receiver) = mpsc::channel(LISTENER_DISPATCH_CAPACITY);
        let accept_task = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.run(sender).await })
        };

        let dispatch_task = tokio::spawn(async move {
            while let Some(classified) = receiver.recv().await {
                match classified {
                    ClassifiedConnection::PierceFirewall { token, raw } => {
                        peer_manager.adopt_pierced_connection(token, raw);
                    }
                    ClassifiedConnection::PeerInit {
                        username,
                        connection_type,
                        token,
                        raw,
                    } => match connection_type {
                        PeerConnectionType::Message => {
                            peer_manager.adopt_peer_init_message_connection(username, raw);
                        }
                        PeerConnectionType::Distributed => {
                            let connection = Arc::new(MessageConnection::spawn(raw, CodeWidth::Narrow, None));
                            distributed_manager.add_child(username, connection).await;
                        }
                        PeerConnectionType::Transfer => {
                            peer_manager.adopt_pierced_connection(token, raw);
                        }
                    },
                }
            }
        });

        Ok(vec![accept_task, dispatch_task])
    }

    async fn session(&self) -> SlskResult<Arc<ClientSession>> {
        self.session
            .read()
            .await
            .clone()
            .ok_or(SlskError::ConnectionClosed {
                reason: DisconnectReason::RemoteClosed,
            })
    }

    /// Tear down the active session and close the server connection.
    pub async fn disconnect(&self) {
        *self.state.write().await = ClientState::Disconnecting;
        if let Some(session) = self.session.write().await.take() {
            session.server_handler.disconnect(DisconnectReason::Requested).await;
        }
        *self.state.write().await = ClientState::Disconnected;
    }

    // -- search --------------------------------------------------------

    pub async fn search(
        &self,
        query: &str,
        token: u32,
        scope: Scope,
        options: SearchOptions,
    ) -> SlskResult<Cancellation> {
        let session = self.session().await?;
        session
            .search_engine
            .search(session.server_handler.as_ref(), query, token, scope, options)
            .await
    }

    pub async fn search_results(&self, token: u32) -> SlskResult<Vec<SearchResultEntry>> {
        let session = self.session().await?;
        Ok(session.search_engine.results(token).await)
    }

    pub async fn cancel_search(&self, token: u32) -> SlskResult<()> {
        let session = self.session().await?;
        session.search_engine.cancel(token);
        Ok(())
    }

    // -- transfers -------------------------------------------------------

    pub async fn download(
        self: &Arc<Self>,
        username: &str,
        filename: &str,
        token: u32,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> SlskResult<()> {
        let session = self.session().await?;
        let ctx = self.transfer_context(&session);
        let download = Download::new(username, filename, token);
        download.run(&ctx, sink).await
    }

    pub async fn upload(
        self: &Arc<Self>,
        username: &str,
        filename: &str,
        token: u32,
        size: u64,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> SlskResult<()> {
        let session = self.session().await?;
        let ctx = self.transfer_context(&session);
        let upload = Upload::new(username, filename, token, size);
        upload.run(&ctx, self.upload_queue.as_ref(), source).await
    }

    fn transfer_context(&self, session: &Arc<ClientSession>) -> TransferContext {
        TransferContext {
            peer_manager: session.peer_manager.clone(),
            waiter: session.waiter.clone(),
            token_generator: self.token_generator.clone(),
            download_bucket: self.download_bucket.clone(),
            upload_bucket: self.upload_bucket.clone(),
            sink: self.sink.clone(),
        }
    }

    pub async fn set_download_speed_limit(&self, bytes_per_s: u32) {
        self.download_bucket.set_capacity(speed_limit_to_capacity(bytes_per_s)).await;
    }

    pub async fn set_upload_speed_limit(&self, bytes_per_s: u32) {
        self.upload_bucket.set_capacity(speed_limit_to_capacity(bytes_per_s)).await;
    }

    // -- server-backed passthroughs --------------------------------------

    pub async fn join_room(&self, room: &str) -> SlskResult<JoinRoomResponse> {
        self.session().await?.server_handler.join_room(room).await
    }

    pub async fn leave_room(&self, room: &str) -> SlskResult<()> {
        self.session().await?.server_handler.leave_room(room).await
    }

    pub async fn say_in_chat_room(&self, room: &str, message: &str) -> SlskResult<()> {
        self.session().await?.server_handler.say_in_chat_room(room, message).await
    }

    pub async fn private_message(&self, username: &str, message: &str) -> SlskResult<()> {
        self.session().await?.server_handler.private_message(username, message).await
    }

    pub async fn get_status(&self, username: &str) -> SlskResult<GetStatusResponse> {
        self.session().await?.server_handler.get_status(username).await
    }

    pub async fn get_user_stats(&self, username: &str) -> SlskResult<GetUserStatsResponse> {
        self.session().await?.server_handler.get_user_stats(username).await
    }

    pub async fn add_user(&self, username: &str) -> SlskResult<AddUserResponse> {
        self.session().await?.server_handler.add_user(username).await
    }

    pub async fn user_privileges(&self, username: &str) -> SlskResult<bool> {
        self.session().await?.server_handler.user_privileges(username).await
    }

    pub async fn check_privileges(&self) -> SlskResult<u32> {
        self.session().await?.server_handler.check_privileges().await
    }

    pub async fn request_room_list(&self) -> SlskResult<RoomListResponse> {
        self.session().await?.server_handler.request_room_list().await
    }

    pub async fn request_privileged_users(&self) -> SlskResult<PrivilegedUsersResponse> {
        self.session().await?.server_handler.request_privileged_users().await
    }

    pub async fn rooms(&self) -> SlskResult<Vec<RoomEntry>> {
        Ok(self.session().await?.server_handler.rooms())
    }

    pub async fn user_status(&self, username: &str) -> SlskResult<Option<UserStatus>> {
        Ok(self.session().await?.server_handler.user_status(username))
    }

    pub async fn user_stats(&self, username: &str) -> SlskResult<Option<UserStats>> {
        Ok(self.session().await?.server_handler.user_stats(username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_disconnected_with_no_session() {
        let client = Client::new(ClientOptions::default());
        assert_eq!(client.state().await, ClientState::Disconnected);
        let err = client.search_results(1).await.unwrap_err();
        assert!(matches!(err, SlskError::ConnectionClosed { .. }));
    }

    #[test]
    fn speed_limit_zero_means_unlimited() {
        assert_eq!(speed_limit_to_capacity(0), UNLIMITED);
    }

    #[test]
    fn speed_limit_is_scaled_to_the_refill_interval() {
        // 100ms refill interval: capacity = bytes_per_s / 10.
        assert_eq!(speed_limit_to_capacity(10_240), 1024);
        assert_eq!(speed_limit_to_capacity(1_000_000), 100_000);
    }

    #[test]
    fn speed_limit_never_rounds_a_nonzero_limit_down_to_zero() {
        assert_eq!(speed_limit_to_capacity(1), 1);
        assert_eq!(speed_limit_to_capacity(9), 1);
    }
}
