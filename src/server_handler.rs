//! Server handler: owns the single server connection, answers
//! [`ServerLink`](crate::peer_manager::ServerLink) and
//! [`SearchServerLink`](crate::search::SearchServerLink) for the peer
//! manager and search engine, and runs the server dispatch loop.
//!
//! The dispatch loop logs and continues on a per-message decode failure
//! rather than tearing down the connection, exactly as
//! [`crate::connection::listener::Listener::run`] tolerates a single
//! `accept()` failure without exiting its own loop.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::codec::{CodeWidth, MessageBuilder};
use crate::collaborators::TcpTransportFactory;
use crate::config::{ConnectionOptions, SearchResponseResolver};
use crate::connection::{MessageConnection, RawConnection};
use crate::distributed_manager::DistributedManager;
use crate::error::{DisconnectReason, SlskError, SlskResult};
use crate::events::{DiagnosticSink, Event};
use crate::messages::common::{PeerConnectionType, RoomEntry, UserStatus};
use crate::messages::distributed::SearchRequest as DistributedSearchRequest;
use crate::messages::init::PierceFirewall;
use crate::messages::server::{
    self, AcknowledgePrivateMessage, AcknowledgePrivilegeNotification, AddUserRequest,
    AddUserResponse, CheckPrivilegesResponse, ConnectToPeer, FileSearch, GetPeerAddressRequest,
    GetPeerAddressResponse, GetStatusRequest, GetStatusResponse, GetUserStatsRequest,
    GetUserStatsResponse, HaveNoParents, JoinRoomRequest, JoinRoomResponse, LeaveRoom,
    LoginRequest, LoginResponse, Ping, PrivateMessage, PrivilegedUsersResponse, RoomListResponse,
    RoomSearch, SayInChatRoom, ServerMessage, ServerPayload, SetListenPort, SetOnlineStatus,
    SetSharedCounts, UserPrivilegesRequest, UserPrivilegesResponse, UserSearch, WishlistSearch,
};
use crate::peer_manager::{PeerManager, ServerLink};
use crate::search::{SearchEngine, SearchServerLink};
use crate::waiter::{WaitKey, Waiter};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-reported aggregate activity for one user, cached as it arrives.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserStats {
    pub average_speed: u32,
    pub upload_count: u64,
    pub shared_files: u32,
    pub shared_folders: u32,
}

/// Owns the server connection and the caches the server alone is allowed to
/// populate: rooms, user status, user stats.
pub struct ServerHandler {
    self_username: String,
    connection: Arc<MessageConnection>,
    waiter: Arc<Waiter>,
    sink: Arc<dyn DiagnosticSink>,
    peer_manager: Arc<PeerManager>,
    distributed_manager: Arc<DistributedManager>,
    search_engine: Arc<SearchEngine>,
    search_response_resolver: Option<SearchResponseResolver>,
    tcp_factory: Arc<dyn TcpTransportFactory>,
    peer_connection_options: ConnectionOptions,
    transfer_connection_options: ConnectionOptions,
    listen_port: u16,
    auto_acknowledge_private_messages: bool,
    auto_acknowledge_privilege_notifications: bool,
    rooms: DashMap<String, u32>,
    user_status: DashMap<String, UserStatus>,
    user_stats: DashMap<String, UserStats>,
}

impl ServerHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_username: String,
        connection: Arc<MessageConnection>,
        waiter: Arc<Waiter>,
        sink: Arc<dyn DiagnosticSink>,
        peer_manager: Arc<PeerManager>,
        distributed_manager: Arc<DistributedManager>,
        search_engine: Arc<SearchEngine>,
        search_response_resolver: Option<SearchResponseResolver>,
        tcp_factory: Arc<dyn TcpTransportFactory>,
        peer_connection_options: ConnectionOptions,
        transfer_connection_options: ConnectionOptions,
        listen_port: u16,
        auto_acknowledge_private_messages: bool,
        auto_acknowledge_privilege_notifications: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_username,
            connection,
            waiter,
            sink,
            peer_manager,
            distributed_manager,
            search_engine,
            search_response_resolver,
            tcp_factory,
            peer_connection_options,
            transfer_connection_options,
            listen_port,
            auto_acknowledge_private_messages,
            auto_acknowledge_privilege_notifications,
            rooms: DashMap::new(),
            user_status: DashMap::new(),
            user_stats: DashMap::new(),
        })
    }

    /// Spawn the dispatch loop as a background task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut frames = self.connection.subscribe();
        loop {
            let frame = match frames.recv().await {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Closed) => {
                    self.waiter.fail_all(|| SlskError::ConnectionClosed {
                        reason: DisconnectReason::RemoteClosed,
                    });
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "server handler lagged behind the frame broadcast");
                    continue;
                }
            };

            match ServerMessage::decode(&frame) {
                Ok(Some(message)) => self.dispatch(message).await,
                Ok(None) => tracing::debug!(code = frame.code, "unknown server message code, dropping"),
                Err(err) => tracing::warn!(error = %err, "failed to decode server message, continuing"),
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, message: ServerMessage) {
        match message {
            ServerMessage::Login(resp) => {
                self.waiter.complete(&WaitKey::for_code(server::LOGIN), resp);
            }
            ServerMessage::Ping(_) => {
                if let Err(err) = self.connection.write(&Ping.to_bytes()).await {
                    tracing::warn!(error = %err, "failed to reply to server ping");
                }
            }
            ServerMessage::CheckPrivileges(resp) => {
                self.waiter.complete(&WaitKey::for_code(server::CHECK_PRIVILEGES), resp);
            }
            ServerMessage::ParentMinSpeed(_)
            | ServerMessage::ParentSpeedRatio(_)
            | ServerMessage::WishlistInterval(_)
            | ServerMessage::NewPassword(_) => {
                tracing::debug!(?message, "server pushed configuration value");
            }
            ServerMessage::RoomList(resp) => self.handle_room_list(resp),
            ServerMessage::PrivilegedUsers(resp) => self.handle_privileged_users(resp).await,
            ServerMessage::JoinRoom(resp) => self.handle_join_room(resp).await,
            ServerMessage::LeaveRoom(msg) => {
                self.waiter.complete(&WaitKey::for_user(server::LEAVE_ROOM, msg.room.clone()), msg);
            }
            ServerMessage::GetPeerAddress(resp) => {
                self.waiter
                    .complete(&WaitKey::for_user(server::GET_PEER_ADDRESS, resp.username.clone()), resp);
            }
            ServerMessage::AddUser(resp) => self.handle_add_user(resp).await,
            ServerMessage::GetStatus(resp) => self.handle_get_status(resp).await,
            ServerMessage::GetUserStats(resp) => self.handle_get_user_stats(resp).await,
            ServerMessage::UserPrivileges(resp) => {
                self.waiter
                    .complete(&WaitKey::for_user(server::USER_PRIVILEGES, resp.username.clone()), resp);
            }
            ServerMessage::PrivateMessage(msg) => self.handle_private_message(msg).await,
            ServerMessage::NotifyPrivileges(msg) => self.handle_notify_privileges(msg).await,
            ServerMessage::NetInfo(net_info) => {
                let candidates = net_info.parents.into_iter().map(|entry| entry.username).collect();
                self.distributed_manager.handle_net_info(candidates);
            }
            ServerMessage::ConnectToPeer(msg) => {
                let this = self.clone();
                tokio::spawn(async move { this.handle_connect_to_peer(msg).await });
            }
            ServerMessage::SayInChatRoom(msg) => {
                self.sink
                    .on_event(Event::RoomMessageReceived {
                        room: msg.room,
                        username: msg.username,
                        message: msg.message,
                    })
                    .await;
            }
            ServerMessage::UserJoinedRoom(msg) => {
                self.user_status.insert(msg.username.clone(), msg.status);
                self.sink
                    .on_event(Event::RoomJoined {
                        room: msg.room,
                        username: msg.username,
                        status: msg.status,
                    })
                    .await;
            }
            ServerMessage::UserLeftRoom(msg) => {
                self.sink
                    .on_event(Event::RoomLeft {
                        room: msg.room,
                        username: msg.username,
                    })
                    .await;
            }
            ServerMessage::KickedFromServer(_) => {
                self.sink.on_event(Event::KickedFromServer).await;
            }
            ServerMessage::FileSearch(msg) => self.handle_file_search(msg).await,
            ServerMessage::SearchRequestFallback(msg) => {
                let request = DistributedSearchRequest {
                    username: msg.username,
                    token: msg.token,
                    query: msg.query,
                };
                self.distributed_manager.handle_search_request(request).await;
            }
        }
    }

    fn handle_room_list(&self, resp: RoomListResponse) {
        self.rooms.clear();
        for room in &resp.rooms {
            self.rooms.insert(room.name.clone(), room.user_count);
        }
        self.waiter.complete(&WaitKey::for_code(server::ROOM_LIST), resp);
    }

    async fn handle_privileged_users(&self, resp: PrivilegedUsersResponse) {
        self.waiter.complete(&WaitKey::for_code(server::PRIVILEGED_USERS), resp.clone());
        self.sink
            .on_event(Event::PrivilegedUserListReceived { usernames: resp.usernames })
            .await;
    }

    async fn handle_join_room(&self, resp: JoinRoomResponse) {
        self.waiter
            .complete(&WaitKey::for_user(server::JOIN_ROOM, resp.room.clone()), resp);
    }

    async fn handle_add_user(&self, resp: AddUserResponse) {
        self.user_status.insert(resp.username.clone(), resp.status);
        self.sink
            .on_event(Event::UserStatusChanged {
                username: resp.username.clone(),
                status: resp.status,
            })
            .await;
        self.waiter
            .complete(&WaitKey::for_user(server::ADD_USER, resp.username.clone()), resp);
    }

    async fn handle_get_status(&self, resp: GetStatusResponse) {
        self.user_status.insert(resp.username.clone(), resp.status);
        self.sink
            .on_event(Event::UserStatusChanged {
                username: resp.username.clone(),
                status: resp.status,
            })
            .await;
        self.waiter
            .complete(&WaitKey::for_user(server::GET_STATUS, resp.username.clone()), resp);
    }

    async fn handle_get_user_stats(&self, resp: GetUserStatsResponse) {
        self.user_stats.insert(
            resp.username.clone(),
            UserStats {
                average_speed: resp.average_speed,
                upload_count: resp.upload_count,
                shared_files: resp.shared_files,
                shared_folders: resp.shared_folders,
            },
        );
        self.sink
            .on_event(Event::UserStatsChanged {
                username: resp.username.clone(),
                average_speed: resp.average_speed,
                shared_files: resp.shared_files,
                shared_folders: resp.shared_folders,
            })
            .await;
        self.waiter
            .complete(&WaitKey::for_user(server::GET_USER_STATS, resp.username.clone()), resp);
    }

    async fn handle_private_message(&self, msg: PrivateMessage) {
        let id = msg.id;
        self.sink
            .on_event(Event::PrivateMessageReceived {
                id,
                username: msg.username,
                message: msg.message,
            })
            .await;
        if self.auto_acknowledge_private_messages {
            if let Err(err) = self
                .connection
                .write(&AcknowledgePrivateMessage { id }.to_bytes())
                .await
            {
                tracing::warn!(error = %err, id, "failed to auto-acknowledge private message");
            }
        }
    }

    async fn handle_notify_privileges(&self, msg: crate::messages::server::NotifyPrivileges) {
        let id = msg.id;
        self.sink
            .on_event(Event::PrivilegeNotificationReceived {
                id,
                username: msg.username,
            })
            .await;
        if self.auto_acknowledge_privilege_notifications {
            if let Err(err) = self
                .connection
                .write(&AcknowledgePrivilegeNotification { id }.to_bytes())
                .await
            {
                tracing::warn!(error = %err, id, "failed to auto-acknowledge privilege notification");
            }
        }
    }

    async fn handle_file_search(&self, msg: FileSearch) {
        let Some(resolver) = &self.search_response_resolver else {
            return;
        };
        let Some(response) = resolver(&msg.username, msg.token, &msg.query) else {
            return;
        };
        match self.peer_manager.get_or_add_message_connection(&msg.username).await {
            Ok(connection) => {
                if let Err(err) = connection.write(&response.to_bytes()).await {
                    tracing::warn!(error = %err, username = %msg.username, "failed to deliver search response");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, username = %msg.username, "failed to reach searcher for response");
            }
        }
    }

    /// Dial out to a peer that solicited an indirect connection through
    /// us via the server, pierce the firewall with their token, and adopt
    /// the resulting socket according to the connection type they asked
    /// for. Transfer connections are adopted through the same token-keyed
    /// mechanism [`PeerManager`] uses for its own establishment attempts —
    /// a pragmatic simplification recorded in `DESIGN.md` rather than a
    /// fully independent inbound transfer-negotiation path.
    async fn handle_connect_to_peer(self: Arc<Self>, msg: ConnectToPeer) {
        let addr = SocketAddr::from((msg.ip, msg.port));
        let options = match msg.connection_type {
            PeerConnectionType::Transfer => &self.transfer_connection_options,
            PeerConnectionType::Message | PeerConnectionType::Distributed => &self.peer_connection_options,
        };

        let raw = match RawConnection::connect(self.tcp_factory.as_ref(), addr, options, None).await {
            Ok(raw) => Arc::new(raw),
            Err(err) => {
                tracing::warn!(error = %err, username = %msg.username, "failed to dial peer for relayed connection");
                return;
            }
        };

        if let Err(err) = raw.write_all(&PierceFirewall { token: msg.token }.to_bytes(), None).await {
            tracing::warn!(error = %err, username = %msg.username, "failed to pierce firewall for relayed connection");
            return;
        }

        match msg.connection_type {
            PeerConnectionType::Message => {
                self.peer_manager
                    .adopt_peer_init_message_connection(msg.username, raw);
            }
            PeerConnectionType::Distributed => {
                let connection = Arc::new(MessageConnection::spawn(raw, CodeWidth::Narrow, None));
                self.distributed_manager.add_child(msg.username, connection).await;
            }
            PeerConnectionType::Transfer => {
                self.peer_manager.adopt_pierced_connection(msg.token, raw);
            }
        }
    }

    /// Close the underlying server connection. Does not touch any peer,
    /// distributed, or transfer connections — those are owned elsewhere and
    /// outlive a single server session until their own idle timeouts fire.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        self.connection.disconnect(reason).await;
    }

    pub async fn login(&self, username: &str, password: &str, version: u32, minor_version: u32) -> SlskResult<LoginResponse> {
        let request = LoginRequest::new(username, password, version, minor_version);
        self.connection.write(&request.to_bytes()).await?;
        self.waiter
            .wait(WaitKey::for_code(server::LOGIN), REQUEST_TIMEOUT, None)
            .await
    }

    pub async fn join_room(&self, room: &str) -> SlskResult<JoinRoomResponse> {
        self.connection
            .write(&JoinRoomRequest { room: room.to_string() }.to_bytes())
            .await?;
        self.waiter
            .wait(WaitKey::for_user(server::JOIN_ROOM, room.to_string()), REQUEST_TIMEOUT, None)
            .await
    }

    pub async fn leave_room(&self, room: &str) -> SlskResult<()> {
        self.connection
            .write(&LeaveRoom { room: room.to_string() }.to_bytes())
            .await?;
        self.waiter
            .wait::<LeaveRoom>(WaitKey::for_user(server::LEAVE_ROOM, room.to_string()), REQUEST_TIMEOUT, None)
            .await?;
        Ok(())
    }

    pub async fn get_status(&self, username: &str) -> SlskResult<GetStatusResponse> {
        self.connection
            .write(&GetStatusRequest { username: username.to_string() }.to_bytes())
            .await?;
        self.waiter
            .wait(WaitKey::for_user(server::GET_STATUS, username.to_string()), REQUEST_TIMEOUT, None)
            .await
    }

    pub async fn get_user_stats(&self, username: &str) -> SlskResult<GetUserStatsResponse> {
        self.connection
            .write(&GetUserStatsRequest { username: username.to_string() }.to_bytes())
            .await?;
        self.waiter
            .wait(
                WaitKey::for_user(server::GET_USER_STATS, username.to_string()),
                REQUEST_TIMEOUT,
                None,
            )
            .await
    }

    pub async fn add_user(&self, username: &str) -> SlskResult<AddUserResponse> {
        self.connection
            .write(&AddUserRequest { username: username.to_string() }.to_bytes())
            .await?;
        self.waiter
            .wait(WaitKey::for_user(server::ADD_USER, username.to_string()), REQUEST_TIMEOUT, None)
            .await
    }

    pub async fn user_privileges(&self, username: &str) -> SlskResult<bool> {
        self.connection
            .write(&UserPrivilegesRequest { username: username.to_string() }.to_bytes())
            .await?;
        let resp: UserPrivilegesResponse = self
            .waiter
            .wait(
                WaitKey::for_user(server::USER_PRIVILEGES, username.to_string()),
                REQUEST_TIMEOUT,
                None,
            )
            .await?;
        Ok(resp.privileged)
    }

    pub async fn check_privileges(&self) -> SlskResult<u32> {
        let empty = MessageBuilder::new().finish(CodeWidth::Wide, server::CHECK_PRIVILEGES);
        self.connection.write(&empty).await?;
        let resp: CheckPrivilegesResponse = self
            .waiter
            .wait(WaitKey::for_code(server::CHECK_PRIVILEGES), REQUEST_TIMEOUT, None)
            .await?;
        Ok(resp.seconds_left)
    }

    pub async fn request_room_list(&self) -> SlskResult<RoomListResponse> {
        let empty = MessageBuilder::new().finish(CodeWidth::Wide, server::ROOM_LIST);
        self.connection.write(&empty).await?;
        self.waiter
            .wait(WaitKey::for_code(server::ROOM_LIST), REQUEST_TIMEOUT, None)
            .await
    }

    pub async fn request_privileged_users(&self) -> SlskResult<PrivilegedUsersResponse> {
        let empty = MessageBuilder::new().finish(CodeWidth::Wide, server::PRIVILEGED_USERS);
        self.connection.write(&empty).await?;
        self.waiter
            .wait(WaitKey::for_code(server::PRIVILEGED_USERS), REQUEST_TIMEOUT, None)
            .await
    }

    pub async fn say_in_chat_room(&self, room: &str, message: &str) -> SlskResult<()> {
        let request = SayInChatRoom {
            room: room.to_string(),
            username: self.self_username.clone(),
            message: message.to_string(),
        };
        self.connection.write(&request.to_bytes()).await
    }

    pub async fn private_message(&self, username: &str, message: &str) -> SlskResult<()> {
        let request = PrivateMessage {
            id: 0,
            timestamp: 0,
            username: username.to_string(),
            message: message.to_string(),
        };
        self.connection.write(&request.to_bytes()).await
    }

    pub async fn set_listen_port(&self, port: u16) -> SlskResult<()> {
        self.connection.write(&SetListenPort { port }.to_bytes()).await
    }

    pub async fn have_no_parents(&self, value: bool) -> SlskResult<()> {
        self.connection.write(&HaveNoParents { value }.to_bytes()).await
    }

    pub async fn set_shared_counts(&self, directory_count: u32, file_count: u32) -> SlskResult<()> {
        self.connection
            .write(&SetSharedCounts { directory_count, file_count }.to_bytes())
            .await
    }

    pub async fn set_online_status(&self, status: UserStatus) -> SlskResult<()> {
        self.connection.write(&SetOnlineStatus { status }.to_bytes()).await
    }

    /// Snapshot of the rooms cache, populated only from `RoomList` pushes.
    pub fn rooms(&self) -> Vec<RoomEntry> {
        self.rooms
            .iter()
            .map(|entry| RoomEntry {
                name: entry.key().clone(),
                user_count: *entry.value(),
            })
            .collect()
    }

    pub fn user_status(&self, username: &str) -> Option<UserStatus> {
        self.user_status.get(username).map(|entry| *entry.value())
    }

    pub fn user_stats(&self, username: &str) -> Option<UserStats> {
        self.user_stats.get(username).map(|entry| *entry.value())
    }
}

#[async_trait]
impl ServerLink for ServerHandler {
    async fn peer_address(&self, username: &str) -> SlskResult<(Ipv4Addr, u16)> {
        self.connection
            .write(&GetPeerAddressRequest { username: username.to_string() }.to_bytes())
            .await?;
        let resp: GetPeerAddressResponse = self
            .waiter
            .wait(
                WaitKey::for_user(server::GET_PEER_ADDRESS, username.to_string()),
                REQUEST_TIMEOUT,
                None,
            )
            .await?;
        Ok((resp.ip, resp.port))
    }

    async fn request_indirect_connection(
        &self,
        token: u32,
        username: &str,
        connection_type: PeerConnectionType,
    ) -> SlskResult<()> {
        let request = ConnectToPeer {
            username: username.to_string(),
            connection_type,
            ip: Ipv4Addr::UNSPECIFIED,
            port: self.listen_port,
            token,
            privileged: false,
        };
        self.connection.write(&request.to_bytes()).await
    }
}

#[async_trait]
impl SearchServerLink for ServerHandler {
    async fn file_search(&self, token: u32, query: &str) -> SlskResult<()> {
        let request = FileSearch {
            username: self.self_username.clone(),
            token,
            query: query.to_string(),
        };
        self.connection.write(&request.to_bytes()).await
    }

    async fn room_search(&self, room: &str, token: u32, query: &str) -> SlskResult<()> {
        let request = RoomSearch {
            room: room.to_string(),
            token,
            query: query.to_string(),
        };
        self.connection.write(&request.to_bytes()).await
    }

    async fn user_search(&self, username: &str, token: u32, query: &str) -> SlskResult<()> {
        let request = UserSearch {
            username: username.to_string(),
            token,
            query: query.to_string(),
        };
        self.connection.write(&request.to_bytes()).await
    }

    async fn wishlist_search(&self, token: u32, query: &str) -> SlskResult<()> {
        let request = WishlistSearch {
            token,
            query: query.to_string(),
        };
        self.connection.write(&request.to_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_stats_defaults_are_zero() {
        let stats = UserStats::default();
        assert_eq!(stats.average_speed, 0);
        assert_eq!(stats.upload_count, 0);
    }
}
