//! Server-channel message catalog (wide, 4-byte codes).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::codec::{CodeWidth, MessageBuilder, MessageFrame, MessageReader};
use crate::error::{SlskError, SlskResult};
use crate::messages::common::{PeerConnectionType, RoomEntry, UserStatus};

/// A server-channel message: fixed `CODE`, payload encode/decode, and
/// default `to_bytes`/`from_frame` built on top of them, keeping the
/// serialize/deserialize split explicit and generalized to bit-exact binary.
pub trait ServerPayload: Sized {
    const CODE: u32;

    fn encode_payload(&self, builder: &mut MessageBuilder);
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self>;

    fn to_bytes(&self) -> Bytes {
        let mut builder = MessageBuilder::new();
        self.encode_payload(&mut builder);
        builder.finish(CodeWidth::Wide, Self::CODE)
    }

    fn from_frame(frame: &MessageFrame) -> SlskResult<Self> {
        if frame.code != Self::CODE {
            return Err(SlskError::UnexpectedMessageCode {
                expected: Self::CODE,
                found: frame.code,
            });
        }
        let mut reader = MessageReader::new(frame.payload.clone());
        Self::decode_payload(&mut reader)
    }
}

macro_rules! server_codes {
    ($($name:ident = $code:expr),* $(,)?) => {
        $(pub const $name: u32 = $code;)*
    };
}

server_codes! {
    LOGIN = 1,
    SET_LISTEN_PORT = 2,
    GET_PEER_ADDRESS = 3,
    ADD_USER = 5,
    GET_STATUS = 7,
    SAY_IN_CHAT_ROOM = 13,
    JOIN_ROOM = 14,
    LEAVE_ROOM = 15,
    USER_JOINED_ROOM = 16,
    USER_LEFT_ROOM = 17,
    CONNECT_TO_PEER = 18,
    PRIVATE_MESSAGE = 22,
    ACKNOWLEDGE_PRIVATE_MESSAGE = 23,
    FILE_SEARCH = 26,
    SET_ONLINE_STATUS = 28,
    PING = 32,
    SET_SHARED_COUNTS = 35,
    GET_USER_STATS = 36,
    KICKED_FROM_SERVER = 41,
    USER_PRIVILEGES = 42,
    GIVE_PRIVILEGES = 43,
    NOTIFY_PRIVILEGES = 44,
    ACKNOWLEDGE_PRIVILEGE_NOTIFICATION = 45,
    HAVE_NO_PARENTS = 71,
    NET_INFO = 102,
    WISHLIST_SEARCH = 103,
    WISHLIST_INTERVAL = 104,
    ROOM_LIST = 64,
    PRIVILEGED_USERS = 69,
    CHECK_PRIVILEGES = 92,
    SEARCH_REQUEST = 93,
    ROOM_SEARCH = 120,
    USER_SEARCH = 121,
    NEW_PASSWORD = 142,
    PARENT_MIN_SPEED = 83,
    PARENT_SPEED_RATIO = 84,
}

/// `Login(username, password, version, hash, minor)` request.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub version: u32,
    pub hash: String,
    pub minor_version: u32,
}

impl LoginRequest {
    /// Build a request, deriving `hash` as the lowercase MD5 hex digest of
    /// `username+password`, per the login handshake's wire format.
    pub fn new(username: impl Into<String>, password: impl Into<String>, version: u32, minor_version: u32) -> Self {
        let username = username.into();
        let password = password.into();
        let digest = md5::compute(format!("{username}{password}"));
        Self {
            hash: format!("{digest:x}"),
            username,
            password,
            version,
            minor_version,
        }
    }
}

impl ServerPayload for LoginRequest {
    const CODE: u32 = LOGIN;

    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.username)
            .write_string(&self.password)
            .write_u32(self.version)
            .write_string(&self.hash)
            .write_u32(self.minor_version);
    }

    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
            password: reader.read_string()?,
            version: reader.read_u32()?,
            hash: reader.read_string()?,
            minor_version: reader.read_u32()?,
        })
    }
}

/// `Login` response: success carries a greeting and our externally visible
/// IP; failure carries a reason.
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub success: bool,
    pub message: String,
    pub ip: Option<Ipv4Addr>,
}

impl ServerPayload for LoginResponse {
    const CODE: u32 = LOGIN;

    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_bool(self.success).write_string(&self.message);
        if let Some(ip) = self.ip {
            builder.write_ipv4(ip);
        }
    }

    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        let success = reader.read_bool()?;
        let message = reader.read_string()?;
        let ip = if success && reader.remaining() >= 4 {
            Some(reader.read_ipv4()?)
        } else {
            None
        };
        Ok(Self { success, message, ip })
    }
}

/// Both directions of `Ping` carry no payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

impl ServerPayload for Ping {
    const CODE: u32 = PING;
    fn encode_payload(&self, _builder: &mut MessageBuilder) {}
    fn decode_payload(_reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Ping)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CheckPrivilegesResponse {
    pub seconds_left: u32,
}

impl ServerPayload for CheckPrivilegesResponse {
    const CODE: u32 = CHECK_PRIVILEGES;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.seconds_left);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            seconds_left: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParentMinSpeed {
    pub kilobytes_per_second: u32,
}

impl ServerPayload for ParentMinSpeed {
    const CODE: u32 = PARENT_MIN_SPEED;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.kilobytes_per_second);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            kilobytes_per_second: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParentSpeedRatio {
    pub ratio: u32,
}

impl ServerPayload for ParentSpeedRatio {
    const CODE: u32 = PARENT_SPEED_RATIO;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.ratio);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            ratio: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WishlistInterval {
    pub interval_seconds: u32,
}

impl ServerPayload for WishlistInterval {
    const CODE: u32 = WISHLIST_INTERVAL;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.interval_seconds);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            interval_seconds: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewPassword {
    pub password: String,
}

impl ServerPayload for NewPassword {
    const CODE: u32 = NEW_PASSWORD;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.password);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            password: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomEntry>,
}

impl ServerPayload for RoomListResponse {
    const CODE: u32 = ROOM_LIST;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.rooms.len() as u32);
        for room in &self.rooms {
            builder.write_string(&room.name);
        }
        builder.write_u32(self.rooms.len() as u32);
        for room in &self.rooms {
            builder.write_u32(room.user_count);
        }
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        let count = reader.read_u32()? as usize;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(reader.read_string()?);
        }
        let count2 = reader.read_u32()? as usize;
        let mut rooms = Vec::with_capacity(names.len());
        for (i, name) in names.into_iter().enumerate() {
            let user_count = if i < count2 { reader.read_u32()? } else { 0 };
            rooms.push(RoomEntry { name, user_count });
        }
        // Unknown trailing groups (moderated room lists, owned-room lists)
        // are skipped rather than rejected.
        let _trailing = reader.read_remaining();
        Ok(Self { rooms })
    }
}

#[derive(Debug, Clone)]
pub struct PrivilegedUsersResponse {
    pub usernames: Vec<String>,
}

impl ServerPayload for PrivilegedUsersResponse {
    const CODE: u32 = PRIVILEGED_USERS;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.usernames.len() as u32);
        for name in &self.usernames {
            builder.write_string(name);
        }
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        let count = reader.read_u32()? as usize;
        let mut usernames = Vec::with_capacity(count);
        for _ in 0..count {
            usernames.push(reader.read_string()?);
        }
        Ok(Self { usernames })
    }
}

#[derive(Debug, Clone)]
pub struct JoinRoomRequest {
    pub room: String,
}

impl ServerPayload for JoinRoomRequest {
    const CODE: u32 = JOIN_ROOM;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.room);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            room: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct JoinRoomResponse {
    pub room: String,
    pub users: Vec<String>,
}

impl ServerPayload for JoinRoomResponse {
    const CODE: u32 = JOIN_ROOM;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.room);
        builder.write_u32(self.users.len() as u32);
        for user in &self.users {
            builder.write_string(user);
        }
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        let room = reader.read_string()?;
        let count = reader.read_u32()? as usize;
        let mut users = Vec::with_capacity(count);
        for _ in 0..count {
            users.push(reader.read_string()?);
        }
        Ok(Self { room, users })
    }
}

#[derive(Debug, Clone)]
pub struct LeaveRoom {
    pub room: String,
}

impl ServerPayload for LeaveRoom {
    const CODE: u32 = LEAVE_ROOM;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.room);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            room: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GetPeerAddressRequest {
    pub username: String,
}

impl ServerPayload for GetPeerAddressRequest {
    const CODE: u32 = GET_PEER_ADDRESS;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.username);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GetPeerAddressResponse {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl ServerPayload for GetPeerAddressResponse {
    const CODE: u32 = GET_PEER_ADDRESS;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.username);
        builder.write_ipv4(self.ip);
        builder.write_u32(self.port as u32);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
            ip: reader.read_ipv4()?,
            port: reader.read_u32()? as u16,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AddUserRequest {
    pub username: String,
}

impl ServerPayload for AddUserRequest {
    const CODE: u32 = ADD_USER;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.username);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AddUserResponse {
    pub username: String,
    pub exists: bool,
    pub status: UserStatus,
}

impl ServerPayload for AddUserResponse {
    const CODE: u32 = ADD_USER;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.username)
            .write_bool(self.exists)
            .write_u32(self.status.to_code());
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
            exists: reader.read_bool()?,
            status: UserStatus::from_code(reader.read_u32()?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GetStatusRequest {
    pub username: String,
}

impl ServerPayload for GetStatusRequest {
    const CODE: u32 = GET_STATUS;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.username);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GetStatusResponse {
    pub username: String,
    pub status: UserStatus,
    pub privileged: bool,
}

impl ServerPayload for GetStatusResponse {
    const CODE: u32 = GET_STATUS;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.username)
            .write_u32(self.status.to_code())
            .write_bool(self.privileged);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
            status: UserStatus::from_code(reader.read_u32()?),
            privileged: reader.read_bool()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GetUserStatsRequest {
    pub username: String,
}

impl ServerPayload for GetUserStatsRequest {
    const CODE: u32 = GET_USER_STATS;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.username);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GetUserStatsResponse {
    pub username: String,
    pub average_speed: u32,
    pub upload_count: u64,
    pub shared_files: u32,
    pub shared_folders: u32,
}

impl ServerPayload for GetUserStatsResponse {
    const CODE: u32 = GET_USER_STATS;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.username)
            .write_u32(self.average_speed)
            .write_u64(self.upload_count)
            .write_u32(self.shared_files)
            .write_u32(self.shared_folders);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
            average_speed: reader.read_u32()?,
            upload_count: reader.read_u64()?,
            shared_files: reader.read_u32()?,
            shared_folders: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UserPrivilegesRequest {
    pub username: String,
}

impl ServerPayload for UserPrivilegesRequest {
    const CODE: u32 = USER_PRIVILEGES;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.username);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UserPrivilegesResponse {
    pub username: String,
    pub privileged: bool,
}

impl ServerPayload for UserPrivilegesResponse {
    const CODE: u32 = USER_PRIVILEGES;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.username).write_bool(self.privileged);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
            privileged: reader.read_bool()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PrivateMessage {
    pub id: u32,
    pub timestamp: u32,
    pub username: String,
    pub message: String,
}

impl ServerPayload for PrivateMessage {
    const CODE: u32 = PRIVATE_MESSAGE;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_u32(self.id)
            .write_u32(self.timestamp)
            .write_string(&self.username)
            .write_string(&self.message);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            id: reader.read_u32()?,
            timestamp: reader.read_u32()?,
            username: reader.read_string()?,
            message: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcknowledgePrivateMessage {
    pub id: u32,
}

impl ServerPayload for AcknowledgePrivateMessage {
    const CODE: u32 = ACKNOWLEDGE_PRIVATE_MESSAGE;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.id);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self { id: reader.read_u32()? })
    }
}

#[derive(Debug, Clone)]
pub struct NotifyPrivileges {
    pub id: u32,
    pub username: String,
}

impl ServerPayload for NotifyPrivileges {
    const CODE: u32 = NOTIFY_PRIVILEGES;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.id).write_string(&self.username);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            id: reader.read_u32()?,
            username: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcknowledgePrivilegeNotification {
    pub id: u32,
}

impl ServerPayload for AcknowledgePrivilegeNotification {
    const CODE: u32 = ACKNOWLEDGE_PRIVILEGE_NOTIFICATION;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.id);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self { id: reader.read_u32()? })
    }
}

/// One candidate parent advertised by the server for the distributed tree.
#[derive(Debug, Clone)]
pub struct NetInfoEntry {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct NetInfo {
    pub parents: Vec<NetInfoEntry>,
}

impl ServerPayload for NetInfo {
    const CODE: u32 = NET_INFO;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.parents.len() as u32);
        for entry in &self.parents {
            builder
                .write_string(&entry.username)
                .write_ipv4(entry.ip)
                .write_u32(entry.port as u32);
        }
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        let count = reader.read_u32()? as usize;
        let mut parents = Vec::with_capacity(count);
        for _ in 0..count {
            parents.push(NetInfoEntry {
                username: reader.read_string()?,
                ip: reader.read_ipv4()?,
                port: reader.read_u32()? as u16,
            });
        }
        Ok(Self { parents })
    }
}

/// `ConnectToPeer`: sent by us to request an indirect connection, and
/// relayed to us by the server when another peer made the same request.
#[derive(Debug, Clone)]
pub struct ConnectToPeer {
    pub username: String,
    pub connection_type: PeerConnectionType,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub token: u32,
    pub privileged: bool,
}

impl ServerPayload for ConnectToPeer {
    const CODE: u32 = CONNECT_TO_PEER;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.username)
            .write_string(self.connection_type.as_str())
            .write_ipv4(self.ip)
            .write_u32(self.port as u32)
            .write_u32(self.token)
            .write_bool(self.privileged);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        let username = reader.read_string()?;
        let type_str = reader.read_string()?;
        let connection_type = PeerConnectionType::parse(&type_str)
            .ok_or_else(|| SlskError::Protocol(format!("unknown connection type {type_str}")))?;
        Ok(Self {
            username,
            connection_type,
            ip: reader.read_ipv4()?,
            port: reader.read_u32()? as u16,
            token: reader.read_u32()?,
            privileged: reader.read_bool()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SayInChatRoom {
    pub room: String,
    pub username: String,
    pub message: String,
}

impl ServerPayload for SayInChatRoom {
    const CODE: u32 = SAY_IN_CHAT_ROOM;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.room)
            .write_string(&self.username)
            .write_string(&self.message);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            room: reader.read_string()?,
            username: reader.read_string()?,
            message: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UserJoinedRoom {
    pub room: String,
    pub username: String,
    pub status: UserStatus,
}

impl ServerPayload for UserJoinedRoom {
    const CODE: u32 = USER_JOINED_ROOM;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.room)
            .write_string(&self.username)
            .write_u32(self.status.to_code());
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            room: reader.read_string()?,
            username: reader.read_string()?,
            status: UserStatus::from_code(reader.read_u32()?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct UserLeftRoom {
    pub room: String,
    pub username: String,
}

impl ServerPayload for UserLeftRoom {
    const CODE: u32 = USER_LEFT_ROOM;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_string(&self.room).write_string(&self.username);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            room: reader.read_string()?,
            username: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KickedFromServer;

impl ServerPayload for KickedFromServer {
    const CODE: u32 = KICKED_FROM_SERVER;
    fn encode_payload(&self, _builder: &mut MessageBuilder) {}
    fn decode_payload(_reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(KickedFromServer)
    }
}

/// A `FileSearch` relayed by the server: someone else's query we might be
/// able to answer from our own shares.
#[derive(Debug, Clone)]
pub struct FileSearch {
    pub username: String,
    pub token: u32,
    pub query: String,
}

impl ServerPayload for FileSearch {
    const CODE: u32 = FILE_SEARCH;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.username)
            .write_u32(self.token)
            .write_string(&self.query);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
            token: reader.read_u32()?,
            query: reader.read_string()?,
        })
    }
}

/// Fallback distributed search request delivered directly on the server
/// channel when parent acquisition has stalled.
#[derive(Debug, Clone)]
pub struct SearchRequestFallback {
    pub username: String,
    pub token: u32,
    pub query: String,
}

impl ServerPayload for SearchRequestFallback {
    const CODE: u32 = SEARCH_REQUEST;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.username)
            .write_u32(self.token)
            .write_string(&self.query);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
            token: reader.read_u32()?,
            query: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SetListenPort {
    pub port: u16,
}

impl ServerPayload for SetListenPort {
    const CODE: u32 = SET_LISTEN_PORT;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.port as u32);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            port: reader.read_u32()? as u16,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HaveNoParents {
    pub value: bool,
}

impl ServerPayload for HaveNoParents {
    const CODE: u32 = HAVE_NO_PARENTS;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_bool(self.value);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            value: reader.read_bool()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SetSharedCounts {
    pub directory_count: u32,
    pub file_count: u32,
}

impl ServerPayload for SetSharedCounts {
    const CODE: u32 = SET_SHARED_COUNTS;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.directory_count).write_u32(self.file_count);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            directory_count: reader.read_u32()?,
            file_count: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SetOnlineStatus {
    pub status: UserStatus,
}

impl ServerPayload for SetOnlineStatus {
    const CODE: u32 = SET_ONLINE_STATUS;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.status.to_code());
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            status: UserStatus::from_code(reader.read_u32()?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WishlistSearch {
    pub token: u32,
    pub query: String,
}

impl ServerPayload for WishlistSearch {
    const CODE: u32 = WISHLIST_SEARCH;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder.write_u32(self.token).write_string(&self.query);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            token: reader.read_u32()?,
            query: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RoomSearch {
    pub room: String,
    pub token: u32,
    pub query: String,
}

impl ServerPayload for RoomSearch {
    const CODE: u32 = ROOM_SEARCH;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.room)
            .write_u32(self.token)
            .write_string(&self.query);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            room: reader.read_string()?,
            token: reader.read_u32()?,
            query: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UserSearch {
    pub username: String,
    pub token: u32,
    pub query: String,
}

impl ServerPayload for UserSearch {
    const CODE: u32 = USER_SEARCH;
    fn encode_payload(&self, builder: &mut MessageBuilder) {
        builder
            .write_string(&self.username)
            .write_u32(self.token)
            .write_string(&self.query);
    }
    fn decode_payload(reader: &mut MessageReader) -> SlskResult<Self> {
        Ok(Self {
            username: reader.read_string()?,
            token: reader.read_u32()?,
            query: reader.read_string()?,
        })
    }
}

/// Decoded, tagged server-channel messages a handler needs to act on —
/// the entries that complete waiters or emit events per the dispatch table.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Login(LoginResponse),
    Ping(Ping),
    CheckPrivileges(CheckPrivilegesResponse),
    ParentMinSpeed(ParentMinSpeed),
    ParentSpeedRatio(ParentSpeedRatio),
    WishlistInterval(WishlistInterval),
    NewPassword(NewPassword),
    RoomList(RoomListResponse),
    PrivilegedUsers(PrivilegedUsersResponse),
    JoinRoom(JoinRoomResponse),
    LeaveRoom(LeaveRoom),
    GetPeerAddress(GetPeerAddressResponse),
    AddUser(AddUserResponse),
    GetStatus(GetStatusResponse),
    GetUserStats(GetUserStatsResponse),
    UserPrivileges(UserPrivilegesResponse),
    PrivateMessage(PrivateMessage),
    NotifyPrivileges(NotifyPrivileges),
    NetInfo(NetInfo),
    ConnectToPeer(ConnectToPeer),
    SayInChatRoom(SayInChatRoom),
    UserJoinedRoom(UserJoinedRoom),
    UserLeftRoom(UserLeftRoom),
    KickedFromServer(KickedFromServer),
    FileSearch(FileSearch),
    SearchRequestFallback(SearchRequestFallback),
}

type ServerDecoder = fn(&MessageFrame) -> SlskResult<ServerMessage>;

/// Explicit dispatch table keyed by code, replacing a reflection-based
/// message mapper: each known server code maps to a decoder that produces a
/// tagged [`ServerMessage`] variant.
static SERVER_DISPATCH: Lazy<HashMap<u32, ServerDecoder>> = Lazy::new(|| {
    let mut table: HashMap<u32, ServerDecoder> = HashMap::new();
    table.insert(LOGIN, |f| LoginResponse::from_frame(f).map(ServerMessage::Login));
    table.insert(PING, |f| Ping::from_frame(f).map(ServerMessage::Ping));
    table.insert(CHECK_PRIVILEGES, |f| {
        CheckPrivilegesResponse::from_frame(f).map(ServerMessage::CheckPrivileges)
    });
    table.insert(PARENT_MIN_SPEED, |f| {
        ParentMinSpeed::from_frame(f).map(ServerMessage::ParentMinSpeed)
    });
    table.insert(PARENT_SPEED_RATIO, |f| {
        ParentSpeedRatio::from_frame(f).map(ServerMessage::ParentSpeedRatio)
    });
    table.insert(WISHLIST_INTERVAL, |f| {
        WishlistInterval::from_frame(f).map(ServerMessage::WishlistInterval)
    });
    table.insert(NEW_PASSWORD, |f| NewPassword::from_frame(f).map(ServerMessage::NewPassword));
    table.insert(ROOM_LIST, |f| RoomListResponse::from_frame(f).map(ServerMessage::RoomList));
    table.insert(PRIVILEGED_USERS, |f| {
        PrivilegedUsersResponse::from_frame(f).map(ServerMessage::PrivilegedUsers)
    });
    table.insert(JOIN_ROOM, |f| JoinRoomResponse::from_frame(f).map(ServerMessage::JoinRoom));
    table.insert(LEAVE_ROOM, |f| LeaveRoom::from_frame(f).map(ServerMessage::LeaveRoom));
    table.insert(GET_PEER_ADDRESS, |f| {
        GetPeerAddressResponse::from_frame(f).map(ServerMessage::GetPeerAddress)
    });
    table.insert(ADD_USER, |f| AddUserResponse::from_frame(f).map(ServerMessage::AddUser));
    table.insert(GET_STATUS, |f| GetStatusResponse::from_frame(f).map(ServerMessage::GetStatus));
    table.insert(GET_USER_STATS, |f| {
        GetUserStatsResponse::from_frame(f).map(ServerMessage::GetUserStats)
    });
    table.insert(USER_PRIVILEGES, |f| {
        UserPrivilegesResponse::from_frame(f).map(ServerMessage::UserPrivileges)
    });
    table.insert(PRIVATE_MESSAGE, |f| {
        PrivateMessage::from_frame(f).map(ServerMessage::PrivateMessage)
    });
    table.insert(NOTIFY_PRIVILEGES, |f| {
        NotifyPrivileges::from_frame(f).map(ServerMessage::NotifyPrivileges)
    });
    table.insert(NET_INFO, |f| NetInfo::from_frame(f).map(ServerMessage::NetInfo));
    table.insert(CONNECT_TO_PEER, |f| {
        ConnectToPeer::from_frame(f).map(ServerMessage::ConnectToPeer)
    });
    table.insert(SAY_IN_CHAT_ROOM, |f| {
        SayInChatRoom::from_frame(f).map(ServerMessage::SayInChatRoom)
    });
    table.insert(USER_JOINED_ROOM, |f| {
        UserJoinedRoom::from_frame(f).map(ServerMessage::UserJoinedRoom)
    });
    table.insert(USER_LEFT_ROOM, |f| {
        UserLeftRoom::from_frame(f).map(ServerMessage::UserLeftRoom)
    });
    table.insert(KICKED_FROM_SERVER, |f| {
        KickedFromServer::from_frame(f).map(ServerMessage::KickedFromServer)
    });
    table.insert(FILE_SEARCH, |f| FileSearch::from_frame(f).map(ServerMessage::FileSearch));
    table.insert(SEARCH_REQUEST, |f| {
        SearchRequestFallback::from_frame(f).map(ServerMessage::SearchRequestFallback)
    });
    table
});

impl ServerMessage {
    /// Decode a server-channel frame via the dispatch table. Unknown codes
    /// return `Ok(None)`; the caller logs a debug diagnostic and drops them.
    pub fn decode(frame: &MessageFrame) -> SlskResult<Option<Self>> {
        match SERVER_DISPATCH.get(&frame.code) {
            Some(decoder) => decoder(frame).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_request_round_trips() {
        let request = LoginRequest::new("alice", "pw", 157, 17);
        assert_eq!(request.hash, format!("{:x}", md5::compute("alicepw")));

        let bytes = request.to_bytes();
        let (frame, consumed) = crate::codec::try_decode_frame(&bytes, CodeWidth::Wide)
            .unwrap()
            .unwrap();
        assert_eq!(consumed, bytes.len());
        let decoded = LoginRequest::from_frame(&frame).unwrap();
        assert_eq!(decoded.username, "alice");
        assert_eq!(decoded.password, "pw");
        assert_eq!(decoded.version, 157);
        assert_eq!(decoded.minor_version, 17);
    }

    #[test]
    fn login_response_round_trips_with_ip() {
        let response = LoginResponse {
            success: true,
            message: "welcome".into(),
            ip: Some(Ipv4Addr::new(1, 2, 3, 4)),
        };
        let bytes = response.to_bytes();
        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Wide)
            .unwrap()
            .unwrap();
        let decoded = LoginResponse::from_frame(&frame).unwrap();
        assert!(decoded.success);
        assert_eq!(decoded.message, "welcome");
        assert_eq!(decoded.ip, Some(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn room_list_skips_unknown_trailing_groups() {
        let mut builder = MessageBuilder::new();
        builder.write_u32(1).write_string("general");
        builder.write_u32(1).write_u32(5);
        // Simulate a legacy trailing group (e.g. moderated room counts)
        // that this implementation does not model.
        builder.write_u32(999);
        let bytes = builder.finish(CodeWidth::Wide, ROOM_LIST);

        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Wide)
            .unwrap()
            .unwrap();
        let decoded = RoomListResponse::from_frame(&frame).unwrap();
        assert_eq!(decoded.rooms, vec![RoomEntry { name: "general".into(), user_count: 5 }]);
    }

    #[test]
    fn dispatch_table_decodes_known_code() {
        let response = Ping;
        let bytes = response.to_bytes();
        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Wide)
            .unwrap()
            .unwrap();
        let decoded = ServerMessage::decode(&frame).unwrap();
        assert!(matches!(decoded, Some(ServerMessage::Ping(_))));
    }

    #[test]
    fn dispatch_table_ignores_unknown_code() {
        let bytes = crate::codec::encode_frame(CodeWidth::Wide, 999_999, b"");
        let (frame, _) = crate::codec::try_decode_frame(&bytes, CodeWidth::Wide)
            .unwrap()
            .unwrap();
        assert!(ServerMessage::decode(&frame).unwrap().is_none());
    }
}
