//! Client configuration
//!
//! Mirrors the configuration options enumerated for the external interface:
//! per-channel connection options, concurrency caps, and the host-supplied
//! search response resolver. A plain struct of sub-structs plus a fluent
//! builder.

use std::sync::Arc;
use std::time::Duration;

use crate::messages::common::{Directory, FileEntry};
use crate::messages::peer::{InfoResponse, SearchResponse};

/// Minimum diagnostic level a host wants surfaced through the [`DiagnosticSink`](crate::events::DiagnosticSink).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DiagnosticLevel {
    None,
    Warning,
    #[default]
    Info,
    Debug,
}

/// Per-channel connection tuning, reused for the server, peer, transfer, and
/// distributed connection kinds.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    /// Negative (represented here as `None`) disables the inactivity timer.
    pub inactivity_timeout: Option<Duration>,
    pub read_buffer_bytes: usize,
    pub write_buffer_bytes: usize,
    pub keepalive_idle: Duration,
    pub keepalive_interval: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            inactivity_timeout: Some(Duration::from_secs(15 * 60)),
            read_buffer_bytes: 16 * 1024,
            write_buffer_bytes: 16 * 1024,
            keepalive_idle: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

/// A host-supplied resolver invoked when the server relays a `FileSearch` we
/// might be able to answer from our own shared files.
pub type SearchResponseResolver =
    std::sync::Arc<dyn Fn(&str, u32, &str) -> Option<SearchResponse> + Send + Sync>;

/// A host-supplied resolver invoked when a peer sends us a `BrowseRequest`.
/// Returns the full share listing to report back.
pub type BrowseResolver = Arc<dyn Fn() -> Vec<Directory> + Send + Sync>;

/// A host-supplied resolver invoked when a peer sends us an `InfoRequest`.
pub type InfoResolver = Arc<dyn Fn() -> InfoResponse + Send + Sync>;

/// A host-supplied resolver invoked when a peer asks for the contents of one
/// of our shared folders. `None` means the folder isn't ours to report.
pub type FolderContentsResolver = Arc<dyn Fn(&str) -> Option<Vec<FileEntry>> + Send + Sync>;

/// Top-level client configuration.
#[derive(Clone)]
pub struct ClientOptions {
    pub minimum_diagnostic_level: DiagnosticLevel,

    pub server_connection_options: ConnectionOptions,
    pub peer_connection_options: ConnectionOptions,
    pub transfer_connection_options: ConnectionOptions,
    pub distributed_connection_options: ConnectionOptions,

    pub concurrent_peer_message_connection_limit: u32,

    pub listen_port: u16,
    pub enable_listener: bool,

    pub auto_acknowledge_private_messages: bool,
    pub auto_acknowledge_privilege_notifications: bool,

    pub accept_distributed_children: bool,
    pub distributed_child_limit: u32,

    /// 0 means unlimited.
    pub upload_speed_limit_bytes_per_s: u32,
    /// 0 means unlimited.
    pub download_speed_limit_bytes_per_s: u32,

    /// Concurrent uploads permitted before new requests queue. Reported to
    /// peers via `InfoResponse::upload_slots`.
    pub upload_slot_limit: u32,

    pub search_response_resolver: Option<SearchResponseResolver>,
    pub browse_resolver: Option<BrowseResolver>,
    pub info_resolver: Option<InfoResolver>,
    pub folder_contents_resolver: Option<FolderContentsResolver>,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("minimum_diagnostic_level", &self.minimum_diagnostic_level)
            .field(
                "server_connection_options",
                &self.server_connection_options,
            )
            .field("peer_connection_options", &self.peer_connection_options)
            .field(
                "transfer_connection_options",
                &self.transfer_connection_options,
            )
            .field(
                "distributed_connection_options",
                &self.distributed_connection_options,
            )
            .field(
                "concurrent_peer_message_connection_limit",
                &self.concurrent_peer_message_connection_limit,
            )
            .field("listen_port", &self.listen_port)
            .field("enable_listener", &self.enable_listener)
            .field(
                "auto_acknowledge_private_messages",
                &self.auto_acknowledge_private_messages,
            )
            .field(
                "auto_acknowledge_privilege_notifications",
                &self.auto_acknowledge_privilege_notifications,
            )
            .field(
                "accept_distributed_children",
                &self.accept_distributed_children,
            )
            .field("distributed_child_limit", &self.distributed_child_limit)
            .field(
                "upload_speed_limit_bytes_per_s",
                &self.upload_speed_limit_bytes_per_s,
            )
            .field(
                "download_speed_limit_bytes_per_s",
                &self.download_speed_limit_bytes_per_s,
            )
            .field(
                "search_response_resolver",
                &self.search_response_resolver.is_some(),
            )
            .field("browse_resolver", &self.browse_resolver.is_some())
            .field("info_resolver", &self.info_resolver.is_some())
            .field(
                "folder_contents_resolver",
                &self.folder_contents_resolver.is_some(),
            )
            .finish()
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            minimum_diagnostic_level: DiagnosticLevel::default(),
            server_connection_options: ConnectionOptions::default(),
            peer_connection_options: ConnectionOptions::default(),
            transfer_connection_options: ConnectionOptions {
                inactivity_timeout: Some(Duration::from_secs(15)),
                ..ConnectionOptions::default()
            },
            distributed_connection_options: ConnectionOptions::default(),
            concurrent_peer_message_connection_limit: 500,
            listen_port: 2234,
            enable_listener: true,
            auto_acknowledge_private_messages: true,
            auto_acknowledge_privilege_notifications: true,
            accept_distributed_children: true,
            distributed_child_limit: 25,
            upload_speed_limit_bytes_per_s: 0,
            download_speed_limit_bytes_per_s: 0,
            upload_slot_limit: 2,
            search_response_resolver: None,
            browse_resolver: None,
            info_resolver: None,
            folder_contents_resolver: None,
        }
    }
}

/// Fluent builder over [`ClientOptions`].
#[derive(Default)]
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn minimum_diagnostic_level(mut self, level: DiagnosticLevel) -> Self {
        self.options.minimum_diagnostic_level = level;
        self
    }

    pub fn server_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options.server_connection_options = options;
        self
    }

    pub fn peer_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options.peer_connection_options = options;
        self
    }

    pub fn transfer_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options.transfer_connection_options = options;
        self
    }

    pub fn distributed_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options.distributed_connection_options = options;
        self
    }

    pub fn concurrent_peer_message_connection_limit(mut self, limit: u32) -> Self {
        self.options.concurrent_peer_message_connection_limit = limit;
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.options.listen_port = port;
        self
    }

    pub fn enable_listener(mut self, enable: bool) -> Self {
        self.options.enable_listener = enable;
        self
    }

    pub fn auto_acknowledge_private_messages(mut self, enable: bool) -> Self {
        self.options.auto_acknowledge_private_messages = enable;
        self
    }

    pub fn auto_acknowledge_privilege_notifications(mut self, enable: bool) -> Self {
        self.options.auto_acknowledge_privilege_notifications = enable;
        self
    }

    pub fn accept_distributed_children(mut self, enable: bool) -> Self {
        self.options.accept_distributed_children = enable;
        self
    }

    pub fn distributed_child_limit(mut self, limit: u32) -> Self {
        self.options.distributed_child_limit = limit;
        self
    }

    pub fn upload_speed_limit_bytes_per_s(mut self, limit: u32) -> Self {
        self.options.upload_speed_limit_bytes_per_s = limit;
        self
    }

    pub fn download_speed_limit_bytes_per_s(mut self, limit: u32) -> Self {
        self.options.download_speed_limit_bytes_per_s = limit;
        self
    }

    pub fn upload_slot_limit(mut self, limit: u32) -> Self {
        self.options.upload_slot_limit = limit;
        self
    }

    pub fn search_response_resolver(mut self, resolver: SearchResponseResolver) -> Self {
        self.options.search_response_resolver = Some(resolver);
        self
    }

    pub fn browse_resolver(mut self, resolver: BrowseResolver) -> Self {
        self.options.browse_resolver = Some(resolver);
        self
    }

    pub fn info_resolver(mut self, resolver: InfoResolver) -> Self {
        self.options.info_resolver = Some(resolver);
        self
    }

    pub fn folder_contents_resolver(mut self, resolver: FolderContentsResolver) -> Self {
        self.options.folder_contents_resolver = Some(resolver);
        self
    }

    /// Build the final configuration. There's nothing here that can be
    /// invalid at this layer — ports and limits are all valid `u16`/`u32`
    /// ranges by construction — so this never fails.
    pub fn build(self) -> ClientOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let options = ClientOptionsBuilder::new()
            .listen_port(12345)
            .upload_speed_limit_bytes_per_s(1024)
            .distributed_child_limit(5)
            .build();

        assert_eq!(options.listen_port, 12345);
        assert_eq!(options.upload_speed_limit_bytes_per_s, 1024);
        assert_eq!(options.distributed_child_limit, 5);
        assert_eq!(options.concurrent_peer_message_connection_limit, 500);
    }

    #[test]
    fn defaults_match_documented_values() {
        let options = ClientOptions::default();
        assert_eq!(options.listen_port, 2234);
        assert!(options.enable_listener);
        assert_eq!(options.upload_speed_limit_bytes_per_s, 0);
    }
}
