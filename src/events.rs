//! Tagged-variant events emitted to the host application.
//!
//! Replaces the class-inheritance event-args style with a single enum
//! carrying the fields each kind needs; handlers subscribe per kind by
//! matching. Delivered two ways: a `tokio::sync::broadcast` channel for
//! consumers who want a `Stream`, and a synchronous [`DiagnosticSink`]
//! trait for hosts that want a plain callback without holding a receiver.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::config::DiagnosticLevel;
use crate::error::DisconnectReason;
use crate::messages::{FileEntry, UserStatus};
use crate::search::{SearchCompletionReason, SearchResultEntry};
use crate::transfer::{TransferDirection as EventTransferDirection, TransferState};

/// Which logical connection a connection-state-changed event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Server,
    Peer,
    Distributed,
    Transfer,
}

/// A single connection's observed state, mirroring the raw connection's
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// One emitted occurrence. Every arm is a struct-like variant so no event
/// needs to downcast or inspect a parallel "kind" tag.
#[derive(Debug, Clone)]
pub enum Event {
    ConnectionStateChanged {
        kind: ConnectionKind,
        peer: Option<String>,
        state: ConnectionState,
        reason: Option<DisconnectReason>,
    },
    Diagnostic {
        level: DiagnosticLevel,
        message: String,
    },
    PrivateMessageReceived {
        id: u32,
        username: String,
        message: String,
    },
    RoomMessageReceived {
        room: String,
        username: String,
        message: String,
    },
    RoomJoined {
        room: String,
        username: String,
        status: UserStatus,
    },
    RoomLeft {
        room: String,
        username: String,
    },
    UserStatusChanged {
        username: String,
        status: UserStatus,
    },
    UserStatsChanged {
        username: String,
        average_speed: u32,
        shared_files: u32,
        shared_folders: u32,
    },
    PrivilegedUserListReceived {
        usernames: Vec<String>,
    },
    PrivilegeNotificationReceived {
        id: u32,
        username: String,
    },
    KickedFromServer,
    SearchResponseReceived {
        token: u32,
        username: String,
        files: Vec<FileEntry>,
        free_upload_slots: u8,
        upload_speed: u32,
    },
    SearchStateChanged {
        token: u32,
        reason: Option<SearchCompletionReason>,
        result_count: usize,
    },
    TransferStateChanged {
        direction: EventTransferDirection,
        username: String,
        token: u32,
        state: TransferState,
    },
    TransferProgressUpdated {
        direction: EventTransferDirection,
        username: String,
        token: u32,
        bytes_transferred: u64,
        size: Option<u64>,
    },
    BrowseProgressUpdated {
        username: String,
        directories_received: usize,
    },
    /// A peer sent `QueueDownload` for one of our shared files. Nothing in
    /// the runtime auto-admits this — the host decides whether and when to
    /// call [`crate::client::Client::upload`] in response.
    UploadRequested {
        username: String,
        filename: String,
    },
}

// `SearchResultEntry` isn't referenced directly above (files are inlined),
// but re-exported here so handlers building `SearchResponseReceived` don't
// need a second import path.
pub use crate::search::SearchResultEntry as _SearchResultEntryReexport;

/// A dependency-injected sink for diagnostics and events, passed through
/// construction rather than reached via a global singleton — the
/// replacement for a process-wide diagnostic singleton.
#[async_trait]
pub trait DiagnosticSink: Send + Sync {
    async fn on_event(&self, event: Event);
}

/// Default sink: every event becomes a `tracing` record at a level derived
/// from the event kind (connection lifecycle at `info`, per-message detail
/// at `debug`, recoverable failures at `warn`).
pub struct TracingDiagnosticSink;

#[async_trait]
impl DiagnosticSink for TracingDiagnosticSink {
    async fn on_event(&self, event: Event) {
        match &event {
            Event::ConnectionStateChanged { .. } | Event::KickedFromServer => {
                tracing::info!(?event, "connection state changed");
            }
            Event::Diagnostic { level, message } => match level {
                DiagnosticLevel::Debug => tracing::debug!("{message}"),
                DiagnosticLevel::Info => tracing::info!("{message}"),
                DiagnosticLevel::Warning => tracing::warn!("{message}"),
                DiagnosticLevel::None => {}
            },
            Event::TransferStateChanged { .. } | Event::SearchStateChanged { .. } => {
                tracing::info!(?event, "state changed");
            }
            _ => tracing::debug!(?event, "event"),
        }
    }
}
