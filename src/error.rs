//! Unified error handling
//!
//! A single `thiserror`-derived enum covering the taxonomy from the error
//! handling design: protocol errors, connection lifecycle, transfer
//! failures, authentication, cancellation, and misconfiguration. Struct-like
//! variants carry context, a `category()` accessor, and an `is_retryable()`
//! predicate the connection-establishment and transfer code use to decide
//! whether a failure is worth surfacing differently to the host.

use std::io;

use thiserror::Error;

/// Why a connection ended.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    #[error("requested by caller")]
    Requested,
    #[error("timed out due to inactivity")]
    TimedOut,
    #[error("remote endpoint closed the connection")]
    RemoteClosed,
    #[error("lost the direct/indirect connection race")]
    AbandonedAfterRace,
    #[error("the underlying transport reported an error: {0}")]
    TransportError(String),
}

/// Narrower detail for transfer-specific failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferErrorKind {
    #[error("connection closed before the expected number of bytes arrived")]
    IncompleteData,
    #[error("remote peer rejected the transfer: {0}")]
    RemoteRejected(String),
    #[error("remote peer reported QueueFailed: {0}")]
    QueueFailed(String),
    #[error("peer did not respond to the transfer negotiation in time")]
    PeerNotResponding,
}

/// Narrower detail for authentication failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthErrorKind {
    #[error("server refused the login: {0}")]
    LoginRefused(String),
    #[error("kicked from the server")]
    Kicked,
}

/// The unified error type for all SoulSeek client operations.
#[derive(Error, Debug)]
pub enum SlskError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message code mismatch: expected {expected}, found {found}")]
    UnexpectedMessageCode { expected: u32, found: u32 },

    #[error("zlib (de)compression failed: {0}")]
    MessageCompression(String),

    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: DisconnectReason },

    #[error("connection attempt timed out")]
    ConnectionTimeout,

    #[error("operation timed out waiting for a response")]
    OperationTimedOut,

    #[error("transfer error: {kind}")]
    Transfer { kind: TransferErrorKind },

    #[error("authentication error: {kind}")]
    Auth { kind: AuthErrorKind },

    #[error("operation canceled")]
    OperationCanceled,

    #[error("argument out of range: {0}")]
    ArgumentOutOfRange(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias used throughout the crate.
pub type SlskResult<T> = Result<T, SlskError>;

/// Broad error grouping, used by diagnostics and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Protocol,
    Connection,
    Transfer,
    Auth,
    Cancellation,
    Configuration,
}

impl SlskError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SlskError::Protocol(_)
            | SlskError::UnexpectedMessageCode { .. }
            | SlskError::MessageCompression(_) => ErrorCategory::Protocol,

            SlskError::ConnectionClosed { .. }
            | SlskError::ConnectionTimeout
            | SlskError::OperationTimedOut => ErrorCategory::Connection,

            SlskError::Transfer { .. } => ErrorCategory::Transfer,
            SlskError::Auth { .. } => ErrorCategory::Auth,
            SlskError::OperationCanceled => ErrorCategory::Cancellation,
            SlskError::ArgumentOutOfRange(_) => ErrorCategory::Configuration,
            SlskError::Io(_) => ErrorCategory::Connection,
        }
    }

    /// Whether retrying the same operation might succeed. Connection
    /// timeouts and remote-closed connections are retryable; protocol
    /// desyncs, auth rejections, and misconfiguration are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SlskError::ConnectionTimeout | SlskError::OperationTimedOut => true,
            SlskError::ConnectionClosed { reason } => matches!(
                reason,
                DisconnectReason::TimedOut | DisconnectReason::RemoteClosed
            ),
            SlskError::Transfer {
                kind: TransferErrorKind::PeerNotResponding,
            } => true,
            SlskError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_errors() {
        assert_eq!(
            SlskError::Protocol("bad frame".into()).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            SlskError::ConnectionTimeout.category(),
            ErrorCategory::Connection
        );
        assert_eq!(
            SlskError::Auth {
                kind: AuthErrorKind::Kicked
            }
            .category(),
            ErrorCategory::Auth
        );
    }

    #[test]
    fn retryability_matches_reason() {
        assert!(SlskError::ConnectionTimeout.is_retryable());
        assert!(SlskError::ConnectionClosed {
            reason: DisconnectReason::TimedOut
        }
        .is_retryable());
        assert!(!SlskError::ConnectionClosed {
            reason: DisconnectReason::AbandonedAfterRace
        }
        .is_retryable());
        assert!(!SlskError::OperationCanceled.is_retryable());
    }
}
