//! Transfer engine: the download and upload state machines, the
//! shared 8-byte start-offset handshake, and the dependency bundle both
//! machines need to reach peers, wait on negotiation replies, and meter
//! bytes through the two global token buckets.

pub mod download;
pub mod upload;

use std::sync::Arc;

pub use crate::messages::common::TransferDirection;
use crate::collaborators::RandomTokenGenerator;
use crate::events::DiagnosticSink;
use crate::peer_manager::PeerManager;
use crate::token_bucket::TokenBucket;
use crate::waiter::Waiter;

pub use download::Download;
pub use upload::{Upload, UploadQueue};

/// Where a transfer's state machine currently sits. `Completed`, `Errored`,
/// `Cancelled`, `TimedOut`, and `RemotelyCancelled` are all terminal;
/// transitions into them never reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Initializing,
    InProgress,
    Completed,
    Errored(String),
    Cancelled,
    TimedOut,
    RemotelyCancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed
                | TransferState::Errored(_)
                | TransferState::Cancelled
                | TransferState::TimedOut
                | TransferState::RemotelyCancelled
        )
    }
}

/// Everything a [`Download`] or [`Upload`] needs to run, passed in rather
/// than reached through a singleton, per the same dependency-injection
/// style as [`crate::collaborators`].
pub struct TransferContext {
    pub peer_manager: Arc<PeerManager>,
    pub waiter: Arc<Waiter>,
    pub token_generator: Arc<dyn RandomTokenGenerator>,
    pub download_bucket: Arc<TokenBucket>,
    pub upload_bucket: Arc<TokenBucket>,
    pub sink: Arc<dyn DiagnosticSink>,
}

pub(crate) const PROGRESS_CHUNK: usize = 64 * 1024;

/// Encode the little-endian u64 start offset exchanged immediately after a
/// transfer connection is established, before any file bytes flow.
pub(crate) fn encode_start_offset(offset: u64) -> [u8; 8] {
    offset.to_le_bytes()
}

pub(crate) fn decode_start_offset(bytes: &[u8]) -> crate::error::SlskResult<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| crate::error::SlskError::Protocol("short start-offset handshake".into()))?;
    Ok(u64::from_le_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_offset_round_trips() {
        let bytes = encode_start_offset(12345);
        assert_eq!(decode_start_offset(&bytes).unwrap(), 12345);
    }

    #[test]
    fn terminal_states_are_recognized() {
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Errored("x".into()).is_terminal());
        assert!(!TransferState::InProgress.is_terminal());
        assert!(!TransferState::Queued.is_terminal());
    }
}
