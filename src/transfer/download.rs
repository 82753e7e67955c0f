//! The download state machine: request, negotiate (direct or
//! queued), establish a transfer connection, exchange the start-offset
//! handshake, and pump bytes under the shared download token bucket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{DisconnectReason, SlskError, SlskResult, TransferErrorKind};
use crate::events::Event;
use crate::messages::peer::{self, PeerPayload, QueueDownload, TransferRequest, TransferResponse};
use crate::messages::common::TransferDirection;
use crate::transfer::{decode_start_offset, encode_start_offset, TransferContext, TransferState, PROGRESS_CHUNK};
use crate::waiter::WaitKey;

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// One in-flight download, identified by `(username, token)`.
pub struct Download {
    username: String,
    filename: String,
    token: u32,
    state: Mutex<TransferState>,
    bytes_transferred: AtomicU64,
    size: Mutex<Option<u64>>,
}

impl Download {
    pub fn new(username: impl Into<String>, filename: impl Into<String>, token: u32) -> Arc<Self> {
        Arc::new(Self {
            username: username.into(),
            filename: filename.into(),
            token,
            state: Mutex::new(TransferState::Queued),
            bytes_transferred: AtomicU64::new(0),
            size: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> TransferState {
        self.state.lock().await.clone()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::SeqCst)
    }

    async fn transition(&self, ctx: &TransferContext, state: TransferState) {
        *self.state.lock().await = state.clone();
        ctx.sink
            .on_event(Event::TransferStateChanged {
                direction: TransferDirection::Download,
                username: self.username.clone(),
                token: self.token,
                state,
            })
            .await;
    }

    async fn emit_progress(&self, ctx: &TransferContext) {
        let size = *self.size.lock().await;
        ctx.sink
            .on_event(Event::TransferProgressUpdated {
                direction: TransferDirection::Download,
                username: self.username.clone(),
                token: self.token,
                bytes_transferred: self.bytes_transferred(),
                size,
            })
            .await;
    }

    /// Drive the whole download to completion, writing received bytes into
    /// `sink`. Cancellation is observed between negotiation steps and
    /// between progress chunks.
    pub async fn run(
        self: &Arc<Self>,
        ctx: &TransferContext,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> SlskResult<()> {
        match self.negotiate_and_pump(ctx, sink).await {
            Ok(()) => {
                self.transition(ctx, TransferState::Completed).await;
                Ok(())
            }
            Err(err) => {
                let state = match &err {
                    SlskError::OperationCanceled => TransferState::Cancelled,
                    SlskError::OperationTimedOut | SlskError::ConnectionTimeout => TransferState::TimedOut,
                    SlskError::Transfer {
                        kind: TransferErrorKind::IncompleteData,
                    } => TransferState::Errored("incomplete data".into()),
                    other => TransferState::Errored(other.to_string()),
                };
                self.transition(ctx, state).await;
                Err(err)
            }
        }
    }

    async fn negotiate_and_pump(
        self: &Arc<Self>,
        ctx: &TransferContext,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> SlskResult<()> {
        self.transition(ctx, TransferState::Initializing).await;

        let connection = ctx
            .peer_manager
            .get_or_add_message_connection(&self.username)
            .await?;

        let request = TransferRequest {
            direction: TransferDirection::Download,
            token: self.token,
            filename: self.filename.clone(),
            size: None,
        };
        {
            let lock = ctx.peer_manager.write_lock(&self.username);
            let _guard = lock.lock().await;
            connection.write(&request.to_bytes()).await?;
        }

        let response: TransferResponse = ctx
            .waiter
            .wait(
                WaitKey::for_token(peer::TRANSFER_RESPONSE, self.token),
                NEGOTIATION_TIMEOUT,
                None,
            )
            .await?;

        let connection_token = if response.allowed {
            *self.size.lock().await = response.size;
            self.token
        } else {
            connection
                .write(&QueueDownload { filename: self.filename.clone() }.to_bytes())
                .await?;

            let remote_request: TransferRequest = ctx
                .waiter
                .wait(
                    WaitKey::for_user(peer::TRANSFER_REQUEST, self.username.clone()),
                    NEGOTIATION_TIMEOUT,
                    None,
                )
                .await?;
            *self.size.lock().await = remote_request.size;

            let ack = TransferResponse {
                token: remote_request.token,
                allowed: true,
                size: remote_request.size,
                message: None,
            };
            connection.write(&ack.to_bytes()).await?;
            remote_request.token
        };

        self.transition(ctx, TransferState::InProgress).await;

        let raw = ctx
            .peer_manager
            .add_transfer_connection(&self.username, connection_token)
            .await?;

        raw.write_all(&encode_start_offset(0), None).await?;
        let start_offset_buf = raw.read_exact(8, None).await?;
        let _peer_start_offset = decode_start_offset(&start_offset_buf)?;

        let total = self.size.lock().await.ok_or_else(|| {
            SlskError::Protocol("download completed negotiation without a known size".into())
        })?;

        let mut remaining = total;
        while remaining > 0 {
            let want = remaining.min(PROGRESS_CHUNK as u64) as usize;
            let chunk = match raw.read_exact(want, Some(ctx.download_bucket.as_ref())).await {
                Ok(chunk) => chunk,
                Err(SlskError::ConnectionClosed { .. }) => {
                    return Err(SlskError::Transfer {
                        kind: TransferErrorKind::IncompleteData,
                    });
                }
                Err(err) => return Err(err),
            };
            sink.write_all(&chunk).await.map_err(SlskError::Io)?;
            remaining -= chunk.len() as u64;
            self.bytes_transferred.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            self.emit_progress(ctx).await;
        }

        raw.disconnect(DisconnectReason::Requested).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_download_starts_queued() {
        let download = Download::new("alice", "file.mp3", 1);
        assert_eq!(download.state().await, TransferState::Queued);
        assert_eq!(download.bytes_transferred(), 0);
    }
}
