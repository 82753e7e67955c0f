//! The upload state machine: wait for a free slot, offer the file,
//! await acceptance, establish a transfer connection, exchange the
//! start-offset handshake, and pump bytes under the shared upload token
//! bucket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, Semaphore};

use crate::error::{DisconnectReason, SlskError, SlskResult, TransferErrorKind};
use crate::events::Event;
use crate::messages::common::TransferDirection;
use crate::messages::peer::{self, PeerPayload, TransferRequest, TransferResponse};
use crate::transfer::{decode_start_offset, encode_start_offset, TransferContext, TransferState, PROGRESS_CHUNK};
use crate::waiter::WaitKey;

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounds concurrent uploads at `upload_slot_limit`; requests beyond the
/// limit queue fairly on the semaphore's own FIFO waiter list.
pub struct UploadQueue {
    slots: Arc<Semaphore>,
}

impl UploadQueue {
    pub fn new(limit: u32) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limit.max(1) as usize)),
        }
    }

    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .expect("upload slot semaphore is never closed")
    }
}

/// One in-flight upload, identified by `(username, token)`.
pub struct Upload {
    username: String,
    filename: String,
    token: u32,
    size: u64,
    state: Mutex<TransferState>,
    bytes_transferred: AtomicU64,
}

impl Upload {
    pub fn new(username: impl Into<String>, filename: impl Into<String>, token: u32, size: u64) -> Arc<Self> {
        Arc::new(Self {
            username: username.into(),
            filename: filename.into(),
            token,
            size,
            state: Mutex::new(TransferState::Queued),
            bytes_transferred: AtomicU64::new(0),
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
                direction: TransferDirection::Upload,
                username: self.username.clone(),
                token: self.token,
                state,
            })
            .await;
    }

    async fn emit_progress(&self, ctx: &TransferContext) {
        ctx.sink
            .on_event(Event::TransferProgressUpdated {
                direction: TransferDirection::Upload,
                username: self.username.clone(),
                token: self.token,
                bytes_transferred: self.bytes_transferred(),
                size: Some(self.size),
            })
            .await;
    }

    /// Drive the whole upload to completion, reading bytes from `source`.
    /// `queue` gates admission: the permit is held for the lifetime of the
    /// offer-and-pump sequence, freeing the slot as soon as this returns.
    pub async fn run(
        self: &Arc<Self>,
        ctx: &TransferContext,
        queue: &UploadQueue,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> SlskResult<()> {
        let _permit = queue.acquire().await;
        match self.offer_and_pump(ctx, source).await {
            Ok(()) => {
                self.transition(ctx, TransferState::Completed).await;
                Ok(())
            }
            Err(err) => {
                let state = match &err {
                    SlskError::OperationCanceled => TransferState::Cancelled,
                    SlskError::OperationTimedOut | SlskError::ConnectionTimeout => TransferState::TimedOut,
                    SlskError::Transfer {
                        kind: TransferErrorKind::RemoteRejected(_),
                    } => TransferState::RemotelyCancelled,
                    other => TransferState::Errored(other.to_string()),
                };
                self.transition(ctx, state).await;
                Err(err)
            }
        }
    }

    async fn offer_and_pump(
        self: &Arc<Self>,
        ctx: &TransferContext,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> SlskResult<()> {
        self.transition(ctx, TransferState::Initializing).await;

        let connection = ctx
            .peer_manager
            .get_or_add_message_connection(&self.username)
            .await?;

        let offer = TransferRequest {
            direction: TransferDirection::Upload,
            token: self.token,
            filename: self.filename.clone(),
            size: Some(self.size),
        };
        {
            let lock = ctx.peer_manager.write_lock(&self.username);
            let _guard = lock.lock().await;
            connection.write(&offer.to_bytes()).await?;
        }

        let response: TransferResponse = ctx
            .waiter
            .wait(
                WaitKey::for_token(peer::TRANSFER_RESPONSE, self.token),
                NEGOTIATION_TIMEOUT,
                None,
            )
            .await?;

        if !response.allowed {
            return Err(SlskError::Transfer {
                kind: TransferErrorKind::RemoteRejected(
                    response.message.unwrap_or_else(|| "denied".into()),
                ),
            });
        }

        self.transition(ctx, TransferState::InProgress).await;

        let raw = ctx
            .peer_manager
            .add_transfer_connection(&self.username, self.token)
            .await?;

        let start_offset_buf = raw.read_exact(8, None).await?;
        let start_offset = decode_start_offset(&start_offset_buf)?;
        raw.write_all(&encode_start_offset(start_offset), None).await?;

        if start_offset > 0 {
            tracing::debug!(offset = start_offset, "resume offsets are accepted but not seeked in source");
        }

        let mut remaining = self.size.saturating_sub(start_offset);
        let mut buf = vec![0u8; PROGRESS_CHUNK];
        while remaining > 0 {
            let want = remaining.min(PROGRESS_CHUNK as u64) as usize;
            let read = source.read(&mut buf[..want]).await.map_err(SlskError::Io)?;
            if read == 0 {
                return Err(SlskError::Transfer {
                    kind: TransferErrorKind::IncompleteData,
                });
            }
            raw.write_all(&buf[..read], Some(ctx.upload_bucket.as_ref())).await?;
            remaining -= read as u64;
            self.bytes_transferred.fetch_add(read as u64, Ordering::SeqCst);
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
    async fn new_upload_starts_queued() {
        let upload = Upload::new("bob", "track.flac", 9, 4096);
        assert_eq!(upload.state().await, TransferState::Queued);
    }

    #[tokio::test]
    async fn queue_admits_up_to_limit_concurrently() {
        let queue = UploadQueue::new(1);
        let first = queue.acquire().await;
        let second = tokio::time::timeout(Duration::from_millis(20), queue.acquire()).await;
        assert!(second.is_err());
        drop(first);
        assert!(tokio::time::timeout(Duration::from_millis(20), queue.acquire())
            .await
            .is_ok());
    }
}
