//! A raw connection wrapped with a continuous read loop producing framed
//! messages, broadcast to subscribers.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::broadcast;

use crate::codec::{try_decode_frame, CodeWidth, MessageFrame};
use crate::connection::raw::{ConnectionState, RawConnection};
use crate::error::{DisconnectReason, SlskResult};

const READ_CHUNK: usize = 16 * 1024;
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Wraps a [`RawConnection`] with a background task that continuously
/// reads bytes, reassembles frames, and broadcasts each one. Writes go
/// straight through to the raw connection, which already serializes them
/// behind its own write-half mutex.
pub struct MessageConnection {
    raw: Arc<RawConnection>,
    code_width: CodeWidth,
    frames: broadcast::Sender<Arc<MessageFrame>>,
    read_task: tokio::task::JoinHandle<()>,
}

impl MessageConnection {
    /// `prebuffered` carries any bytes already consumed off the socket
    /// before this connection was constructed — e.g. the remainder of a
    /// frame whose length and handshake code the listener already read
    /// during classification. The read loop drains those before touching
    /// the socket again, so framing continues from the right offset
    /// regardless of how much the listener peeked.
    pub fn spawn(raw: Arc<RawConnection>, code_width: CodeWidth, prebuffered: Option<Bytes>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let task_raw = raw.clone();
        let task_frames = frames.clone();

        let read_task = tokio::spawn(async move {
            let mut buffer = BytesMut::new();
            if let Some(prebuffered) = prebuffered {
                buffer.extend_from_slice(&prebuffered);
            }

            loop {
                match try_decode_frame(&buffer, code_width) {
                    Ok(Some((frame, consumed))) => {
                        let _ = buffer.split_to(consumed);
                        let _ = task_frames.send(Arc::new(frame));
                        continue;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "message connection desynchronized, closing");
                        task_raw
                            .disconnect(DisconnectReason::TransportError(err.to_string()))
                            .await;
                        return;
                    }
                }

                match task_raw.read_some(READ_CHUNK).await {
                    Ok(bytes) => buffer.extend_from_slice(&bytes),
                    Err(_) => return,
                }
            }
        });

        Self {
            raw,
            code_width,
            frames,
            read_task,
        }
    }

    pub fn code_width(&self) -> CodeWidth {
        self.code_width
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<MessageFrame>> {
        self.frames.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.raw.state()
    }

    pub async fn write(&self, bytes: &[u8]) -> SlskResult<()> {
        self.raw.write_all(bytes, None).await
    }

    pub async fn disconnect(&self, reason: DisconnectReason) {
        self.raw.disconnect(reason).await;
    }

    pub fn raw(&self) -> &Arc<RawConnection> {
        &self.raw
    }
}

impl Drop for MessageConnection {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_channel_has_bounded_capacity() {
        let (tx, _rx) = broadcast::channel::<Arc<MessageFrame>>(FRAME_CHANNEL_CAPACITY);
        assert_eq!(tx.receiver_count(), 1);
    }
}
