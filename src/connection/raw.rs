//! Reliable stream abstraction: connect/read/write lifecycle, inactivity
//! timeout, idempotent disconnect.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::collaborators::TcpTransportFactory;
use crate::config::ConnectionOptions;
use crate::error::{DisconnectReason, SlskError, SlskResult};
use crate::token_bucket::{TokenBucket, UNLIMITED};
use crate::waiter::Cancellation;

/// Cap a metered chunk to the governor's current capacity. `wait(count)`
/// rejects any `count` above capacity outright, so a configured speed
/// limit below the natural chunk size (64 KiB) would otherwise fail every
/// transfer it governs instead of simply pacing it more finely.
async fn metered_want(requested: usize, governor: Option<&TokenBucket>) -> usize {
    match governor {
        Some(bucket) => {
            let capacity = bucket.capacity().await;
            if capacity == UNLIMITED {
                requested
            } else {
                requested.min(capacity as usize).max(1)
            }
        }
        None => requested,
    }
}

/// The connection lifecycle. Stored as an atomic so reads from any task
/// never block on the read/write halves' locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            4 => ConnectionState::Disconnected,
            _ => ConnectionState::Pending,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Pending => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Disconnecting => 3,
            ConnectionState::Disconnected => 4,
        }
    }
}

struct Shared {
    state: AtomicU8,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    last_activity: Mutex<Instant>,
    inactivity_timeout: Option<Duration>,
}

/// A TCP connection with OS keepalive, an inactivity timer, and
/// rate-limited read/write helpers. Read and write halves are held
/// separately so one task can read while another writes, with writes
/// additionally serialized by their own mutex (message connections layer a
/// second, per-username mutex on top of this for cross-connection
/// ordering).
pub struct RawConnection {
    shared: Arc<Shared>,
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<OwnedWriteHalf>,
    watchdog: Option<tokio::task::JoinHandle<()>>,
}

impl RawConnection {
    /// Dial `addr` through the injected transport factory, racing a
    /// cancellation observer and the configured connect timeout.
    pub async fn connect(
        factory: &dyn TcpTransportFactory,
        addr: SocketAddr,
        options: &ConnectionOptions,
        cancellation: Option<Cancellation>,
    ) -> SlskResult<Self> {
        let connect_future = factory.connect(addr);
        let timeout_future = tokio::time::sleep(options.connect_timeout);
        tokio::pin!(connect_future);
        tokio::pin!(timeout_future);

        let stream = if let Some(cancellation) = cancellation {
            tokio::select! {
                result = &mut connect_future => result.map_err(SlskError::Io)?,
                _ = &mut timeout_future => return Err(SlskError::ConnectionTimeout),
                _ = cancellation.cancelled() => return Err(SlskError::OperationCanceled),
            }
        } else {
            tokio::select! {
                result = &mut connect_future => result.map_err(SlskError::Io)?,
                _ = &mut timeout_future => return Err(SlskError::ConnectionTimeout),
            }
        };

        Ok(Self::from_stream(stream, options))
    }

    /// Wrap an already-established socket (accepted by the listener, or
    /// handed off after a connection-establishment race), applying the
    /// same keepalive and inactivity configuration.
    pub fn from_stream(stream: TcpStream, options: &ConnectionOptions) -> Self {
        let _ = stream.set_nodelay(true);
        apply_keepalive(&stream, options);

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ConnectionState::Connected.to_u8()),
            disconnect_reason: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            inactivity_timeout: options.inactivity_timeout,
        });

        let watchdog = shared.inactivity_timeout.map(|timeout| {
            let shared = shared.clone();
            tokio::spawn(async move { run_inactivity_watchdog(shared, timeout).await })
        });

        Self {
            shared,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
            watchdog,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    fn ensure_connected(&self) -> SlskResult<()> {
        if self.state() != ConnectionState::Connected {
            let reason = self
                .shared
                .disconnect_reason
                .try_lock()
                .ok()
                .and_then(|guard| guard.clone())
                .unwrap_or(DisconnectReason::RemoteClosed);
            return Err(SlskError::ConnectionClosed { reason });
        }
        Ok(())
    }

    async fn touch(&self) {
        *self.shared.last_activity.lock().await = Instant::now();
    }

    /// Read exactly `n` bytes, optionally metered by a token bucket.
    pub async fn read_exact(&self, n: usize, governor: Option<&TokenBucket>) -> SlskResult<Vec<u8>> {
        self.ensure_connected()?;
        let mut guard = self.read_half.lock().await;
        let half = guard
            .as_mut()
            .ok_or(SlskError::ConnectionClosed { reason: DisconnectReason::RemoteClosed })?;

        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let want = metered_want(n - filled, governor).await;
            if let Some(bucket) = governor {
                bucket.wait(want as u64).await?;
            }
            let read = half.read(&mut buf[filled..filled + want]).await.map_err(SlskError::Io)?;
            if read == 0 {
                self.fail(DisconnectReason::RemoteClosed).await;
                return Err(SlskError::ConnectionClosed {
                    reason: DisconnectReason::RemoteClosed,
                });
            }
            filled += read;
        }
        self.touch().await;
        Ok(buf)
    }

    /// Read whatever is available, up to `max` bytes. Used by the message
    /// connection's continuous read loop, which needs to grow a framing
    /// buffer rather than block for an exact count.
    pub async fn read_some(&self, max: usize) -> SlskResult<Vec<u8>> {
        self.ensure_connected()?;
        let mut guard = self.read_half.lock().await;
        let half = guard
            .as_mut()
            .ok_or(SlskError::ConnectionClosed { reason: DisconnectReason::RemoteClosed })?;

        let mut buf = vec![0u8; max];
        let read = half.read(&mut buf).await.map_err(SlskError::Io)?;
        if read == 0 {
            self.fail(DisconnectReason::RemoteClosed).await;
            return Err(SlskError::ConnectionClosed {
                reason: DisconnectReason::RemoteClosed,
            });
        }
        buf.truncate(read);
        self.touch().await;
        Ok(buf)
    }

    /// Read exactly `n` bytes, streaming each chunk into `sink` as it
    /// arrives rather than buffering the whole read in memory — used by
    /// the transfer engine's progress pump.
    pub async fn read_to_sink(
        &self,
        n: u64,
        sink: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
        governor: Option<&TokenBucket>,
    ) -> SlskResult<()> {
        self.ensure_connected()?;
        let mut guard = self.read_half.lock().await;
        let half = guard
            .as_mut()
            .ok_or(SlskError::ConnectionClosed { reason: DisconnectReason::RemoteClosed })?;

        const CHUNK: usize = 64 * 1024;
        let mut remaining = n;
        let mut buf = vec![0u8; CHUNK];
        while remaining > 0 {
            let want = remaining.min(CHUNK as u64) as usize;
            let want = metered_want(want, governor).await;
            if let Some(bucket) = governor {
                bucket.wait(want as u64).await?;
            }
            let read = half.read(&mut buf[..want]).await.map_err(SlskError::Io)?;
            if read == 0 {
                self.fail(DisconnectReason::RemoteClosed).await;
                return Err(SlskError::Transfer {
                    kind: crate::error::TransferErrorKind::IncompleteData,
                });
            }
            sink.write_all(&buf[..read]).await.map_err(SlskError::Io)?;
            remaining -= read as u64;
        }
        self.touch().await;
        Ok(())
    }

    /// Write the full buffer, optionally metered.
    pub async fn write_all(&self, bytes: &[u8], governor: Option<&TokenBucket>) -> SlskResult<()> {
        self.ensure_connected()?;
        let mut half = self.write_half.lock().await;
        let mut written = 0;
        while written < bytes.len() {
            let want = metered_want(bytes.len() - written, governor).await;
            if let Some(bucket) = governor {
                bucket.wait(want as u64).await?;
            }
            let n = half.write(&bytes[written..written + want]).await.map_err(SlskError::Io)?;
            written += n;
        }
        half.flush().await.map_err(SlskError::Io)?;
        drop(half);
        self.touch().await;
        Ok(())
    }

    /// Idempotent: a connection already disconnected keeps its first
    /// reason.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        self.fail(reason).await;
    }

    async fn fail(&self, reason: DisconnectReason) {
        let previous = self
            .shared
            .state
            .swap(ConnectionState::Disconnected.to_u8(), Ordering::SeqCst);
        if previous == ConnectionState::Disconnected.to_u8() {
            return;
        }
        let mut guard = self.shared.disconnect_reason.lock().await;
        if guard.is_none() {
            *guard = Some(reason);
        }
    }

    pub async fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared.disconnect_reason.lock().await.clone()
    }
}

impl Drop for RawConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
    }
}

async fn run_inactivity_watchdog(shared: Arc<Shared>, timeout: Duration) {
    loop {
        let last = *shared.last_activity.lock().await;
        let elapsed = last.elapsed();
        if elapsed >= timeout {
            let previous = shared
                .state
                .swap(ConnectionState::Disconnected.to_u8(), Ordering::SeqCst);
            if previous != ConnectionState::Disconnected.to_u8() {
                let mut guard = shared.disconnect_reason.lock().await;
                if guard.is_none() {
                    *guard = Some(DisconnectReason::TimedOut);
                }
            }
            return;
        }
        if shared.state.load(Ordering::SeqCst) == ConnectionState::Disconnected.to_u8() {
            return;
        }
        tokio::time::sleep(timeout - elapsed).await;
    }
}

fn apply_keepalive(stream: &TcpStream, options: &ConnectionOptions) {
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(options.keepalive_idle)
        .with_interval(options.keepalive_interval);
    let _ = socket.set_tcp_keepalive(&keepalive);
}
