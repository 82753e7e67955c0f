//! Shared, fair rate limiter for upload/download bytes.
//!
//! One bucket backs each transfer direction; every transfer pump acquires
//! bytes from it before writing to or reading from its socket. Modeled as
//! a background replenishment task plus a FIFO wait queue, using a
//! `tokio::spawn` + `tokio::sync::Mutex` shape for its periodic refill.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{SlskError, SlskResult};

/// Sentinel capacity meaning "no limit": every `wait` is granted
/// immediately regardless of queue state.
pub const UNLIMITED: u64 = u64::MAX;

struct PendingWaiter {
    count: u64,
    sender: oneshot::Sender<()>,
}

struct Inner {
    capacity: u64,
    current: u64,
    queue: VecDeque<PendingWaiter>,
}

impl Inner {
    /// Serve the FIFO queue while the head's request fits in `current`.
    fn drain(&mut self) {
        if self.capacity == UNLIMITED {
            for waiter in self.queue.drain(..) {
                let _ = waiter.sender.send(());
            }
            return;
        }
        while let Some(front) = self.queue.front() {
            if front.count > self.current {
                break;
            }
            let waiter = self.queue.pop_front().expect("front just checked");
            self.current -= waiter.count;
            let _ = waiter.sender.send(());
        }
    }
}

/// A shared token bucket. Cloning shares the same underlying state — every
/// clone contends for the same capacity.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<Mutex<Inner>>,
    interval: Duration,
    replenisher: Arc<JoinHandle<()>>,
}

impl TokenBucket {
    /// `capacity` in bytes (or [`UNLIMITED`]), `interval` between
    /// replenishments.
    pub fn new(capacity: u64, interval: Duration) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            capacity,
            current: capacity,
            queue: VecDeque::new(),
        }));

        let task_inner = inner.clone();
        let task_interval = interval;
        let replenisher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task_interval.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                let mut guard = task_inner.lock().await;
                guard.current = guard.capacity;
                guard.drain();
            }
        });

        Self {
            inner,
            interval,
            replenisher: Arc::new(replenisher),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Acquire `count` bytes, suspending until granted. Fails immediately
    /// (without queuing) if `count` exceeds capacity — no replenishment
    /// could ever satisfy it.
    pub async fn wait(&self, count: u64) -> SlskResult<()> {
        let receiver = {
            let mut guard = self.inner.lock().await;
            if guard.capacity != UNLIMITED && count > guard.capacity {
                return Err(SlskError::ArgumentOutOfRange(format!(
                    "requested {count} exceeds bucket capacity {}",
                    guard.capacity
                )));
            }
            let (sender, receiver) = oneshot::channel();
            guard.queue.push_back(PendingWaiter { count, sender });
            guard.drain();
            receiver
        };
        receiver.await.map_err(|_| SlskError::OperationCanceled)
    }

    /// Reconfigure capacity. Takes effect at the next interval tick, not
    /// immediately — in-flight waiters already queued are unaffected until
    /// then.
    pub async fn set_capacity(&self, capacity: u64) {
        let mut guard = self.inner.lock().await;
        guard.capacity = capacity;
    }

    pub async fn capacity(&self) -> u64 {
        self.inner.lock().await.capacity
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        // `inner` is also held by the replenisher task for its entire
        // (infinite) lifetime, so its count never reflects the last
        // *external* handle going away. `replenisher` itself is only ever
        // cloned by `TokenBucket::clone`, so checking it tells us whether
        // we're dropping the last `TokenBucket` handle.
        if Arc::strong_count(&self.replenisher) == 1 {
            self.replenisher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_immediately_when_capacity_available() {
        let bucket = TokenBucket::new(1000, Duration::from_millis(50));
        bucket.wait(400).await.unwrap();
        assert_eq!(bucket.capacity().await, 1000);
    }

    #[tokio::test]
    async fn rejects_request_larger_than_capacity() {
        let bucket = TokenBucket::new(100, Duration::from_millis(50));
        let result = bucket.wait(101).await;
        assert!(matches!(result, Err(SlskError::ArgumentOutOfRange(_))));
    }

    #[tokio::test]
    async fn unlimited_sentinel_never_blocks() {
        let bucket = TokenBucket::new(UNLIMITED, Duration::from_millis(10));
        bucket.wait(u64::MAX / 2).await.unwrap();
    }

    #[tokio::test]
    async fn serves_queued_waiters_in_submission_order() {
        let bucket = TokenBucket::new(10, Duration::from_millis(1000));
        // Exhaust current capacity.
        bucket.wait(10).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3u32 {
            let bucket = bucket.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                bucket.wait(3).await.unwrap();
                order.lock().await.push(i);
            }));
        }
        // Give the spawned tasks a chance to enqueue in order.
        tokio::time::sleep(Duration::from_millis(20)).await;
        // One interval tick replenishes capacity to 10, draining all three
        // (3+3+3=9 <= 10) in submission order.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
