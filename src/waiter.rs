//! Key→future registry matching asynchronous responses to outstanding
//! requests, with timeout, cancellation, and FIFO multi-waiter support.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::error::{SlskError, SlskResult};

/// A composite key identifying one outstanding wait: a message code plus
/// optional correlating argument (username or a 32-bit token).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitKey {
    Code(u32),
    CodeAndUser(u32, String),
    CodeAndToken(u32, u32),
}

impl WaitKey {
    pub fn for_code(code: u32) -> Self {
        WaitKey::Code(code)
    }

    pub fn for_user(code: u32, username: impl Into<String>) -> Self {
        WaitKey::CodeAndUser(code, username.into())
    }

    pub fn for_token(code: u32, token: u32) -> Self {
        WaitKey::CodeAndToken(code, token)
    }
}

/// A caller-held handle that cancels every wait registered with it when
/// [`cancel`](Cancellation::cancel) is called. Cheap to clone; all clones
/// share the same cancellation state.
#[derive(Clone, Default)]
pub struct Cancellation {
    notify: Arc<Notify>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

type BoxedValue = Box<dyn Any + Send>;

struct Registration {
    sender: oneshot::Sender<Result<BoxedValue, SlskError>>,
    deadline: Option<Instant>,
}

/// The keyed future registry. One instance is shared by the client and its
/// handlers; handlers call [`complete`](Waiter::complete)/[`throw`](Waiter::throw),
/// callers call [`wait`](Waiter::wait)/[`wait_indefinite`](Waiter::wait_indefinite).
pub struct Waiter {
    queues: DashMap<WaitKey, VecDeque<Registration>>,
    sweeper: JoinHandle<()>,
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        let queues: DashMap<WaitKey, VecDeque<Registration>> = DashMap::new();
        // The sweeper needs a handle back into `queues`, but `queues` must
        // be moved into the `Arc<Self>` we're constructing. Build the inner
        // map first, spawn against a raw pointer-free shared clone via
        // `Arc::new_cyclic` instead of a two-phase trick.
        Arc::new_cyclic(|weak: &std::sync::Weak<Waiter>| {
            let weak = weak.clone();
            let sweeper = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(250));
                loop {
                    ticker.tick().await;
                    let Some(this) = weak.upgrade() else {
                        return;
                    };
                    this.sweep_expired();
                }
            });
            Waiter { queues, sweeper }
        })
    }

    /// Remove and reject any registrations whose deadline has passed. Runs
    /// in bounded batches: one pass per queue per tick, not an unbounded
    /// scan of the whole registry at once.
    fn sweep_expired(&self) {
        let now = Instant::now();
        for mut entry in self.queues.iter_mut() {
            let queue = entry.value_mut();
            let mut remaining = VecDeque::with_capacity(queue.len());
            while let Some(registration) = queue.pop_front() {
                match registration.deadline {
                    Some(deadline) if deadline <= now => {
                        let _ = registration.sender.send(Err(SlskError::OperationTimedOut));
                    }
                    _ => remaining.push_back(registration),
                }
            }
            *queue = remaining;
        }
    }

    /// Register a single-shot wait with a deadline.
    pub async fn wait<T: Send + 'static>(
        self: &Arc<Self>,
        key: WaitKey,
        timeout: Duration,
        cancellation: Option<Cancellation>,
    ) -> SlskResult<T> {
        self.wait_with_deadline(key, Some(Instant::now() + timeout), cancellation)
            .await
    }

    /// Register a wait with no deadline; only cancellation or completion
    /// ends it.
    pub async fn wait_indefinite<T: Send + 'static>(
        self: &Arc<Self>,
        key: WaitKey,
        cancellation: Option<Cancellation>,
    ) -> SlskResult<T> {
        self.wait_with_deadline(key, None, cancellation).await
    }

    async fn wait_with_deadline<T: Send + 'static>(
        self: &Arc<Self>,
        key: WaitKey,
        deadline: Option<Instant>,
        cancellation: Option<Cancellation>,
    ) -> SlskResult<T> {
        let (sender, receiver) = oneshot::channel();
        self.queues
            .entry(key.clone())
            .or_default()
            .push_back(Registration { sender, deadline });

        let result = if let Some(cancellation) = cancellation {
            tokio::select! {
                result = receiver => result.map_err(|_| SlskError::OperationCanceled),
                _ = cancellation.cancelled() => {
                    self.remove_registration(&key);
                    Err(SlskError::OperationCanceled)
                }
            }
        } else {
            receiver.await.map_err(|_| SlskError::OperationCanceled)
        };

        match result? {
            Ok(boxed) => boxed
                .downcast::<T>()
                .map(|b| *b)
                .map_err(|_| SlskError::Protocol("waiter value type mismatch".into())),
            Err(err) => Err(err),
        }
    }

    /// Best-effort removal of a still-pending registration after the
    /// caller's cancellation observer fires. If it already completed
    /// between the signal firing and this running, this is a no-op.
    fn remove_registration(&self, key: &WaitKey) {
        if let Some(mut queue) = self.queues.get_mut(key) {
            // The cancelled registration is somewhere in the queue; since
            // oneshot senders silently drop on a dead receiver, it's safe
            // to just leave a closed sender in place rather than find it —
            // `complete`/`throw` skip closed senders when draining.
            queue.retain(|r| !r.sender.is_closed());
        }
    }

    /// Resolve the head of the queue for `key` with `value`.
    pub fn complete<T: Send + 'static>(&self, key: &WaitKey, value: T) {
        self.dispatch(key, Ok(Box::new(value)));
    }

    /// Reject the head of the queue for `key` with `error`.
    pub fn throw(&self, key: &WaitKey, error: SlskError) {
        self.dispatch(key, Err(error));
    }

    fn dispatch(&self, key: &WaitKey, value: Result<BoxedValue, SlskError>) {
        if let Some(mut queue) = self.queues.get_mut(key) {
            while let Some(registration) = queue.pop_front() {
                if registration.sender.is_closed() {
                    continue;
                }
                let _ = registration.sender.send(value);
                return;
            }
        }
    }

    /// Reject every pending registration across all keys — used when the
    /// owning connection closes and all in-flight waits must surface the
    /// same failure.
    pub fn fail_all(&self, error_factory: impl Fn() -> SlskError) {
        for mut entry in self.queues.iter_mut() {
            while let Some(registration) = entry.value_mut().pop_front() {
                let _ = registration.sender.send(Err(error_factory()));
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Helper alias retained for readers scanning for the map type used by
/// handlers keying waits by `(code, username)` pairs without importing
/// `HashMap` separately.
pub type WaitKeyMap<V> = HashMap<WaitKey, V>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_resolves_single_waiter() {
        let waiter = Waiter::new();
        let key = WaitKey::for_code(1);
        let waiter_clone = waiter.clone();
        let key_clone = key.clone();
        let handle = tokio::spawn(async move {
            waiter_clone
                .wait::<u32>(key_clone, Duration::from_secs(1), None)
                .await
        });
        tokio::task::yield_now().await;
        waiter.complete(&key, 7u32);
        assert_eq!(handle.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn fifo_multi_waiters_resolve_in_order() {
        let waiter = Waiter::new();
        let key = WaitKey::for_code(2);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let waiter = waiter.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                waiter.wait::<u32>(key, Duration::from_secs(1), None).await
            }));
            tokio::task::yield_now().await;
        }

        for i in 0..3u32 {
            waiter.complete(&key, i);
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(results, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancellation_rejects_the_future() {
        let waiter = Waiter::new();
        let cancellation = Cancellation::new();
        let key = WaitKey::for_code(3);

        let waiter_clone = waiter.clone();
        let key_clone = key.clone();
        let cancellation_clone = cancellation.clone();
        let handle = tokio::spawn(async move {
            waiter_clone
                .wait::<u32>(key_clone, Duration::from_secs(5), Some(cancellation_clone))
                .await
        });
        tokio::task::yield_now().await;
        cancellation.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SlskError::OperationCanceled)));
    }

    #[tokio::test]
    async fn timeout_expires_via_sweeper() {
        let waiter = Waiter::new();
        let key = WaitKey::for_code(4);
        let result = waiter.wait::<u32>(key, Duration::from_millis(50), None).await;
        assert!(matches!(result, Err(SlskError::OperationTimedOut)));
    }
}
