//! Search engine: issues outgoing search requests, aggregates
//! inbound `SearchResponse`s per token under response/file filters, and
//! completes on cancellation, timeout, a response cap, or an overall
//! deadline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::events::{DiagnosticSink, Event};
use crate::messages::FileEntry;
use crate::waiter::Cancellation;

/// Where a search is directed. Each scope maps to a distinct outgoing
/// server request.
#[derive(Debug, Clone)]
pub enum Scope {
    Network,
    Room(String),
    User(String),
    Wishlist,
}

/// One peer's response, post-filtering, as retained in the aggregate.
#[derive(Debug, Clone)]
pub struct SearchResultEntry {
    pub username: String,
    pub files: Vec<FileEntry>,
    pub free_upload_slots: u8,
    pub upload_speed: u32,
    pub queue_length: u64,
}

/// Why a search stopped accepting further responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchCompletionReason {
    Cancelled,
    TimedOut,
    ResponseCapReached,
    DeadlineElapsed,
}

/// Per-response admission criteria, applied before any file filtering.
#[derive(Debug, Clone, Default)]
pub struct ResponseFilter {
    pub min_free_upload_slots: u8,
    pub max_queue_length: Option<u64>,
    pub min_upload_speed: u32,
    pub min_result_count: usize,
}

impl ResponseFilter {
    fn admits(&self, free_upload_slots: u8, upload_speed: u32, queue_length: u64, result_count: usize) -> bool {
        free_upload_slots >= self.min_free_upload_slots
            && self.max_queue_length.map_or(true, |max| queue_length <= max)
            && upload_speed >= self.min_upload_speed
            && result_count >= self.min_result_count
    }
}

/// Per-file admission criteria, applied to each file within an admitted
/// response.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub excluded_extensions: Vec<String>,
    pub min_bitrate: Option<u32>,
    pub min_size: Option<u64>,
    pub min_length_seconds: Option<u32>,
    pub min_sample_rate: Option<u32>,
    pub min_bit_depth: Option<u32>,
    pub include_constant_bitrate: bool,
    pub include_variable_bitrate: bool,
}

impl FileFilter {
    /// Accept-everything default used when a caller hasn't narrowed the
    /// VBR/CBR inclusion, since an all-`false` default would silently drop
    /// every file.
    pub fn permissive() -> Self {
        Self {
            include_constant_bitrate: true,
            include_variable_bitrate: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, file: &FileEntry) -> bool {
        if self
            .excluded_extensions
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(&file.extension))
        {
            return false;
        }
        if let Some(min) = self.min_bitrate {
            if file.bitrate().map_or(true, |bitrate| bitrate < min) {
                return false;
            }
        }
        if let Some(min) = self.min_size {
            if file.size < min {
                return false;
            }
        }
        if let Some(min) = self.min_length_seconds {
            if file.duration_seconds().map_or(true, |seconds| seconds < min) {
                return false;
            }
        }
        if let Some(min) = self.min_sample_rate {
            if file.sample_rate().map_or(true, |rate| rate < min) {
                return false;
            }
        }
        if let Some(min) = self.min_bit_depth {
            if file.bit_depth().map_or(true, |depth| depth < min) {
                return false;
            }
        }
        if file.is_vbr() {
            if !self.include_variable_bitrate {
                return false;
            }
        } else if !self.include_constant_bitrate {
            return false;
        }
        true
    }
}

/// Per-search configuration.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub search_timeout: Duration,
    pub overall_deadline: Option<Duration>,
    pub response_cap: Option<usize>,
    pub response_filter: ResponseFilter,
    pub file_filter: FileFilter,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_secs(15),
            overall_deadline: Some(Duration::from_secs(60)),
            response_cap: None,
            response_filter: ResponseFilter::default(),
            file_filter: FileFilter::permissive(),
        }
    }
}

/// Sends the outgoing request matching a [`Scope`]. Kept as a trait so the
/// search engine doesn't depend on the concrete server handler.
#[async_trait]
pub trait SearchServerLink: Send + Sync {
    async fn file_search(&self, token: u32, query: &str) -> crate::error::SlskResult<()>;
    async fn room_search(&self, room: &str, token: u32, query: &str) -> crate::error::SlskResult<()>;
    async fn user_search(&self, username: &str, token: u32, query: &str) -> crate::error::SlskResult<()>;
    async fn wishlist_search(&self, token: u32, query: &str) -> crate::error::SlskResult<()>;
}

struct ActiveSearch {
    options: SearchOptions,
    results: Mutex<Vec<SearchResultEntry>>,
    cancellation: Cancellation,
    last_response: Mutex<Instant>,
    deadline: Option<Instant>,
    completed: AtomicUsize,
}

const NOT_COMPLETED: usize = 0;
const COMPLETED: usize = 1;

/// Owns every in-flight search, keyed by token.
pub struct SearchEngine {
    active: DashMap<u32, Arc<ActiveSearch>>,
    sink: Arc<dyn DiagnosticSink>,
}

impl SearchEngine {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Arc<Self> {
        Arc::new(Self {
            active: DashMap::new(),
            sink,
        })
    }

    /// Issue a search and begin aggregating responses under `token`.
    /// Returns a [`Cancellation`] handle the caller can use to end the
    /// search early.
    pub async fn search(
        self: &Arc<Self>,
        server: &dyn SearchServerLink,
        query: &str,
        token: u32,
        scope: Scope,
        options: SearchOptions,
    ) -> crate::error::SlskResult<Cancellation> {
        match &scope {
            Scope::Network => server.file_search(token, query).await?,
            Scope::Room(room) => server.room_search(room, token, query).await?,
            Scope::User(username) => server.user_search(username, token, query).await?,
            Scope::Wishlist => server.wishlist_search(token, query).await?,
        }

        let cancellation = Cancellation::new();
        let deadline = options.overall_deadline.map(|d| Instant::now() + d);
        let search = Arc::new(ActiveSearch {
            options,
            results: Mutex::new(Vec::new()),
            cancellation: cancellation.clone(),
            last_response: Mutex::new(Instant::now()),
            deadline,
            completed: AtomicUsize::new(NOT_COMPLETED),
        });
        self.active.insert(token, search.clone());

        let this = self.clone();
        tokio::spawn(async move { this.watch(token, search).await });

        Ok(cancellation)
    }

    async fn watch(self: Arc<Self>, token: u32, search: Arc<ActiveSearch>) {
        loop {
            let since_last = search.last_response.lock().await.elapsed();
            let timeout_remaining = search.options.search_timeout.saturating_sub(since_last);
            let deadline_remaining = search
                .deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));

            let wait = match deadline_remaining {
                Some(d) => timeout_remaining.min(d),
                None => timeout_remaining,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = search.cancellation.cancelled() => {
                    self.complete(token, SearchCompletionReason::Cancelled).await;
                    return;
                }
            }

            if search.completed.load(Ordering::SeqCst) == COMPLETED {
                return;
            }
            if search.last_response.lock().await.elapsed() >= search.options.search_timeout {
                self.complete(token, SearchCompletionReason::TimedOut).await;
                return;
            }
            if let Some(deadline) = search.deadline {
                if Instant::now() >= deadline {
                    self.complete(token, SearchCompletionReason::DeadlineElapsed).await;
                    return;
                }
            }
        }
    }

    /// Feed one decoded, decompressed `SearchResponse` into the aggregate
    /// for its token. A token with no active search (already completed, or
    /// a stray response) is ignored.
    pub async fn handle_response(
        &self,
        token: u32,
        username: String,
        files: Vec<FileEntry>,
        free_upload_slots: u8,
        upload_speed: u32,
        queue_length: u64,
    ) {
        let Some(search) = self.active.get(&token).map(|entry| entry.clone()) else {
            return;
        };
        if search.completed.load(Ordering::SeqCst) == COMPLETED {
            return;
        }

        let filtered: Vec<FileEntry> = files
            .into_iter()
            .filter(|file| search.options.file_filter.matches(file))
            .collect();
        if filtered.is_empty() {
            return;
        }
        if !search.options.response_filter.admits(
            free_upload_slots,
            upload_speed,
            queue_length,
            filtered.len(),
        ) {
            return;
        }

        *search.last_response.lock().await = Instant::now();
        let mut results = search.results.lock().await;
        results.push(SearchResultEntry {
            username: username.clone(),
            files: filtered.clone(),
            free_upload_slots,
            upload_speed,
            queue_length,
        });
        let reached_cap = search
            .options
            .response_cap
            .map_or(false, |cap| results.len() >= cap);
        drop(results);

        self.sink
            .on_event(Event::SearchResponseReceived {
                token,
                username,
                files: filtered,
                free_upload_slots,
                upload_speed,
            })
            .await;

        if reached_cap {
            self.complete(token, SearchCompletionReason::ResponseCapReached).await;
        }
    }

    pub fn cancel(&self, token: u32) {
        if let Some(search) = self.active.get(&token) {
            search.cancellation.cancel();
        }
    }

    async fn complete(&self, token: u32, reason: SearchCompletionReason) {
        let Some((_, search)) = self.active.remove(&token) else {
            return;
        };
        if search.completed.swap(COMPLETED, Ordering::SeqCst) == COMPLETED {
            return;
        }
        let result_count = search.results.lock().await.len();
        self.sink
            .on_event(Event::SearchStateChanged {
                token,
                reason: Some(reason),
                result_count,
            })
            .await;
    }

    pub async fn results(&self, token: u32) -> Vec<SearchResultEntry> {
        match self.active.get(&token) {
            Some(search) => search.results.lock().await.clone(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::FileEntry;

    fn mp3(bitrate: u32, size: u64) -> FileEntry {
        FileEntry {
            name: "song.mp3".into(),
            size,
            extension: "mp3".into(),
            attributes: vec![(0, bitrate)],
        }
    }

    #[test]
    fn file_filter_rejects_excluded_extension() {
        let filter = FileFilter {
            excluded_extensions: vec!["mp3".into()],
            ..FileFilter::permissive()
        };
        assert!(!filter.matches(&mp3(320, 1_000_000)));
    }

    #[test]
    fn file_filter_enforces_minimum_bitrate() {
        let filter = FileFilter {
            min_bitrate: Some(256),
            ..FileFilter::permissive()
        };
        assert!(!filter.matches(&mp3(128, 1_000_000)));
        assert!(filter.matches(&mp3(320, 1_000_000)));
    }

    #[test]
    fn response_filter_enforces_minimum_free_slots() {
        let filter = ResponseFilter {
            min_free_upload_slots: 1,
            ..ResponseFilter::default()
        };
        assert!(!filter.admits(0, 1000, 0, 5));
        assert!(filter.admits(1, 1000, 0, 5));
    }

    #[tokio::test]
    async fn response_below_min_result_count_after_filtering_is_dropped() {
        let engine = SearchEngine::new(Arc::new(crate::events::TracingDiagnosticSink));
        struct NullServer;
        #[async_trait]
        impl SearchServerLink for NullServer {
            async fn file_search(&self, _token: u32, _query: &str) -> crate::error::SlskResult<()> {
                Ok(())
            }
            async fn room_search(&self, _room: &str, _token: u32, _query: &str) -> crate::error::SlskResult<()> {
                Ok(())
            }
            async fn user_search(&self, _username: &str, _token: u32, _query: &str) -> crate::error::SlskResult<()> {
                Ok(())
            }
            async fn wishlist_search(&self, _token: u32, _query: &str) -> crate::error::SlskResult<()> {
                Ok(())
            }
        }

        let mut options = SearchOptions::default();
        options.response_filter.min_result_count = 5;
        let _cancellation = engine
            .search(&NullServer, "foo", 1, Scope::Network, options)
            .await
            .unwrap();

        engine
            .handle_response(1, "bob".into(), vec![mp3(320, 1_000_000)], 1, 1000, 0)
            .await;
        assert!(engine.results(1).await.is_empty());
        engine.cancel(1);
    }
}
