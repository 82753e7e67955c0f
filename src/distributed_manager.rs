//! Distributed connection manager: parent selection across
//! concurrent candidates, child admission, and verbatim search-request
//! forwarding through the distributed tree.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;

use crate::codec::CodeWidth;
use crate::config::SearchResponseResolver;
use crate::connection::MessageConnection;
use crate::error::{SlskError, SlskResult};
use crate::messages::distributed::{
    BranchLevel, BranchRoot, ChildDepth, DistributedMessage, DistributedPayload, Ping,
    SearchRequest,
};
use crate::peer_manager::PeerManager;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct ParentState {
    connection: Arc<MessageConnection>,
    username: String,
    drive_task: tokio::task::JoinHandle<()>,
}

/// Owns the single active parent connection (if any), the set of admitted
/// children, and the branch-level/branch-root values learned from the
/// parent and propagated to children.
pub struct DistributedManager {
    self_username: String,
    peer_manager: Arc<PeerManager>,
    accept_children: bool,
    max_children: u32,
    search_resolver: Option<SearchResponseResolver>,
    parent: RwLock<Option<ParentState>>,
    children: DashMap<String, Arc<MessageConnection>>,
    child_depths: DashMap<String, u32>,
    branch_level: AtomicU32,
    branch_root: Mutex<Option<String>>,
    own_child_depth: AtomicU32,
    acquiring: Mutex<()>,
}

impl DistributedManager {
    pub fn new(
        self_username: String,
        peer_manager: Arc<PeerManager>,
        accept_children: bool,
        max_children: u32,
        search_resolver: Option<SearchResponseResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_username,
            peer_manager,
            accept_children,
            max_children,
            search_resolver,
            parent: RwLock::new(None),
            children: DashMap::new(),
            child_depths: DashMap::new(),
            branch_level: AtomicU32::new(0),
            branch_root: Mutex::new(None),
            own_child_depth: AtomicU32::new(0),
            acquiring: Mutex::new(()),
        })
    }

    /// React to the server's `NetInfo` candidate list by racing parent
    /// attempts. Runs in the background; call sites don't await the
    /// outcome, they observe it through [`DistributedManager::has_parent`]
    /// or the emitted connection-state events.
    pub fn handle_net_info(self: &Arc<Self>, candidates: Vec<String>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.acquire_parent(candidates).await;
        });
    }

    pub async fn has_parent(&self) -> bool {
        self.parent.read().await.is_some()
    }

    /// Attempt every candidate concurrently; the first to complete the
    /// distributed handshake and deliver a `BranchRoot` becomes the single
    /// active parent. Losing attempts are aborted by `JoinSet::abort_all`.
    /// Only one acquisition runs at a time per manager.
    async fn acquire_parent(self: &Arc<Self>, candidates: Vec<String>) {
        let _guard = self.acquiring.lock().await;
        if self.has_parent().await {
            return;
        }

        let mut attempts = JoinSet::new();
        for candidate in candidates {
            let this = self.clone();
            attempts.spawn(async move { this.attempt_parent(candidate).await });
        }

        let mut winner = None;
        while let Some(result) = attempts.join_next().await {
            match result {
                Ok(Ok(handshake)) => {
                    winner = Some(handshake);
                    break;
                }
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "distributed parent candidate failed");
                }
                Err(_) => {}
            }
        }
        attempts.abort_all();

        match winner {
            Some((username, connection, level, root)) => {
                self.adopt_parent(username, connection, level, root).await;
            }
            None => {
                tracing::warn!("no distributed parent candidate succeeded");
            }
        }
    }

    async fn attempt_parent(
        self: &Arc<Self>,
        candidate: String,
    ) -> SlskResult<(String, Arc<MessageConnection>, u32, String)> {
        let raw = self
            .peer_manager
            .establish_distributed_connection(&candidate)
            .await?;
        let connection = Arc::new(MessageConnection::spawn(raw, CodeWidth::Narrow, None));
        let mut frames = connection.subscribe();

        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let mut level = 0u32;
            loop {
                let frame = frames
                    .recv()
                    .await
                    .map_err(|_| SlskError::ConnectionTimeout)?;
                match DistributedMessage::decode(&frame)? {
                    Some(DistributedMessage::BranchLevel(b)) => level = b.level,
                    Some(DistributedMessage::BranchRoot(root)) => return Ok((level, root.username)),
                    _ => {}
                }
            }
        })
        .await
        .map_err(|_| SlskError::ConnectionTimeout)??;

        Ok((candidate, connection, handshake.0, handshake.1))
    }

    async fn adopt_parent(
        self: &Arc<Self>,
        username: String,
        connection: Arc<MessageConnection>,
        level: u32,
        root: String,
    ) {
        self.branch_level.store(level, Ordering::SeqCst);
        *self.branch_root.lock().await = Some(root);

        let this = self.clone();
        let driven = connection.clone();
        let drive_task = tokio::spawn(async move { this.drive_parent(driven).await });

        let mut parent = self.parent.write().await;
        *parent = Some(ParentState {
            connection,
            username,
            drive_task,
        });
    }

    /// Continuously read frames from the parent, forwarding search
    /// requests to every child and updating branch state as it changes.
    async fn drive_parent(self: Arc<Self>, connection: Arc<MessageConnection>) {
        let mut frames = connection.subscribe();
        loop {
            let frame = match frames.recv().await {
                Ok(frame) => frame,
                Err(_) => {
                    self.handle_parent_lost().await;
                    return;
                }
            };

            match DistributedMessage::decode(&frame) {
                Ok(Some(DistributedMessage::SearchRequest(request))) => {
                    self.handle_search_request(request).await;
                }
                Ok(Some(DistributedMessage::BranchLevel(b))) => {
                    if self.branch_level.swap(b.level, Ordering::SeqCst) != b.level {
                        self.forward_to_children(&b.to_bytes()).await;
                    }
                }
                Ok(Some(DistributedMessage::BranchRoot(root))) => {
                    let changed = {
                        let mut guard = self.branch_root.lock().await;
                        let changed = guard.as_deref() != Some(root.username.as_str());
                        *guard = Some(root.username.clone());
                        changed
                    };
                    if changed {
                        self.forward_to_children(&root.to_bytes()).await;
                    }
                }
                Ok(Some(DistributedMessage::Ping(_))) | Ok(None) => {}
                Ok(Some(DistributedMessage::ChildDepth(_))) => {
                    tracing::debug!("unexpected ChildDepth from parent, ignoring");
                }
                Err(err) => tracing::warn!(error = %err, "failed to decode distributed frame from parent"),
            }
        }
    }

    async fn handle_parent_lost(&self) {
        tracing::warn!("distributed parent connection lost");
        self.parent.write().await.take();
    }

    /// Handle a distributed search request, whether it arrived from the
    /// active parent or the server's direct fallback delivery. Forwards to
    /// every child verbatim, then answers locally if the configured
    /// resolver matches.
    pub async fn handle_search_request(self: &Arc<Self>, request: SearchRequest) {
        self.forward_to_children(&request.to_bytes()).await;

        let Some(resolver) = &self.search_resolver else {
            return;
        };
        let Some(response) = resolver(&request.username, request.token, &request.query) else {
            return;
        };

        match self
            .peer_manager
            .get_or_add_message_connection(&request.username)
            .await
        {
            Ok(connection) => {
                if let Err(err) = connection.write(&response.to_bytes()).await {
                    tracing::warn!(error = %err, username = %request.username, "failed to deliver distributed search response");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, username = %request.username, "failed to reach searcher for distributed response");
            }
        }
    }

    async fn forward_to_children(&self, bytes: &[u8]) {
        for entry in self.children.iter() {
            if let Err(err) = entry.value().write(bytes).await {
                tracing::warn!(error = %err, username = %entry.key(), "failed to forward to distributed child");
            }
        }
    }

    /// Admit a new child, provided `accept_children` is set and admission
    /// is within `max_children`, pushing current branch state so it starts
    /// in sync with the rest of the tree. Rejected children are
    /// disconnected without ever seeing that push.
    pub async fn add_child(self: &Arc<Self>, username: String, connection: Arc<MessageConnection>) {
        if !self.accept_children {
            tracing::debug!(username, "rejecting distributed child, children not accepted");
            connection
                .disconnect(crate::error::DisconnectReason::Requested)
                .await;
            return;
        }
        if self.children.len() as u32 >= self.max_children {
            tracing::debug!(username, "rejecting distributed child, at capacity");
            connection
                .disconnect(crate::error::DisconnectReason::Requested)
                .await;
            return;
        }

        let level = self.branch_level.load(Ordering::SeqCst);
        if let Err(err) = connection.write(&BranchLevel { level }.to_bytes()).await {
            tracing::warn!(error = %err, "failed to push branch level to new child");
        }
        if let Some(root) = self.branch_root.lock().await.clone() {
            if let Err(err) = connection.write(&BranchRoot { username: root }.to_bytes()).await {
                tracing::warn!(error = %err, "failed to push branch root to new child");
            }
        }

        self.children.insert(username.clone(), connection.clone());

        let this = self.clone();
        tokio::spawn(async move { this.drive_child(username, connection).await });
    }

    pub fn remove_child(&self, username: &str) {
        self.children.remove(username);
        self.child_depths.remove(username);
    }

    async fn drive_child(self: Arc<Self>, username: String, connection: Arc<MessageConnection>) {
        let mut frames = connection.subscribe();
        loop {
            let frame = match frames.recv().await {
                Ok(frame) => frame,
                Err(_) => {
                    self.remove_child(&username);
                    return;
                }
            };

            match DistributedMessage::decode(&frame) {
                Ok(Some(DistributedMessage::ChildDepth(depth))) => {
                    self.child_depths.insert(username.clone(), depth.depth);
                    self.recompute_and_propagate_child_depth().await;
                }
                Ok(Some(DistributedMessage::Ping(_))) | Ok(None) => {}
                Ok(Some(_)) => tracing::debug!(username, "unexpected message from distributed child"),
                Err(err) => tracing::warn!(error = %err, username, "failed to decode distributed frame from child"),
            }
        }
    }

    async fn recompute_and_propagate_child_depth(&self) {
        let max_child_depth = self.child_depths.iter().map(|entry| *entry.value()).max();
        let own_depth = max_child_depth.map(|d| d + 1).unwrap_or(0);
        if self.own_child_depth.swap(own_depth, Ordering::SeqCst) == own_depth {
            return;
        }

        if let Some(parent) = self.parent.read().await.as_ref() {
            if let Err(err) = parent
                .connection
                .write(&ChildDepth { depth: own_depth }.to_bytes())
                .await
            {
                tracing::warn!(error = %err, "failed to propagate child depth to parent");
            }
        }
    }

    pub async fn send_ping_to_parent(&self) {
        if let Some(parent) = self.parent.read().await.as_ref() {
            let _ = parent.connection.write(&Ping.to_bytes()).await;
        }
    }
}

impl Drop for ParentState {
    fn drop(&mut self) {
        self.drive_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_depth_recompute_is_one_plus_max() {
        let depths: std::collections::HashMap<&str, u32> = [("a", 2), ("b", 5)].into_iter().collect();
        let max = depths.values().copied().max().unwrap();
        assert_eq!(max + 1, 6);
    }
}
