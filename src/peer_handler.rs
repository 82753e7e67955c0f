//! Peer handler: one instance shared across every peer message
//! connection. Spawns a dispatch loop per connection that answers
//! browse/info/folder-contents requests from the host-supplied resolvers,
//! feeds search responses into the [`SearchEngine`], and completes the
//! [`Waiter`] keys the transfer engine blocks on.
//!
//! Like [`crate::server_handler::ServerHandler`], each loop logs and
//! continues on a per-message decode failure rather than dropping the
//! connection.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{BrowseResolver, FolderContentsResolver, InfoResolver};
use crate::connection::MessageConnection;
use crate::error::{SlskError, TransferErrorKind};
use crate::events::{DiagnosticSink, Event};
use crate::messages::common::Directory;
use crate::messages::peer::{
    self, BrowseResponse, FolderContentsResponse, InfoResponse, PeerMessage, PeerPayload,
};
use crate::search::SearchEngine;
use crate::waiter::{WaitKey, Waiter};

pub struct PeerHandler {
    waiter: Arc<Waiter>,
    search_engine: Arc<SearchEngine>,
    sink: Arc<dyn DiagnosticSink>,
    browse_resolver: Option<BrowseResolver>,
    info_resolver: Option<InfoResolver>,
    folder_contents_resolver: Option<FolderContentsResolver>,
}

impl PeerHandler {
    pub fn new(
        waiter: Arc<Waiter>,
        search_engine: Arc<SearchEngine>,
        sink: Arc<dyn DiagnosticSink>,
        browse_resolver: Option<BrowseResolver>,
        info_resolver: Option<InfoResolver>,
        folder_contents_resolver: Option<FolderContentsResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            waiter,
            search_engine,
            sink,
            browse_resolver,
            info_resolver,
            folder_contents_resolver,
        })
    }

    /// Spawn the dispatch loop for one peer's message connection.
    pub fn spawn_for_connection(self: &Arc<Self>, username: String, connection: Arc<MessageConnection>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run(username, connection).await })
    }

    async fn run(self: Arc<Self>, username: String, connection: Arc<MessageConnection>) {
        let mut frames = connection.subscribe();
        loop {
            let frame = match frames.recv().await {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, username, "peer handler lagged behind the frame broadcast");
                    continue;
                }
            };

            match PeerMessage::decode(&frame) {
                Ok(Some(message)) => self.dispatch(&username, &connection, message).await,
                Ok(None) => tracing::debug!(code = frame.code, username, "unknown peer message code, dropping"),
                Err(err) => tracing::warn!(error = %err, username, "failed to decode peer message, continuing"),
            }
        }
    }

    async fn dispatch(&self, username: &str, connection: &Arc<MessageConnection>, message: PeerMessage) {
        match message {
            PeerMessage::BrowseRequest(_) => self.handle_browse_request(connection).await,
            PeerMessage::BrowseResponse(resp) => self.handle_browse_response(username, connection, resp).await,
            PeerMessage::SearchResponse(resp) => {
                self.search_engine
                    .handle_response(
                        resp.token,
                        resp.username,
                        resp.files,
                        resp.free_upload_slots,
                        resp.upload_speed,
                        resp.queue_length,
                    )
                    .await;
            }
            PeerMessage::InfoRequest(_) => self.handle_info_request(connection).await,
            PeerMessage::InfoResponse(resp) => {
                self.waiter
                    .complete(&WaitKey::for_user(peer::INFO_RESPONSE, username.to_string()), resp);
            }
            PeerMessage::FolderContentsRequest(req) => self.handle_folder_contents_request(connection, req).await,
            PeerMessage::FolderContentsResponse(resp) => {
                self.waiter
                    .complete(&WaitKey::for_token(peer::FOLDER_CONTENTS_RESPONSE, resp.token), resp);
            }
            PeerMessage::TransferRequest(req) => {
                self.waiter
                    .complete(&WaitKey::for_user(peer::TRANSFER_REQUEST, username.to_string()), req);
            }
            PeerMessage::TransferResponse(resp) => {
                self.waiter
                    .complete(&WaitKey::for_token(peer::TRANSFER_RESPONSE, resp.token), resp);
            }
            PeerMessage::QueueDownload(msg) => {
                self.sink
                    .on_event(Event::UploadRequested {
                        username: username.to_string(),
                        filename: msg.filename.clone(),
                    })
                    .await;
                self.waiter
                    .complete(&WaitKey::for_user(peer::QUEUE_DOWNLOAD, username.to_string()), msg);
            }
            PeerMessage::UploadFailed(msg) => {
                tracing::debug!(username, filename = %msg.filename, "upload failed as reported by peer");
                self.waiter.throw(
                    &WaitKey::for_user(peer::TRANSFER_REQUEST, username.to_string()),
                    SlskError::Transfer {
                        kind: TransferErrorKind::RemoteRejected(format!(
                            "upload failed for {}",
                            msg.filename
                        )),
                    },
                );
            }
            PeerMessage::QueueFailed(msg) => {
                tracing::debug!(username, filename = %msg.filename, reason = %msg.message, "queue request failed");
                self.waiter.throw(
                    &WaitKey::for_user(peer::TRANSFER_REQUEST, username.to_string()),
                    SlskError::Transfer {
                        kind: TransferErrorKind::QueueFailed(msg.message.clone()),
                    },
                );
            }
            PeerMessage::PlaceInQueueRequest(req) => {
                tracing::debug!(username, filename = %req.filename, "peer asked for queue position, no resolver configured");
            }
            PeerMessage::PlaceInQueueResponse(resp) => {
                tracing::debug!(username, filename = %resp.filename, place = resp.place, "received queue position");
            }
        }
    }

    async fn handle_browse_request(&self, connection: &Arc<MessageConnection>) {
        let directories: Vec<Directory> = match &self.browse_resolver {
            Some(resolver) => resolver(),
            None => Vec::new(),
        };
        let response = BrowseResponse { directories };
        if let Err(err) = connection.write(&response.to_bytes()).await {
            tracing::warn!(error = %err, "failed to send browse response");
        }
    }

    async fn handle_browse_response(&self, username: &str, _connection: &Arc<MessageConnection>, resp: BrowseResponse) {
        self.sink
            .on_event(Event::BrowseProgressUpdated {
                username: username.to_string(),
                directories_received: resp.directories.len(),
            })
            .await;
        self.waiter
            .complete(&WaitKey::for_user(peer::BROWSE_RESPONSE, username.to_string()), resp);
    }

    async fn handle_info_request(&self, connection: &Arc<MessageConnection>) {
        let Some(resolver) = &self.info_resolver else {
            return;
        };
        let response: InfoResponse = resolver();
        if let Err(err) = connection.write(&response.to_bytes()).await {
            tracing::warn!(error = %err, "failed to send info response");
        }
    }

    async fn handle_folder_contents_request(
        &self,
        connection: &Arc<MessageConnection>,
        req: crate::messages::peer::FolderContentsRequest,
    ) {
        let Some(resolver) = &self.folder_contents_resolver else {
            return;
        };
        let Some(files) = resolver(&req.folder) else {
            return;
        };
        let response = FolderContentsResponse {
            token: req.token,
            folder: req.folder,
            files,
        };
        if let Err(err) = connection.write(&response.to_bytes()).await {
            tracing::warn!(error = %err, "failed to send folder contents response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingDiagnosticSink;

    #[tokio::test]
    async fn constructs_without_resolvers() {
        let waiter = Waiter::new();
        let search_engine = SearchEngine::new(Arc::new(TracingDiagnosticSink));
        let handler = PeerHandler::new(waiter, search_engine, Arc::new(TracingDiagnosticSink), None, None, None);
        assert!(handler.browse_resolver.is_none());
    }
}
