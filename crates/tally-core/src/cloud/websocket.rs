//! WebSocket backend for automerge-repo-sync-server
//!
//! ## Protocol
//!
//! 1. Connect via WebSocket
//! 2. Send peer ID (join) and wait for the server's peer message
//! 3. Exchange Automerge sync messages for the container document
//! 4. Apply received changes
//!
//! Each call opens its own connection; there is no long-lived session.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use automerge::sync::{Message as SyncMessage, SyncDoc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::message::{ClientMessage, PeerId, ServerMessage};
use super::state::PeerSyncStates;
use super::{
    AttachRequest, CloudBackend, CloudError, CloudEvent, SessionKind, SyncReport,
    EVENT_CHANNEL_CAPACITY,
};
use crate::document::StoreDocument;
use crate::store_id::StoreId;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = SplitSink<Socket, Message>;
type Reader = SplitStream<Socket>;

/// Handshake deadline
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the sync exchange after the handshake
const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend talking to an automerge-repo sync server
pub struct WebSocketBackend {
    url: String,
    peer_id: PeerId,
    sync_state: Mutex<PeerSyncStates>,
    events: broadcast::Sender<CloudEvent>,
}

impl WebSocketBackend {
    /// Create a backend for the given server URL
    pub fn new(url: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let peer_id = format!("tally-{}", &uuid::Uuid::new_v4().to_string()[..8]);

        Self {
            url: url.to_string(),
            peer_id,
            sync_state: Mutex::new(PeerSyncStates::new()),
            events,
        }
    }

    /// Persist peer sync state at `path`
    pub fn with_state_path(mut self, path: PathBuf) -> Result<Self> {
        self.sync_state = Mutex::new(PeerSyncStates::with_path(path)?);
        Ok(self)
    }

    /// Our peer ID
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    fn emit(&self, event: CloudEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn connect(&self) -> Result<Socket, CloudError> {
        debug!(url = %self.url, "Connecting to sync server");
        let connecting = connect_async(self.url.as_str());
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => Err(CloudError::Connection(format!("{}: {}", self.url, e))),
            Err(_) => Err(CloudError::Timeout(format!(
                "connecting to {}. Check server is running.",
                self.url
            ))),
        }
    }

    /// Send join and wait for the server's peer ID
    async fn handshake(&self, write: &mut Writer, read: &mut Reader) -> Result<PeerId, CloudError> {
        send(write, &ClientMessage::join(&self.peer_id)).await?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.handshake_timeout());
            }

            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                        Ok(ServerMessage::Peer { sender_id, .. }) => {
                            debug!(server_peer = %sender_id, "Handshake complete");
                            return Ok(sender_id);
                        }
                        Ok(ServerMessage::Error { message, .. }) => {
                            return Err(CloudError::Rejected(message));
                        }
                        // Other messages are not expected before the peer reply
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Ignoring undecodable message during handshake"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(CloudError::Connection(format!(
                            "sync server ({}) closed connection during handshake",
                            self.url
                        )));
                    }
                    Some(Err(e)) => {
                        return Err(CloudError::Connection(format!("{}: {}", self.url, e)));
                    }
                    Some(Ok(_)) => {}
                },
                _ = tokio::time::sleep(remaining) => return Err(self.handshake_timeout()),
            }
        }
    }

    fn handshake_timeout(&self) -> CloudError {
        CloudError::Timeout(format!(
            "waiting for sync server response ({}). Check server is running.",
            self.url
        ))
    }

    /// Run the sync exchange for one container
    async fn exchange(
        &self,
        container: &StoreId,
        doc: &mut StoreDocument,
    ) -> Result<SyncReport, CloudError> {
        let (mut write, mut read) = self.connect().await?.split();
        let server_peer = self.handshake(&mut write, &mut read).await?;

        let mut states = self.sync_state.lock().await;

        if let Some(sync_msg) = doc
            .inner_mut()
            .sync()
            .generate_sync_message(states.get_or_create(&server_peer))
        {
            let request =
                ClientMessage::request(&self.peer_id, &server_peer, container, sync_msg.encode());
            send(&mut write, &request).await?;
        }

        let mut remote_changes = false;
        let expected_id = container.to_bs58check();
        let deadline = Instant::now() + SYNC_TIMEOUT;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("Sync exchange reached its deadline");
                break;
            }

            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                        Ok(msg) if msg.document_id().is_some_and(|id| id != expected_id) => {
                            debug!(document = ?msg.document_id(), "Ignoring message for another document");
                        }
                        Ok(ServerMessage::Sync { sender_id, data, .. }) => {
                            let Ok(sync_msg) = SyncMessage::decode(&data) else {
                                warn!(peer = %sender_id, "Ignoring undecodable sync message");
                                continue;
                            };
                            let peer_state = states.get_or_create(&sender_id);
                            let before = doc.inner_mut().get_heads();
                            doc.inner_mut()
                                .sync()
                                .receive_sync_message(peer_state, sync_msg)
                                .map_err(|e| CloudError::Document(e.to_string()))?;
                            if doc.inner_mut().get_heads() != before {
                                remote_changes = true;
                            }

                            match doc.inner_mut().sync().generate_sync_message(peer_state) {
                                Some(reply) => {
                                    let msg = ClientMessage::sync(
                                        &self.peer_id,
                                        &sender_id,
                                        container,
                                        reply.encode(),
                                    );
                                    send(&mut write, &msg).await?;
                                }
                                // Nothing left to send, both sides agree
                                None => break,
                            }
                        }
                        Ok(ServerMessage::DocUnavailable { .. }) => {
                            // Not on the server yet, upload it
                            if let Some(sync_msg) = doc
                                .inner_mut()
                                .sync()
                                .generate_sync_message(states.get_or_create(&server_peer))
                            {
                                let msg = ClientMessage::sync(
                                    &self.peer_id,
                                    &server_peer,
                                    container,
                                    sync_msg.encode(),
                                );
                                send(&mut write, &msg).await?;
                            }
                        }
                        Ok(ServerMessage::Error { message, .. }) => {
                            return Err(CloudError::Rejected(message));
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Ignoring undecodable message"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => return Err(CloudError::Connection(e.to_string())),
                    Some(Ok(_)) => {}
                },
                _ = tokio::time::sleep(remaining) => break,
            }
        }

        if let Err(e) = states.save() {
            warn!(error = %e, "Failed to save sync state");
        }
        let _ = write.close().await;

        Ok(SyncReport { remote_changes })
    }
}

async fn send(write: &mut Writer, msg: &ClientMessage) -> Result<(), CloudError> {
    write
        .send(Message::Binary(msg.encode()?))
        .await
        .map_err(|e| CloudError::Connection(e.to_string()))
}

#[async_trait]
impl CloudBackend for WebSocketBackend {
    async fn attach(&self, request: &AttachRequest) -> Result<(), CloudError> {
        self.emit(CloudEvent::SessionStarted(SessionKind::Setup));

        let result = async {
            let (mut write, mut read) = self.connect().await?.split();
            self.handshake(&mut write, &mut read).await?;
            let _ = write.close().await;
            Ok::<(), CloudError>(())
        }
        .await;

        match &result {
            Ok(()) => info!(
                url = %self.url,
                container = %request.container,
                "Attached to sync server"
            ),
            Err(e) => warn!(url = %self.url, error = %e, "Attach failed"),
        }
        self.emit(CloudEvent::SessionEnded(
            SessionKind::Setup,
            result.as_ref().err().cloned(),
        ));
        result
    }

    async fn sync(
        &self,
        container: &StoreId,
        doc: &mut StoreDocument,
    ) -> Result<SyncReport, CloudError> {
        info!(url = %self.url, container = %container, "Starting sync");
        self.emit(CloudEvent::SessionStarted(SessionKind::Export));

        let result = self.exchange(container, doc).await;

        match &result {
            Ok(report) => info!(remote_changes = report.remote_changes, "Sync complete"),
            Err(e) => warn!(error = %e, "Sync failed"),
        }
        self.emit(CloudEvent::SessionEnded(
            SessionKind::Export,
            result.as_ref().err().cloned(),
        ));
        result
    }

    fn subscribe(&self) -> broadcast::Receiver<CloudEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_backend() {
        let backend = WebSocketBackend::new("ws://localhost:3030");
        assert!(backend.peer_id().starts_with("tally-"));
        assert_eq!(backend.url(), "ws://localhost:3030");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        // Port 9 (discard) is closed on test machines
        let backend = WebSocketBackend::new("ws://127.0.0.1:9");
        let mut events = backend.subscribe();
        let request = AttachRequest {
            container: StoreId::new(),
            store_id: StoreId::new(),
            schema_version: 2,
            record_count: 0,
        };

        let err = backend.attach(&request).await.unwrap_err();
        assert!(matches!(
            err,
            CloudError::Connection(_) | CloudError::Timeout(_)
        ));

        assert_eq!(
            events.recv().await.unwrap(),
            CloudEvent::SessionStarted(SessionKind::Setup)
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            CloudEvent::SessionEnded(SessionKind::Setup, Some(_))
        ));
    }
}
