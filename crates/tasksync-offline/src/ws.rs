//! WebSocket client for the sync server.
//!
//! One writer task drains an outgoing channel into the socket; one reader
//! task routes acks to the waiting request and pushes events to the
//! application.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasksync_realtime::{AckReply, ClientOperation, MutationRequest, OutboundEvent, ServerFrame};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{OfflineError, Result};
use crate::retry::RetryPolicy;
use crate::transport::{SendError, SyncTransport};

/// Default time to wait for an ack.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<AckReply>>>>;

/// Receives events pushed by the server.
pub type EventReceiver = mpsc::UnboundedReceiver<OutboundEvent>;

/// An authenticated connection to a sync node.
pub struct WsClient {
    outgoing: mpsc::UnboundedSender<String>,
    pending: PendingAcks,
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl WsClient {
    /// Connect to `url` (e.g. `ws://host:8080/ws`) presenting `token` as a
    /// bearer credential.
    pub async fn connect(url: &str, token: &str) -> Result<(Self, EventReceiver)> {
        let mut request = url
            .into_client_request()
            .map_err(|e| OfflineError::Transport(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| OfflineError::Transport(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| OfflineError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // Writer: outgoing channel -> socket
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader: socket -> acks and events
        let reader_pending = pending.clone();
        let reader_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerFrame>(text.as_str()) {
                            Ok(ServerFrame::Ack(ack)) => {
                                let waiter = ack
                                    .id
                                    .as_ref()
                                    .and_then(|id| reader_pending.lock().remove(id));
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(ack);
                                    }
                                    None => debug!(id = ?ack.id, "Ack without a waiting request"),
                                }
                            }
                            Ok(ServerFrame::Event(event)) => {
                                let _ = event_tx.send(event);
                            }
                            Err(e) => warn!(error = %e, "Unreadable server frame"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            // Dropping the senders fails every outstanding request.
            reader_pending.lock().clear();
            info!("Disconnected from sync server");
        });

        info!(url = %url, "Connected to sync server");
        Ok((
            Self {
                outgoing: out_tx,
                pending,
                connected,
                next_id: AtomicU64::new(1),
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
            },
            event_rx,
        ))
    }

    /// Connect, retrying with backoff.
    pub async fn connect_with_retry(
        url: &str,
        token: &str,
        policy: &RetryPolicy,
    ) -> Result<(Self, EventReceiver)> {
        policy.execute(|| Self::connect(url, token)).await
    }

    /// Change how long a request waits for its ack.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Whether the socket is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send an operation and wait for its ack.
    pub async fn request(&self, op: ClientOperation) -> Result<AckReply> {
        if !self.is_connected() {
            return Err(OfflineError::Transport("not connected".to_string()));
        }
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let text = serde_json::to_string(&op.to_frame(Some(id.clone())))
            .map_err(|e| OfflineError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        if self.outgoing.send(text).is_err() {
            self.pending.lock().remove(&id);
            return Err(OfflineError::Transport("connection closed".to_string()));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(OfflineError::Transport("connection closed".to_string())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(OfflineError::Timeout)
            }
        }
    }
}

#[async_trait]
impl SyncTransport for WsClient {
    async fn send(&self, request: &MutationRequest) -> std::result::Result<Value, SendError> {
        match self.request(ClientOperation::Mutate(request.clone())).await {
            Ok(ack) if ack.success => Ok(ack.data.unwrap_or(Value::Null)),
            Ok(ack) => Err(SendError::from_ack(ack)),
            Err(e) => Err(SendError::Retriable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Port 1 is never a sync server.
        let err = WsClient::connect("ws://127.0.0.1:1/ws", "token")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OfflineError::Transport(_)));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        assert!(matches!(
            WsClient::connect("not a url", "token").await.err(),
            Some(OfflineError::Transport(_))
        ));
    }
}
