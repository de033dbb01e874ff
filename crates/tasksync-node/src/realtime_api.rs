//! WebSocket endpoint and real-time statistics.
//!
//! - `/ws`: authenticated sync connection
//! - `/api/realtime/stats`: hub counters
//!
//! The credential is checked before the upgrade: a `token` query parameter,
//! or an `Authorization: Bearer` header. A refused handshake gets a JSON
//! error and never becomes a socket. The device class comes from the
//! `device` query parameter, falling back to the user agent.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{
        header::{AUTHORIZATION, USER_AGENT},
        HeaderMap,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tasksync_auth::extract_credential;
use tasksync_realtime::{Session, SyncHub};
use tasksync_types::{DeviceClass, Transport};
use tracing::{debug, info, warn};

use crate::api::{ApiError, AppState};

/// Create the real-time API routes.
pub fn realtime_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/realtime/stats", get(get_stats))
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
    device: Option<DeviceClass>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let credential = extract_credential(params.token.as_deref(), authorization);
    let device = params.device.unwrap_or_else(|| {
        headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(DeviceClass::from_user_agent)
            .unwrap_or_default()
    });

    let session = state
        .hub
        .connect(credential, Transport::WebSocket, device)
        .await?;

    // If the upgrade never completes the session is dropped with the
    // closure, which disconnects it.
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, session)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<SyncHub>, session: Session) {
    let Session {
        guard,
        mut receiver,
    } = session;
    let connection = guard.connection().clone();
    let client_id = connection.id.clone();
    info!(client_id = %client_id, user_id = %connection.user_id, "WebSocket session opened");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_client_id = client_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = receiver.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        debug!(client_id = %send_client_id, "Send task ended");
    });

    // Frames from one connection are handled in arrival order.
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                hub.handle_text(&connection, text.as_str()).await;
            }
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    hub.handle_text(&connection, text).await;
                }
                Err(_) => debug!(client_id = %client_id, "Non-UTF-8 binary frame ignored"),
            },
            Ok(Message::Close(_)) => {
                debug!(client_id = %client_id, "WebSocket close received");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    send_task.abort();
    drop(guard);
    info!(client_id = %client_id, "WebSocket session closed");
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.stats())
}
