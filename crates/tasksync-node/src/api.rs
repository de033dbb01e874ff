//! HTTP surface of the node: shared state, router and error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tasksync_auth::AuthError;
use tasksync_realtime::{RealtimeError, SyncHub};
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::health::{health_routes, HealthState};
use crate::observability::request_id_middleware;
use crate::realtime_api::realtime_routes;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Sync hub of this node.
    pub hub: Arc<SyncHub>,
    /// Probe state.
    pub health: HealthState,
}

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Unauthorized(AuthError),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RealtimeError> for ApiError {
    fn from(e: RealtimeError) -> Self {
        match e {
            RealtimeError::Auth(auth) => match auth {
                AuthError::InvalidKey(_) | AuthError::Serialization(_) => {
                    ApiError::Internal(auth.to_string())
                }
                auth => ApiError::Unauthorized(auth),
            },
            limit @ RealtimeError::ConnectionLimit(_) => ApiError::Unavailable(limit.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(auth) => auth.code(),
            ApiError::Unavailable(_) => "UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            code: self.code(),
            error: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    code: &'static str,
    error: String,
}

/// Build the full router: real-time endpoints, probes and tracing layers.
pub fn create_router(state: AppState) -> Router {
    let health = state.health.clone();
    Router::new()
        .merge(realtime_routes())
        .merge(health_routes::<AppState>(health))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}
