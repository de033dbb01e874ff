//! # Health Checks
//!
//! Probes for orchestrators:
//!
//! - **Liveness**: the process is running
//! - **Readiness**: startup finished and the sync hub can take connections
//!   (its bridge, when configured, is subscribed)
//! - **Startup**: initial startup completed
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tasksync_node::health::{health_routes, HealthState};
//!
//! let health = HealthState::new(hub.clone());
//! health.set_startup_complete(true);
//!
//! let app: axum::Router<()> = axum::Router::new().merge(health_routes(health));
//! ```

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tasksync_realtime::SyncHub;

/// Health status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
    /// Not configured, or not observable.
    Unknown,
}

/// Individual component health.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Liveness probe response.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessResponse {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
}

/// Readiness component checks.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessChecks {
    /// Connection handling on this node.
    pub realtime: ComponentHealth,
    /// Cross-node pub/sub.
    pub bridge: ComponentHealth,
}

/// Readiness probe response.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    pub checks: ReadinessChecks,
}

/// Overall health response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub node_id: String,
    pub uptime_seconds: u64,
    pub checks: ReadinessChecks,
}

/// Shared health state.
#[derive(Clone)]
pub struct HealthState {
    start_time: Instant,
    startup_complete: Arc<AtomicBool>,
    hub: Arc<SyncHub>,
}

impl HealthState {
    /// Track the health of `hub`.
    pub fn new(hub: Arc<SyncHub>) -> Self {
        Self {
            start_time: Instant::now(),
            startup_complete: Arc::new(AtomicBool::new(false)),
            hub,
        }
    }

    /// Uptime in seconds.
    pub fn uptime(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Mark startup as complete.
    pub fn set_startup_complete(&self, complete: bool) {
        self.startup_complete.store(complete, Ordering::SeqCst);
    }

    /// Check if startup is complete.
    pub fn is_startup_complete(&self) -> bool {
        self.startup_complete.load(Ordering::SeqCst)
    }

    /// Ready to accept connections.
    pub fn is_ready(&self) -> bool {
        self.is_startup_complete() && self.hub.is_ready()
    }

    fn checks(&self) -> ReadinessChecks {
        let stats = self.hub.stats();
        let realtime = ComponentHealth {
            status: if self.is_startup_complete() {
                HealthStatus::Up
            } else {
                HealthStatus::Down
            },
            details: Some(serde_json::json!({
                "connections": stats.connections,
                "users_online": stats.users_online,
            })),
        };

        let bridge = match stats.bridge {
            None => ComponentHealth {
                status: HealthStatus::Unknown,
                details: Some(serde_json::json!({ "reason": "bridge not configured" })),
            },
            Some(bridge) => ComponentHealth {
                status: if self.hub.is_ready() {
                    HealthStatus::Up
                } else {
                    HealthStatus::Down
                },
                details: Some(serde_json::json!({
                    "published": bridge.published,
                    "received": bridge.received,
                    "publish_failed": bridge.publish_failed,
                    "dropped": bridge.dropped,
                })),
            },
        };

        ReadinessChecks { realtime, bridge }
    }
}

/// Create health check routes.
pub fn health_routes<S>(state: HealthState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/health/startup", get(startup_handler))
        .with_state(state)
}

fn status_code(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Up => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn health_handler(State(state): State<HealthState>) -> Response {
    let status = if state.is_ready() {
        HealthStatus::Up
    } else {
        HealthStatus::Down
    };
    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: state.hub.node_id().to_string(),
        uptime_seconds: state.uptime(),
        checks: state.checks(),
    };

    (status_code(status), Json(response)).into_response()
}

async fn liveness_handler(State(state): State<HealthState>) -> Response {
    let response = LivenessResponse {
        status: HealthStatus::Up,
        uptime_seconds: state.uptime(),
    };

    (StatusCode::OK, Json(response)).into_response()
}

async fn readiness_handler(State(state): State<HealthState>) -> Response {
    let status = if state.is_ready() {
        HealthStatus::Up
    } else {
        HealthStatus::Down
    };
    let response = ReadinessResponse {
        status,
        checks: state.checks(),
    };

    (status_code(status), Json(response)).into_response()
}

async fn startup_handler(State(state): State<HealthState>) -> Response {
    let status = if state.is_startup_complete() {
        HealthStatus::Up
    } else {
        HealthStatus::Down
    };
    (status_code(status), Json(serde_json::json!({ "status": status }))).into_response()
}
