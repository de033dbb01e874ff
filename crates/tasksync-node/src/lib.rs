//! # TaskSync Node
//!
//! HTTP/WebSocket server hosting one [`SyncHub`](tasksync_realtime::SyncHub).
//!
//! ## Endpoints
//!
//! | Path | Purpose |
//! |------|---------|
//! | `GET /ws?token=...&device=...` | Sync connection |
//! | `GET /api/realtime/stats` | Hub counters |
//! | `GET /health`, `/health/live`, `/health/ready`, `/health/startup` | Probes |
//!
//! ## Architecture
//!
//! ```text
//!            ┌────────────────── tasksync-node ──────────────────┐
//!  client ──►│ /ws ─► handshake auth ─► SyncHub ◄─► CrossNodeBridge│◄──► memory / MQTT
//!            │                             │                      │
//!            │ /health ◄── HealthState ◄───┘                      │
//!            └────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use tasksync_node::{config::NodeConfig, SyncNode};
//!
//! # async fn run() -> Result<(), tasksync_node::NodeError> {
//! let config = NodeConfig::load(Some("tasksync.yaml".as_ref()))?;
//! let node = SyncNode::start(&config).await?;
//! let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
//! node.serve(listener, async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod health;
pub mod node;
pub mod observability;
pub mod realtime_api;

pub use api::{create_router, ApiError, AppState};
pub use config::{ConfigError, NodeConfig};
pub use node::{NodeError, SyncNode};
