//! Node bootstrap: build the hub from configuration and serve it.

use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tasksync_auth::{AuthError, ConnectionAuthenticator, Ed25519Verifier, MemoryDirectory};
use tasksync_realtime::{
    BridgeError, CrossNodeBridge, MemoryBackend, MemoryPubSub, MqttPubSub, PubSub, RealtimeError,
    SyncHub,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{create_router, AppState};
use crate::config::{BridgeKind, ConfigError, NodeConfig};
use crate::health::HealthState;

/// Startup and serving failures.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running sync node.
pub struct SyncNode {
    state: AppState,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncNode {
    /// Start a node with the pub/sub transport named in the configuration.
    pub async fn start(config: &NodeConfig) -> Result<Self, NodeError> {
        let node_id = config.node_id();
        let pubsub: Arc<dyn PubSub> = match config.bridge.kind {
            BridgeKind::Memory => Arc::new(MemoryPubSub::new()),
            BridgeKind::Mqtt => Arc::new(MqttPubSub::connect(config.mqtt_config(&node_id))?),
        };
        Self::start_with(config, node_id, pubsub).await
    }

    /// Start a node on an existing pub/sub transport.
    ///
    /// Nodes built in one process on clones of the same [`MemoryPubSub`]
    /// form a cluster.
    pub async fn start_with(
        config: &NodeConfig,
        node_id: String,
        pubsub: Arc<dyn PubSub>,
    ) -> Result<Self, NodeError> {
        config.check()?;

        let verifier = Ed25519Verifier::from_hex(&config.auth.verification_key)?;
        let directory = MemoryDirectory::new();
        for user in &config.auth.users {
            directory.insert_active(user);
        }
        let authenticator = ConnectionAuthenticator::new(Arc::new(verifier), Arc::new(directory));

        let bridge = Arc::new(CrossNodeBridge::new(node_id.clone(), pubsub));
        let hub = SyncHub::new(
            config.hub_config(node_id.clone()),
            authenticator,
            Arc::new(MemoryBackend::new()),
            Some(bridge),
        );
        let tasks = hub.start().await?;

        let health = HealthState::new(hub.clone());
        health.set_startup_complete(true);

        info!(
            node_id = %node_id,
            bridge = ?config.bridge.kind,
            users = config.auth.users.len(),
            "Sync node started"
        );

        Ok(Self {
            state: AppState { hub, health },
            tasks,
        })
    }

    /// The node's hub.
    pub fn hub(&self) -> &Arc<SyncHub> {
        &self.state.hub
    }

    /// Probe state.
    pub fn health(&self) -> &HealthState {
        &self.state.health
    }

    /// HTTP router serving this node.
    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Serve on `listener` until `shutdown` resolves, then stop background
    /// work.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), NodeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Listening");

        let health = self.state.health.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                health.set_startup_complete(false);
            })
            .await?;

        self.stop();
        Ok(())
    }

    /// Abort background tasks.
    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
        info!(node_id = %self.state.hub.node_id(), "Sync node stopped");
    }
}
