//! Sync hub: the composition root for one node.
//!
//! Owns the connection lifecycle (authenticate, presence, join, leave)
//! and dispatches decoded client operations through a single match.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tasksync_auth::ConnectionAuthenticator;
use tasksync_types::{now_millis, DeviceClass, MutationVerb, ResourceKind, Transport, UserId};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{ActivityConfig, ActivityEvent, ActivityLog};
use crate::backend::{MutationBackend, MutationError};
use crate::bridge::{BridgeStats, CrossNodeBridge};
use crate::connection::{create_connection, Connection, ConnectionReceiver};
use crate::dispatcher::EventDispatcher;
use crate::error::RealtimeError;
use crate::event::OutboundEvent;
use crate::notification::Notification;
use crate::presence::{ExpiryReceiver, PresenceChange, PresenceConfig, PresenceTracker};
use crate::protocol::{AckReply, ClientFrame, ClientOperation, MutationRequest, ServerFrame};
use crate::router::RoomRouter;

/// Default maximum number of concurrent connections per node.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Activity entries returned when a connection subscribes to the feed.
const ACTIVITY_BACKFILL: usize = 20;

/// Node-level settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Identifies this node on the bridge.
    pub node_id: String,
    pub max_connections: usize,
    pub presence: PresenceConfig,
    pub activity: ActivityConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", uuid::Uuid::new_v4()),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            presence: PresenceConfig::default(),
            activity: ActivityConfig::default(),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubStats {
    pub node_id: String,
    /// Currently open connections on this node.
    pub connections: usize,
    /// Users with at least one connection on this node.
    pub connected_users: usize,
    /// Users whose effective presence is not offline.
    pub users_online: usize,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub operations: u64,
    pub frames_delivered: u64,
    pub frames_failed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeStats>,
}

/// Leaves the hub when dropped.
///
/// The transport holds this for as long as the socket is open, so every
/// exit path, including panics in the handler, runs the disconnect.
#[derive(Debug)]
pub struct SessionGuard {
    hub: Weak<SyncHub>,
    connection: Arc<Connection>,
}

impl SessionGuard {
    /// The connection this guard owns.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.disconnect(&self.connection);
        }
    }
}

/// An authenticated, joined connection.
#[derive(Debug)]
pub struct Session {
    pub guard: SessionGuard,
    /// Frames to write to the client, in emission order.
    pub receiver: ConnectionReceiver,
}

impl Session {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.guard.connection
    }
}

/// Real-time synchronization hub for one node.
pub struct SyncHub {
    config: HubConfig,
    authenticator: ConnectionAuthenticator,
    backend: Arc<dyn MutationBackend>,
    router: Arc<RoomRouter>,
    presence: Arc<PresenceTracker>,
    activity: Arc<ActivityLog>,
    dispatcher: Arc<EventDispatcher>,
    bridge: Option<Arc<CrossNodeBridge>>,
    expiry: Mutex<Option<ExpiryReceiver>>,
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    operations: AtomicU64,
}

impl std::fmt::Debug for SyncHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHub")
            .field("node_id", &self.config.node_id)
            .field("connections", &self.router.total_connections())
            .finish_non_exhaustive()
    }
}

impl SyncHub {
    /// Build a hub. Pass a bridge to take part in a multi-node deployment.
    pub fn new(
        config: HubConfig,
        authenticator: ConnectionAuthenticator,
        backend: Arc<dyn MutationBackend>,
        bridge: Option<Arc<CrossNodeBridge>>,
    ) -> Arc<Self> {
        let router = Arc::new(RoomRouter::new());
        let (presence, expiry) = PresenceTracker::new(config.presence.clone());
        let activity = Arc::new(ActivityLog::new(config.activity.clone()));
        let dispatcher = Arc::new(EventDispatcher::new(
            router.clone(),
            presence.clone(),
            activity.clone(),
            bridge.clone(),
        ));

        Arc::new(Self {
            config,
            authenticator,
            backend,
            router,
            presence,
            activity,
            dispatcher,
            bridge,
            expiry: Mutex::new(Some(expiry)),
            total_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            operations: AtomicU64::new(0),
        })
    }

    /// Node id.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Start background work: the bridge, typing expiry, presence
    /// heartbeats and activity pruning.
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>, RealtimeError> {
        let mut handles = Vec::new();

        if let Some(bridge) = &self.bridge {
            handles.extend(bridge.start(self.dispatcher.clone()).await?);
        }

        let expiry = self.expiry.lock().take();
        if let Some(mut expiry) = expiry {
            let dispatcher = self.dispatcher.clone();
            handles.push(tokio::spawn(async move {
                while let Some(change) = expiry.recv().await {
                    dispatcher.presence_changed(&change);
                }
            }));
        }

        let dispatcher = self.dispatcher.clone();
        let presence = self.presence.clone();
        let activity = self.activity.clone();
        let period = self.config.presence.heartbeat_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                dispatcher.announce_all();
                for change in presence.sweep_remote() {
                    dispatcher.presence_changed(&change);
                }
                let pruned = activity.prune();
                if pruned > 0 {
                    debug!(pruned, "Pruned activity feed");
                }
            }
        }));

        info!(node_id = %self.config.node_id, "Sync hub started");
        Ok(handles)
    }

    /// Authenticate a handshake credential and open a session.
    ///
    /// The user is online before the connection joins its room, so nothing
    /// can reach the connection ahead of its own presence.
    pub async fn connect(
        self: &Arc<Self>,
        credential: Option<&str>,
        transport: Transport,
        device: DeviceClass,
    ) -> Result<Session, RealtimeError> {
        let identity = match self.authenticator.authenticate(credential).await {
            Ok(identity) => identity,
            Err(e) => {
                self.rejected_connections.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Rejected connection");
                return Err(e.into());
            }
        };

        if self.router.total_connections() >= self.config.max_connections {
            self.rejected_connections.fetch_add(1, Ordering::Relaxed);
            return Err(RealtimeError::ConnectionLimit(self.config.max_connections));
        }

        let (connection, receiver) = create_connection(identity.user_id.clone(), transport, device);

        if let Some(change) =
            self.presence
                .connection_opened(&connection.user_id, &connection.id, device)
        {
            self.dispatcher.presence_changed(&change);
        }
        self.dispatcher.announce_presence(&connection.user_id);
        self.router.join(connection.clone());
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        info!(
            client_id = %connection.id,
            user_id = %connection.user_id,
            transport = ?transport,
            "Client connected"
        );

        Ok(Session {
            guard: SessionGuard {
                hub: Arc::downgrade(self),
                connection,
            },
            receiver,
        })
    }

    /// Remove a connection. Idempotent.
    pub fn disconnect(&self, connection: &Connection) {
        if self.router.find(&connection.user_id, &connection.id).is_none() {
            connection.close();
            return;
        }
        self.router.leave(connection);

        for change in self
            .presence
            .connection_closed(&connection.user_id, &connection.id)
        {
            self.dispatcher.presence_changed(&change);
        }
        self.dispatcher.announce_presence(&connection.user_id);

        info!(
            client_id = %connection.id,
            user_id = %connection.user_id,
            "Client disconnected"
        );
    }

    /// Handle one text frame from a connection and send its ack.
    pub async fn handle_text(&self, connection: &Arc<Connection>, text: &str) -> AckReply {
        let ack = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => {
                let id = frame.id.clone();
                match frame.operation() {
                    Ok(op) => self.handle_operation(connection, id, op).await,
                    Err(e) => AckReply::err(id, e.code(), e.to_string()),
                }
            }
            Err(e) => {
                let e = RealtimeError::from(e);
                AckReply::err(None, e.code(), e.to_string())
            }
        };

        if !self.router.send_to(connection, &ServerFrame::Ack(ack.clone())) {
            debug!(client_id = %connection.id, "Connection closed before ack");
        }
        ack
    }

    /// Execute a decoded operation for a connection.
    pub async fn handle_operation(
        &self,
        connection: &Arc<Connection>,
        id: Option<String>,
        op: ClientOperation,
    ) -> AckReply {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let user = &connection.user_id;
        debug!(client_id = %connection.id, operation = %op.name(), "Handling operation");

        match op {
            ClientOperation::Mutate(request) => self.mutate(user, id, &request).await,
            ClientOperation::PresenceUpdate { status, device } => {
                if let Some(change) =
                    self.presence
                        .update_status(user, &connection.id, status, device)
                {
                    self.dispatcher.presence_changed(&change);
                }
                self.dispatcher.announce_presence(user);
                AckReply::ok(id, Some(json!(self.presence.record(user))))
            }
            ClientOperation::TypingStart { task_id } => {
                if let Some(change) = self.presence.typing_start(user, &task_id) {
                    self.dispatcher.presence_changed(&change);
                }
                AckReply::ok(id, None)
            }
            ClientOperation::TypingStop { task_id } => {
                if let Some(change) = self.presence.typing_stop(user, &task_id) {
                    self.dispatcher.presence_changed(&change);
                }
                AckReply::ok(id, None)
            }
            ClientOperation::PresenceSubscribe { user_ids } => {
                let added = match connection.watch_all(&user_ids) {
                    Ok(added) => added,
                    Err(e) => return AckReply::err(id, e.code(), e.to_string()),
                };
                for subject in &added {
                    self.router.watch(subject, connection.clone());
                }
                AckReply::ok(id, Some(json!(self.presence.query(&user_ids))))
            }
            ClientOperation::PresenceUnsubscribe { user_ids } => {
                for subject in &user_ids {
                    connection.unwatch(subject);
                    self.router.unwatch(subject, &connection.id);
                }
                AckReply::ok(id, None)
            }
            ClientOperation::PresenceQuery { user_ids } => {
                AckReply::ok(id, Some(json!(self.presence.query(&user_ids))))
            }
            ClientOperation::ActivitySubscribe => {
                connection.set_activity_subscribed(true);
                let recent = self.activity.recent(user, ACTIVITY_BACKFILL);
                AckReply::ok(id, Some(json!(recent)))
            }
            ClientOperation::ActivityUnsubscribe => {
                connection.set_activity_subscribed(false);
                AckReply::ok(id, None)
            }
            ClientOperation::Ping => AckReply::ok(id, Some(json!({ "pong": now_millis() }))),
        }
    }

    async fn mutate(&self, owner: &UserId, id: Option<String>, request: &MutationRequest) -> AckReply {
        match self.backend.apply(owner, request).await {
            Ok(resource) => {
                let changes = Value::Object(request.fields.clone());
                if let Err(e) = self.dispatcher.emit_mutation(
                    request.kind,
                    request.verb,
                    resource.clone(),
                    &changes,
                    owner,
                ) {
                    warn!(error = %e, "Failed to emit mutation event");
                }
                AckReply::ok(id, Some(resource))
            }
            Err(MutationError::Conflict { current }) => {
                debug!(
                    user_id = %owner,
                    operation = %request.operation_name(),
                    "Mutation conflicts with server state"
                );
                let err = MutationError::Conflict { current: None };
                AckReply::err(id, err.code(), err.to_string())
                    .with_data(current.unwrap_or(Value::Null))
            }
            Err(e) => {
                warn!(user_id = %owner, operation = %request.operation_name(), error = %e, "Mutation failed");
                AckReply::err(id, e.code(), e.to_string())
            }
        }
    }

    /// Fan out a mutation persisted outside the hub. See
    /// [`EventDispatcher::emit`].
    pub fn emit(
        &self,
        kind: ResourceKind,
        verb: MutationVerb,
        payload: Value,
        owner: &UserId,
    ) -> Result<OutboundEvent, RealtimeError> {
        self.dispatcher.emit(kind, verb, payload, owner)
    }

    /// Push a notification to its recipient.
    pub fn notify(&self, notification: &Notification) -> OutboundEvent {
        self.dispatcher.notify(notification)
    }

    /// Record an activity that did not come from a mutation (e.g. sharing).
    pub fn record_activity(&self, activity: ActivityEvent) {
        self.dispatcher.record_activity(activity);
    }

    /// Deliver a presence change as if it came from the tracker.
    pub fn presence_changed(&self, change: &PresenceChange) {
        self.dispatcher.presence_changed(change);
    }

    /// Room router.
    pub fn router(&self) -> &RoomRouter {
        &self.router
    }

    /// Presence tracker.
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Activity log.
    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    /// Whether the hub can serve traffic: the bridge, if any, is subscribed.
    pub fn is_ready(&self) -> bool {
        self.bridge.as_ref().map_or(true, |b| b.is_subscribed())
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> HubStats {
        let (delivered, failed) = self.router.delivery_totals();
        HubStats {
            node_id: self.config.node_id.clone(),
            connections: self.router.total_connections(),
            connected_users: self.router.room_count(),
            users_online: self.presence.online_count(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            operations: self.operations.load(Ordering::Relaxed),
            frames_delivered: delivered,
            frames_failed: failed,
            bridge: self.bridge.as_ref().map(|b| b.stats()),
        }
    }
}
