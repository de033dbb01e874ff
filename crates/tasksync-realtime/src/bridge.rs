//! Cross-node bridge.
//!
//! Every event delivered locally is also published on a shared pub/sub
//! channel keyed by category. Every node subscribes to all categories and
//! delivers what other nodes published to its own connections. Received
//! envelopes are never re-published.
//!
//! Delivery between nodes is best-effort. There is no acknowledgment,
//! retry, ordering or replay: a node that is down while an event is
//! published never sees it, and its clients reconcile by re-fetching on
//! reconnect. Outbound envelopes wait in a bounded queue; when the broker
//! cannot keep up, new envelopes are dropped and counted.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tasksync_types::UserId;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::event::{EventCategory, OutboundEvent};
use crate::presence::PresenceAnnouncement;

/// Capacity of the in-process broadcast channel.
const MEMORY_CAPACITY: usize = 1024;

/// Envelopes waiting for the publisher task.
pub const OUTBOUND_CAPACITY: usize = 4096;

/// A raw message on the shared channel.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    /// Category the message was published under.
    pub category: EventCategory,
    /// Encoded [`BridgeEnvelope`].
    pub payload: Vec<u8>,
}

/// A shared publish/subscribe channel between nodes.
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// Publish a payload under a category.
    async fn publish(&self, category: EventCategory, payload: Vec<u8>) -> Result<(), BridgeError>;

    /// Subscribe to every category.
    async fn subscribe(&self) -> Result<broadcast::Receiver<PubSubMessage>, BridgeError>;
}

/// In-process pub/sub. Clones share one channel, so several bridges
/// built over clones behave like nodes on one broker.
#[derive(Debug, Clone)]
pub struct MemoryPubSub {
    tx: broadcast::Sender<PubSubMessage>,
}

impl MemoryPubSub {
    /// Create a new channel.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MEMORY_CAPACITY);
        Self { tx }
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, category: EventCategory, payload: Vec<u8>) -> Result<(), BridgeError> {
        // No subscribers is not an error.
        let _ = self.tx.send(PubSubMessage { category, payload });
        Ok(())
    }

    async fn subscribe(&self) -> Result<broadcast::Receiver<PubSubMessage>, BridgeError> {
        Ok(self.tx.subscribe())
    }
}

/// Which local connections a bridged event is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "user_id", rename_all = "snake_case")]
pub enum DeliveryTarget {
    /// Every connection of the user.
    User(UserId),
    /// Connections watching the user's presence.
    Watchers(UserId),
    /// The user's connections subscribed to the activity feed.
    ActivitySubscribers(UserId),
}

/// What a bridged message carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgePayload {
    /// An event to deliver.
    Deliver {
        target: DeliveryTarget,
        event: OutboundEvent,
    },
    /// The origin node's local status for a user.
    Presence(PresenceAnnouncement),
}

impl BridgePayload {
    /// Category this payload travels on.
    pub fn category(&self) -> EventCategory {
        match self {
            BridgePayload::Deliver { event, .. } => event.category(),
            BridgePayload::Presence(_) => EventCategory::PresenceSync,
        }
    }
}

/// A message on the wire between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeEnvelope {
    /// Node that published the envelope.
    pub origin: String,
    pub category: EventCategory,
    pub payload: BridgePayload,
}

impl BridgeEnvelope {
    /// Encode to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(self).map_err(|e| BridgeError::InvalidMessage(e.to_string()))
    }

    /// Decode from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(bytes).map_err(|e| BridgeError::InvalidMessage(e.to_string()))
    }
}

/// Where remotely-originated envelopes are handed for local delivery.
///
/// Implementations must only deliver locally; nothing reached through
/// this trait may publish back onto the bridge.
pub trait BridgeSink: Send + Sync + 'static {
    /// Deliver an event to local connections.
    fn deliver_remote(&self, target: &DeliveryTarget, event: &OutboundEvent);

    /// Record another node's presence announcement.
    fn presence_remote(&self, origin: &str, announcement: &PresenceAnnouncement);
}

/// Bridge counters.
#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    publish_failed: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
    echoes_dropped: AtomicU64,
    invalid: AtomicU64,
    lagged: AtomicU64,
}

/// Snapshot of bridge counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    pub published: u64,
    pub publish_failed: u64,
    /// Envelopes discarded because the outbound queue was full.
    pub dropped: u64,
    pub received: u64,
    pub echoes_dropped: u64,
    pub invalid: u64,
    pub lagged: u64,
}

/// What happened to one incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    Delivered,
    Echo,
    Invalid,
}

/// Publishes local events to other nodes and delivers theirs here.
pub struct CrossNodeBridge {
    node_id: String,
    pubsub: Arc<dyn PubSub>,
    outbound: mpsc::Sender<BridgeEnvelope>,
    pending: Mutex<Option<mpsc::Receiver<BridgeEnvelope>>>,
    counters: Arc<Counters>,
    subscribed: AtomicBool,
}

impl std::fmt::Debug for CrossNodeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossNodeBridge")
            .field("node_id", &self.node_id)
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}

impl CrossNodeBridge {
    /// Create a bridge for `node_id` over a pub/sub transport.
    pub fn new(node_id: impl Into<String>, pubsub: Arc<dyn PubSub>) -> Self {
        Self::with_capacity(node_id, pubsub, OUTBOUND_CAPACITY)
    }

    /// Create a bridge whose outbound queue holds `capacity` envelopes.
    pub fn with_capacity(
        node_id: impl Into<String>,
        pubsub: Arc<dyn PubSub>,
        capacity: usize,
    ) -> Self {
        let (outbound, pending) = mpsc::channel(capacity.max(1));
        Self {
            node_id: node_id.into(),
            pubsub,
            outbound,
            pending: Mutex::new(Some(pending)),
            counters: Arc::new(Counters::default()),
            subscribed: AtomicBool::new(false),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether the subscriber is running.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Queue an event for other nodes. Never blocks and never fails the
    /// caller; a full queue drops the event and transport errors are
    /// logged by the publisher task.
    pub fn publish_event(&self, target: DeliveryTarget, event: OutboundEvent) {
        self.enqueue(BridgePayload::Deliver { target, event });
    }

    /// Queue this node's presence for a user.
    pub fn publish_presence(&self, announcement: PresenceAnnouncement) {
        self.enqueue(BridgePayload::Presence(announcement));
    }

    fn enqueue(&self, payload: BridgePayload) {
        let envelope = BridgeEnvelope {
            origin: self.node_id.clone(),
            category: payload.category(),
            payload,
        };
        match self.outbound.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    node_id = %self.node_id,
                    category = %envelope.category,
                    "Bridge outbound queue full, dropping envelope"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(node_id = %self.node_id, "Bridge publisher stopped, dropping envelope");
            }
        }
    }

    /// Subscribe and spawn the publisher and subscriber tasks.
    pub async fn start(
        &self,
        sink: Arc<dyn BridgeSink>,
    ) -> Result<Vec<JoinHandle<()>>, BridgeError> {
        let mut pending = self
            .pending
            .lock()
            .take()
            .ok_or(BridgeError::AlreadyStarted)?;
        let mut incoming = self.pubsub.subscribe().await?;
        self.subscribed.store(true, Ordering::SeqCst);

        let pubsub = self.pubsub.clone();
        let counters = self.counters.clone();
        let publisher = tokio::spawn(async move {
            while let Some(envelope) = pending.recv().await {
                let bytes = match envelope.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode bridge envelope");
                        counters.invalid.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                match pubsub.publish(envelope.category, bytes).await {
                    Ok(()) => {
                        counters.published.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(category = %envelope.category, error = %e, "Bridge publish failed");
                        counters.publish_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });

        let node_id = self.node_id.clone();
        let counters = self.counters.clone();
        let subscriber = tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(message) => {
                        handle_incoming(&node_id, &counters, sink.as_ref(), &message);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(node_id = %node_id, skipped = n, "Bridge subscriber lagged");
                        counters.lagged.fetch_add(n, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(node_id = %node_id, "Bridge channel closed");
                        break;
                    }
                }
            }
        });

        info!(node_id = %self.node_id, "Cross-node bridge started");
        Ok(vec![publisher, subscriber])
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BridgeStats {
        let c = &self.counters;
        BridgeStats {
            published: c.published.load(Ordering::Relaxed),
            publish_failed: c.publish_failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            echoes_dropped: c.echoes_dropped.load(Ordering::Relaxed),
            invalid: c.invalid.load(Ordering::Relaxed),
            lagged: c.lagged.load(Ordering::Relaxed),
        }
    }
}

fn handle_incoming(
    node_id: &str,
    counters: &Counters,
    sink: &dyn BridgeSink,
    message: &PubSubMessage,
) -> Incoming {
    let envelope = match BridgeEnvelope::decode(&message.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(category = %message.category, error = %e, "Dropping malformed bridge message");
            counters.invalid.fetch_add(1, Ordering::Relaxed);
            return Incoming::Invalid;
        }
    };

    if envelope.origin == node_id {
        counters.echoes_dropped.fetch_add(1, Ordering::Relaxed);
        return Incoming::Echo;
    }

    counters.received.fetch_add(1, Ordering::Relaxed);
    match &envelope.payload {
        BridgePayload::Deliver { target, event } => {
            debug!(origin = %envelope.origin, event = %event.event, "Delivering bridged event");
            sink.deliver_remote(target, event);
        }
        BridgePayload::Presence(announcement) => {
            sink.presence_remote(&envelope.origin, announcement);
        }
    }
    Incoming::Delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventName;
    use std::time::Duration;
    use tasksync_types::{DeviceClass, PresenceStatus};

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(DeliveryTarget, OutboundEvent)>>,
        presence: Mutex<Vec<(String, PresenceAnnouncement)>>,
    }

    impl BridgeSink for RecordingSink {
        fn deliver_remote(&self, target: &DeliveryTarget, event: &OutboundEvent) {
            self.delivered.lock().push((target.clone(), event.clone()));
        }

        fn presence_remote(&self, origin: &str, announcement: &PresenceAnnouncement) {
            self.presence
                .lock()
                .push((origin.to_string(), announcement.clone()));
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn envelope(origin: &str) -> PubSubMessage {
        let env = BridgeEnvelope {
            origin: origin.to_string(),
            category: EventCategory::TaskSync,
            payload: BridgePayload::Deliver {
                target: DeliveryTarget::User(UserId::new("alice")),
                event: OutboundEvent::new(EventName::TodoCreated, serde_json::json!({"id": "t1"})),
            },
        };
        PubSubMessage {
            category: EventCategory::TaskSync,
            payload: env.encode().unwrap(),
        }
    }

    #[test]
    fn test_handle_incoming_drops_echo() {
        let sink = RecordingSink::default();
        let counters = Counters::default();

        assert_eq!(
            handle_incoming("node-a", &counters, &sink, &envelope("node-a")),
            Incoming::Echo
        );
        assert!(sink.delivered.lock().is_empty());

        assert_eq!(
            handle_incoming("node-a", &counters, &sink, &envelope("node-b")),
            Incoming::Delivered
        );
        assert_eq!(sink.delivered.lock().len(), 1);
    }

    #[test]
    fn test_handle_incoming_rejects_garbage() {
        let sink = RecordingSink::default();
        let counters = Counters::default();
        let msg = PubSubMessage {
            category: EventCategory::TaskSync,
            payload: b"not json".to_vec(),
        };
        assert_eq!(
            handle_incoming("node-a", &counters, &sink, &msg),
            Incoming::Invalid
        );
        assert_eq!(counters.invalid.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = BridgeEnvelope {
            origin: "node-a".into(),
            category: EventCategory::PresenceSync,
            payload: BridgePayload::Presence(PresenceAnnouncement {
                user_id: UserId::new("alice"),
                status: PresenceStatus::Away,
                device: DeviceClass::Mobile,
                last_activity: 1,
                seq: 1,
            }),
        };
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["category"], "presence-sync");
        assert_eq!(json["payload"]["kind"], "presence");
        assert_eq!(json["payload"]["status"], "away");

        let target = serde_json::to_value(DeliveryTarget::Watchers(UserId::new("bob"))).unwrap();
        assert_eq!(target, serde_json::json!({"scope": "watchers", "user_id": "bob"}));
    }

    #[tokio::test]
    async fn test_two_bridges_share_memory_channel() {
        let pubsub = MemoryPubSub::new();
        let a = CrossNodeBridge::new("node-a", Arc::new(pubsub.clone()));
        let b = CrossNodeBridge::new("node-b", Arc::new(pubsub));

        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());
        a.start(sink_a.clone()).await.unwrap();
        b.start(sink_b.clone()).await.unwrap();

        a.publish_event(
            DeliveryTarget::User(UserId::new("alice")),
            OutboundEvent::new(EventName::TodoUpdated, serde_json::json!({"id": "t1"})),
        );

        wait_for(|| sink_b.delivered.lock().len() == 1).await;
        wait_for(|| a.stats().echoes_dropped == 1).await;
        assert!(sink_a.delivered.lock().is_empty());
        assert_eq!(a.stats().published, 1);
        assert_eq!(b.stats().received, 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let bridge = CrossNodeBridge::new("node-a", Arc::new(MemoryPubSub::new()));
        let sink = Arc::new(RecordingSink::default());
        bridge.start(sink.clone()).await.unwrap();
        assert!(bridge.is_subscribed());
        assert!(matches!(
            bridge.start(sink).await,
            Err(BridgeError::AlreadyStarted)
        ));
    }

    /// A broker whose publishes never complete.
    struct StalledPubSub {
        inner: MemoryPubSub,
    }

    #[async_trait]
    impl PubSub for StalledPubSub {
        async fn publish(&self, _: EventCategory, _: Vec<u8>) -> Result<(), BridgeError> {
            std::future::pending().await
        }

        async fn subscribe(&self) -> Result<broadcast::Receiver<PubSubMessage>, BridgeError> {
            self.inner.subscribe().await
        }
    }

    #[tokio::test]
    async fn test_stalled_broker_drops_instead_of_queueing() {
        let pubsub = StalledPubSub {
            inner: MemoryPubSub::new(),
        };
        let bridge = CrossNodeBridge::with_capacity("node-a", Arc::new(pubsub), 8);
        bridge.start(Arc::new(RecordingSink::default())).await.unwrap();

        for i in 0..100 {
            bridge.publish_event(
                DeliveryTarget::User(UserId::new("alice")),
                OutboundEvent::new(EventName::TodoCreated, serde_json::json!({ "id": i })),
            );
            tokio::task::yield_now().await;
        }

        let stats = bridge.stats();
        assert_eq!(stats.published, 0);
        // One envelope is stuck in the publisher, the queue holds the rest.
        assert!(stats.dropped >= 100 - 8 - 1);
        assert!(stats.dropped <= 100 - 8);
    }

    #[tokio::test]
    async fn test_publish_before_start_is_flushed() {
        let pubsub = MemoryPubSub::new();
        let a = CrossNodeBridge::new("node-a", Arc::new(pubsub.clone()));
        let b = CrossNodeBridge::new("node-b", Arc::new(pubsub));
        let sink_b = Arc::new(RecordingSink::default());
        b.start(sink_b.clone()).await.unwrap();

        a.publish_presence(PresenceAnnouncement {
            user_id: UserId::new("alice"),
            status: PresenceStatus::Online,
            device: DeviceClass::Web,
            last_activity: 0,
            seq: 1,
        });
        a.start(Arc::new(RecordingSink::default())).await.unwrap();

        wait_for(|| sink_b.presence.lock().len() == 1).await;
        assert_eq!(sink_b.presence.lock()[0].0, "node-a");
    }
}
