//! # TaskSync Real-time
//!
//! Multi-device real-time synchronization for the TaskSync task manager.
//!
//! A mutation persisted on behalf of a user is pushed to every open
//! connection of that user, on every node, while presence and typing
//! indicators are shared with the users who asked to watch them.
//!
//! ## Features
//!
//! - **Sync Hub**: Connection lifecycle and the single dispatch point for
//!   client operations
//! - **Room Router**: Per-user delivery groups on one node
//! - **Presence**: Online/away/busy/offline derived from open connections,
//!   unioned across nodes, with self-expiring typing indicators
//! - **Cross-Node Bridge**: Best-effort pub/sub fan-out between nodes, in
//!   memory or over MQTT (`mqtt` feature)
//! - **Activity feed** and **notifications**
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tasksync_auth::{
//!     ConnectionAuthenticator, Ed25519Verifier, MemoryDirectory, TokenSigner, TokenType,
//! };
//! use tasksync_realtime::{HubConfig, MemoryBackend, SyncHub};
//! use tasksync_types::{DeviceClass, Transport};
//!
//! # tokio_test_block(async {
//! let signer = TokenSigner::generate();
//! let directory = MemoryDirectory::new();
//! directory.insert_active("alice");
//! let auth = ConnectionAuthenticator::new(
//!     Arc::new(Ed25519Verifier::new(signer.verification_key())),
//!     Arc::new(directory),
//! );
//!
//! let hub = SyncHub::new(HubConfig::default(), auth, Arc::new(MemoryBackend::new()), None);
//!
//! let token = signer.issue("alice", TokenType::Access, 3600).unwrap();
//! let mut phone = hub.connect(Some(&token), Transport::InProcess, DeviceClass::Mobile).await.unwrap();
//! let laptop = hub.connect(Some(&token), Transport::InProcess, DeviceClass::Desktop).await.unwrap();
//!
//! // The laptop creates a task; the phone hears about it.
//! let frame = r#"{"id":"1","event":"todo:create","data":{"id":"t1","title":"Milk"}}"#;
//! let ack = hub.handle_text(laptop.connection(), frame).await;
//! assert!(ack.success);
//!
//! let pushed = phone.receiver.try_recv().unwrap();
//! assert!(pushed.contains("todo:created"));
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```
//!
//! ## Wire Protocol
//!
//! ### Client -> Server
//!
//! ```json
//! {"id": "r1", "event": "todo:update", "data": {"id": "t1", "title": "X", "base_version": 3}}
//! {"id": "r2", "event": "presence:subscribe", "data": {"user_ids": ["bob"]}}
//! {"id": "r3", "event": "ping"}
//! ```
//!
//! ### Server -> Client
//!
//! ```json
//! {"type": "ack", "id": "r1", "success": false, "data": {...}, "error": {"code": "CONFLICT", "message": "..."}}
//! {"type": "event", "event": "todo:updated", "data": {...}, "timestamp": 1700000000000, "event_id": "..."}
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── SyncHub (one per node) ────────────────────────┐
//! │                                                                         │
//! │  client op ─► MutationBackend ─► EventDispatcher ─┬─► RoomRouter ─► conns│
//! │                                      │            └─► CrossNodeBridge ──┼──► pub/sub
//! │                                      ▼                      ▲           │
//! │                               PresenceTracker               │           │
//! │                               ActivityLog        remote envelopes ◄─────┼──── pub/sub
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod activity;
pub mod backend;
pub mod bridge;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod hub;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod notification;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod router;

// Re-export main types
pub use activity::{ActivityAction, ActivityConfig, ActivityEvent, ActivityLog};
pub use backend::{MemoryBackend, MutationBackend, MutationError};
pub use bridge::{
    BridgeEnvelope, BridgePayload, BridgeSink, BridgeStats, CrossNodeBridge, DeliveryTarget,
    MemoryPubSub, PubSub, PubSubMessage,
};
pub use connection::{Connection, ConnectionReceiver, MAX_WATCHES_PER_CONNECTION};
pub use dispatcher::EventDispatcher;
pub use error::{BridgeError, RealtimeError};
pub use event::{EventCategory, EventName, OutboundEvent};
pub use hub::{HubConfig, HubStats, Session, SessionGuard, SyncHub};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttBridgeConfig, MqttPubSub};
pub use notification::{Notification, NotificationKind};
pub use presence::{
    PresenceAnnouncement, PresenceChange, PresenceConfig, PresenceRecord, PresenceTracker,
};
pub use protocol::{AckError, AckReply, ClientFrame, ClientOperation, MutationRequest, ServerFrame};
pub use router::{DeliveryReport, RoomRouter};
