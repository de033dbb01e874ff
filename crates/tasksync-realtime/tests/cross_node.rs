//! Two nodes sharing one in-memory pub/sub channel.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tasksync_auth::{ConnectionAuthenticator, Ed25519Verifier, MemoryDirectory, TokenSigner, TokenType};
use tasksync_realtime::{
    ClientOperation, ConnectionReceiver, CrossNodeBridge, HubConfig, MemoryBackend, MemoryPubSub,
    Session, SyncHub,
};
use tasksync_types::{DeviceClass, MutationVerb, ResourceKind, Transport, UserId};

struct Cluster {
    signer: TokenSigner,
    a: Arc<SyncHub>,
    b: Arc<SyncHub>,
}

fn node(
    name: &str,
    pubsub: &MemoryPubSub,
    signer: &TokenSigner,
    directory: &Arc<MemoryDirectory>,
) -> Arc<SyncHub> {
    let auth = ConnectionAuthenticator::new(
        Arc::new(Ed25519Verifier::new(signer.verification_key())),
        directory.clone(),
    );
    let bridge = Arc::new(CrossNodeBridge::new(name, Arc::new(pubsub.clone())));
    SyncHub::new(
        HubConfig {
            node_id: name.to_string(),
            ..HubConfig::default()
        },
        auth,
        Arc::new(MemoryBackend::new()),
        Some(bridge),
    )
}

async fn cluster() -> Cluster {
    let signer = TokenSigner::generate();
    let directory = Arc::new(MemoryDirectory::new());
    for user in ["alice", "bob"] {
        directory.insert_active(user);
    }
    let pubsub = MemoryPubSub::new();
    let a = node("node-a", &pubsub, &signer, &directory);
    let b = node("node-b", &pubsub, &signer, &directory);
    a.start().await.unwrap();
    b.start().await.unwrap();
    Cluster { signer, a, b }
}

impl Cluster {
    async fn connect(&self, hub: &Arc<SyncHub>, user: &str) -> Session {
        let token = self.signer.issue(user, TokenType::Access, 3600).unwrap();
        hub.connect(Some(&token), Transport::InProcess, DeviceClass::Web)
            .await
            .unwrap()
    }
}

async fn next_event(rx: &mut ConnectionReceiver, name: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let text = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
            .expect("connection closed");
        let frame: Value = serde_json::from_str(&text).unwrap();
        if frame["event"] == name {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_event_reaches_user_connected_only_to_other_node() {
    let c = cluster().await;
    let mut alice_on_b = c.connect(&c.b, "alice").await;

    c.a.emit(
        ResourceKind::Task,
        MutationVerb::Create,
        json!({"id": "t1", "title": "From A"}),
        &UserId::new("alice"),
    )
    .unwrap();

    let frame = next_event(&mut alice_on_b.receiver, "todo:created").await;
    assert_eq!(frame["data"]["title"], "From A");
}

#[tokio::test]
async fn test_mutation_on_one_node_reaches_devices_on_both() {
    let c = cluster().await;
    let laptop = c.connect(&c.a, "alice").await;
    let mut phone = c.connect(&c.b, "alice").await;
    let mut bob = c.connect(&c.b, "bob").await;

    let ack = c
        .a
        .handle_text(
            laptop.connection(),
            r#"{"id":"1","event":"todo:update","data":{"id":"t1","title":"X","force":true}}"#,
        )
        .await;
    assert!(ack.success);

    let frame = next_event(&mut phone.receiver, "todo:updated").await;
    assert_eq!(frame["data"]["id"], "t1");

    // Nothing for another user, on either node.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bob.receiver.try_recv().is_err());
}

#[tokio::test]
async fn test_bridge_does_not_echo_back() {
    let c = cluster().await;
    let mut alice_on_a = c.connect(&c.a, "alice").await;

    c.a.emit(
        ResourceKind::Tag,
        MutationVerb::Create,
        json!({"id": "g1", "name": "home"}),
        &UserId::new("alice"),
    )
    .unwrap();

    next_event(&mut alice_on_a.receiver, "tag:created").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Exactly one copy: the local delivery.
    assert!(alice_on_a.receiver.try_recv().is_err());

    let stats = c.a.stats().bridge.unwrap();
    assert!(stats.echoes_dropped >= 1);
}

#[tokio::test]
async fn test_presence_and_typing_cross_nodes() {
    let c = cluster().await;
    let mut bob_on_a = c.connect(&c.a, "bob").await;
    c.a.handle_operation(
        bob_on_a.connection(),
        None,
        ClientOperation::PresenceSubscribe {
            user_ids: vec![UserId::new("alice")],
        },
    )
    .await;

    let alice_on_b = c.connect(&c.b, "alice").await;
    let online = next_event(&mut bob_on_a.receiver, "presence:online").await;
    assert_eq!(online["data"]["user_id"], "alice");

    c.b.handle_operation(
        alice_on_b.connection(),
        None,
        ClientOperation::TypingStart {
            task_id: "t1".into(),
        },
    )
    .await;
    let typing = next_event(&mut bob_on_a.receiver, "presence:typing").await;
    assert_eq!(typing["data"]["typing"], true);

    drop(alice_on_b);
    next_event(&mut bob_on_a.receiver, "presence:offline").await;
    assert_eq!(
        c.a.presence().status(&UserId::new("alice")),
        tasksync_types::PresenceStatus::Offline
    );
}
