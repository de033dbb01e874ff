//! Connection lifecycle, isolation and typing expiry on a single node.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tasksync_auth::{ConnectionAuthenticator, Ed25519Verifier, MemoryDirectory, TokenSigner, TokenType};
use tasksync_realtime::{
    ClientOperation, ConnectionReceiver, HubConfig, MemoryBackend, PresenceConfig, Session,
    SyncHub,
};
use tasksync_types::{DeviceClass, PresenceStatus, Transport, UserId};

struct Node {
    hub: Arc<SyncHub>,
    signer: TokenSigner,
}

fn node(typing_timeout: Duration) -> Node {
    let signer = TokenSigner::generate();
    let directory = MemoryDirectory::new();
    for user in ["alice", "bob", "carol"] {
        directory.insert_active(user);
    }
    let auth = ConnectionAuthenticator::new(
        Arc::new(Ed25519Verifier::new(signer.verification_key())),
        Arc::new(directory),
    );
    let hub = SyncHub::new(
        HubConfig {
            presence: PresenceConfig {
                typing_timeout,
                ..PresenceConfig::default()
            },
            ..HubConfig::default()
        },
        auth,
        Arc::new(MemoryBackend::new()),
        None,
    );
    Node { hub, signer }
}

impl Node {
    async fn connect(&self, user: &str) -> Session {
        let token = self.signer.issue(user, TokenType::Access, 3600).unwrap();
        self.hub
            .connect(Some(&token), Transport::InProcess, DeviceClass::Web)
            .await
            .unwrap()
    }

    async fn send(&self, session: &Session, frame: &str) {
        let ack = self.hub.handle_text(session.connection(), frame).await;
        assert!(ack.success, "operation failed: {:?}", ack.error);
    }
}

fn drain(rx: &mut ConnectionReceiver) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(text) = rx.try_recv() {
        out.push(serde_json::from_str(&text).unwrap());
    }
    out
}

fn events(frames: &[Value]) -> Vec<&str> {
    frames
        .iter()
        .filter(|f| f["type"] == "event")
        .filter_map(|f| f["event"].as_str())
        .collect()
}

#[tokio::test]
async fn test_delivery_is_isolated_per_user() {
    let n = node(Duration::from_secs(5));
    let mut alice = [n.connect("alice").await, n.connect("alice").await];
    let mut bob = n.connect("bob").await;
    let mut carol = n.connect("carol").await;

    n.send(
        &alice[0],
        r#"{"id":"1","event":"category:create","data":{"id":"c1","name":"Work"}}"#,
    )
    .await;

    for session in alice.iter_mut() {
        assert_eq!(events(&drain(&mut session.receiver)), vec!["category:created"]);
    }
    assert!(drain(&mut bob.receiver).is_empty());
    assert!(drain(&mut carol.receiver).is_empty());
}

#[tokio::test]
async fn test_dead_connection_does_not_break_broadcast() {
    let n = node(Duration::from_secs(5));
    let dead = n.connect("alice").await;
    let mut live = n.connect("alice").await;
    let writer = n.connect("alice").await;

    // The transport's reader half vanished without a clean close.
    let Session { guard, receiver } = dead;
    drop(receiver);

    n.send(
        &writer,
        r#"{"id":"1","event":"todo:create","data":{"id":"t1","title":"A"}}"#,
    )
    .await;
    assert_eq!(events(&drain(&mut live.receiver)), vec!["todo:created"]);

    drop(guard);
    assert_eq!(n.hub.router().connection_count(&UserId::new("alice")), 2);
}

#[tokio::test]
async fn test_zero_connections_means_offline() {
    let n = node(Duration::from_secs(5));
    let alice = UserId::new("alice");
    let sessions = vec![
        n.connect("alice").await,
        n.connect("alice").await,
        n.connect("alice").await,
    ];
    assert_eq!(n.hub.presence().status(&alice), PresenceStatus::Online);

    let mut sessions = sessions.into_iter();
    for _ in 0..2 {
        drop(sessions.next());
        assert_eq!(n.hub.presence().status(&alice), PresenceStatus::Online);
    }
    drop(sessions.next());
    assert_eq!(n.hub.presence().status(&alice), PresenceStatus::Offline);
    assert_eq!(n.hub.stats().connections, 0);
}

#[tokio::test]
async fn test_online_before_first_delivery() {
    let n = node(Duration::from_secs(5));
    let session = n.connect("alice").await;
    // By the time connect returns the connection is routable and the
    // user is already online.
    assert_eq!(
        n.hub.presence().status(&session.connection().user_id),
        PresenceStatus::Online
    );
    assert_eq!(n.hub.router().connection_count(&UserId::new("alice")), 1);
}

#[tokio::test(start_paused = true)]
async fn test_typing_expires_without_client_cooperation() {
    let n = node(Duration::from_secs(5));
    n.hub.start().await.unwrap();

    let mut bob = n.connect("bob").await;
    n.hub
        .handle_operation(
            bob.connection(),
            None,
            ClientOperation::PresenceSubscribe {
                user_ids: vec![UserId::new("alice")],
            },
        )
        .await;

    let alice = n.connect("alice").await;
    n.send(
        &alice,
        r#"{"id":"1","event":"presence:typing:start","data":{"task_id":"t1"}}"#,
    )
    .await;

    let frames = drain(&mut bob.receiver);
    let typing: Vec<_> = frames
        .iter()
        .filter(|f| f["event"] == "presence:typing")
        .collect();
    assert_eq!(typing.len(), 1);
    assert_eq!(typing[0]["data"]["typing"], true);

    // Alice goes silent; no stop is ever sent.
    tokio::time::sleep(Duration::from_secs(6)).await;

    let frames = drain(&mut bob.receiver);
    let stop = frames
        .iter()
        .find(|f| f["event"] == "presence:typing")
        .expect("typing should have expired");
    assert_eq!(stop["data"]["typing"], false);
    assert_eq!(stop["data"]["task_id"], "t1");
    assert!(!n.hub.presence().is_typing(&UserId::new("alice"), "t1"));
}
