//! Session manager behaviour across ownership changes, with two simulated
//! nodes sharing one coordinator and one store.

use scrivener_core::ot::Edit;
use scrivener_core::ownership::{
    Coordinator, MemoryCoordinator, MembershipChange, NodeInfo, RingSnapshot,
};
use scrivener_core::protocol::{ClientMessage, ServerMessage};
use scrivener_core::storage::{MemoryStorage, MetadataStore};
use scrivener_core::{ScrivenerError, VersionId};
use scrivener_server::sync::{
    ClientConnection, Connect, JoinedState, SessionConfig, SessionManager, SessionStores,
};
use std::sync::Arc;
use std::time::Duration;

const VNODES: usize = 16;

struct Cluster {
    coordinator: Arc<MemoryCoordinator>,
    storage: MemoryStorage,
}

impl Cluster {
    fn new() -> Self {
        Self {
            coordinator: Arc::new(MemoryCoordinator::with_vnodes(VNODES)),
            storage: MemoryStorage::new(),
        }
    }

    fn manager(&self, node_id: &str) -> Arc<SessionManager> {
        let stores = SessionStores {
            log: Arc::new(self.storage.clone()),
            metadata: Arc::new(self.storage.clone()),
            coordinator: self.coordinator.clone(),
        };
        Arc::new(SessionManager::new(
            node(node_id),
            stores,
            SessionConfig::default(),
        ))
    }
}

fn node(node_id: &str) -> NodeInfo {
    NodeInfo::new(node_id, format!("{node_id}.local:4040"))
}

/// A document owned by `a` alone that moves to `b` once `b` joins.
fn doc_moving_to_b() -> String {
    let one = RingSnapshot::genesis(VNODES)
        .apply(MembershipChange::Join { node: node("a") }, 0)
        .unwrap();
    let two = one
        .apply(MembershipChange::Join { node: node("b") }, 0)
        .unwrap();
    (0..1000)
        .map(|i| format!("doc-{i}"))
        .find(|doc| two.record(doc).unwrap().node_id == "b")
        .expect("some document moves to the new node")
}

async fn connect(
    manager: &Arc<SessionManager>,
    doc: &str,
    client: &str,
    user: &str,
) -> (ClientConnection, JoinedState) {
    match manager.connect(doc, client, user).await.unwrap() {
        Connect::Local { connection, joined } => (connection, joined),
        Connect::Redirect { record, .. } => panic!("redirected to {}", record.node_id),
    }
}

fn submit(op_id: &str, base_seq: u64, edit: Edit) -> ClientMessage {
    ClientMessage::Submit {
        client_op_id: op_id.to_string(),
        base_seq,
        edit,
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_handoff_fences_old_owner_and_preserves_text() {
    let cluster = Cluster::new();
    let a = cluster.manager("a");
    let b = cluster.manager("b");
    cluster.coordinator.register_node(node("a")).unwrap();
    let doc = doc_moving_to_b();

    let (mut alice, joined) = connect(&a, &doc, "c1", "alice").await;
    assert_eq!(joined.seq, 0);
    let replies = alice
        .handle_message(submit("x1", 0, Edit::insert(0, "Hello")))
        .await;
    assert!(matches!(replies.last(), Some(ServerMessage::Ack { .. })));

    // b joins; a has not yet reacted to the new membership
    cluster.coordinator.register_node(node("b")).unwrap();

    // The old owner can no longer append
    let replies = alice
        .handle_message(submit("x2", 1, Edit::insert(5, "!")))
        .await;
    match replies.as_slice() {
        [ServerMessage::Error { error, .. }] => assert_eq!(error.kind, "OwnershipStale"),
        other => panic!("expected a fencing error, got {other:?}"),
    }
    assert_eq!(cluster.storage.operation_count(&doc), 1);

    // The new owner waits for the old claim to be released
    assert!(matches!(
        b.admit(&doc).await,
        Err(ScrivenerError::HandoffPending { .. })
    ));
    // and a itself now redirects
    assert!(matches!(
        a.connect(&doc, "c2", "carol").await.unwrap(),
        Connect::Redirect { .. }
    ));

    a.on_membership_change(&cluster.coordinator.current()).await;
    match alice.recv_event().await {
        Some(ServerMessage::Redirect { node_id, addr, .. }) => {
            assert_eq!(node_id, "b");
            assert_eq!(addr, "b.local:4040");
        }
        other => panic!("expected redirect, got {other:?}"),
    }
    alice.disconnect().await;

    let (_alice, joined) = connect(&b, &doc, "c3", "alice").await;
    assert_eq!(joined.text, "Hello");
    assert_eq!(joined.seq, 1);
    let claim = cluster.coordinator.claim(&doc).unwrap().unwrap();
    assert_eq!(claim.node_id, "b");
}

#[tokio::test]
async fn test_idle_session_is_compacted_and_evicted() {
    let cluster = Cluster::new();
    let a = cluster.manager("a");
    cluster.coordinator.register_node(node("a")).unwrap();

    let (mut alice, _) = connect(&a, "notes", "c1", "alice").await;
    alice
        .handle_message(submit("x1", 0, Edit::insert(0, "Hello!")))
        .await;
    alice.disconnect().await;

    wait_until(|| async { a.get("notes").await.is_none() }).await;

    let version = cluster.storage.current_version("notes").unwrap();
    assert_ne!(version, VersionId::GENESIS);
    assert!(cluster.coordinator.claim("notes").unwrap().is_none());
    assert_eq!(a.stats().await.active_sessions, 0);

    let (_alice, joined) = connect(&a, "notes", "c2", "alice").await;
    assert_eq!(joined.text, "Hello!");
    assert_eq!(joined.version, version);
    assert_eq!(joined.seq, 1);
}

#[tokio::test]
async fn test_reconnect_keeps_session_alive() {
    let cluster = Cluster::new();
    let a = cluster.manager("a");
    cluster.coordinator.register_node(node("a")).unwrap();

    let (mut alice, _) = connect(&a, "notes", "c1", "alice").await;
    alice
        .handle_message(submit("x1", 0, Edit::insert(0, "draft")))
        .await;
    let session = a.get("notes").await.unwrap();

    alice.disconnect().await;
    // Back before the scheduled compaction runs
    let (_alice, joined) = connect(&a, "notes", "c2", "alice").await;
    assert_eq!(joined.text, "draft");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let current = a.get("notes").await.unwrap();
    assert!(Arc::ptr_eq(&session, &current));
    assert!(!current.is_closed());
    assert_eq!(
        cluster.storage.current_version("notes").unwrap(),
        VersionId::GENESIS
    );
}

#[tokio::test]
async fn test_retry_after_lost_ack_is_idempotent() {
    let cluster = Cluster::new();
    let a = cluster.manager("a");
    cluster.coordinator.register_node(node("a")).unwrap();

    let (mut first, _) = connect(&a, "notes", "c1", "alice").await;
    let (_bob, _) = connect(&a, "notes", "c2", "bob").await;
    let replies = first
        .handle_message(submit("x1", 0, Edit::insert(0, "hi")))
        .await;
    let Some(ServerMessage::Ack { ack }) = replies.last().cloned() else {
        panic!("expected ack, got {replies:?}");
    };
    first.disconnect().await;

    // Same user, new connection, same submission id
    let (mut second, joined) = connect(&a, "notes", "c3", "alice").await;
    assert_eq!(joined.text, "hi");
    let replies = second
        .handle_message(submit("x1", 0, Edit::insert(0, "hi")))
        .await;
    assert_eq!(replies.last(), Some(&ServerMessage::Ack { ack }));
    assert_eq!(cluster.storage.operation_count("notes"), 1);
}

#[tokio::test]
async fn test_retry_after_eviction_is_idempotent() {
    let cluster = Cluster::new();
    let a = cluster.manager("a");
    cluster.coordinator.register_node(node("a")).unwrap();

    let (mut first, _) = connect(&a, "notes", "c1", "alice").await;
    let replies = first
        .handle_message(submit("x1", 0, Edit::insert(0, "hi")))
        .await;
    let Some(ServerMessage::Ack { ack }) = replies.last().cloned() else {
        panic!("expected ack, got {replies:?}");
    };
    first.disconnect().await;

    // Compacted, evicted and loaded again from the new version
    wait_until(|| async { a.get("notes").await.is_none() }).await;
    let (mut second, joined) = connect(&a, "notes", "c2", "alice").await;
    assert_ne!(joined.version, VersionId::GENESIS);
    let replies = second
        .handle_message(submit("x1", 0, Edit::insert(0, "hi")))
        .await;
    assert_eq!(replies.last(), Some(&ServerMessage::Ack { ack }));
    assert_eq!(cluster.storage.operation_count("notes"), 1);
}

#[tokio::test]
async fn test_shutdown_hands_everything_off() {
    let cluster = Cluster::new();
    let a = cluster.manager("a");
    let b = cluster.manager("b");
    cluster.coordinator.register_node(node("a")).unwrap();
    cluster.coordinator.register_node(node("b")).unwrap();

    let docs: Vec<String> = (0..20).map(|i| format!("doc-{i}")).collect();
    let mut connections = Vec::new();
    for doc in &docs {
        let manager = if a.directory().resolve(doc).unwrap().node_id == "a" {
            &a
        } else {
            &b
        };
        let (mut c, _) = connect(manager, doc, &format!("c-{doc}"), "alice").await;
        c.handle_message(submit("x1", 0, Edit::insert(0, doc.as_str())))
            .await;
        connections.push(c);
    }

    a.shutdown().await;
    assert_eq!(a.stats().await.active_sessions, 0);

    // Every document is now served by b with its text intact
    for doc in &docs {
        assert_eq!(b.directory().resolve(doc).unwrap().node_id, "b");
        let (_c, joined) = connect(&b, doc, &format!("r-{doc}"), "alice").await;
        assert_eq!(joined.text, *doc);
    }
}
