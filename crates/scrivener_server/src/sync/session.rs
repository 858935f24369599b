//! The live session of one document on its owning node.
//!
//! A submission runs under the session lock in this order:
//!
//! 1. transform against the window and validate,
//! 2. check the ownership claim and append to the log under the session's
//!    epoch,
//! 3. apply to the live text and record the ack,
//! 4. broadcast the operations.
//!
//! Other clients may see an operation before its submitter receives the ack,
//! but never before the operation is durable and its ack recorded, so a
//! retry prompted by the broadcast gets the recorded ack. The submitter's
//! connection sends every event sequenced up to the ack before the ack.
//!
//! A write that fails because the log moved on or the claim was lost closes
//! the session and redirects its clients to the current owner. When that is
//! still this node, the next client to connect reloads from the log.

use indexmap::IndexMap;
use ropey::Rope;
use scrivener_core::compaction::{CompactionInput, CompactionOutcome, compact};
use scrivener_core::history::load_current;
use scrivener_core::ot::{Edit, transform_against_history, transform_position};
use scrivener_core::ownership::{Coordinator, NodeInfo, OwnershipRecord};
use scrivener_core::protocol::{CursorInfo, ServerMessage};
use scrivener_core::storage::{MetadataStore, OperationLog};
use scrivener_core::{Ack, Operation, Result, ScrivenerError, SubmissionRecord, VersionId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Applied operations kept for transforming late submissions
    pub window_size: usize,
    /// Capacity of the event broadcast channel
    pub broadcast_capacity: usize,
    /// Acks remembered for idempotent retries
    pub submission_retention: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: 256,
            broadcast_capacity: 1024,
            submission_retention: 1024,
        }
    }
}

/// Durable collaborators of a session
#[derive(Clone)]
pub struct SessionStores {
    pub log: Arc<dyn OperationLog>,
    pub metadata: Arc<dyn MetadataStore>,
    pub coordinator: Arc<dyn Coordinator>,
}

/// Events fanned out to every connection of a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A committed operation; `origin` is the submitting connection
    Operation { origin: String, op: Arc<Operation> },
    Cursor {
        origin: String,
        user_id: String,
        position: usize,
    },
    Presence { users: Vec<String> },
    /// The session closed; clients reconnect to `addr`
    Redirect {
        doc_id: String,
        node_id: String,
        addr: String,
    },
}

impl SessionEvent {
    /// Sequence number of an operation event
    pub fn seq(&self) -> Option<u64> {
        match self {
            SessionEvent::Operation { op, .. } => Some(op.seq),
            _ => None,
        }
    }
}

/// Document state handed to a joining client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedState {
    pub doc_id: String,
    pub version: VersionId,
    pub seq: u64,
    pub text: String,
    pub cursors: Vec<CursorInfo>,
}

impl From<JoinedState> for ServerMessage {
    fn from(state: JoinedState) -> Self {
        ServerMessage::Joined {
            doc_id: state.doc_id,
            version: state.version,
            seq: state.seq,
            text: state.text,
            cursors: state.cursors,
        }
    }
}

/// Result of an idle-time compaction attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleCompaction {
    /// A client joined before the compaction took the session lock
    Reconnected,
    /// The session was already closed
    Closed,
    Ran(CompactionOutcome),
}

struct SessionState {
    text: Rope,
    version: VersionId,
    /// `base_seq` of the current version's snapshot
    version_base_seq: u64,
    seq: u64,
    /// Most recently applied operations, oldest first
    window: VecDeque<Operation>,
    /// user_id -> caret
    cursors: HashMap<String, usize>,
    /// client_id -> user_id, in join order
    clients: IndexMap<String, String>,
    /// (author, client_op_id) -> ack
    submissions: IndexMap<(String, String), Ack>,
}

impl SessionState {
    fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.clients.values().cloned().collect();
        users.sort();
        users.dedup();
        users
    }

    fn cursors(&self) -> Vec<CursorInfo> {
        let mut cursors: Vec<CursorInfo> = self
            .cursors
            .iter()
            .map(|(user_id, position)| CursorInfo {
                user_id: user_id.clone(),
                position: *position,
            })
            .collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        cursors
    }

    /// Oldest `base_seq` the window can still transform from
    fn oldest_base(&self) -> u64 {
        self.seq - self.window.len() as u64
    }

    fn remember(&mut self, author: &str, ack: Ack, retention: usize) {
        self.submissions
            .insert((author.to_string(), ack.client_op_id.clone()), ack);
        while self.submissions.len() > retention {
            self.submissions.shift_remove_index(0);
        }
    }
}

/// The authoritative editing session of one document on its owning node.
///
/// Every mutation is serialized by one async mutex, so operations are
/// appended, applied and broadcast in a single total order.
pub struct DocumentSession {
    doc_id: String,
    /// Owning node; where clients reconnect after a failed write
    node: NodeInfo,
    epoch: u64,
    config: SessionConfig,
    stores: SessionStores,
    state: Mutex<SessionState>,
    broadcast_tx: broadcast::Sender<SessionEvent>,
    client_count: AtomicUsize,
    closed: AtomicBool,
}

impl DocumentSession {
    /// Load the current version of a document for `record`'s owner.
    ///
    /// Raises the log's fence to `record.epoch` first, so no append of an
    /// earlier owner can land after the state read here.
    pub fn load(
        record: &OwnershipRecord,
        node: &NodeInfo,
        stores: SessionStores,
        config: SessionConfig,
    ) -> Result<Self> {
        stores.log.fence(&record.doc_id, record.epoch)?;
        let loaded = load_current(stores.log.as_ref(), stores.metadata.as_ref(), &record.doc_id)?;

        let mut state = SessionState {
            text: loaded.text,
            version: loaded.version,
            version_base_seq: loaded.snapshot.base_seq,
            seq: loaded.seq,
            window: VecDeque::new(),
            cursors: HashMap::new(),
            clients: IndexMap::new(),
            submissions: IndexMap::new(),
        };

        for entry in loaded.snapshot.submissions {
            state.remember(&entry.author, entry.ack, config.submission_retention);
        }
        // Rebuild acks of submissions appended after the snapshot. One
        // submission's operations are consecutive in the log.
        let mut last: Option<(String, String)> = None;
        for op in &loaded.trailing {
            let key = (op.author.clone(), op.client_op_id.clone());
            if last.as_ref() == Some(&key) {
                if let Some(ack) = state.submissions.get_mut(&key) {
                    ack.seq = op.seq;
                    ack.applied.push(op.edit.clone());
                }
            } else {
                let ack = Ack {
                    client_op_id: op.client_op_id.clone(),
                    seq: op.seq,
                    applied: vec![op.edit.clone()],
                };
                state.remember(&op.author, ack, config.submission_retention);
            }
            last = Some(key);
        }

        let skip = loaded.trailing.len().saturating_sub(config.window_size);
        state.window.extend(loaded.trailing.into_iter().skip(skip));

        info!(
            "Loaded session for {} at {} (seq {}, epoch {})",
            record.doc_id, state.version, state.seq, record.epoch
        );

        let (broadcast_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Ok(Self {
            doc_id: record.doc_id.clone(),
            node: node.clone(),
            epoch: record.epoch,
            config,
            stores,
            state: Mutex::new(state),
            broadcast_tx,
            client_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Fencing epoch this session appends under
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Get the number of connected clients
    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ScrivenerError::SessionClosed(self.doc_id.clone()));
        }
        Ok(())
    }

    /// Add a client. Returns the current state and a receiver for every
    /// event after it.
    pub async fn join(
        &self,
        client_id: &str,
        user_id: &str,
    ) -> Result<(JoinedState, broadcast::Receiver<SessionEvent>)> {
        let mut state = self.state.lock().await;
        self.ensure_open()?;

        // Subscribe under the lock so no event between snapshot and
        // subscription is lost
        let rx = self.broadcast_tx.subscribe();
        if state
            .clients
            .insert(client_id.to_string(), user_id.to_string())
            .is_none()
        {
            self.client_count.fetch_add(1, Ordering::SeqCst);
        }
        let users = state.users();
        let _ = self.broadcast_tx.send(SessionEvent::Presence { users });

        debug!(
            "Client {} ({}) joined {} at seq {}",
            client_id, user_id, self.doc_id, state.seq
        );
        Ok((self.joined_state(&state), rx))
    }

    fn joined_state(&self, state: &SessionState) -> JoinedState {
        JoinedState {
            doc_id: self.doc_id.clone(),
            version: state.version,
            seq: state.seq,
            text: state.text.to_string(),
            cursors: state.cursors(),
        }
    }

    /// Current state, for clients that fell behind the broadcast channel
    pub async fn snapshot_state(&self) -> JoinedState {
        let state = self.state.lock().await;
        self.joined_state(&state)
    }

    /// Transform, persist, apply and broadcast one submission.
    ///
    /// A resubmitted `(author, client_op_id)` returns the recorded ack and
    /// changes nothing. On any error nothing was persisted or applied; an
    /// error that [requires re-resolving](ScrivenerError::requires_reresolve)
    /// also closes the session.
    pub async fn submit(
        &self,
        client_id: &str,
        client_op_id: &str,
        base_seq: u64,
        edit: Edit,
    ) -> Result<Ack> {
        let mut state = self.state.lock().await;
        self.ensure_open()?;

        let author = state
            .clients
            .get(client_id)
            .cloned()
            .ok_or_else(|| ScrivenerError::UnknownClient(client_id.to_string()))?;

        let key = (author.clone(), client_op_id.to_string());
        if let Some(ack) = state.submissions.get(&key) {
            debug!(
                "Duplicate submission {} from {} on {}",
                client_op_id, author, self.doc_id
            );
            return Ok(ack.clone());
        }

        if base_seq > state.seq || base_seq < state.oldest_base() {
            return Err(ScrivenerError::StaleBase {
                base_seq,
                oldest: state.oldest_base(),
                current: state.seq,
            });
        }

        let skip = (base_seq - state.oldest_base()) as usize;
        let concurrent: Vec<&Edit> = state.window.iter().skip(skip).map(|op| &op.edit).collect();

        // Bounds are checked against the text the client edited
        let base_len = concurrent
            .iter()
            .fold(state.text.len_chars() as isize, |len, e| len - e.len_delta());
        edit.validate(base_len.max(0) as usize)?;

        let applied = transform_against_history(&edit, concurrent);

        // Apply to a copy first; the live text only changes once the log
        // holds the operations
        let mut text = state.text.clone();
        for e in &applied {
            e.apply(&mut text)?;
        }

        if applied.is_empty() {
            let ack = Ack {
                client_op_id: client_op_id.to_string(),
                seq: state.seq,
                applied,
            };
            state.remember(&author, ack.clone(), self.config.submission_retention);
            return Ok(ack);
        }

        if let Err(e) = self
            .stores
            .coordinator
            .validate(&self.doc_id, &self.node.node_id, self.epoch)
        {
            return Err(self.write_failed(e));
        }

        let timestamp = chrono::Utc::now().timestamp_millis();
        let ops: Vec<Operation> = applied
            .iter()
            .enumerate()
            .map(|(i, e)| Operation {
                id: uuid::Uuid::new_v4().to_string(),
                doc_id: self.doc_id.clone(),
                version: state.version,
                seq: state.seq + 1 + i as u64,
                epoch: self.epoch,
                author: author.clone(),
                client_op_id: client_op_id.to_string(),
                edit: e.clone(),
                timestamp,
            })
            .collect();

        if let Err(e) = self.stores.log.append_batch(&ops) {
            warn!(
                "Append of {} on {} failed: {}",
                client_op_id, self.doc_id, e
            );
            return Err(self.write_failed(e));
        }

        // Durable: commit to live state
        state.text = text;
        for op in &ops {
            for position in state.cursors.values_mut() {
                *position = transform_position(*position, &op.edit);
            }
        }
        state.seq += ops.len() as u64;

        let ack = Ack {
            client_op_id: client_op_id.to_string(),
            seq: state.seq,
            applied,
        };
        state.remember(&author, ack.clone(), self.config.submission_retention);

        for op in ops {
            let op = Arc::new(op);
            state.window.push_back((*op).clone());
            let _ = self.broadcast_tx.send(SessionEvent::Operation {
                origin: client_id.to_string(),
                op,
            });
        }
        while state.window.len() > self.config.window_size {
            state.window.pop_front();
        }

        debug!(
            "Applied {} on {} -> seq {}",
            client_op_id, self.doc_id, state.seq
        );
        Ok(ack)
    }

    /// Store and broadcast a client's caret
    pub async fn update_cursor(&self, client_id: &str, position: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_open()?;

        let user_id = state
            .clients
            .get(client_id)
            .cloned()
            .ok_or_else(|| ScrivenerError::UnknownClient(client_id.to_string()))?;
        let len = state.text.len_chars();
        if position > len {
            return Err(ScrivenerError::MalformedOp(format!(
                "cursor {} beyond document length {}",
                position, len
            )));
        }

        state.cursors.insert(user_id.clone(), position);
        let _ = self.broadcast_tx.send(SessionEvent::Cursor {
            origin: client_id.to_string(),
            user_id,
            position,
        });
        Ok(())
    }

    /// Remove a client. Returns how many clients remain.
    pub async fn leave(&self, client_id: &str) -> usize {
        let mut state = self.state.lock().await;
        let Some(user_id) = state.clients.shift_remove(client_id) else {
            return state.clients.len();
        };
        self.client_count.fetch_sub(1, Ordering::SeqCst);

        if !state.clients.values().any(|u| *u == user_id) {
            state.cursors.remove(&user_id);
        }
        let users = state.users();
        let _ = self.broadcast_tx.send(SessionEvent::Presence { users });

        debug!("Client {} ({}) left {}", client_id, user_id, self.doc_id);
        state.clients.len()
    }

    /// Close on a write error the live state cannot recover from, sending
    /// clients to the current owner. Must be called with the state lock held.
    fn write_failed(&self, err: ScrivenerError) -> ScrivenerError {
        if err.requires_reresolve() {
            warn!(
                "Session for {} (epoch {}) can no longer write: {}",
                self.doc_id, self.epoch, err
            );
            let snapshot = self.stores.coordinator.current();
            let target = snapshot
                .record(&self.doc_id)
                .and_then(|record| snapshot.node(&record.node_id).cloned())
                .unwrap_or_else(|| self.node.clone());
            self.close_locked(&target.node_id, &target.addr);
        }
        err
    }

    /// Close the session for good and tell every client where to go.
    pub async fn close(&self, node_id: &str, addr: &str) {
        let _state = self.state.lock().await;
        self.close_locked(node_id, addr);
    }

    fn close_locked(&self, node_id: &str, addr: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.broadcast_tx.send(SessionEvent::Redirect {
            doc_id: self.doc_id.clone(),
            node_id: node_id.to_string(),
            addr: addr.to_string(),
        });
        info!(
            "Closed session for {} (epoch {}), redirecting to {}",
            self.doc_id, self.epoch, node_id
        );
    }

    /// Close only if nobody is connected. Returns whether it closed.
    pub async fn close_if_idle(&self) -> bool {
        let state = self.state.lock().await;
        if !state.clients.is_empty() {
            return false;
        }
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Fold the live text into a new version if no client is connected.
    pub async fn compact_if_idle(&self) -> Result<IdleCompaction> {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Ok(IdleCompaction::Closed);
        }
        if !state.clients.is_empty() {
            return Ok(IdleCompaction::Reconnected);
        }

        let submissions = state
            .submissions
            .iter()
            .map(|((author, _), ack)| SubmissionRecord {
                author: author.clone(),
                ack: ack.clone(),
            })
            .collect();
        let outcome = compact(
            self.stores.log.as_ref(),
            self.stores.metadata.as_ref(),
            CompactionInput {
                doc_id: &self.doc_id,
                from_version: state.version,
                from_base_seq: state.version_base_seq,
                text: state.text.to_string(),
                seq: state.seq,
                submissions,
                now: chrono::Utc::now().timestamp_millis(),
            },
        )?;

        if let CompactionOutcome::Committed { version, .. } = &outcome {
            state.version = *version;
            state.version_base_seq = state.seq;
        }
        Ok(IdleCompaction::Ran(outcome))
    }

    /// Current text, mostly for tests and diagnostics
    pub async fn text(&self) -> String {
        self.state.lock().await.text.to_string()
    }

    pub async fn seq(&self) -> u64 {
        self.state.lock().await.seq
    }

    pub async fn version(&self) -> VersionId {
        self.state.lock().await.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrivener_core::ownership::{MemoryCoordinator, NodeInfo};
    use scrivener_core::storage::MemoryStorage;

    struct Fixture {
        storage: MemoryStorage,
        record: OwnershipRecord,
        node: NodeInfo,
        stores: SessionStores,
        config: SessionConfig,
        session: DocumentSession,
    }

    impl Fixture {
        /// A fresh session from whatever the stores hold now
        fn reload(&self) -> DocumentSession {
            DocumentSession::load(
                &self.record,
                &self.node,
                self.stores.clone(),
                self.config.clone(),
            )
            .unwrap()
        }

        /// Operation as another writer of this document would append it
        fn foreign_op(&self, seq: u64, epoch: u64, edit: Edit) -> Operation {
            Operation {
                id: format!("foreign-{seq}"),
                doc_id: "doc".into(),
                version: VersionId::GENESIS,
                seq,
                epoch,
                author: "mallory".into(),
                client_op_id: format!("m{seq}"),
                edit,
                timestamp: 0,
            }
        }
    }

    fn fixture(window_size: usize) -> Fixture {
        let storage = MemoryStorage::new();
        let node = NodeInfo::new("n1", "127.0.0.1:1");
        let coordinator = Arc::new(MemoryCoordinator::with_vnodes(8));
        coordinator.register_node(node.clone()).unwrap();
        let record = coordinator.current().record("doc").unwrap();
        coordinator
            .acquire("doc", &record.node_id, record.epoch)
            .unwrap();

        let stores = SessionStores {
            log: Arc::new(storage.clone()),
            metadata: Arc::new(storage.clone()),
            coordinator,
        };
        let config = SessionConfig {
            window_size,
            ..SessionConfig::default()
        };
        let session =
            DocumentSession::load(&record, &node, stores.clone(), config.clone()).unwrap();
        Fixture {
            storage,
            record,
            node,
            stores,
            config,
            session,
        }
    }

    #[tokio::test]
    async fn test_hello_world_concurrent_submissions() {
        let f = fixture(16);
        let (_, _rx_a) = f.session.join("a", "alice").await.unwrap();
        let (_, _rx_b) = f.session.join("b", "bob").await.unwrap();
        f.session
            .submit("a", "seed", 0, Edit::insert(0, "Hello!"))
            .await
            .unwrap();

        // Both edited "Hello!" at seq 1
        let first = f
            .session
            .submit("b", "del", 1, Edit::delete(5, 1))
            .await
            .unwrap();
        let second = f
            .session
            .submit("a", "ins", 1, Edit::insert(5, ", world"))
            .await
            .unwrap();

        assert_eq!(first.seq, 2);
        assert_eq!(second.seq, 3);
        assert_eq!(second.applied, vec![Edit::insert(5, ", world")]);
        assert_eq!(f.session.text().await, "Hello, world");
    }

    #[tokio::test]
    async fn test_retry_returns_same_ack_and_records_once() {
        let f = fixture(16);
        let (_, mut rx) = f.session.join("a", "alice").await.unwrap();
        let (_, _other) = f.session.join("b", "bob").await.unwrap();

        let ack = f
            .session
            .submit("a", "x1", 0, Edit::insert(0, "hi"))
            .await
            .unwrap();
        // Ack lost; the client reconnects and retries the same id
        let retry = f
            .session
            .submit("a", "x1", 0, Edit::insert(0, "hi"))
            .await
            .unwrap();

        assert_eq!(ack, retry);
        assert_eq!(f.storage.operation_count("doc"), 1);
        assert_eq!(f.session.text().await, "hi");

        let mut operations = 0;
        while let Ok(event) = rx.try_recv() {
            if event.seq().is_some() {
                operations += 1;
            }
        }
        assert_eq!(operations, 1);
    }

    #[tokio::test]
    async fn test_failed_append_changes_nothing() {
        let f = fixture(16);
        let (_, mut rx) = f.session.join("a", "alice").await.unwrap();
        while rx.try_recv().is_ok() {}

        f.storage.fail_next_appends(1);
        let err = f
            .session
            .submit("a", "x1", 0, Edit::insert(0, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrivenerError::TransientIo(_)));
        assert_eq!(f.session.text().await, "");
        assert_eq!(f.session.seq().await, 0);
        assert!(rx.try_recv().is_err());

        // Same id goes through once storage recovers
        let ack = f
            .session
            .submit("a", "x1", 0, Edit::insert(0, "hi"))
            .await
            .unwrap();
        assert_eq!(ack.seq, 1);
        assert_eq!(f.storage.operation_count("doc"), 1);
    }

    #[tokio::test]
    async fn test_split_delete_appends_two_consecutive_ops() {
        let f = fixture(16);
        f.session.join("a", "alice").await.unwrap();
        f.session.join("b", "bob").await.unwrap();
        f.session
            .submit("a", "seed", 0, Edit::insert(0, "abcdef"))
            .await
            .unwrap();

        f.session
            .submit("a", "ins", 1, Edit::insert(3, "XY"))
            .await
            .unwrap();
        let ack = f
            .session
            .submit("b", "del", 1, Edit::delete(1, 4))
            .await
            .unwrap();

        assert_eq!(ack.seq, 4);
        assert_eq!(ack.applied.len(), 2);
        assert_eq!(f.session.text().await, "aXYf");
        let ops = f
            .storage
            .read_range("doc", VersionId::GENESIS, 3)
            .unwrap();
        assert_eq!(
            ops.iter().map(|op| op.seq).collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[tokio::test]
    async fn test_covered_delete_acks_current_seq() {
        let f = fixture(16);
        f.session.join("a", "alice").await.unwrap();
        f.session
            .submit("a", "seed", 0, Edit::insert(0, "abcdefg"))
            .await
            .unwrap();
        f.session
            .submit("a", "wipe", 1, Edit::delete(0, 6))
            .await
            .unwrap();

        let ack = f
            .session
            .submit("a", "inner", 1, Edit::delete(2, 2))
            .await
            .unwrap();
        assert_eq!(ack.seq, 2);
        assert!(ack.applied.is_empty());
        assert_eq!(f.session.text().await, "g");
        assert_eq!(f.storage.operation_count("doc"), 2);
    }

    #[tokio::test]
    async fn test_stale_base_rejected() {
        let f = fixture(2);
        f.session.join("a", "alice").await.unwrap();
        for i in 0..4 {
            f.session
                .submit("a", &format!("op{i}"), i, Edit::insert(0, "x"))
                .await
                .unwrap();
        }
        let err = f
            .session
            .submit("a", "late", 1, Edit::insert(0, "y"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScrivenerError::StaleBase {
                base_seq: 1,
                oldest: 2,
                current: 4
            }
        ));
        let err = f
            .session
            .submit("a", "future", 9, Edit::insert(0, "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrivenerError::StaleBase { .. }));
    }

    #[tokio::test]
    async fn test_out_of_bounds_edit_rejected() {
        let f = fixture(16);
        f.session.join("a", "alice").await.unwrap();
        let err = f
            .session
            .submit("a", "bad", 0, Edit::delete(0, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrivenerError::MalformedOp(_)));
        assert_eq!(f.storage.operation_count("doc"), 0);
    }

    #[tokio::test]
    async fn test_cursors_shift_and_clear_on_leave() {
        let f = fixture(16);
        f.session.join("a", "alice").await.unwrap();
        f.session.join("b", "bob").await.unwrap();
        f.session
            .submit("a", "seed", 0, Edit::insert(0, "hello"))
            .await
            .unwrap();

        f.session.update_cursor("b", 3).await.unwrap();
        assert!(f.session.update_cursor("b", 6).await.is_err());

        f.session
            .submit("a", "front", 1, Edit::insert(0, ">>"))
            .await
            .unwrap();
        let state = f.session.snapshot_state().await;
        assert_eq!(
            state.cursors,
            vec![CursorInfo {
                user_id: "bob".into(),
                position: 5
            }]
        );

        assert_eq!(f.session.leave("b").await, 1);
        assert!(f.session.snapshot_state().await.cursors.is_empty());
    }

    #[tokio::test]
    async fn test_compaction_waits_for_idle_and_keeps_text() {
        let f = fixture(16);
        f.session.join("a", "alice").await.unwrap();
        f.session
            .submit("a", "seed", 0, Edit::insert(0, "Hello!"))
            .await
            .unwrap();

        assert_eq!(
            f.session.compact_if_idle().await.unwrap(),
            IdleCompaction::Reconnected
        );

        f.session.leave("a").await;
        let outcome = f.session.compact_if_idle().await.unwrap();
        assert!(matches!(
            outcome,
            IdleCompaction::Ran(CompactionOutcome::Committed { .. })
        ));
        assert_ne!(f.session.version().await, VersionId::GENESIS);

        // Appends continue in the new version with the next seq
        f.session.join("a", "alice").await.unwrap();
        let ack = f
            .session
            .submit("a", "more", 1, Edit::insert(6, "?"))
            .await
            .unwrap();
        assert_eq!(ack.seq, 2);
        assert_eq!(f.session.text().await, "Hello!?");
    }

    #[tokio::test]
    async fn test_closed_session_rejects_joins() {
        let f = fixture(16);
        f.session.close("n2", "127.0.0.1:2").await;
        assert!(matches!(
            f.session.join("a", "alice").await,
            Err(ScrivenerError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_prompted_by_broadcast_gets_recorded_ack() {
        let f = fixture(16);
        f.session.join("a", "alice").await.unwrap();
        let (_, mut bob) = f.session.join("b", "bob").await.unwrap();
        while bob.try_recv().is_ok() {}

        let ack = f
            .session
            .submit("a", "x1", 0, Edit::insert(0, "hi"))
            .await
            .unwrap();

        // Once anyone can see the operation its ack is already recorded
        let event = bob.try_recv().unwrap();
        assert_eq!(event.seq(), Some(1));
        let retry = f
            .session
            .submit("a", "x1", 0, Edit::insert(0, "hi"))
            .await
            .unwrap();
        assert_eq!(retry, ack);
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retry_after_reload_returns_same_ack() {
        let f = fixture(16);
        f.session.join("a", "alice").await.unwrap();
        f.session
            .submit("a", "seed", 0, Edit::insert(0, "abcdef"))
            .await
            .unwrap();
        f.session
            .submit("a", "ins", 1, Edit::insert(3, "XY"))
            .await
            .unwrap();
        // Splits into two operations against the insert
        let ack = f
            .session
            .submit("a", "x1", 1, Edit::delete(1, 4))
            .await
            .unwrap();
        assert_eq!(ack.applied.len(), 2);
        f.session.leave("a").await;
        f.session.close("n1", "127.0.0.1:1").await;

        let session = f.reload();
        assert_eq!(session.version().await, VersionId::GENESIS);
        session.join("a2", "alice").await.unwrap();
        let retry = session
            .submit("a2", "x1", 1, Edit::delete(1, 4))
            .await
            .unwrap();
        assert_eq!(retry, ack);
        assert_eq!(f.storage.operation_count("doc"), 4);
        assert_eq!(session.text().await, "aXYf");
    }

    #[tokio::test]
    async fn test_retry_after_compaction_and_reload_returns_same_ack() {
        let f = fixture(16);
        f.session.join("a", "alice").await.unwrap();
        let ack = f
            .session
            .submit("a", "x1", 0, Edit::insert(0, "Hello!"))
            .await
            .unwrap();
        f.session.leave("a").await;
        assert!(matches!(
            f.session.compact_if_idle().await.unwrap(),
            IdleCompaction::Ran(CompactionOutcome::Committed { .. })
        ));
        assert!(f.session.close_if_idle().await);

        let session = f.reload();
        assert_ne!(session.version().await, VersionId::GENESIS);
        session.join("a2", "alice").await.unwrap();
        let retry = session
            .submit("a2", "x1", 0, Edit::insert(0, "Hello!"))
            .await
            .unwrap();
        assert_eq!(retry, ack);
        assert_eq!(f.storage.operation_count("doc"), 1);
        assert_eq!(session.text().await, "Hello!");
    }

    #[tokio::test]
    async fn test_append_from_earlier_epoch_is_fenced() {
        let f = fixture(16);
        f.session.join("a", "alice").await.unwrap();

        // A previous owner's append arriving after this session loaded
        let late = f.foreign_op(1, f.record.epoch - 1, Edit::insert(0, "stale"));
        assert!(matches!(
            f.storage.append(&late),
            Err(ScrivenerError::Fenced { .. })
        ));

        let ack = f
            .session
            .submit("a", "x1", 0, Edit::insert(0, "fresh"))
            .await
            .unwrap();
        assert_eq!(ack.seq, 1);
        let ops = f.storage.read_range("doc", VersionId::GENESIS, 0).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].epoch, f.record.epoch);
    }

    #[tokio::test]
    async fn test_log_ahead_of_session_closes_it_for_reload() {
        let f = fixture(16);
        let (_, mut rx) = f.session.join("a", "alice").await.unwrap();
        while rx.try_recv().is_ok() {}

        // Something else wrote under this epoch after the session loaded
        f.storage
            .append(&f.foreign_op(1, f.record.epoch, Edit::insert(0, "elsewhere ")))
            .unwrap();

        let err = f
            .session
            .submit("a", "x1", 0, Edit::insert(0, "here"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrivenerError::SequenceGap { expected: 2, got: 1, .. }));
        assert!(f.session.is_closed());
        match rx.try_recv().unwrap() {
            SessionEvent::Redirect { node_id, addr, .. } => {
                assert_eq!(node_id, "n1");
                assert_eq!(addr, "127.0.0.1:1");
            }
            other => panic!("expected redirect, got {other:?}"),
        }
        assert_eq!(f.session.text().await, "");

        let session = f.reload();
        session.join("a2", "alice").await.unwrap();
        assert_eq!(session.text().await, "elsewhere ");
        let ack = session
            .submit("a2", "x1", 1, Edit::insert(10, "here"))
            .await
            .unwrap();
        assert_eq!(ack.seq, 2);
        assert_eq!(session.text().await, "elsewhere here");
    }
}
