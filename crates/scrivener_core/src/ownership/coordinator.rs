//! Linearizable coordination: the membership log and ownership claims.
//!
//! Everything that changes who owns what goes through a [`Coordinator`].
//! The ring snapshot decides which `(node, epoch)` a document belongs to;
//! the claim table makes sure the previous holder has let go before the
//! new one starts appending.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::membership::{MembershipChange, NodeInfo, RingSnapshot};
use super::ring::DEFAULT_VNODES;
use crate::error::{Result, ScrivenerError};

/// The node currently allowed to append to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub node_id: String,
    pub epoch: u64,
}

/// Shared coordination state for a cluster.
///
/// Implementations must be linearizable: every node observes the same
/// ordered membership log, and claim operations act on the latest snapshot.
pub trait Coordinator: Send + Sync {
    /// Add a node (or update its address). Returns the resulting snapshot.
    fn register_node(&self, node: NodeInfo) -> Result<Arc<RingSnapshot>>;

    /// Graceful departure.
    fn deregister_node(&self, node_id: &str) -> Result<Arc<RingSnapshot>>;

    /// Record that a node is alive.
    fn heartbeat(&self, node_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Remove every node silent for longer than `timeout`. Returns the
    /// removed node ids.
    fn expire_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<String>>;

    /// Latest snapshot this process has observed.
    fn current(&self) -> Arc<RingSnapshot>;

    /// Subscribe to snapshot commits.
    fn watch_membership(&self) -> watch::Receiver<Arc<RingSnapshot>>;

    /// Pull commits made elsewhere and publish them to watchers.
    fn refresh(&self) -> Result<Arc<RingSnapshot>>;

    /// Snapshots committed after `since`, oldest first.
    fn history(&self, since: u64) -> Result<Vec<Arc<RingSnapshot>>>;

    /// Claim a document for `(node_id, epoch)`.
    fn acquire(&self, doc_id: &str, node_id: &str, epoch: u64) -> Result<()>;

    /// Check that `(node_id, epoch)` still owns and holds the document.
    fn validate(&self, doc_id: &str, node_id: &str, epoch: u64) -> Result<()>;

    /// Let go of a claim. Releasing a claim one does not hold is a no-op.
    fn release(&self, doc_id: &str, node_id: &str, epoch: u64) -> Result<()>;

    /// Current claim holder, if any.
    fn claim(&self, doc_id: &str) -> Result<Option<Claim>>;
}

/// Decide an acquire against the latest snapshot and existing claim.
/// Returns `true` when the claim needs to be (re)written.
pub(crate) fn check_acquire(
    snapshot: &RingSnapshot,
    existing: Option<&Claim>,
    doc_id: &str,
    node_id: &str,
    epoch: u64,
) -> Result<bool> {
    check_assignment(snapshot, doc_id, node_id, epoch)?;
    match existing {
        None => Ok(true),
        Some(claim) if claim.node_id == node_id && claim.epoch == epoch => Ok(false),
        Some(claim) if claim.epoch > epoch => Err(stale(doc_id, node_id, epoch)),
        Some(claim) if claim.node_id == node_id => Ok(true),
        // Holder failed or was removed: fenced by the membership commit
        Some(claim) if !snapshot.contains_node(&claim.node_id) => Ok(true),
        Some(claim) => Err(ScrivenerError::HandoffPending {
            doc_id: doc_id.to_string(),
            holder: claim.node_id.clone(),
        }),
    }
}

/// Fencing check for a submit: the snapshot still assigns `(node, epoch)`
/// and the caller holds the claim.
pub(crate) fn check_validate(
    snapshot: &RingSnapshot,
    existing: Option<&Claim>,
    doc_id: &str,
    node_id: &str,
    epoch: u64,
) -> Result<()> {
    check_assignment(snapshot, doc_id, node_id, epoch)?;
    match existing {
        Some(claim) if claim.node_id == node_id && claim.epoch == epoch => Ok(()),
        _ => Err(stale(doc_id, node_id, epoch)),
    }
}

fn check_assignment(snapshot: &RingSnapshot, doc_id: &str, node_id: &str, epoch: u64) -> Result<()> {
    let record = snapshot
        .record(doc_id)
        .ok_or(ScrivenerError::EmptyMembership)?;
    if record.node_id != node_id || record.epoch != epoch {
        return Err(stale(doc_id, node_id, epoch));
    }
    Ok(())
}

fn stale(doc_id: &str, node_id: &str, epoch: u64) -> ScrivenerError {
    ScrivenerError::OwnershipStale {
        doc_id: doc_id.to_string(),
        node_id: node_id.to_string(),
        epoch,
    }
}

/// Membership log entries kept for [`Coordinator::history`].
const HISTORY_LIMIT: usize = 1024;

struct State {
    log: Vec<Arc<RingSnapshot>>,
    heartbeats: HashMap<String, DateTime<Utc>>,
    claims: HashMap<String, Claim>,
}

impl State {
    fn latest(&self) -> &Arc<RingSnapshot> {
        // The log always holds at least the genesis snapshot
        &self.log[self.log.len() - 1]
    }
}

/// In-process coordinator for single-process clusters and tests.
///
/// Several [`crate::ownership::OwnershipDirectory`]s (one per simulated node)
/// can share one instance behind an `Arc`.
pub struct MemoryCoordinator {
    state: Mutex<State>,
    tx: watch::Sender<Arc<RingSnapshot>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES)
    }

    pub fn with_vnodes(vnodes: usize) -> Self {
        let genesis = Arc::new(RingSnapshot::genesis(vnodes));
        let (tx, _) = watch::channel(genesis.clone());
        Self {
            state: Mutex::new(State {
                log: vec![genesis],
                heartbeats: HashMap::new(),
                claims: HashMap::new(),
            }),
            tx,
        }
    }

    fn commit(&self, state: &mut State, change: MembershipChange) -> Result<Arc<RingSnapshot>> {
        let latest = state.latest().clone();
        if !latest.changes_anything(&change) {
            return Ok(latest);
        }
        let next = Arc::new(latest.apply(change, Utc::now().timestamp_millis())?);
        log::info!(
            "Membership v{} committed ({:?}), {} node(s)",
            next.version,
            next.change,
            next.nodes.len()
        );
        state.log.push(next.clone());
        if state.log.len() > HISTORY_LIMIT {
            state.log.remove(0);
        }
        self.tx.send_replace(next.clone());
        Ok(next)
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator for MemoryCoordinator {
    fn register_node(&self, node: NodeInfo) -> Result<Arc<RingSnapshot>> {
        let mut state = self.state.lock().unwrap();
        state.heartbeats.insert(node.node_id.clone(), Utc::now());
        self.commit(&mut state, MembershipChange::Join { node })
    }

    fn deregister_node(&self, node_id: &str) -> Result<Arc<RingSnapshot>> {
        let mut state = self.state.lock().unwrap();
        state.heartbeats.remove(node_id);
        self.commit(
            &mut state,
            MembershipChange::Leave {
                node_id: node_id.to_string(),
            },
        )
    }

    fn heartbeat(&self, node_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.latest().contains_node(node_id) {
            return Err(ScrivenerError::UnknownNode(node_id.to_string()));
        }
        state.heartbeats.insert(node_id.to_string(), now);
        Ok(())
    }

    fn expire_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        let cutoff = now - timeout;
        let stale: Vec<String> = state
            .latest()
            .nodes
            .keys()
            .filter(|id| state.heartbeats.get(*id).is_none_or(|seen| *seen < cutoff))
            .cloned()
            .collect();

        for node_id in &stale {
            log::warn!("Expiring node '{}': no heartbeat since {}", node_id, cutoff);
            state.heartbeats.remove(node_id);
            self.commit(
                &mut state,
                MembershipChange::Expire {
                    node_id: node_id.clone(),
                },
            )?;
        }
        Ok(stale)
    }

    fn current(&self) -> Arc<RingSnapshot> {
        self.tx.borrow().clone()
    }

    fn watch_membership(&self) -> watch::Receiver<Arc<RingSnapshot>> {
        self.tx.subscribe()
    }

    fn refresh(&self) -> Result<Arc<RingSnapshot>> {
        // Commits publish synchronously; nothing can be missed
        Ok(self.current())
    }

    fn history(&self, since: u64) -> Result<Vec<Arc<RingSnapshot>>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .log
            .iter()
            .filter(|snap| snap.version > since)
            .cloned()
            .collect())
    }

    fn acquire(&self, doc_id: &str, node_id: &str, epoch: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let snapshot = state.latest().clone();
        if check_acquire(&snapshot, state.claims.get(doc_id), doc_id, node_id, epoch)? {
            log::debug!("'{}' claimed by {} at epoch {}", doc_id, node_id, epoch);
            state.claims.insert(
                doc_id.to_string(),
                Claim {
                    node_id: node_id.to_string(),
                    epoch,
                },
            );
        }
        Ok(())
    }

    fn validate(&self, doc_id: &str, node_id: &str, epoch: u64) -> Result<()> {
        let state = self.state.lock().unwrap();
        check_validate(state.latest(), state.claims.get(doc_id), doc_id, node_id, epoch)
    }

    fn release(&self, doc_id: &str, node_id: &str, epoch: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let held = state
            .claims
            .get(doc_id)
            .is_some_and(|c| c.node_id == node_id && c.epoch == epoch);
        if held {
            state.claims.remove(doc_id);
            log::debug!("'{}' released by {} at epoch {}", doc_id, node_id, epoch);
        }
        Ok(())
    }

    fn claim(&self, doc_id: &str) -> Result<Option<Claim>> {
        Ok(self.state.lock().unwrap().claims.get(doc_id).cloned())
    }
}
