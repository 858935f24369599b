//! Document → owner lookups over the latest observed ring snapshot.

use std::sync::Arc;
use tokio::sync::watch;

use super::coordinator::Coordinator;
use super::membership::{NodeInfo, OwnershipRecord, RingSnapshot};
use crate::error::{Result, ScrivenerError};

/// Read-only view of who owns which document.
///
/// Resolution is a pure function of the snapshot: for a fixed membership
/// version every process resolves a document to the same record.
#[derive(Clone)]
pub struct OwnershipDirectory {
    coordinator: Arc<dyn Coordinator>,
    view: watch::Receiver<Arc<RingSnapshot>>,
}

impl OwnershipDirectory {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        let view = coordinator.watch_membership();
        Self { coordinator, view }
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    /// Latest snapshot this directory has observed.
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.view.borrow().clone()
    }

    pub fn membership_version(&self) -> u64 {
        self.view.borrow().version
    }

    /// Owner and epoch of `doc_id`.
    pub fn resolve(&self, doc_id: &str) -> Result<OwnershipRecord> {
        self.snapshot()
            .record(doc_id)
            .ok_or(ScrivenerError::EmptyMembership)
    }

    /// Owner record plus the address clients should connect to.
    pub fn resolve_with_addr(&self, doc_id: &str) -> Result<(OwnershipRecord, NodeInfo)> {
        let snapshot = self.snapshot();
        let record = snapshot
            .record(doc_id)
            .ok_or(ScrivenerError::EmptyMembership)?;
        let node = snapshot
            .node(&record.node_id)
            .cloned()
            .ok_or_else(|| ScrivenerError::UnknownNode(record.node_id.clone()))?;
        Ok((record, node))
    }
}
