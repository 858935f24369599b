//! In-memory storage implementation for testing.
//!
//! Implements both [`OperationLog`] and [`MetadataStore`]. Appends can be
//! made to fail on demand to exercise the failure paths of a session.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use super::{
    DocumentMeta, MetadataStore, OperationLog, RetiredVersion, StorageResult, check_batch,
    check_fence, expected_next_seq,
};
use crate::error::ScrivenerError;
use crate::types::{Operation, Snapshot, VersionId};

type VersionKey = (String, VersionId);

/// In-memory storage for tests and single-process experiments.
///
/// Thread-safe via `RwLock`; data is lost when dropped. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    /// Operations per `(doc, version)`, in sequence order
    ops: Arc<RwLock<HashMap<VersionKey, Vec<Operation>>>>,

    snapshots: Arc<RwLock<HashMap<VersionKey, Snapshot>>>,

    /// Fencing epoch per document. Only touched while holding `ops`.
    fences: Arc<RwLock<HashMap<String, u64>>>,

    docs: Arc<RwLock<HashMap<String, DocRow>>>,

    /// Retired versions keyed by `(doc, version)`
    retired: Arc<RwLock<BTreeMap<VersionKey, i64>>>,

    /// Number of upcoming appends that fail with a transient error
    failing_appends: Arc<AtomicUsize>,
}

#[derive(Debug, Clone, Default)]
struct DocRow {
    current_version: VersionId,
    next_version: u64,
    owner_hint: Option<String>,
    updated_at: i64,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail with [`ScrivenerError::TransientIo`]
    /// without storing anything.
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Total number of stored operations for a document, across versions.
    pub fn operation_count(&self, doc_id: &str) -> usize {
        let ops = self.ops.read().unwrap();
        ops.iter()
            .filter(|((doc, _), _)| doc == doc_id)
            .map(|(_, list)| list.len())
            .sum()
    }

    fn take_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn touch(&self, doc_id: &str) -> i64 {
        chrono::Utc::now().timestamp_millis().max(
            self.docs
                .read()
                .unwrap()
                .get(doc_id)
                .map_or(0, |row| row.updated_at),
        )
    }
}

impl OperationLog for MemoryStorage {
    fn append_batch(&self, ops: &[Operation]) -> StorageResult<u64> {
        let Some(first) = ops.first() else {
            return Ok(0);
        };
        if self.take_failure() {
            return Err(ScrivenerError::TransientIo(
                "injected append failure".to_string(),
            ));
        }

        let key = (first.doc_id.clone(), first.version);
        let base = self
            .snapshots
            .read()
            .unwrap()
            .get(&key)
            .map(|s| s.base_seq);

        let mut log = self.ops.write().unwrap();
        let mut fences = self.fences.write().unwrap();
        let fence = fences.entry(first.doc_id.clone()).or_default();
        check_fence(ops, *fence)?;

        let entry = log.entry(key).or_default();
        let expected = expected_next_seq(entry.last().map(|op| op.seq), base);
        check_batch(ops, expected)?;

        entry.extend_from_slice(ops);
        *fence = first.epoch;
        Ok(ops[ops.len() - 1].seq)
    }

    fn fence(&self, doc_id: &str, epoch: u64) -> StorageResult<()> {
        let _log = self.ops.write().unwrap();
        let mut fences = self.fences.write().unwrap();
        let fence = fences.entry(doc_id.to_string()).or_default();
        *fence = (*fence).max(epoch);
        Ok(())
    }

    fn fence_epoch(&self, doc_id: &str) -> StorageResult<u64> {
        Ok(self
            .fences
            .read()
            .unwrap()
            .get(doc_id)
            .copied()
            .unwrap_or(0))
    }

    fn read_range(
        &self,
        doc_id: &str,
        version: VersionId,
        from_seq: u64,
    ) -> StorageResult<Vec<Operation>> {
        let log = self.ops.read().unwrap();
        Ok(log
            .get(&(doc_id.to_string(), version))
            .map(|ops| ops.iter().filter(|op| op.seq >= from_seq).cloned().collect())
            .unwrap_or_default())
    }

    fn last_seq(&self, doc_id: &str, version: VersionId) -> StorageResult<Option<u64>> {
        let log = self.ops.read().unwrap();
        Ok(log
            .get(&(doc_id.to_string(), version))
            .and_then(|ops| ops.last())
            .map(|op| op.seq))
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let mut snapshots = self.snapshots.write().unwrap();
        let key = (snapshot.doc_id.clone(), snapshot.version);
        if snapshots.contains_key(&key) {
            return Err(ScrivenerError::SnapshotExists {
                doc_id: snapshot.doc_id.clone(),
                version: snapshot.version,
            });
        }
        snapshots.insert(key, snapshot.clone());
        Ok(())
    }

    fn read_snapshot(&self, doc_id: &str, version: VersionId) -> StorageResult<Option<Snapshot>> {
        let snapshots = self.snapshots.read().unwrap();
        Ok(snapshots.get(&(doc_id.to_string(), version)).cloned())
    }

    fn delete_version(&self, doc_id: &str, version: VersionId) -> StorageResult<()> {
        let key = (doc_id.to_string(), version);
        self.ops.write().unwrap().remove(&key);
        self.snapshots.write().unwrap().remove(&key);
        Ok(())
    }

    fn versions(&self, doc_id: &str) -> StorageResult<Vec<VersionId>> {
        let mut versions: Vec<VersionId> = self
            .ops
            .read()
            .unwrap()
            .keys()
            .chain(self.snapshots.read().unwrap().keys())
            .filter(|(doc, _)| doc == doc_id)
            .map(|(_, version)| *version)
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }
}

impl MetadataStore for MemoryStorage {
    fn current_version(&self, doc_id: &str) -> StorageResult<VersionId> {
        let docs = self.docs.read().unwrap();
        Ok(docs
            .get(doc_id)
            .map_or(VersionId::GENESIS, |row| row.current_version))
    }

    fn compare_and_swap_version(
        &self,
        doc_id: &str,
        expected: VersionId,
        new: VersionId,
    ) -> StorageResult<bool> {
        let now = self.touch(doc_id);
        let mut docs = self.docs.write().unwrap();
        let row = docs.entry(doc_id.to_string()).or_default();
        if row.current_version != expected {
            return Ok(false);
        }
        row.current_version = new;
        row.updated_at = now;
        Ok(true)
    }

    fn allocate_version(&self, doc_id: &str) -> StorageResult<VersionId> {
        let mut docs = self.docs.write().unwrap();
        let row = docs.entry(doc_id.to_string()).or_default();
        row.next_version = row.next_version.max(row.current_version.0) + 1;
        Ok(VersionId(row.next_version))
    }

    fn set_owner_hint(&self, doc_id: &str, node_id: Option<&str>) -> StorageResult<()> {
        let now = self.touch(doc_id);
        let mut docs = self.docs.write().unwrap();
        let row = docs.entry(doc_id.to_string()).or_default();
        row.owner_hint = node_id.map(str::to_string);
        row.updated_at = now;
        Ok(())
    }

    fn document(&self, doc_id: &str) -> StorageResult<Option<DocumentMeta>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(doc_id).map(|row| DocumentMeta {
            doc_id: doc_id.to_string(),
            current_version: row.current_version,
            owner_hint: row.owner_hint.clone(),
            updated_at: row.updated_at,
        }))
    }

    fn retire_version(
        &self,
        doc_id: &str,
        version: VersionId,
        retired_at: i64,
    ) -> StorageResult<()> {
        let mut retired = self.retired.write().unwrap();
        retired
            .entry((doc_id.to_string(), version))
            .or_insert(retired_at);
        Ok(())
    }

    fn retired_before(&self, cutoff: i64) -> StorageResult<Vec<RetiredVersion>> {
        let retired = self.retired.read().unwrap();
        Ok(retired
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|((doc_id, version), at)| RetiredVersion {
                doc_id: doc_id.clone(),
                version: *version,
                retired_at: *at,
            })
            .collect())
    }

    fn forget_retired(&self, doc_id: &str, version: VersionId) -> StorageResult<()> {
        self.retired
            .write()
            .unwrap()
            .remove(&(doc_id.to_string(), version));
        Ok(())
    }
}
