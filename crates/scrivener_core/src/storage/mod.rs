//! Durable state: the operation log, snapshots and per-document metadata.
//!
//! Two traits split the persistence needs of a session:
//!
//! - [`OperationLog`] holds the append-only operations and the compacted
//!   snapshots, keyed by `(doc_id, version)`.
//! - [`MetadataStore`] holds the current-version pointer of every document,
//!   the version counter, the owner hint and the retired-version queue.
//!
//! Both have an in-memory backend for tests and, with the `sqlite` feature,
//! a SQLite backend.

mod memory_storage;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite_storage;

pub use memory_storage::MemoryStorage;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite_storage::SqliteStorage;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{Result, ScrivenerError};
use crate::types::{Operation, Snapshot, VersionId};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T>;

/// Append-only log of operations plus compacted snapshots.
///
/// # Sequencing
///
/// Within one `(doc_id, version)` sequence numbers are gap-free. The first
/// operation of a version must carry the version snapshot's `base_seq + 1`
/// (`1` for the genesis version); every later one the previous plus one.
/// Backends reject anything else with [`ScrivenerError::SequenceGap`].
///
/// # Fencing
///
/// Every document has a fencing epoch, the highest ownership epoch the log
/// has seen for it. A batch whose `epoch` is below the fence is rejected
/// with [`ScrivenerError::Fenced`]; an accepted batch raises the fence to
/// its epoch. The check and the write happen atomically, so once a new
/// owner has called [`OperationLog::fence`] no append of an older owner can
/// land behind it.
pub trait OperationLog: Send + Sync {
    /// Append a single operation. Returns its sequence number.
    fn append(&self, op: &Operation) -> StorageResult<u64> {
        self.append_batch(std::slice::from_ref(op))
    }

    /// Append operations atomically: either all of them become durable or
    /// none do. All must share one `(doc_id, version)` and one epoch.
    /// Returns the last sequence number.
    fn append_batch(&self, ops: &[Operation]) -> StorageResult<u64>;

    /// Raise a document's fencing epoch to `epoch`. Never lowers it.
    fn fence(&self, doc_id: &str, epoch: u64) -> StorageResult<()>;

    /// Current fencing epoch; `0` for documents never written or fenced.
    fn fence_epoch(&self, doc_id: &str) -> StorageResult<u64>;

    /// Operations of a version with `seq >= from_seq`, in sequence order.
    fn read_range(&self, doc_id: &str, version: VersionId, from_seq: u64)
    -> StorageResult<Vec<Operation>>;

    /// Highest sequence number stored under a version.
    fn last_seq(&self, doc_id: &str, version: VersionId) -> StorageResult<Option<u64>>;

    /// Store a snapshot. Snapshots are write-once.
    fn write_snapshot(&self, snapshot: &Snapshot) -> StorageResult<()>;

    fn read_snapshot(&self, doc_id: &str, version: VersionId) -> StorageResult<Option<Snapshot>>;

    /// Drop a version's snapshot and operations.
    fn delete_version(&self, doc_id: &str, version: VersionId) -> StorageResult<()>;

    /// Versions with a snapshot or operations, ascending.
    fn versions(&self, doc_id: &str) -> StorageResult<Vec<VersionId>>;
}

/// Externally visible metadata of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct DocumentMeta {
    pub doc_id: String,
    pub current_version: VersionId,
    /// Node that last served the document
    pub owner_hint: Option<String>,
    /// Last change (Unix milliseconds)
    pub updated_at: i64,
}

/// A superseded version waiting for deferred deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredVersion {
    pub doc_id: String,
    pub version: VersionId,
    /// When it was retired (Unix milliseconds)
    pub retired_at: i64,
}

/// Per-document metadata with a compare-and-swap version pointer.
pub trait MetadataStore: Send + Sync {
    /// Current version; [`VersionId::GENESIS`] for unknown documents.
    fn current_version(&self, doc_id: &str) -> StorageResult<VersionId>;

    /// Move the pointer from `expected` to `new`. Returns `false`, changing
    /// nothing, when the pointer is no longer at `expected`.
    fn compare_and_swap_version(
        &self,
        doc_id: &str,
        expected: VersionId,
        new: VersionId,
    ) -> StorageResult<bool>;

    /// Reserve a fresh version id. Ids are never handed out twice.
    fn allocate_version(&self, doc_id: &str) -> StorageResult<VersionId>;

    fn set_owner_hint(&self, doc_id: &str, node_id: Option<&str>) -> StorageResult<()>;

    fn document(&self, doc_id: &str) -> StorageResult<Option<DocumentMeta>>;

    /// Queue a version for deletion once its grace period passes.
    fn retire_version(&self, doc_id: &str, version: VersionId, retired_at: i64)
    -> StorageResult<()>;

    /// Retired versions queued before `cutoff` (Unix milliseconds).
    fn retired_before(&self, cutoff: i64) -> StorageResult<Vec<RetiredVersion>>;

    /// Remove a version from the retired queue after deleting it.
    fn forget_retired(&self, doc_id: &str, version: VersionId) -> StorageResult<()>;
}

/// Sequence number the next operation of a version must carry, given the
/// last stored one and the version's snapshot.
pub(crate) fn expected_next_seq(last: Option<u64>, snapshot_base: Option<u64>) -> u64 {
    match last {
        Some(seq) => seq + 1,
        None => snapshot_base.unwrap_or(0) + 1,
    }
}

/// Reject a batch appended under an epoch older than the document's fence.
pub(crate) fn check_fence(ops: &[Operation], fence: u64) -> StorageResult<()> {
    match ops.first() {
        Some(first) if first.epoch < fence => Err(ScrivenerError::Fenced {
            doc_id: first.doc_id.clone(),
            epoch: first.epoch,
            fence,
        }),
        _ => Ok(()),
    }
}

/// Shared shape checks for [`OperationLog::append_batch`]: one document,
/// version and epoch, consecutive sequence numbers starting at `expected`.
pub(crate) fn check_batch(ops: &[Operation], expected: u64) -> StorageResult<()> {
    let Some(first) = ops.first() else {
        return Ok(());
    };
    for (i, op) in ops.iter().enumerate() {
        if op.doc_id != first.doc_id || op.version != first.version || op.epoch != first.epoch
        {
            return Err(ScrivenerError::MalformedOp(
                "batch spans several documents, versions or epochs".to_string(),
            ));
        }
        let want = expected + i as u64;
        if op.seq != want {
            return Err(ScrivenerError::SequenceGap {
                doc_id: op.doc_id.clone(),
                version: op.version,
                expected: want,
                got: op.seq,
            });
        }
    }
    Ok(())
}
