//! Online compaction.
//!
//! A compaction folds a version's operations into a snapshot under a freshly
//! allocated version and moves the document's version pointer to it with a
//! compare-and-swap:
//!
//! 1. allocate a new version id,
//! 2. write the snapshot under it (write-once),
//! 3. CAS the pointer from the version the text was built on.
//!
//! Nothing is observable before step 3, so a crash earlier leaves the
//! document untouched; the unreferenced snapshot is at worst garbage. The
//! loser of a CAS race retires its own orphan version; the winner retires the
//! version it replaced. Retired versions are deleted by [`sweep_retired`]
//! after a grace period so readers still holding them finish first.

use serde::Serialize;

use crate::error::Result;
use crate::storage::{MetadataStore, OperationLog};
use crate::types::{Snapshot, SubmissionRecord, VersionId};

/// Live state to fold into a snapshot.
#[derive(Debug, Clone)]
pub struct CompactionInput<'a> {
    pub doc_id: &'a str,
    /// Version the live text was built on
    pub from_version: VersionId,
    /// `base_seq` of `from_version`'s snapshot
    pub from_base_seq: u64,
    pub text: String,
    pub seq: u64,
    pub submissions: Vec<SubmissionRecord>,
    /// Unix milliseconds
    pub now: i64,
}

/// What a compaction attempt did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompactionOutcome {
    /// The pointer now references `version`; `previous` is retired
    Committed {
        previous: VersionId,
        version: VersionId,
    },
    /// No operations since the last snapshot
    Unchanged,
    /// Another writer moved the pointer first; `orphan` is retired
    LostRace { orphan: VersionId },
}

/// Run the compaction protocol.
pub fn compact(
    log: &dyn OperationLog,
    metadata: &dyn MetadataStore,
    input: CompactionInput<'_>,
) -> Result<CompactionOutcome> {
    if input.seq == input.from_base_seq {
        return Ok(CompactionOutcome::Unchanged);
    }

    let version = metadata.allocate_version(input.doc_id)?;
    let snapshot = Snapshot {
        doc_id: input.doc_id.to_string(),
        version,
        text: input.text,
        base_seq: input.seq,
        submissions: input.submissions,
        created_at: input.now,
    };
    log.write_snapshot(&snapshot)?;

    if metadata.compare_and_swap_version(input.doc_id, input.from_version, version)? {
        metadata.retire_version(input.doc_id, input.from_version, input.now)?;
        log::info!(
            "Compacted '{}': {} -> {} at seq {}",
            input.doc_id,
            input.from_version,
            version,
            snapshot.base_seq
        );
        Ok(CompactionOutcome::Committed {
            previous: input.from_version,
            version,
        })
    } else {
        metadata.retire_version(input.doc_id, version, input.now)?;
        log::warn!(
            "Compaction of '{}' lost the version race; retiring orphan {}",
            input.doc_id,
            version
        );
        Ok(CompactionOutcome::LostRace { orphan: version })
    }
}

/// Delete versions retired before `cutoff` (Unix milliseconds). Returns how
/// many were deleted.
///
/// A version that became current again is only dropped from the queue.
pub fn sweep_retired(
    log: &dyn OperationLog,
    metadata: &dyn MetadataStore,
    cutoff: i64,
) -> Result<usize> {
    let mut deleted = 0;
    for retired in metadata.retired_before(cutoff)? {
        if metadata.current_version(&retired.doc_id)? != retired.version {
            log.delete_version(&retired.doc_id, retired.version)?;
            deleted += 1;
        }
        metadata.forget_retired(&retired.doc_id, retired.version)?;
    }
    if deleted > 0 {
        log::debug!("Swept {} retired version(s)", deleted);
    }
    Ok(deleted)
}
