//! Reconstructing document text from durable state.
//!
//! [`load_current`] is what a session does on creation: the current
//! version's snapshot plus its trailing operations. [`replay_from_genesis`]
//! walks every retained version instead and cross-checks each snapshot
//! against the replayed text.

use ropey::Rope;
use std::collections::BTreeMap;

use crate::error::{Result, ScrivenerError};
use crate::storage::{MetadataStore, OperationLog};
use crate::types::{Operation, Snapshot, VersionId};

/// State of a document at its current version.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub version: VersionId,
    pub snapshot: Snapshot,
    /// Operations appended to `version` after the snapshot, in order
    pub trailing: Vec<Operation>,
    pub text: Rope,
    /// Sequence number of the last applied operation
    pub seq: u64,
}

/// Load the latest snapshot plus trailing operations.
pub fn load_current(
    log: &dyn OperationLog,
    metadata: &dyn MetadataStore,
    doc_id: &str,
) -> Result<LoadedDocument> {
    let version = metadata.current_version(doc_id)?;
    let snapshot = match log.read_snapshot(doc_id, version)? {
        Some(snapshot) => snapshot,
        None if version.is_genesis() => Snapshot::genesis(doc_id),
        None => {
            return Err(ScrivenerError::Database(format!(
                "snapshot for '{}' {} is missing",
                doc_id, version
            )));
        }
    };

    let trailing = log.read_range(doc_id, version, snapshot.base_seq + 1)?;
    let mut text = Rope::from_str(&snapshot.text);
    let mut seq = snapshot.base_seq;
    for op in &trailing {
        if op.seq != seq + 1 {
            return Err(ScrivenerError::SequenceGap {
                doc_id: doc_id.to_string(),
                version,
                expected: seq + 1,
                got: op.seq,
            });
        }
        op.edit.apply(&mut text)?;
        seq = op.seq;
    }

    log::debug!(
        "Loaded '{}' at {} (base seq {}, {} trailing op(s))",
        doc_id,
        version,
        snapshot.base_seq,
        trailing.len()
    );
    Ok(LoadedDocument {
        version,
        snapshot,
        trailing,
        text,
        seq,
    })
}

/// Result of a full replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    pub text: String,
    pub seq: u64,
    /// Retained versions the replay walked through
    pub versions: Vec<VersionId>,
}

/// Replay every retained operation in sequence order.
///
/// Starts from the empty text when the genesis version is still retained,
/// otherwise from the oldest retained snapshot. Every later snapshot must
/// equal the text replayed up to its `base_seq`.
pub fn replay_from_genesis(log: &dyn OperationLog, doc_id: &str) -> Result<Replay> {
    let versions = log.versions(doc_id)?;

    let mut snapshots: BTreeMap<u64, Vec<Snapshot>> = BTreeMap::new();
    let mut ops: Vec<Operation> = Vec::new();
    for version in &versions {
        if let Some(snapshot) = log.read_snapshot(doc_id, *version)? {
            snapshots.entry(snapshot.base_seq).or_default().push(snapshot);
        }
        ops.extend(log.read_range(doc_id, *version, 0)?);
    }
    ops.sort_by_key(|op| op.seq);

    let (mut text, mut seq) = match versions.first() {
        None => {
            return Ok(Replay {
                text: String::new(),
                seq: 0,
                versions,
            });
        }
        Some(v) if v.is_genesis() => (Rope::new(), 0),
        Some(v) => {
            let oldest = log.read_snapshot(doc_id, *v)?.ok_or_else(|| {
                ScrivenerError::Database(format!("snapshot for '{}' {} is missing", doc_id, v))
            })?;
            (Rope::from_str(&oldest.text), oldest.base_seq)
        }
    };

    check_snapshots(&snapshots, doc_id, seq, &text)?;
    let start = seq;
    for op in ops.iter().filter(|op| op.seq > start) {
        if op.seq != seq + 1 {
            return Err(ScrivenerError::SequenceGap {
                doc_id: doc_id.to_string(),
                version: op.version,
                expected: seq + 1,
                got: op.seq,
            });
        }
        op.edit.apply(&mut text)?;
        seq = op.seq;
        check_snapshots(&snapshots, doc_id, seq, &text)?;
    }

    Ok(Replay {
        text: text.to_string(),
        seq,
        versions,
    })
}

fn check_snapshots(
    snapshots: &BTreeMap<u64, Vec<Snapshot>>,
    doc_id: &str,
    seq: u64,
    text: &Rope,
) -> Result<()> {
    for snapshot in snapshots.get(&seq).into_iter().flatten() {
        if *text != snapshot.text.as_str() {
            return Err(ScrivenerError::Database(format!(
                "snapshot for '{}' {} diverges from history at seq {}",
                doc_id, snapshot.version, seq
            )));
        }
    }
    Ok(())
}
