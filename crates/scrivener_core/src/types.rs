//! Core record types shared by the session, the storage backends and the wire
//! protocol.
//!
//! These are the durable shapes of the system: an [`Operation`] is one
//! sequenced, transformed edit in the log, a [`Snapshot`] is the compacted
//! text a version starts from.

use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::ot::Edit;

/// Identifier of a document version.
///
/// Version `0` is the genesis version: empty text, no snapshot. Later
/// versions are allocated by compaction from a per-document counter and are
/// never reused, so ids increase monotonically.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(transparent)]
#[ts(export, export_to = "bindings/")]
pub struct VersionId(pub u64);

impl VersionId {
    /// The version every document starts at.
    pub const GENESIS: VersionId = VersionId(0);

    pub fn is_genesis(self) -> bool {
        self == Self::GENESIS
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A single transformed edit as recorded in the operation log.
///
/// Operations are append-only. Within one `(doc_id, version)` they are
/// totally ordered by `seq` with no gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Operation {
    /// Server-generated unique id (UUID v4)
    pub id: String,
    pub doc_id: String,
    /// Version that was current when the operation was appended
    pub version: VersionId,
    /// Server-assigned sequence number
    pub seq: u64,
    /// Ownership epoch the appending node held
    #[serde(default)]
    pub epoch: u64,
    /// User that submitted the edit
    pub author: String,
    /// Client-chosen submission id, shared by every operation one
    /// submission produced
    pub client_op_id: String,
    /// The edit, with positions valid against the text at `seq - 1`
    pub edit: Edit,
    /// Server timestamp (Unix milliseconds)
    pub timestamp: i64,
}

/// The outcome of one accepted submission.
///
/// Stored per `(author, client_op_id)` so a retried submission returns the
/// identical ack instead of being applied twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Ack {
    pub client_op_id: String,
    /// Sequence number of the last operation the submission produced, or the
    /// document sequence at the time if it transformed to nothing
    pub seq: u64,
    /// Edits as actually applied (zero, one or two after transformation)
    pub applied: Vec<Edit>,
}

/// Idempotency record carried across compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub author: String,
    pub ack: Ack,
}

/// Compacted full text of a document at the start of a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub doc_id: String,
    pub version: VersionId,
    pub text: String,
    /// Sequence number of the last operation folded into `text`; the
    /// version's own operations start at `base_seq + 1`
    pub base_seq: u64,
    /// Recent submissions, so retries that straddle compaction stay
    /// idempotent
    pub submissions: Vec<SubmissionRecord>,
    /// Creation time (Unix milliseconds)
    pub created_at: i64,
}

impl Snapshot {
    /// The implicit snapshot of a document nobody has edited yet.
    pub fn genesis(doc_id: &str) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            version: VersionId::GENESIS,
            text: String::new(),
            base_seq: 0,
            submissions: Vec::new(),
            created_at: 0,
        }
    }
}
