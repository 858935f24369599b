use serde::Serialize;
use thiserror::Error;

use crate::types::VersionId;

/// Unified error type for scrivener operations
#[derive(Debug, Error)]
pub enum ScrivenerError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    /// The log or metadata store is temporarily unavailable. Only the
    /// affected submission fails; the client retries with the same id.
    #[error("Storage temporarily unavailable: {0}")]
    TransientIo(String),

    // Ownership errors
    #[error("Ownership of '{doc_id}' at epoch {epoch} is no longer held by node '{node_id}'")]
    OwnershipStale {
        doc_id: String,
        node_id: String,
        epoch: u64,
    },

    #[error("Ownership of '{doc_id}' is still held by '{holder}' pending handoff")]
    HandoffPending { doc_id: String, holder: String },

    /// An append carried an epoch older than one the log has already seen
    /// for the document: a newer owner took over.
    #[error("Append to '{doc_id}' at epoch {epoch} rejected, log is fenced at epoch {fence}")]
    Fenced {
        doc_id: String,
        epoch: u64,
        fence: u64,
    },

    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    #[error("No nodes are registered in the membership")]
    EmptyMembership,

    // Versioning errors
    #[error("Version conflict on '{doc_id}': expected {expected}, found {actual}")]
    VersionConflict {
        doc_id: String,
        expected: VersionId,
        actual: VersionId,
    },

    #[error("Sequence gap on '{doc_id}' version {version}: expected {expected}, got {got}")]
    SequenceGap {
        doc_id: String,
        version: VersionId,
        expected: u64,
        got: u64,
    },

    #[error("Snapshot for '{doc_id}' version {version} already exists")]
    SnapshotExists { doc_id: String, version: VersionId },

    // Operation errors
    #[error("Malformed operation: {0}")]
    MalformedOp(String),

    #[error("Base sequence {base_seq} is outside the replayable window ({oldest}..={current})")]
    StaleBase {
        base_seq: u64,
        oldest: u64,
        current: u64,
    },

    // Session errors
    #[error("Session for '{0}' is closed")]
    SessionClosed(String),

    #[error("Client '{0}' is not connected to this session")]
    UnknownClient(String),
}

#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
impl From<rusqlite::Error> for ScrivenerError {
    fn from(err: rusqlite::Error) -> Self {
        let busy = matches!(
            &err,
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        );
        if busy {
            ScrivenerError::TransientIo(err.to_string())
        } else {
            ScrivenerError::Database(err.to_string())
        }
    }
}

/// Result type alias for scrivener operations
pub type Result<T> = std::result::Result<T, ScrivenerError>;

/// A serializable representation of ScrivenerError for the wire protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize, ts_rs::TS)]
#[ts(export, export_to = "bindings/")]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&ScrivenerError> for SerializableError {
    fn from(err: &ScrivenerError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<ScrivenerError> for SerializableError {
    fn from(err: ScrivenerError) -> Self {
        SerializableError::from(&err)
    }
}

impl ScrivenerError {
    /// Variant name, stable across releases
    pub fn kind(&self) -> &'static str {
        match self {
            ScrivenerError::Io(_) => "Io",
            ScrivenerError::Serialization(_) => "Serialization",
            ScrivenerError::Database(_) => "Database",
            ScrivenerError::TransientIo(_) => "TransientIo",
            ScrivenerError::OwnershipStale { .. } => "OwnershipStale",
            ScrivenerError::HandoffPending { .. } => "HandoffPending",
            ScrivenerError::Fenced { .. } => "Fenced",
            ScrivenerError::UnknownNode(_) => "UnknownNode",
            ScrivenerError::EmptyMembership => "EmptyMembership",
            ScrivenerError::VersionConflict { .. } => "VersionConflict",
            ScrivenerError::SequenceGap { .. } => "SequenceGap",
            ScrivenerError::SnapshotExists { .. } => "SnapshotExists",
            ScrivenerError::MalformedOp(_) => "MalformedOp",
            ScrivenerError::StaleBase { .. } => "StaleBase",
            ScrivenerError::SessionClosed(_) => "SessionClosed",
            ScrivenerError::UnknownClient(_) => "UnknownClient",
        }
    }

    /// Whether the client should re-resolve ownership before retrying.
    ///
    /// A session that hits one of these while writing can no longer trust
    /// its live state and closes.
    pub fn requires_reresolve(&self) -> bool {
        matches!(
            self,
            ScrivenerError::OwnershipStale { .. }
                | ScrivenerError::Fenced { .. }
                | ScrivenerError::SequenceGap { .. }
                | ScrivenerError::HandoffPending { .. }
                | ScrivenerError::SessionClosed(_)
        )
    }

    /// Whether retrying the same submission (same client op id) may succeed
    /// without any other change
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScrivenerError::TransientIo(_))
    }

    /// Convert to a serializable representation for the wire protocol
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}
