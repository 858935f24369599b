#![doc = include_str!("../README.md")]

/// Compaction protocol and the retired-version sweep
pub mod compaction;

/// Error (common error types)
pub mod error;

/// Reconstructing text from snapshots and operations
pub mod history;

/// Operational transformation (edits, transform rules, client mirror)
pub mod ot;

/// Document ownership (hash ring, membership log, coordinator)
pub mod ownership;

/// Wire protocol messages
pub mod protocol;

/// Operation log and metadata storage
pub mod storage;

/// Durable record types
pub mod types;

pub use error::{Result, ScrivenerError, SerializableError};
pub use ot::{ClientDocument, Edit};
pub use types::{Ack, Operation, Snapshot, SubmissionRecord, VersionId};
