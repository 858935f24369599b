//! JSON messages exchanged over a client connection.
//!
//! Every message is an object tagged by `type` in snake case, e.g.
//! `{"type":"submit","client_op_id":"x1","base_seq":4,"edit":{...}}`.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::SerializableError;
use crate::ot::Edit;
use crate::types::{Ack, Operation, VersionId};

/// Messages a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ClientMessage {
    /// Submit an edit made against the text at `base_seq`
    Submit {
        client_op_id: String,
        base_seq: u64,
        edit: Edit,
    },
    UpdateCursor { position: usize },
    Leave,
}

/// A user's caret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CursorInfo {
    pub user_id: String,
    pub position: usize,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ServerMessage {
    /// Full state on join (or after falling behind)
    Joined {
        doc_id: String,
        version: VersionId,
        seq: u64,
        text: String,
        cursors: Vec<CursorInfo>,
    },
    /// Acknowledgement of this client's submission
    Ack { ack: Ack },
    /// An operation committed by another client
    Operation { op: Operation },
    Cursor { user_id: String, position: usize },
    /// Users currently connected to the document
    Presence { users: Vec<String> },
    /// The document is served elsewhere; reconnect to `addr`
    Redirect {
        doc_id: String,
        node_id: String,
        addr: String,
    },
    Error {
        /// Set when the error answers a submission
        client_op_id: Option<String>,
        error: SerializableError,
    },
}

impl ServerMessage {
    /// Serialize for a text frame.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
