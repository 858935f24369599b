//! Client-side mirror of the session protocol.
//!
//! A [`ClientDocument`] keeps at most one submission in flight and buffers
//! later local edits. Remote operations arriving from the server were
//! committed before anything the client still holds, so they win every tie
//! when transformed against local edits. This mirrors the server's
//! append-commit tie-break and makes every replica converge.

use ropey::Rope;

use super::edit::Edit;
use super::transform::{Tie, transform_pair};
use crate::error::{Result, ScrivenerError};
use crate::types::{Ack, Operation};

/// A submission ready to be sent to the owning node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub client_op_id: String,
    pub base_seq: u64,
    pub edit: Edit,
}

#[derive(Debug, Clone)]
struct InFlight {
    client_op_id: String,
    /// The in-flight edit as the client currently sees it (rebased over
    /// remote operations received since it was sent)
    edits: Vec<Edit>,
}

/// Local replica of one document.
#[derive(Debug, Clone)]
pub struct ClientDocument {
    text: Rope,
    server_seq: u64,
    inflight: Option<InFlight>,
    buffer: Vec<Edit>,
    next_id: u64,
    id_prefix: String,
}

impl ClientDocument {
    /// Start from the state returned by a join.
    pub fn new(id_prefix: impl Into<String>, text: &str, seq: u64) -> Self {
        Self {
            text: Rope::from_str(text),
            server_seq: seq,
            inflight: None,
            buffer: Vec::new(),
            next_id: 0,
            id_prefix: id_prefix.into(),
        }
    }

    pub fn text(&self) -> String {
        self.text.to_string()
    }

    pub fn server_seq(&self) -> u64 {
        self.server_seq
    }

    /// Whether every local edit has been acknowledged.
    pub fn is_synced(&self) -> bool {
        self.inflight.is_none() && self.buffer.is_empty()
    }

    /// Id of the unacknowledged submission. After a reconnect it is resent
    /// under the same id so the server deduplicates it.
    pub fn inflight_id(&self) -> Option<&str> {
        self.inflight.as_ref().map(|f| f.client_op_id.as_str())
    }

    /// Apply a local edit. Returns a submission to send if nothing is in
    /// flight; otherwise the edit waits in the buffer.
    pub fn apply_local(&mut self, edit: Edit) -> Result<Option<Submission>> {
        if edit.is_noop() {
            return Ok(None);
        }
        edit.apply(&mut self.text)?;

        if self.inflight.is_some() {
            self.buffer.push(edit);
            return Ok(None);
        }
        Ok(Some(self.send(edit)))
    }

    /// Integrate an operation committed by somebody else.
    pub fn apply_remote(&mut self, op: &Operation) -> Result<()> {
        if op.seq <= self.server_seq {
            // Already integrated (replayed broadcast)
            return Ok(());
        }
        if op.seq != self.server_seq + 1 {
            return Err(ScrivenerError::SequenceGap {
                doc_id: op.doc_id.clone(),
                version: op.version,
                expected: self.server_seq + 1,
                got: op.seq,
            });
        }

        let mut remote = vec![op.edit.clone()];
        if let Some(inflight) = self.inflight.as_mut() {
            let (r, local) = transform_pair(&remote, &inflight.edits, Tie::OpFirst);
            remote = r;
            inflight.edits = local;
        }
        if !self.buffer.is_empty() {
            let (r, local) = transform_pair(&remote, &self.buffer, Tie::OpFirst);
            remote = r;
            self.buffer = local;
        }

        super::edit::apply_all(&mut self.text, &remote)?;
        self.server_seq = op.seq;
        Ok(())
    }

    /// Handle the acknowledgement of the in-flight submission. Returns the
    /// next buffered edit to send, if any.
    pub fn acknowledge(&mut self, ack: &Ack) -> Result<Option<Submission>> {
        match &self.inflight {
            Some(inflight) if inflight.client_op_id == ack.client_op_id => {}
            _ => {
                return Err(ScrivenerError::MalformedOp(format!(
                    "unexpected ack for '{}'",
                    ack.client_op_id
                )));
            }
        }
        self.inflight = None;
        self.server_seq = self.server_seq.max(ack.seq);

        if self.buffer.is_empty() {
            return Ok(None);
        }
        let next = self.buffer.remove(0);
        Ok(Some(self.send(next)))
    }

    fn send(&mut self, edit: Edit) -> Submission {
        self.next_id += 1;
        let client_op_id = format!("{}-{}", self.id_prefix, self.next_id);
        self.inflight = Some(InFlight {
            client_op_id: client_op_id.clone(),
            edits: vec![edit.clone()],
        });
        Submission {
            client_op_id,
            base_seq: self.server_seq,
            edit,
        }
    }
}
