use super::manager::SessionManager;
use super::session::{DocumentSession, SessionEvent};
use scrivener_core::protocol::{ClientMessage, ServerMessage};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Represents a connected client
pub struct ClientConnection {
    pub client_id: String,
    pub user_id: String,
    session: Arc<DocumentSession>,
    manager: Arc<SessionManager>,
    broadcast_rx: broadcast::Receiver<SessionEvent>,
    /// Events already pulled from the channel but ordered after an ack
    backlog: VecDeque<SessionEvent>,
    left: bool,
}

impl ClientConnection {
    pub(crate) fn new(
        client_id: String,
        user_id: String,
        session: Arc<DocumentSession>,
        manager: Arc<SessionManager>,
        broadcast_rx: broadcast::Receiver<SessionEvent>,
    ) -> Self {
        Self {
            client_id,
            user_id,
            session,
            manager,
            broadcast_rx,
            backlog: VecDeque::new(),
            left: false,
        }
    }

    pub fn doc_id(&self) -> &str {
        self.session.doc_id()
    }

    /// Handle an incoming message from the client.
    ///
    /// Replies come back in the order they must be sent. `Leave` is the
    /// caller's to handle and yields nothing here.
    pub async fn handle_message(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::Submit {
                client_op_id,
                base_seq,
                edit,
            } => {
                // Run to completion even if this connection goes away mid-append
                let session = self.session.clone();
                let client_id = self.client_id.clone();
                let op_id = client_op_id.clone();
                let result = tokio::spawn(async move {
                    session.submit(&client_id, &op_id, base_seq, edit).await
                })
                .await;

                match result {
                    Ok(Ok(ack)) => {
                        let mut replies = self.drain_through(ack.seq);
                        replies.push(ServerMessage::Ack { ack });
                        replies
                    }
                    Ok(Err(e)) => {
                        debug!(
                            "Submission {} from {} rejected: {}",
                            client_op_id, self.client_id, e
                        );
                        vec![ServerMessage::Error {
                            client_op_id: Some(client_op_id),
                            error: e.to_serializable(),
                        }]
                    }
                    Err(e) => {
                        warn!("Submit task for {} failed: {}", client_op_id, e);
                        Vec::new()
                    }
                }
            }
            ClientMessage::UpdateCursor { position } => {
                match self.session.update_cursor(&self.client_id, position).await {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![ServerMessage::Error {
                        client_op_id: None,
                        error: e.to_serializable(),
                    }],
                }
            }
            ClientMessage::Leave => Vec::new(),
        }
    }

    /// Pull every event up to and including operation `seq`, leaving later
    /// ones for [`Self::recv_event`]. The session broadcasts before it
    /// returns an ack, so all of them are already queued.
    fn drain_through(&mut self, seq: u64) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Some(event) = self.backlog.front() {
            if event.seq().is_some_and(|s| s > seq) {
                return out;
            }
            if let Some(event) = self.backlog.pop_front()
                && let Some(msg) = self.to_message(event)
            {
                out.push(msg);
            }
        }
        loop {
            match self.broadcast_rx.try_recv() {
                Ok(event) if event.seq().is_some_and(|s| s > seq) => {
                    self.backlog.push_back(event);
                    break;
                }
                Ok(event) => {
                    if let Some(msg) = self.to_message(event) {
                        out.push(msg);
                    }
                }
                // A lag is noticed and resynced by the next recv_event
                Err(_) => break,
            }
        }
        out
    }

    /// Receive the next message for this client from the session.
    ///
    /// Returns `None` once the session is gone.
    pub async fn recv_event(&mut self) -> Option<ServerMessage> {
        while let Some(event) = self.backlog.pop_front() {
            if let Some(msg) = self.to_message(event) {
                return Some(msg);
            }
        }
        loop {
            match self.broadcast_rx.recv().await {
                Ok(event) => {
                    if let Some(msg) = self.to_message(event) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        "Client {} lagged {} events on {}, resending state",
                        self.client_id,
                        n,
                        self.doc_id()
                    );
                    // Everything queued is older than the fresh state
                    while self.broadcast_rx.try_recv().is_ok() {}
                    self.backlog.clear();
                    return Some(self.session.snapshot_state().await.into());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn to_message(&self, event: SessionEvent) -> Option<ServerMessage> {
        match event {
            // Own operations arrive as the ack
            SessionEvent::Operation { origin, .. } if origin == self.client_id => None,
            SessionEvent::Operation { op, .. } => Some(ServerMessage::Operation {
                op: Arc::unwrap_or_clone(op),
            }),
            SessionEvent::Cursor { origin, .. } if origin == self.client_id => None,
            SessionEvent::Cursor {
                user_id, position, ..
            } => Some(ServerMessage::Cursor { user_id, position }),
            SessionEvent::Presence { users } => Some(ServerMessage::Presence { users }),
            SessionEvent::Redirect {
                doc_id,
                node_id,
                addr,
            } => Some(ServerMessage::Redirect {
                doc_id,
                node_id,
                addr,
            }),
        }
    }

    /// Leave the session and let the manager schedule idle work.
    pub async fn disconnect(mut self) {
        self.left = true;
        leave(&self.manager, &self.session, &self.client_id).await;
    }
}

async fn leave(manager: &Arc<SessionManager>, session: &Arc<DocumentSession>, client_id: &str) {
    let remaining = session.leave(client_id).await;
    debug!(
        "Client disconnected: client={}, doc={}, remaining={}",
        client_id,
        session.doc_id(),
        remaining
    );
    if remaining == 0 {
        manager.on_client_left(session.clone());
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        // Dropped without disconnect(), e.g. a cancelled handler
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            let session = self.session.clone();
            let client_id = std::mem::take(&mut self.client_id);
            handle.spawn(async move {
                leave(&manager, &session, &client_id).await;
            });
        }
    }
}
