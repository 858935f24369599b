use super::connection::ClientConnection;
use super::session::{DocumentSession, IdleCompaction, JoinedState, SessionConfig, SessionStores};
use scrivener_core::compaction::sweep_retired;
use scrivener_core::ownership::{NodeInfo, OwnershipDirectory, OwnershipRecord, RingSnapshot};
use scrivener_core::{Result, ScrivenerError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

/// Attempts at joining when a session closes between lookup and join
const JOIN_ATTEMPTS: usize = 3;

/// Where a client editing a document has to go
pub enum Admission {
    Local(Arc<DocumentSession>),
    Redirect {
        record: OwnershipRecord,
        node: NodeInfo,
    },
}

/// Result of connecting a client to a document
pub enum Connect {
    Local {
        connection: ClientConnection,
        joined: JoinedState,
    },
    Redirect {
        record: OwnershipRecord,
        node: NodeInfo,
    },
}

/// Statistics about the sessions on this node
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub active_connections: usize,
    pub active_sessions: usize,
}

/// Owns the document sessions this node is currently serving
pub struct SessionManager {
    node: NodeInfo,
    directory: OwnershipDirectory,
    stores: SessionStores,
    config: SessionConfig,
    /// Map of doc_id to its live session
    sessions: RwLock<HashMap<String, Arc<DocumentSession>>>,
    /// One compaction at a time per node
    compaction_permits: Semaphore,
}

impl SessionManager {
    pub fn new(node: NodeInfo, stores: SessionStores, config: SessionConfig) -> Self {
        Self {
            node,
            directory: OwnershipDirectory::new(stores.coordinator.clone()),
            stores,
            config,
            sessions: RwLock::new(HashMap::new()),
            compaction_permits: Semaphore::new(1),
        }
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    pub fn directory(&self) -> &OwnershipDirectory {
        &self.directory
    }

    pub fn stores(&self) -> &SessionStores {
        &self.stores
    }

    /// Serve `doc_id` here, or say which node does.
    pub async fn admit(&self, doc_id: &str) -> Result<Admission> {
        let (record, node) = self.directory.resolve_with_addr(doc_id)?;
        if record.node_id != self.node.node_id {
            return Ok(Admission::Redirect { record, node });
        }
        Ok(Admission::Local(self.get_or_create(&record).await?))
    }

    /// Get an existing session by doc id (does not create if not found)
    pub async fn get(&self, doc_id: &str) -> Option<Arc<DocumentSession>> {
        self.sessions.read().await.get(doc_id).cloned()
    }

    /// Get or create the session for a record assigned to this node
    async fn get_or_create(&self, record: &OwnershipRecord) -> Result<Arc<DocumentSession>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&record.doc_id)
                && session.epoch() == record.epoch
                && !session.is_closed()
            {
                return Ok(session.clone());
            }
        }

        let mut sessions = self.sessions.write().await;

        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(&record.doc_id) {
            if session.epoch() == record.epoch && !session.is_closed() {
                return Ok(session.clone());
            }
            // Superseded by a newer epoch on this same node
            session.close(&self.node.node_id, &self.node.addr).await;
            sessions.remove(&record.doc_id);
        }

        self.stores
            .coordinator
            .acquire(&record.doc_id, &self.node.node_id, record.epoch)?;
        let session = match DocumentSession::load(
            record,
            &self.node,
            self.stores.clone(),
            self.config.clone(),
        ) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("Failed to load session for {}: {}", record.doc_id, e);
                self.release(&record.doc_id, record.epoch);
                return Err(e);
            }
        };
        if let Err(e) = self
            .stores
            .metadata
            .set_owner_hint(&record.doc_id, Some(&self.node.node_id))
        {
            warn!("Failed to record owner hint for {}: {}", record.doc_id, e);
        }

        sessions.insert(record.doc_id.clone(), session.clone());
        info!(
            "Created session for {} (epoch {})",
            record.doc_id, record.epoch
        );
        Ok(session)
    }

    /// Admit and join a client.
    pub async fn connect(
        self: &Arc<Self>,
        doc_id: &str,
        client_id: &str,
        user_id: &str,
    ) -> Result<Connect> {
        let mut last_err = None;
        for _ in 0..JOIN_ATTEMPTS {
            let session = match self.admit(doc_id).await? {
                Admission::Local(session) => session,
                Admission::Redirect { record, node } => {
                    return Ok(Connect::Redirect { record, node });
                }
            };
            match session.join(client_id, user_id).await {
                Ok((joined, rx)) => {
                    let connection = ClientConnection::new(
                        client_id.to_string(),
                        user_id.to_string(),
                        session,
                        self.clone(),
                        rx,
                    );
                    return Ok(Connect::Local { connection, joined });
                }
                // Evicted between lookup and join; the next admit reloads
                Err(e @ ScrivenerError::SessionClosed(_)) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| ScrivenerError::SessionClosed(doc_id.to_string())))
    }

    /// The last client left `session`: compact it and evict it unless
    /// someone reconnects first.
    pub fn on_client_left(self: &Arc<Self>, session: Arc<DocumentSession>) {
        let manager = self.clone();
        tokio::spawn(async move {
            // Let a reconnect that raced the leave get in first
            tokio::task::yield_now().await;
            let Ok(_permit) = manager.compaction_permits.acquire().await else {
                return;
            };
            if session.client_count() > 0 {
                return;
            }

            match session.compact_if_idle().await {
                Ok(IdleCompaction::Ran(outcome)) => {
                    debug!("Idle compaction of {}: {:?}", session.doc_id(), outcome);
                }
                Ok(IdleCompaction::Reconnected) => {
                    debug!("Compaction of {} abandoned, client reconnected", session.doc_id());
                    return;
                }
                Ok(IdleCompaction::Closed) => {}
                // Operations stay in the log; the next load replays them
                Err(e) => warn!("Compaction of {} failed: {}", session.doc_id(), e),
            }
            manager.evict_if_idle(&session).await;
        });
    }

    /// Remove `session` if it is still the registered one and has no
    /// clients, or closed itself after a failed write.
    async fn evict_if_idle(&self, session: &Arc<DocumentSession>) {
        let mut sessions = self.sessions.write().await;
        let registered = sessions
            .get(session.doc_id())
            .is_some_and(|s| Arc::ptr_eq(s, session));
        if registered && (session.close_if_idle().await || session.is_closed()) {
            sessions.remove(session.doc_id());
            self.release(session.doc_id(), session.epoch());
            info!("Removed idle session: {}", session.doc_id());
        }
    }

    fn release(&self, doc_id: &str, epoch: u64) {
        if let Err(e) = self
            .stores
            .coordinator
            .release(doc_id, &self.node.node_id, epoch)
        {
            warn!("Failed to release claim on {}: {}", doc_id, e);
        }
    }

    /// Close every session whose assignment `snapshot` moved away from
    /// this node's `(node, epoch)`, redirecting its clients to the new
    /// owner.
    pub async fn on_membership_change(&self, snapshot: &RingSnapshot) {
        let mut sessions = self.sessions.write().await;
        let moved: Vec<String> = sessions
            .iter()
            .filter(|(doc_id, session)| {
                snapshot.record(doc_id).is_none_or(|record| {
                    record.node_id != self.node.node_id || record.epoch != session.epoch()
                })
            })
            .map(|(doc_id, _)| doc_id.clone())
            .collect();

        for doc_id in moved {
            let Some(session) = sessions.remove(&doc_id) else {
                continue;
            };
            let target = snapshot
                .record(&doc_id)
                .and_then(|record| snapshot.node(&record.node_id).cloned())
                .unwrap_or_else(|| self.node.clone());
            session.close(&target.node_id, &target.addr).await;
            self.release(&doc_id, session.epoch());
            info!(
                "Handed off {} (epoch {}) to {} at membership v{}",
                doc_id,
                session.epoch(),
                target.node_id,
                snapshot.version
            );
        }
    }

    /// Leave the cluster and hand every session off.
    pub async fn shutdown(&self) {
        let snapshot = match self
            .stores
            .coordinator
            .deregister_node(&self.node.node_id)
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Failed to deregister {}: {}", self.node.node_id, e);
                self.stores.coordinator.current()
            }
        };
        self.on_membership_change(&snapshot).await;
    }

    /// Delete versions retired longer than `grace` ago.
    pub fn sweep_retired(&self, grace: Duration) -> Result<usize> {
        let grace_ms = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);
        let cutoff = chrono::Utc::now()
            .timestamp_millis()
            .saturating_sub(grace_ms);
        sweep_retired(
            self.stores.log.as_ref(),
            self.stores.metadata.as_ref(),
            cutoff,
        )
    }

    /// Get statistics about the sessions on this node
    pub async fn stats(&self) -> SyncStats {
        let sessions = self.sessions.read().await;
        SyncStats {
            active_connections: sessions.values().map(|s| s.client_count()).sum(),
            active_sessions: sessions.len(),
        }
    }
}
