//! SQLite-backed coordinator shared by several processes on one host.
//!
//! Every mutation runs in an `IMMEDIATE` transaction, which takes SQLite's
//! write lock up front, so commits and claim changes are serialized across
//! processes. Watchers only see commits made elsewhere after [`refresh`].
//!
//! [`refresh`]: Coordinator::refresh

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tokio::sync::watch;

use super::coordinator::{Claim, Coordinator, check_acquire, check_validate};
use super::membership::{MembershipChange, NodeInfo, RingSnapshot};
use crate::error::{Result, ScrivenerError};

pub struct SqliteCoordinator {
    conn: Mutex<Connection>,
    vnodes: usize,
    tx: watch::Sender<Arc<RingSnapshot>>,
}

impl SqliteCoordinator {
    /// Open or create the coordination database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, vnodes: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, vnodes)
    }

    /// In-memory database, for tests.
    pub fn in_memory(vnodes: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, vnodes)
    }

    fn from_connection(conn: Connection, vnodes: usize) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        // Readers of other processes don't block the writer
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        let (tx, _) = watch::channel(Arc::new(RingSnapshot::genesis(vnodes)));
        let coordinator = Self {
            conn: Mutex::new(conn),
            vnodes,
            tx,
        };
        coordinator.init_schema()?;
        coordinator.refresh()?;
        Ok(coordinator)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Ordered ring snapshots
            CREATE TABLE IF NOT EXISTS membership_log (
                version INTEGER PRIMARY KEY,
                snapshot TEXT NOT NULL,
                committed_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS node_heartbeats (
                node_id TEXT PRIMARY KEY,
                last_seen INTEGER NOT NULL
            );

            -- At most one claim per document
            CREATE TABLE IF NOT EXISTS ownership_claims (
                doc_id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                epoch INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Latest committed snapshot, reusing the published one when unchanged.
    fn load_latest(&self, conn: &Connection) -> Result<Arc<RingSnapshot>> {
        let version: Option<i64> =
            conn.query_row("SELECT MAX(version) FROM membership_log", [], |row| {
                row.get(0)
            })?;
        let Some(version) = version else {
            return Ok(Arc::new(RingSnapshot::genesis(self.vnodes)));
        };

        let published = self.tx.borrow().clone();
        if published.version == version as u64 {
            return Ok(published);
        }

        let json: String = conn.query_row(
            "SELECT snapshot FROM membership_log WHERE version = ?",
            params![version],
            |row| row.get(0),
        )?;
        Ok(Arc::new(serde_json::from_str(&json)?))
    }

    fn publish(&self, snapshot: &Arc<RingSnapshot>) {
        self.tx.send_if_modified(|current| {
            if snapshot.version > current.version {
                *current = snapshot.clone();
                true
            } else {
                false
            }
        });
    }

    /// Append a commit inside an open transaction.
    fn commit_in(
        &self,
        conn: &Connection,
        change: MembershipChange,
    ) -> Result<Arc<RingSnapshot>> {
        let latest = self.load_latest(conn)?;
        if !latest.changes_anything(&change) {
            return Ok(latest);
        }
        let next = latest.apply(change, Utc::now().timestamp_millis())?;
        conn.execute(
            "INSERT INTO membership_log (version, snapshot, committed_at) VALUES (?, ?, ?)",
            params![
                next.version as i64,
                serde_json::to_string(&next)?,
                next.committed_at
            ],
        )?;
        log::info!(
            "Membership v{} committed ({:?}), {} node(s)",
            next.version,
            next.change,
            next.nodes.len()
        );
        Ok(Arc::new(next))
    }

    fn read_claim(conn: &Connection, doc_id: &str) -> Result<Option<Claim>> {
        let claim = conn
            .query_row(
                "SELECT node_id, epoch FROM ownership_claims WHERE doc_id = ?",
                params![doc_id],
                |row| {
                    Ok(Claim {
                        node_id: row.get(0)?,
                        epoch: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(claim)
    }
}

impl Coordinator for SqliteCoordinator {
    fn register_node(&self, node: NodeInfo) -> Result<Arc<RingSnapshot>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR REPLACE INTO node_heartbeats (node_id, last_seen) VALUES (?, ?)",
            params![node.node_id, Utc::now().timestamp_millis()],
        )?;
        let snapshot = self.commit_in(&tx, MembershipChange::Join { node })?;
        tx.commit()?;
        self.publish(&snapshot);
        Ok(snapshot)
    }

    fn deregister_node(&self, node_id: &str) -> Result<Arc<RingSnapshot>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM node_heartbeats WHERE node_id = ?",
            params![node_id],
        )?;
        let snapshot = self.commit_in(
            &tx,
            MembershipChange::Leave {
                node_id: node_id.to_string(),
            },
        )?;
        tx.commit()?;
        self.publish(&snapshot);
        Ok(snapshot)
    }

    fn heartbeat(&self, node_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if !self.load_latest(&conn)?.contains_node(node_id) {
            return Err(ScrivenerError::UnknownNode(node_id.to_string()));
        }
        conn.execute(
            "INSERT OR REPLACE INTO node_heartbeats (node_id, last_seen) VALUES (?, ?)",
            params![node_id, now.timestamp_millis()],
        )?;
        Ok(())
    }

    fn expire_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cutoff = (now - timeout).timestamp_millis();

        let latest = self.load_latest(&tx)?;
        let mut stale = Vec::new();
        for node_id in latest.nodes.keys() {
            let seen: Option<i64> = tx
                .query_row(
                    "SELECT last_seen FROM node_heartbeats WHERE node_id = ?",
                    params![node_id],
                    |row| row.get(0),
                )
                .optional()?;
            if seen.is_none_or(|seen| seen < cutoff) {
                stale.push(node_id.clone());
            }
        }

        let mut snapshot = latest;
        for node_id in &stale {
            log::warn!("Expiring node '{}': no heartbeat since {}", node_id, cutoff);
            tx.execute(
                "DELETE FROM node_heartbeats WHERE node_id = ?",
                params![node_id],
            )?;
            snapshot = self.commit_in(
                &tx,
                MembershipChange::Expire {
                    node_id: node_id.clone(),
                },
            )?;
        }
        tx.commit()?;
        // Watchers see the batch only once all of it is durable
        self.publish(&snapshot);
        Ok(stale)
    }

    fn current(&self) -> Arc<RingSnapshot> {
        self.tx.borrow().clone()
    }

    fn watch_membership(&self) -> watch::Receiver<Arc<RingSnapshot>> {
        self.tx.subscribe()
    }

    fn refresh(&self) -> Result<Arc<RingSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let latest = self.load_latest(&conn)?;
        self.publish(&latest);
        Ok(latest)
    }

    fn history(&self, since: u64) -> Result<Vec<Arc<RingSnapshot>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT snapshot FROM membership_log WHERE version > ? ORDER BY version ASC",
        )?;
        let rows = stmt
            .query_map(params![since as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| Ok(Arc::new(serde_json::from_str(json)?)))
            .collect()
    }

    fn acquire(&self, doc_id: &str, node_id: &str, epoch: u64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let latest = self.load_latest(&tx)?;
        let existing = Self::read_claim(&tx, doc_id)?;
        if check_acquire(&latest, existing.as_ref(), doc_id, node_id, epoch)? {
            tx.execute(
                "INSERT OR REPLACE INTO ownership_claims (doc_id, node_id, epoch) VALUES (?, ?, ?)",
                params![doc_id, node_id, epoch as i64],
            )?;
            log::debug!("'{}' claimed by {} at epoch {}", doc_id, node_id, epoch);
        }
        tx.commit()?;
        Ok(())
    }

    fn validate(&self, doc_id: &str, node_id: &str, epoch: u64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        // A read transaction gives one consistent view of log and claims
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let latest = self.load_latest(&tx)?;
        let existing = Self::read_claim(&tx, doc_id)?;
        check_validate(&latest, existing.as_ref(), doc_id, node_id, epoch)
    }

    fn release(&self, doc_id: &str, node_id: &str, epoch: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM ownership_claims WHERE doc_id = ? AND node_id = ? AND epoch = ?",
            params![doc_id, node_id, epoch as i64],
        )?;
        if removed > 0 {
            log::debug!("'{}' released by {} at epoch {}", doc_id, node_id, epoch);
        }
        Ok(())
    }

    fn claim(&self, doc_id: &str) -> Result<Option<Claim>> {
        let conn = self.conn.lock().unwrap();
        Self::read_claim(&conn, doc_id)
    }
}
