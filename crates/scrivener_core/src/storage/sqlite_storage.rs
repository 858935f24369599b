//! SQLite-backed storage for the operation log and document metadata.
//!
//! One database file holds operations, snapshots, the per-document version
//! pointer and the retired-version queue. Multi-row writes run inside a
//! transaction so a batch is either fully durable or absent.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::{
    DocumentMeta, MetadataStore, OperationLog, RetiredVersion, StorageResult, check_batch,
    check_fence, expected_next_seq,
};
use crate::error::ScrivenerError;
use crate::types::{Operation, Snapshot, SubmissionRecord, VersionId};

/// SQLite-backed storage.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the storage is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Append-only operation log
            CREATE TABLE IF NOT EXISTS operations (
                doc_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                id TEXT NOT NULL,
                author TEXT NOT NULL,
                client_op_id TEXT NOT NULL,
                edit TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                epoch INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (doc_id, version, seq)
            );

            -- Highest ownership epoch that wrote or fenced each document
            CREATE TABLE IF NOT EXISTS fences (
                doc_id TEXT PRIMARY KEY,
                epoch INTEGER NOT NULL
            );

            -- Compacted text at the start of each version
            CREATE TABLE IF NOT EXISTS snapshots (
                doc_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                text TEXT NOT NULL,
                base_seq INTEGER NOT NULL,
                submissions TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (doc_id, version)
            );

            CREATE TABLE IF NOT EXISTS documents (
                doc_id TEXT PRIMARY KEY,
                current_version INTEGER NOT NULL DEFAULT 0,
                next_version INTEGER NOT NULL DEFAULT 0,
                owner_hint TEXT,
                updated_at INTEGER NOT NULL
            );

            -- Superseded versions awaiting deletion
            CREATE TABLE IF NOT EXISTS retired_versions (
                doc_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                retired_at INTEGER NOT NULL,
                PRIMARY KEY (doc_id, version)
            );

            CREATE INDEX IF NOT EXISTS idx_retired_at ON retired_versions(retired_at);
            "#,
        )?;
        Ok(())
    }

    fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operation> {
        let edit: String = row.get(6)?;
        let edit = serde_json::from_str(&edit).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(Operation {
            doc_id: row.get(0)?,
            version: VersionId(row.get::<_, i64>(1)? as u64),
            seq: row.get::<_, i64>(2)? as u64,
            id: row.get(3)?,
            author: row.get(4)?,
            client_op_id: row.get(5)?,
            edit,
            timestamp: row.get(7)?,
            epoch: row.get::<_, i64>(8)? as u64,
        })
    }

    fn read_fence(conn: &Connection, doc_id: &str) -> StorageResult<u64> {
        let epoch: Option<i64> = conn
            .query_row(
                "SELECT epoch FROM fences WHERE doc_id = ?",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(epoch.map_or(0, |e| e as u64))
    }

    fn raise_fence(conn: &Connection, doc_id: &str, epoch: u64) -> StorageResult<()> {
        conn.execute(
            "INSERT INTO fences (doc_id, epoch) VALUES (?, ?)
             ON CONFLICT(doc_id) DO UPDATE SET epoch = MAX(epoch, excluded.epoch)",
            params![doc_id, epoch as i64],
        )?;
        Ok(())
    }

    fn ensure_document(conn: &Connection, doc_id: &str) -> StorageResult<()> {
        conn.execute(
            "INSERT OR IGNORE INTO documents (doc_id, updated_at) VALUES (?, ?)",
            params![doc_id, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }
}

impl OperationLog for SqliteStorage {
    fn append_batch(&self, ops: &[Operation]) -> StorageResult<u64> {
        let Some(first) = ops.first() else {
            return Ok(0);
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        check_fence(ops, Self::read_fence(&tx, &first.doc_id)?)?;
        let last: Option<i64> = tx.query_row(
            "SELECT MAX(seq) FROM operations WHERE doc_id = ? AND version = ?",
            params![first.doc_id, first.version.0 as i64],
            |row| row.get(0),
        )?;
        let base: Option<i64> = tx
            .query_row(
                "SELECT base_seq FROM snapshots WHERE doc_id = ? AND version = ?",
                params![first.doc_id, first.version.0 as i64],
                |row| row.get(0),
            )
            .optional()?;
        let expected = expected_next_seq(last.map(|s| s as u64), base.map(|s| s as u64));
        check_batch(ops, expected)?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO operations (doc_id, version, seq, id, author, client_op_id, edit, timestamp, epoch)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for op in ops {
                stmt.execute(params![
                    op.doc_id,
                    op.version.0 as i64,
                    op.seq as i64,
                    op.id,
                    op.author,
                    op.client_op_id,
                    serde_json::to_string(&op.edit)?,
                    op.timestamp,
                    op.epoch as i64,
                ])?;
            }
        }
        Self::raise_fence(&tx, &first.doc_id, first.epoch)?;

        tx.commit()?;
        Ok(ops[ops.len() - 1].seq)
    }

    fn fence(&self, doc_id: &str, epoch: u64) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        Self::raise_fence(&conn, doc_id, epoch)
    }

    fn fence_epoch(&self, doc_id: &str) -> StorageResult<u64> {
        let conn = self.conn.lock().unwrap();
        Self::read_fence(&conn, doc_id)
    }

    fn read_range(
        &self,
        doc_id: &str,
        version: VersionId,
        from_seq: u64,
    ) -> StorageResult<Vec<Operation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT doc_id, version, seq, id, author, client_op_id, edit, timestamp, epoch
             FROM operations WHERE doc_id = ? AND version = ? AND seq >= ?
             ORDER BY seq ASC",
        )?;
        let ops = stmt
            .query_map(
                params![doc_id, version.0 as i64, from_seq as i64],
                Self::row_to_operation,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    fn last_seq(&self, doc_id: &str, version: VersionId) -> StorageResult<Option<u64>> {
        let conn = self.conn.lock().unwrap();
        let last: Option<i64> = conn.query_row(
            "SELECT MAX(seq) FROM operations WHERE doc_id = ? AND version = ?",
            params![doc_id, version.0 as i64],
            |row| row.get(0),
        )?;
        Ok(last.map(|s| s as u64))
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO snapshots (doc_id, version, text, base_seq, submissions, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                snapshot.doc_id,
                snapshot.version.0 as i64,
                snapshot.text,
                snapshot.base_seq as i64,
                serde_json::to_string(&snapshot.submissions)?,
                snapshot.created_at,
            ],
        )?;
        if inserted == 0 {
            return Err(ScrivenerError::SnapshotExists {
                doc_id: snapshot.doc_id.clone(),
                version: snapshot.version,
            });
        }
        Ok(())
    }

    fn read_snapshot(&self, doc_id: &str, version: VersionId) -> StorageResult<Option<Snapshot>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT text, base_seq, submissions, created_at FROM snapshots
                 WHERE doc_id = ? AND version = ?",
                params![doc_id, version.0 as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((text, base_seq, submissions, created_at)) = row else {
            return Ok(None);
        };
        let submissions: Vec<SubmissionRecord> = serde_json::from_str(&submissions)?;
        Ok(Some(Snapshot {
            doc_id: doc_id.to_string(),
            version,
            text,
            base_seq: base_seq as u64,
            submissions,
            created_at,
        }))
    }

    fn delete_version(&self, doc_id: &str, version: VersionId) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM operations WHERE doc_id = ? AND version = ?",
            params![doc_id, version.0 as i64],
        )?;
        tx.execute(
            "DELETE FROM snapshots WHERE doc_id = ? AND version = ?",
            params![doc_id, version.0 as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn versions(&self, doc_id: &str) -> StorageResult<Vec<VersionId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT version FROM operations WHERE doc_id = ?1
             UNION
             SELECT version FROM snapshots WHERE doc_id = ?1
             ORDER BY version ASC",
        )?;
        let versions = stmt
            .query_map(params![doc_id], |row| row.get::<_, i64>(0))?
            .map(|v| v.map(|v| VersionId(v as u64)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }
}

impl MetadataStore for SqliteStorage {
    fn current_version(&self, doc_id: &str) -> StorageResult<VersionId> {
        let conn = self.conn.lock().unwrap();
        let version: Option<i64> = conn
            .query_row(
                "SELECT current_version FROM documents WHERE doc_id = ?",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map_or(VersionId::GENESIS, |v| VersionId(v as u64)))
    }

    fn compare_and_swap_version(
        &self,
        doc_id: &str,
        expected: VersionId,
        new: VersionId,
    ) -> StorageResult<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::ensure_document(&tx, doc_id)?;
        let updated = tx.execute(
            "UPDATE documents SET current_version = ?, updated_at = ?
             WHERE doc_id = ? AND current_version = ?",
            params![
                new.0 as i64,
                chrono::Utc::now().timestamp_millis(),
                doc_id,
                expected.0 as i64
            ],
        )?;
        tx.commit()?;
        Ok(updated == 1)
    }

    fn allocate_version(&self, doc_id: &str) -> StorageResult<VersionId> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::ensure_document(&tx, doc_id)?;
        let next: i64 = tx.query_row(
            "UPDATE documents SET next_version = MAX(next_version, current_version) + 1
             WHERE doc_id = ? RETURNING next_version",
            params![doc_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(VersionId(next as u64))
    }

    fn set_owner_hint(&self, doc_id: &str, node_id: Option<&str>) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        Self::ensure_document(&tx, doc_id)?;
        tx.execute(
            "UPDATE documents SET owner_hint = ?, updated_at = ? WHERE doc_id = ?",
            params![node_id, chrono::Utc::now().timestamp_millis(), doc_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn document(&self, doc_id: &str) -> StorageResult<Option<DocumentMeta>> {
        let conn = self.conn.lock().unwrap();
        let meta = conn
            .query_row(
                "SELECT current_version, owner_hint, updated_at FROM documents WHERE doc_id = ?",
                params![doc_id],
                |row| {
                    Ok(DocumentMeta {
                        doc_id: doc_id.to_string(),
                        current_version: VersionId(row.get::<_, i64>(0)? as u64),
                        owner_hint: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }

    fn retire_version(
        &self,
        doc_id: &str,
        version: VersionId,
        retired_at: i64,
    ) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO retired_versions (doc_id, version, retired_at) VALUES (?, ?, ?)",
            params![doc_id, version.0 as i64, retired_at],
        )?;
        Ok(())
    }

    fn retired_before(&self, cutoff: i64) -> StorageResult<Vec<RetiredVersion>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT doc_id, version, retired_at FROM retired_versions
             WHERE retired_at < ? ORDER BY retired_at ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| {
                Ok(RetiredVersion {
                    doc_id: row.get(0)?,
                    version: VersionId(row.get::<_, i64>(1)? as u64),
                    retired_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn forget_retired(&self, doc_id: &str, version: VersionId) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM retired_versions WHERE doc_id = ? AND version = ?",
            params![doc_id, version.0 as i64],
        )?;
        Ok(())
    }
}
