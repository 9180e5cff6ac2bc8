//! SQLite storage backend.
//!
//! One table per logical store. Timestamps are stored as UTC milliseconds,
//! payloads as JSON text. Statements are short, so they run on the calling
//! task under a connection mutex.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use storesync_common::{
    EntityType, Error, NewOutboxEntry, NewQueueAttempt, NewQueueEntry, NewSyncSession,
    OutboxEntry, QueueAttempt, QueueEntry, QueueStatus, Result, StoreId, SyncSession,
};

use crate::store::{OutboxQuery, SyncStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_attempt_at INTEGER,
    status TEXT NOT NULL,
    priority TEXT NOT NULL,
    error_message TEXT,
    conflict_flag INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL,
    resolved_by TEXT,
    resolved_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_key ON outbox_entries(entity_type, entity_id, id);
CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox_entries(status);

CREATE TABLE IF NOT EXISTS queue_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    idempotency_key TEXT UNIQUE,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_id INTEGER NOT NULL REFERENCES queue_entries(id),
    attempted_at INTEGER NOT NULL,
    success INTEGER NOT NULL,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_attempts_time ON queue_attempts(attempted_at);

CREATE TABLE IF NOT EXISTS sync_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    store_id INTEGER,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    triggered_by TEXT,
    error_message TEXT,
    processed_events INTEGER NOT NULL,
    differences_detected INTEGER NOT NULL
);
"#;

const OUTBOX_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, attempt_count, \
     last_attempt_at, status, priority, error_message, conflict_flag, version, resolved_by, \
     resolved_at, created_at, updated_at";

const QUEUE_COLUMNS: &str =
    "id, event_type, payload, idempotency_key, status, attempts, last_error, created_at, updated_at";

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Storage(format!("timestamp out of range: {}", ms)))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

/// Outbox row exactly as SQLite returns it.
struct RawOutbox {
    id: i64,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: String,
    attempt_count: i64,
    last_attempt_at: Option<i64>,
    status: String,
    priority: String,
    error_message: Option<String>,
    conflict_flag: bool,
    version: i64,
    resolved_by: Option<String>,
    resolved_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl RawOutbox {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            operation: row.get(3)?,
            payload: row.get(4)?,
            attempt_count: row.get(5)?,
            last_attempt_at: row.get(6)?,
            status: row.get(7)?,
            priority: row.get(8)?,
            error_message: row.get(9)?,
            conflict_flag: row.get(10)?,
            version: row.get(11)?,
            resolved_by: row.get(12)?,
            resolved_at: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn into_entry(self) -> Result<OutboxEntry> {
        Ok(OutboxEntry {
            id: self.id,
            entity_type: EntityType::new(&self.entity_type)?,
            entity_id: self.entity_id,
            operation: self.operation.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            attempt_count: self.attempt_count as u32,
            last_attempt_at: opt_from_millis(self.last_attempt_at)?,
            status: self.status.parse()?,
            priority: self.priority.parse()?,
            error_message: self.error_message,
            conflict_flag: self.conflict_flag,
            version: self.version as u32,
            resolved_by: self.resolved_by,
            resolved_at: opt_from_millis(self.resolved_at)?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

/// Queue row exactly as SQLite returns it.
struct RawQueue {
    id: i64,
    event_type: String,
    payload: String,
    idempotency_key: Option<String>,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawQueue {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            payload: row.get(2)?,
            idempotency_key: row.get(3)?,
            status: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_entry(self) -> Result<QueueEntry> {
        Ok(QueueEntry {
            id: self.id,
            event_type: self.event_type,
            payload: serde_json::from_str(&self.payload)?,
            idempotency_key: self.idempotency_key,
            status: self.status.parse()?,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, i64, bool, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_attempt(raw: (i64, i64, i64, bool, Option<String>)) -> Result<QueueAttempt> {
    let (id, queue_id, attempted_at, success, error_message) = raw;
    Ok(QueueAttempt {
        id,
        queue_id,
        attempted_at: from_millis(attempted_at)?,
        success,
        error_message,
    })
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema setup failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        info!("SQLite sync store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))
    }

    /// Run `write` for every entry in one transaction. An unknown id rolls
    /// the whole batch back.
    fn update_each<F>(&self, entries: &[OutboxEntry], write: F) -> Result<()>
    where
        F: Fn(&Transaction<'_>, &OutboxEntry) -> rusqlite::Result<usize>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;
        for entry in entries {
            let changed = write(&tx, entry).map_err(storage_err)?;
            if changed == 0 {
                // Dropping the transaction rolls back the rows already written.
                return Err(Error::NotFound(format!("Outbox entry not found: {}", entry.id)));
            }
        }
        tx.commit().map_err(storage_err)?;
        debug!("Updated {} outbox entries", entries.len());
        Ok(())
    }

    fn outbox_where(query: &OutboxQuery) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();

        if let Some(entity_type) = &query.entity_type {
            clauses.push("entity_type = ?");
            args.push(Value::Text(entity_type.as_str().to_string()));
        }
        if let Some(entity_id) = &query.entity_id {
            clauses.push("entity_id = ?");
            args.push(Value::Text(entity_id.clone()));
        }
        if let Some(status) = query.status {
            clauses.push("status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(priority) = query.priority {
            clauses.push("priority = ?");
            args.push(Value::Text(priority.as_str().to_string()));
        }
        if let Some(flag) = query.conflict_flag {
            clauses.push("conflict_flag = ?");
            args.push(Value::Integer(flag as i64));
        }
        if let Some(since) = query.attempted_since {
            clauses.push("last_attempt_at IS NOT NULL AND last_attempt_at >= ?");
            args.push(Value::Integer(to_millis(since)));
        }

        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (sql, args)
    }
}

#[async_trait]
impl SyncStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert_outbox(&self, entry: NewOutboxEntry) -> Result<OutboxEntry> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&entry.payload)?;
        conn.execute(
            r#"
            INSERT INTO outbox_entries
            (entity_type, entity_id, operation, payload, status, priority,
             conflict_flag, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5, ?6, ?7, ?8, ?8)
            "#,
            params![
                entry.entity_type.as_str(),
                entry.entity_id,
                entry.operation.as_str(),
                payload,
                entry.priority.as_str(),
                entry.conflict_flag,
                entry.version as i64,
                to_millis(entry.created_at),
            ],
        )
        .map_err(storage_err)?;
        let id = conn.last_insert_rowid();
        debug!("Inserted outbox entry {}", id);
        Ok(entry.into_entry(id))
    }

    async fn latest_outbox_for(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
    ) -> Result<Option<OutboxEntry>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM outbox_entries WHERE entity_type = ?1 AND entity_id = ?2 \
             ORDER BY id DESC LIMIT 1",
            OUTBOX_COLUMNS
        );
        conn.query_row(&sql, params![entity_type.as_str(), entity_id], RawOutbox::from_row)
            .optional()
            .map_err(storage_err)?
            .map(RawOutbox::into_entry)
            .transpose()
    }

    async fn get_outbox(&self, id: i64) -> Result<Option<OutboxEntry>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM outbox_entries WHERE id = ?1", OUTBOX_COLUMNS);
        conn.query_row(&sql, [id], RawOutbox::from_row)
            .optional()
            .map_err(storage_err)?
            .map(RawOutbox::into_entry)
            .transpose()
    }

    async fn list_outbox(&self, query: &OutboxQuery) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn()?;
        let (filter, mut args) = Self::outbox_where(query);
        args.push(Value::Integer(query.limit.map_or(-1, |l| l as i64)));
        args.push(Value::Integer(query.offset as i64));
        let sql = format!(
            "SELECT {} FROM outbox_entries{} ORDER BY id ASC LIMIT ? OFFSET ?",
            OUTBOX_COLUMNS, filter
        );

        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let raws = stmt
            .query_map(params_from_iter(args.iter()), RawOutbox::from_row)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        raws.into_iter().map(RawOutbox::into_entry).collect()
    }

    async fn count_outbox(&self, query: &OutboxQuery) -> Result<usize> {
        let conn = self.conn()?;
        let (filter, args) = Self::outbox_where(query);
        let sql = format!("SELECT COUNT(*) FROM outbox_entries{}", filter);
        let count: i64 = conn
            .query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))
            .map_err(storage_err)?;
        Ok(count as usize)
    }

    async fn update_outbox_batch(&self, entries: &[OutboxEntry]) -> Result<()> {
        self.update_each(entries, |tx, entry| {
            tx.execute(
                r#"
                UPDATE outbox_entries SET
                    attempt_count = ?2, last_attempt_at = ?3, status = ?4, priority = ?5,
                    error_message = ?6, conflict_flag = ?7, version = ?8,
                    resolved_by = ?9, resolved_at = ?10, updated_at = ?11
                WHERE id = ?1
                "#,
                params![
                    entry.id,
                    entry.attempt_count as i64,
                    entry.last_attempt_at.map(to_millis),
                    entry.status.as_str(),
                    entry.priority.as_str(),
                    entry.error_message,
                    entry.conflict_flag,
                    entry.version as i64,
                    entry.resolved_by,
                    entry.resolved_at.map(to_millis),
                    to_millis(entry.updated_at),
                ],
            )
        })
    }

    async fn record_delivery_batch(&self, entries: &[OutboxEntry]) -> Result<()> {
        self.update_each(entries, |tx, entry| {
            tx.execute(
                r#"
                UPDATE outbox_entries SET
                    attempt_count = ?2, last_attempt_at = ?3, status = ?4,
                    error_message = ?5, updated_at = ?6
                WHERE id = ?1
                "#,
                params![
                    entry.id,
                    entry.attempt_count as i64,
                    entry.last_attempt_at.map(to_millis),
                    entry.status.as_str(),
                    entry.error_message,
                    to_millis(entry.updated_at),
                ],
            )
        })
    }

    async fn record_review_batch(&self, entries: &[OutboxEntry]) -> Result<()> {
        self.update_each(entries, |tx, entry| {
            tx.execute(
                r#"
                UPDATE outbox_entries SET
                    priority = ?2, conflict_flag = ?3, version = ?4,
                    resolved_by = ?5, resolved_at = ?6, updated_at = ?7
                WHERE id = ?1
                "#,
                params![
                    entry.id,
                    entry.priority.as_str(),
                    entry.conflict_flag,
                    entry.version as i64,
                    entry.resolved_by,
                    entry.resolved_at.map(to_millis),
                    to_millis(entry.updated_at),
                ],
            )
        })
    }

    async fn insert_queue(&self, entry: NewQueueEntry) -> Result<QueueEntry> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&entry.payload)?;
        conn.execute(
            r#"
            INSERT INTO queue_entries
            (event_type, payload, idempotency_key, status, attempts, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'QUEUED', 0, ?4, ?4)
            "#,
            params![
                entry.event_type,
                payload,
                entry.idempotency_key,
                to_millis(entry.created_at),
            ],
        )
        .map_err(storage_err)?;
        let id = conn.last_insert_rowid();
        Ok(entry.into_entry(id))
    }

    async fn find_queue_by_key(&self, key: &str) -> Result<Option<QueueEntry>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM queue_entries WHERE idempotency_key = ?1",
            QUEUE_COLUMNS
        );
        conn.query_row(&sql, [key], RawQueue::from_row)
            .optional()
            .map_err(storage_err)?
            .map(RawQueue::into_entry)
            .transpose()
    }

    async fn list_queue(&self, statuses: &[QueueStatus]) -> Result<Vec<QueueEntry>> {
        let conn = self.conn()?;
        let args: Vec<Value> = statuses
            .iter()
            .map(|s| Value::Text(s.as_str().to_string()))
            .collect();
        let filter = if statuses.is_empty() {
            String::new()
        } else {
            let marks = vec!["?"; statuses.len()].join(", ");
            format!(" WHERE status IN ({})", marks)
        };
        let sql = format!(
            "SELECT {} FROM queue_entries{} ORDER BY id ASC",
            QUEUE_COLUMNS, filter
        );

        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let raws = stmt
            .query_map(params_from_iter(args.iter()), RawQueue::from_row)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        raws.into_iter().map(RawQueue::into_entry).collect()
    }

    async fn update_queue(&self, entry: &QueueEntry) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                r#"
                UPDATE queue_entries SET status = ?2, attempts = ?3, last_error = ?4, updated_at = ?5
                WHERE id = ?1
                "#,
                params![
                    entry.id,
                    entry.status.as_str(),
                    entry.attempts as i64,
                    entry.last_error,
                    to_millis(entry.updated_at),
                ],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Queue entry not found: {}", entry.id)));
        }
        Ok(())
    }

    async fn insert_attempt(&self, attempt: NewQueueAttempt) -> Result<QueueAttempt> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO queue_attempts (queue_id, attempted_at, success, error_message)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                attempt.queue_id,
                to_millis(attempt.attempted_at),
                attempt.success,
                attempt.error_message,
            ],
        )
        .map_err(storage_err)?;
        let id = conn.last_insert_rowid();
        Ok(attempt.into_attempt(id))
    }

    async fn list_attempts_since(&self, since: DateTime<Utc>) -> Result<Vec<QueueAttempt>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, queue_id, attempted_at, success, error_message FROM queue_attempts \
                 WHERE attempted_at >= ?1 ORDER BY id ASC",
            )
            .map_err(storage_err)?;
        let raws = stmt
            .query_map([to_millis(since)], attempt_from_row)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        raws.into_iter().map(into_attempt).collect()
    }

    async fn list_attempts_for(&self, queue_id: i64) -> Result<Vec<QueueAttempt>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, queue_id, attempted_at, success, error_message FROM queue_attempts \
                 WHERE queue_id = ?1 ORDER BY id ASC",
            )
            .map_err(storage_err)?;
        let raws = stmt
            .query_map([queue_id], attempt_from_row)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        raws.into_iter().map(into_attempt).collect()
    }

    async fn insert_session(&self, session: NewSyncSession) -> Result<SyncSession> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO sync_sessions
            (store_id, mode, status, started_at, finished_at, triggered_by, error_message,
             processed_events, differences_detected)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                session.store_id.map(|s| s.0),
                session.mode.as_str(),
                session.status.as_str(),
                to_millis(session.started_at),
                to_millis(session.finished_at),
                session.triggered_by,
                session.error_message,
                session.processed_events as i64,
                session.differences_detected as i64,
            ],
        )
        .map_err(storage_err)?;
        let id = conn.last_insert_rowid();
        Ok(session.into_session(id))
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<SyncSession>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, store_id, mode, status, started_at, finished_at, triggered_by,
                       error_message, processed_events, differences_detected
                FROM sync_sessions ORDER BY id DESC LIMIT ?1
                "#,
            )
            .map_err(storage_err)?;
        type RawSession = (
            i64,
            Option<i64>,
            String,
            String,
            i64,
            i64,
            Option<String>,
            Option<String>,
            i64,
            i64,
        );
        let raws = stmt
            .query_map([limit as i64], |row| -> rusqlite::Result<RawSession> {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                ))
            })
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;

        raws.into_iter()
            .map(|r| {
                Ok(SyncSession {
                    id: r.0,
                    store_id: r.1.map(StoreId),
                    mode: r.2.parse()?,
                    status: r.3.parse()?,
                    started_at: from_millis(r.4)?,
                    finished_at: from_millis(r.5)?,
                    triggered_by: r.6,
                    error_message: r.7,
                    processed_events: r.8 as u64,
                    differences_detected: r.9 as u64,
                })
            })
            .collect()
    }
}
