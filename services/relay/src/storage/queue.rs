//! Durable SQLite store-and-forward queue.
//!
//! # Schema
//! - `messages`: one row per routable record, `status` PENDING or DELIVERED.
//! - `clients`: identity directory with last-seen timestamps.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000.
//! PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! # Schema versioning
//! `PRAGMA user_version` is the schema-version counter.  Migrations are
//! additive only (columns are appended, never dropped) and each step bumps
//! the counter inside the same transaction.  A "duplicate column name"
//! error from a partially-applied prior run counts as success.

use hh_protocol::{now_ms, Priority, Record, RecordKind};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

/// Current schema version.  v1 = base tables, v2 = priority column,
/// v3 = delivered_at column.
const SCHEMA_VERSION: i64 = 3;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("Migration to v{0} failed: {1}")]
    Migration(i64, String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A compact pending-row view for the control plane (`GET_PENDING`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingSummary {
    pub from: String,
    pub priority: i64,
    pub body: String,
}

// ---------------------------------------------------------------------------
// MessageStore
// ---------------------------------------------------------------------------

/// The durable queue.  Owns the only connection to the storage file; all
/// mutators are serialized by the caller holding this store behind one
/// mutex.
pub struct MessageStore {
    conn: Connection,
}

impl MessageStore {
    /// Open (or create) the store at `path`.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, creates the base
    /// schema and brings the version counter up to date.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        let mut store = MessageStore { conn };
        store.apply_migrations()?;
        Ok(store)
    }

    /// Current value of the schema-version counter.
    pub fn schema_version(&self) -> StoreResult<i64> {
        let v: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        Ok(v)
    }

    // -----------------------------------------------------------------------
    // Migrations
    // -----------------------------------------------------------------------

    fn apply_migrations(&mut self) -> StoreResult<()> {
        let mut version = self.schema_version()?;
        while version < SCHEMA_VERSION {
            let next = version + 1;
            let tx = self.conn.transaction()?;
            let step: Result<(), rusqlite::Error> = match next {
                1 => tx.execute_batch(include_str!("schema.sql")),
                2 => tolerate_duplicate_column(tx.execute_batch(
                    "ALTER TABLE messages ADD COLUMN priority INTEGER NOT NULL DEFAULT 1",
                )),
                3 => tolerate_duplicate_column(
                    tx.execute_batch("ALTER TABLE messages ADD COLUMN delivered_at INTEGER"),
                ),
                _ => Ok(()),
            };
            step.map_err(|e| StoreError::Migration(next, e.to_string()))?;
            tx.pragma_update(None, "user_version", next)?;
            tx.commit()?;
            version = next;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Record rows
    // -----------------------------------------------------------------------

    /// Insert a record as PENDING.  Idempotent on `id`: re-inserting an
    /// existing id is a no-op.
    pub fn store(&mut self, rec: &Record) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO messages
                 (id, kind, sender, recipient, created_at, body, priority, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING')",
            params![
                rec.id,
                rec.kind.as_str(),
                rec.from,
                rec.to,
                rec.timestamp,
                rec.body,
                rec.priority.as_i64(),
            ],
        )?;
        Ok(())
    }

    /// Transition a row to DELIVERED and stamp the delivery time.
    /// A missing id is a silent no-op.
    pub fn mark_delivered(&mut self, id: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE messages SET status = 'DELIVERED', delivered_at = ?2
             WHERE id = ?1 AND status = 'PENDING'",
            params![id, now_ms()],
        )?;
        Ok(())
    }

    /// All PENDING rows deliverable to `identity`: direct records addressed
    /// to it, plus broadcasts it did not originate.  Ordered by priority
    /// descending, then creation time ascending.
    pub fn pending_for(&self, identity: &str) -> StoreResult<Vec<Record>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, sender, recipient, created_at, body, priority, delivered_at
             FROM messages
             WHERE status = 'PENDING'
               AND (recipient = ?1 OR (kind = 'BROADCAST' AND sender != ?1))
             ORDER BY priority DESC, created_at ASC",
        )?;
        let rows = stmt.query_map(params![identity], map_record)?;
        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }

    /// Pending-row summaries for one identity, control-plane shape.
    pub fn pending_summaries_for(&self, identity: &str) -> StoreResult<Vec<PendingSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT sender, priority, body
             FROM messages
             WHERE status = 'PENDING'
               AND (recipient = ?1 OR (kind = 'BROADCAST' AND sender != ?1))
             ORDER BY priority DESC, created_at ASC",
        )?;
        let rows = stmt.query_map(params![identity], |row| {
            Ok(PendingSummary {
                from: row.get(0)?,
                priority: row.get(1)?,
                body: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn pending_count(&self) -> StoreResult<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE status = 'PENDING'",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn total_count(&self) -> StoreResult<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Distinct identities with at least one PENDING direct record
    /// addressed to them.
    pub fn identities_with_pending_direct(&self) -> StoreResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT recipient FROM messages
             WHERE status = 'PENDING' AND recipient IS NOT NULL
             ORDER BY recipient",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Client directory
    // -----------------------------------------------------------------------

    /// Record that `identity` was heard from just now.
    pub fn upsert_last_seen(&mut self, identity: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO clients (client_id, last_seen) VALUES (?1, ?2)
             ON CONFLICT(client_id) DO UPDATE SET last_seen = excluded.last_seen",
            params![identity, now_ms()],
        )?;
        Ok(())
    }

    pub fn last_seen(&self, identity: &str) -> StoreResult<Option<i64>> {
        let v = self
            .conn
            .query_row(
                "SELECT last_seen FROM clients WHERE client_id = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;
        Ok(v)
    }

    pub fn client_count(&self) -> StoreResult<i64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))?;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> StoreResult<()> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

/// Re-running an additive migration after a partial prior run hits
/// "duplicate column name"; that outcome is success.
fn tolerate_duplicate_column(result: Result<(), rusqlite::Error>) -> Result<(), rusqlite::Error> {
    match result {
        Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
        other => other,
    }
}

fn map_record(row: &rusqlite::Row<'_>) -> Result<Record, rusqlite::Error> {
    let kind_str: String = row.get(1)?;
    let kind = RecordKind::parse(&kind_str).unwrap_or(RecordKind::Direct);
    let priority = Priority::from_i64(row.get::<_, i64>(6)?).unwrap_or(Priority::Normal);
    Ok(Record {
        id: row.get(0)?,
        kind,
        from: row.get(2)?,
        to: row.get(3)?,
        timestamp: row.get(4)?,
        body: row.get(5)?,
        priority,
        delivered_timestamp: row.get(7)?,
    })
}
