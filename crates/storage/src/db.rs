//! SQLite connection shared by the ledger, registry, reservation store and journal

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, Transaction};
use rusqlite_migration::{M, Migrations};

use crate::error::Result;
use crate::models::QuotaLevel;

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied. Timestamps are unix milliseconds so range
/// predicates compare numerically.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: quota ledger and deduplication registry
        M::up(
            r#"
            CREATE TABLE quotas (
                id TEXT PRIMARY KEY,
                level TEXT NOT NULL
                    CHECK (level IN ('organization', 'domain', 'user', 'mailbox')),
                entity_id TEXT NOT NULL,
                parent_id TEXT,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                used_bytes INTEGER NOT NULL DEFAULT 0,
                reserved_bytes INTEGER NOT NULL DEFAULT 0,
                soft_limit_pct INTEGER NOT NULL DEFAULT 90,
                hard_limit_pct INTEGER NOT NULL DEFAULT 100,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (level, entity_id)
            );

            CREATE INDEX idx_quotas_parent_id ON quotas(parent_id);

            -- Live reservations shared between instances
            CREATE TABLE quota_reservations (
                id TEXT PRIMARY KEY,
                org_id TEXT,
                domain_id TEXT,
                user_id TEXT,
                mailbox_id TEXT NOT NULL,
                reserved_bytes INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX idx_quota_reservations_expires_at
                ON quota_reservations(expires_at);

            CREATE TABLE deduplicated_attachments (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                storage_key TEXT NOT NULL,
                size INTEGER NOT NULL,
                content_type TEXT NOT NULL,
                ref_count INTEGER NOT NULL DEFAULT 1 CHECK (ref_count >= 0),
                first_seen_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (org_id, content_hash)
            );

            CREATE INDEX idx_dedup_orphans
                ON deduplicated_attachments(ref_count, updated_at);

            CREATE TABLE attachment_references (
                id TEXT PRIMARY KEY,
                dedup_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                domain_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                mailbox_id TEXT,
                message_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                content_id TEXT,
                is_inline INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (dedup_id) REFERENCES deduplicated_attachments(id)
            );

            CREATE INDEX idx_attachment_references_dedup_id
                ON attachment_references(dedup_id);
            CREATE INDEX idx_attachment_references_message_id
                ON attachment_references(message_id);
            "#,
        ),
        // Migration 2: intents for blob writes awaiting quota accounting
        M::up(
            r#"
            CREATE TABLE storage_journal (
                id TEXT PRIMARY KEY,
                operation TEXT NOT NULL,
                storage_key TEXT NOT NULL,
                mailbox_id TEXT,
                delta_bytes INTEGER NOT NULL,
                state TEXT NOT NULL CHECK (state IN ('pending', 'blob_applied')),
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX idx_storage_journal_updated_at ON storage_journal(updated_at);
            "#,
        ),
    ])
}

/// A single SQLite connection guarded by a mutex.
///
/// Every statement that enforces a limit runs under this lock, so a
/// conditional UPDATE observes and modifies its row without interleaving.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and bring its schema up to date
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::init(conn, busy_timeout)
    }

    /// Fresh private in-memory database (tests, ephemeral tooling)
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, Duration::from_secs(5))
    }

    fn init(mut conn: Connection, busy_timeout: Duration) -> anyhow::Result<Self> {
        // WAL lets readers proceed during writes; foreign_keys guards reference rows.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        conn.busy_timeout(busy_timeout)?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection. A panic while holding the lock does not leave
    /// SQLite in a torn state, so poisoning is ignored.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` inside a transaction. Returning an error rolls it back.
    pub(crate) fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl ToSql for QuotaLevel {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for QuotaLevel {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[test]
    fn test_open_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("nested/storage.db"), Duration::from_secs(1)).unwrap();

        let conn = db.lock();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        for table in [
            "attachment_references",
            "deduplicated_attachments",
            "quota_reservations",
            "quotas",
            "storage_journal",
        ] {
            assert!(tables.iter().any(|t| t == table), "missing table {table}");
        }
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO quotas (id, level, entity_id, created_at, updated_at)
                 VALUES ('q1', 'mailbox', 'm1', 0, 0)",
                [],
            )?;
            Err(crate::StorageError::invalid("abort"))
        });
        assert!(result.is_err());

        let count: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM quotas", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_level_sql_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock();
        let level: QuotaLevel = conn
            .query_row("SELECT ?1", [QuotaLevel::Domain], |row| row.get(0))
            .unwrap();
        assert_eq!(level, QuotaLevel::Domain);
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let back = from_millis(to_millis(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
