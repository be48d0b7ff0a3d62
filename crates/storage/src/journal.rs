//! Intent journal for blob mutations that are followed by quota accounting
//!
//! A write is recorded as `pending` before the blob store is touched, moved
//! to `blob_applied` once the blob call returns, and deleted once usage has
//! been updated. Anything left behind by a crash or a failed accounting call
//! is repaired by [`OperationJournal::reconcile`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::blob::BlobStore;
use crate::db::{Database, from_millis, to_millis};
use crate::error::{Result, StorageError};
use crate::quota::QuotaService;

const COLUMNS: &str =
    "id, operation, storage_key, mailbox_id, delta_bytes, state, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalOp {
    StoreMessage,
    DeleteMessage,
    CopyIn,
    DeleteSource,
}

impl JournalOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreMessage => "store_message",
            Self::DeleteMessage => "delete_message",
            Self::CopyIn => "copy_in",
            Self::DeleteSource => "delete_source",
        }
    }
}

impl fmt::Display for JournalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JournalOp {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "store_message" => Ok(Self::StoreMessage),
            "delete_message" => Ok(Self::DeleteMessage),
            "copy_in" => Ok(Self::CopyIn),
            "delete_source" => Ok(Self::DeleteSource),
            other => Err(StorageError::invalid(format!("unknown journal operation: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalState {
    /// Recorded, blob call not yet known to have succeeded
    Pending,
    /// Blob call succeeded, usage not yet updated
    BlobApplied,
}

impl JournalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::BlobApplied => "blob_applied",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "blob_applied" => Some(Self::BlobApplied),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub operation: JournalOp,
    pub storage_key: String,
    /// Mailbox whose usage changes; `None` when the object carried no mailbox
    pub mailbox_id: Option<String>,
    pub delta_bytes: i64,
    pub state: JournalState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JournalEntry {
    /// Whether the blob store currently looks the way this intent leaves it
    fn blob_matches(&self, exists: bool) -> bool {
        match self.delta_bytes {
            d if d > 0 => exists,
            d if d < 0 => !exists,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub applied: usize,
    pub discarded: usize,
    pub failed: usize,
}

pub struct OperationJournal {
    db: Arc<Database>,
}

impl OperationJournal {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record an intent and return its id
    pub fn begin(
        &self,
        operation: JournalOp,
        storage_key: &str,
        mailbox_id: Option<&str>,
        delta_bytes: i64,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = to_millis(Utc::now());
        self.db.lock().execute(
            &format!("INSERT INTO storage_journal ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)"),
            params![
                id,
                operation.as_str(),
                storage_key,
                mailbox_id,
                delta_bytes,
                JournalState::Pending.as_str(),
                now,
            ],
        )?;
        debug!("Journal begin: id={} op={} key={} delta={}", id, operation, storage_key, delta_bytes);
        Ok(id)
    }

    pub fn mark_blob_applied(&self, id: &str) -> Result<()> {
        let changed = self.db.lock().execute(
            "UPDATE storage_journal SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
            params![
                JournalState::BlobApplied.as_str(),
                to_millis(Utc::now()),
                id,
                JournalState::Pending.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::not_found("journal entry", id));
        }
        Ok(())
    }

    /// Drop an entry whose accounting is done, or whose blob call failed
    pub fn complete(&self, id: &str) -> Result<()> {
        let changed = self
            .db
            .lock()
            .execute("DELETE FROM storage_journal WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(StorageError::not_found("journal entry", id));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<JournalEntry>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM storage_journal WHERE id = ?1"),
                [id],
                raw_entry,
            )
            .optional()?;
        row.map(RawEntry::into_entry).transpose()
    }

    /// Entries untouched since `older_than`, oldest first
    pub fn stale(&self, older_than: DateTime<Utc>) -> Result<Vec<JournalEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM storage_journal WHERE updated_at <= ?1 ORDER BY updated_at, id"
        ))?;
        let rows = stmt
            .query_map([to_millis(older_than)], raw_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawEntry::into_entry).collect()
    }

    /// Settle every entry untouched since `older_than`.
    ///
    /// `blob_applied` entries get their delta applied. `pending` entries are
    /// applied when the blob store already reflects the intent and discarded
    /// otherwise. Each entry is claimed before its delta is applied, so two
    /// reconcilers never apply the same one; a failed apply puts it back.
    pub fn reconcile(
        &self,
        blobs: &dyn BlobStore,
        quota: &dyn QuotaService,
        older_than: DateTime<Utc>,
    ) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();

        for entry in self.stale(older_than)? {
            let apply = match entry.state {
                JournalState::BlobApplied => true,
                JournalState::Pending => match blobs.exists(&entry.storage_key) {
                    Ok(exists) => entry.blob_matches(exists),
                    Err(e) => {
                        warn!("Journal {}: cannot inspect {}: {}", entry.id, entry.storage_key, e);
                        stats.failed += 1;
                        continue;
                    }
                },
            };

            let Some(entry) = self.take(&entry.id)? else {
                continue;
            };

            if !apply {
                debug!("Journal discard: id={} op={} key={}", entry.id, entry.operation, entry.storage_key);
                stats.discarded += 1;
                continue;
            }

            let Some(mailbox_id) = entry.mailbox_id.as_deref() else {
                warn!("Journal {}: no mailbox recorded for {}, dropping", entry.id, entry.storage_key);
                stats.discarded += 1;
                continue;
            };

            match quota.update_usage(mailbox_id, entry.delta_bytes) {
                Ok(()) => {
                    info!(
                        "Journal applied: id={} op={} mailbox={} delta={}",
                        entry.id, entry.operation, mailbox_id, entry.delta_bytes
                    );
                    stats.applied += 1;
                }
                Err(e) => {
                    warn!("Journal {}: usage update failed: {}", entry.id, e);
                    self.restore(&entry)?;
                    stats.failed += 1;
                }
            }
        }

        if stats != ReconcileStats::default() {
            info!(
                "Journal reconcile: applied={} discarded={} failed={}",
                stats.applied, stats.discarded, stats.failed
            );
        }
        Ok(stats)
    }

    fn take(&self, id: &str) -> Result<Option<JournalEntry>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!("DELETE FROM storage_journal WHERE id = ?1 RETURNING {COLUMNS}"),
                [id],
                raw_entry,
            )
            .optional()?;
        row.map(RawEntry::into_entry).transpose()
    }

    fn restore(&self, entry: &JournalEntry) -> Result<()> {
        self.db.lock().execute(
            &format!("INSERT INTO storage_journal ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                entry.id,
                entry.operation.as_str(),
                entry.storage_key,
                entry.mailbox_id,
                entry.delta_bytes,
                entry.state.as_str(),
                to_millis(entry.created_at),
                to_millis(entry.updated_at),
            ],
        )?;
        Ok(())
    }
}

struct RawEntry {
    id: String,
    operation: String,
    storage_key: String,
    mailbox_id: Option<String>,
    delta_bytes: i64,
    state: String,
    created_at: i64,
    updated_at: i64,
}

fn raw_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        id: row.get(0)?,
        operation: row.get(1)?,
        storage_key: row.get(2)?,
        mailbox_id: row.get(3)?,
        delta_bytes: row.get(4)?,
        state: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl RawEntry {
    fn into_entry(self) -> Result<JournalEntry> {
        let state = JournalState::parse(&self.state)
            .ok_or_else(|| StorageError::invalid(format!("unknown journal state: {}", self.state)))?;
        Ok(JournalEntry {
            operation: self.operation.parse()?,
            id: self.id,
            storage_key: self.storage_key,
            mailbox_id: self.mailbox_id,
            delta_bytes: self.delta_bytes,
            state,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}
