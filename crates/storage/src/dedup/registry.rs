//! SQLite-backed deduplication registry

use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{CleanupStats, DeduplicationService};
use crate::blob::BlobStore;
use crate::db::{Database, from_millis, to_millis};
use crate::error::{Result, StorageError, is_constraint_violation};
use crate::models::{
    AttachmentReference, DeduplicatedAttachment, DeduplicationResult, DeduplicationStats,
};

const DEDUP_COLUMNS: &str = "id, org_id, content_hash, storage_key, size, content_type, \
     ref_count, first_seen_at, last_seen_at, created_at, updated_at";

const REFERENCE_COLUMNS: &str = "id, dedup_id, org_id, domain_id, user_id, mailbox_id, \
     message_id, filename, content_type, size, content_id, is_inline, created_at";

pub struct SqliteDedupRegistry {
    db: Arc<Database>,
    blobs: Arc<dyn BlobStore>,
    orphan_grace: chrono::Duration,
}

impl SqliteDedupRegistry {
    pub fn new(db: Arc<Database>, blobs: Arc<dyn BlobStore>, orphan_grace: chrono::Duration) -> Self {
        Self {
            db,
            blobs,
            orphan_grace,
        }
    }

    fn row_to_dedup(row: &Row<'_>) -> rusqlite::Result<DeduplicatedAttachment> {
        Ok(DeduplicatedAttachment {
            id: row.get(0)?,
            org_id: row.get(1)?,
            content_hash: row.get(2)?,
            storage_key: row.get(3)?,
            size: row.get(4)?,
            content_type: row.get(5)?,
            ref_count: row.get(6)?,
            first_seen_at: from_millis(row.get(7)?),
            last_seen_at: from_millis(row.get(8)?),
            created_at: from_millis(row.get(9)?),
            updated_at: from_millis(row.get(10)?),
        })
    }

    fn row_to_reference(row: &Row<'_>) -> rusqlite::Result<AttachmentReference> {
        Ok(AttachmentReference {
            id: row.get(0)?,
            dedup_id: row.get(1)?,
            org_id: row.get(2)?,
            domain_id: row.get(3)?,
            user_id: row.get(4)?,
            mailbox_id: row.get(5)?,
            message_id: row.get(6)?,
            filename: row.get(7)?,
            content_type: row.get(8)?,
            size: row.get(9)?,
            content_id: row.get(10)?,
            is_inline: row.get(11)?,
            created_at: from_millis(row.get(12)?),
        })
    }

    fn insert_reference(conn: &Connection, dedup_id: &str, reference: &AttachmentReference) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO attachment_references ({REFERENCE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                reference.id,
                dedup_id,
                reference.org_id,
                reference.domain_id,
                reference.user_id,
                reference.mailbox_id,
                reference.message_id,
                reference.filename,
                reference.content_type,
                reference.size,
                reference.content_id,
                reference.is_inline,
                to_millis(reference.created_at),
            ],
        )?;
        Ok(())
    }

    fn load_dedup(conn: &Connection, id: &str) -> Result<Option<DeduplicatedAttachment>> {
        let row = conn
            .query_row(
                &format!("SELECT {DEDUP_COLUMNS} FROM deduplicated_attachments WHERE id = ?1"),
                [id],
                Self::row_to_dedup,
            )
            .optional()?;
        Ok(row)
    }
}

impl DeduplicationService for SqliteDedupRegistry {
    fn check_duplicate(&self, org_id: &str, content_hash: &str) -> Result<DeduplicationResult> {
        let conn = self.db.lock();
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {DEDUP_COLUMNS} FROM deduplicated_attachments
                     WHERE org_id = ?1 AND content_hash = ?2"
                ),
                params![org_id, content_hash],
                Self::row_to_dedup,
            )
            .optional()?;

        Ok(DeduplicationResult {
            is_duplicate: existing.is_some(),
            space_saved: existing.as_ref().map_or(0, |e| e.size),
            existing,
            content_hash: content_hash.to_string(),
        })
    }

    fn register_attachment(
        &self,
        attachment: &DeduplicatedAttachment,
        reference: &AttachmentReference,
    ) -> Result<()> {
        let now = to_millis(Utc::now());
        self.db.transaction(|tx| {
            let inserted = tx.execute(
                &format!(
                    "INSERT INTO deduplicated_attachments ({DEDUP_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7, ?7, ?7)"
                ),
                params![
                    attachment.id,
                    attachment.org_id,
                    attachment.content_hash,
                    attachment.storage_key,
                    attachment.size,
                    attachment.content_type,
                    now,
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    return Err(StorageError::AlreadyExists {
                        resource: "deduplicated attachment",
                        id: format!("{}/{}", attachment.org_id, attachment.content_hash),
                    });
                }
                Err(e) => return Err(e.into()),
            }
            Self::insert_reference(tx, &attachment.id, reference)
        })?;

        info!(
            "Registered attachment: org={} hash={} size={} key={}",
            attachment.org_id, attachment.content_hash, attachment.size, attachment.storage_key
        );
        Ok(())
    }

    fn add_reference(&self, dedup_id: &str, reference: &AttachmentReference) -> Result<i64> {
        let now = to_millis(Utc::now());
        let ref_count = self.db.transaction(|tx| {
            let ref_count: i64 = tx
                .query_row(
                    "UPDATE deduplicated_attachments
                     SET ref_count = ref_count + 1, last_seen_at = ?1, updated_at = ?1
                     WHERE id = ?2
                     RETURNING ref_count",
                    params![now, dedup_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StorageError::not_found("deduplicated attachment", dedup_id))?;
            Self::insert_reference(tx, dedup_id, reference)?;
            Ok(ref_count)
        })?;

        debug!(
            "Added attachment reference: dedup={} reference={} ref_count={}",
            dedup_id, reference.id, ref_count
        );
        Ok(ref_count)
    }

    fn remove_reference(&self, reference_id: &str) -> Result<i64> {
        let now = to_millis(Utc::now());
        let (dedup_id, ref_count) = self.db.transaction(|tx| {
            let dedup_id: String = tx
                .query_row(
                    "DELETE FROM attachment_references WHERE id = ?1 RETURNING dedup_id",
                    [reference_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StorageError::not_found("attachment reference", reference_id))?;
            let ref_count: i64 = tx
                .query_row(
                    "UPDATE deduplicated_attachments
                     SET ref_count = MAX(0, ref_count - 1), updated_at = ?1
                     WHERE id = ?2
                     RETURNING ref_count",
                    params![now, dedup_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StorageError::not_found("deduplicated attachment", dedup_id.clone()))?;
            Ok((dedup_id, ref_count))
        })?;

        if ref_count == 0 {
            debug!("Attachment orphaned: dedup={}", dedup_id);
        }
        Ok(ref_count)
    }

    fn cleanup_orphans(&self) -> Result<CleanupStats> {
        let cutoff = to_millis(Utc::now() - self.orphan_grace);
        let candidates: Vec<String> = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(
                "SELECT id FROM deduplicated_attachments
                 WHERE ref_count = 0 AND updated_at <= ?1
                 ORDER BY updated_at",
            )?;
            stmt.query_map([cutoff], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut stats = CleanupStats::default();
        for id in candidates {
            // Re-check inside the transaction; a concurrent add_reference wins.
            let outcome = self.db.transaction(|tx| {
                let deleted: Option<(String, i64)> = tx
                    .query_row(
                        "DELETE FROM deduplicated_attachments
                         WHERE id = ?1 AND ref_count = 0 AND updated_at <= ?2
                         RETURNING storage_key, size",
                        params![id, cutoff],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((storage_key, size)) = deleted else {
                    return Ok(None);
                };
                self.blobs.delete(&storage_key)?;
                Ok(Some((storage_key, size)))
            });

            match outcome {
                Ok(Some((storage_key, size))) => {
                    debug!("Deleted orphan: dedup={} key={} size={}", id, storage_key, size);
                    stats.deleted += 1;
                    stats.bytes_freed += size;
                }
                Ok(None) => debug!("Orphan revived before cleanup: dedup={}", id),
                Err(e) => {
                    error!("Failed to delete orphan {}: {}", id, e);
                    stats.failed += 1;
                }
            }
        }

        if stats.deleted > 0 || stats.failed > 0 {
            info!(
                "Orphan cleanup: deleted={} bytes_freed={} failed={}",
                stats.deleted, stats.bytes_freed, stats.failed
            );
        }
        Ok(stats)
    }

    fn get_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<(DeduplicatedAttachment, AttachmentReference)> {
        let conn = self.db.lock();
        let reference = conn
            .query_row(
                &format!("SELECT {REFERENCE_COLUMNS} FROM attachment_references WHERE id = ?1"),
                [reference_id],
                Self::row_to_reference,
            )
            .optional()?
            .ok_or_else(|| StorageError::not_found("attachment reference", reference_id))?;

        let Some(dedup) = Self::load_dedup(&conn, &reference.dedup_id)? else {
            warn!(
                "Reference points at missing attachment: reference={} dedup={}",
                reference.id, reference.dedup_id
            );
            return Err(StorageError::not_found("deduplicated attachment", reference.dedup_id));
        };
        Ok((dedup, reference))
    }

    fn references_for_message(&self, message_id: &str) -> Result<Vec<AttachmentReference>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REFERENCE_COLUMNS} FROM attachment_references
             WHERE message_id = ?1 ORDER BY created_at, id"
        ))?;
        let references = stmt
            .query_map([message_id], Self::row_to_reference)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(references)
    }

    fn stats(&self, org_id: &str) -> Result<DeduplicationStats> {
        let conn = self.db.lock();
        let (total, unique, used, logical): (i64, i64, i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(ref_count), 0), COUNT(*),
                    COALESCE(SUM(size), 0), COALESCE(SUM(size * ref_count), 0)
             FROM deduplicated_attachments WHERE org_id = ?1",
            [org_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(DeduplicationStats {
            total_attachments: total,
            unique_attachments: unique,
            duplicate_count: (total - unique).max(0),
            storage_used: used,
            storage_saved: (logical - used).max(0),
            dedup_ratio: if used > 0 {
                logical as f64 / used as f64
            } else {
                1.0
            },
        })
    }
}
