//! Deduplicated attachment records and their references

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One physical copy of attachment content, shared within an organization.
///
/// Unique per `(org_id, content_hash)`. `ref_count == 0` marks an orphan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicatedAttachment {
    pub id: String,
    pub org_id: String,
    pub content_hash: String,
    pub storage_key: String,
    pub size: i64,
    pub content_type: String,
    pub ref_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeduplicatedAttachment {
    pub fn new(
        org_id: impl Into<String>,
        content_hash: impl Into<String>,
        storage_key: impl Into<String>,
        size: i64,
        content_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            content_hash: content_hash.into(),
            storage_key: storage_key.into(),
            size,
            content_type: content_type.into(),
            ref_count: 1,
            first_seen_at: now,
            last_seen_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_orphaned(&self) -> bool {
        self.ref_count == 0
    }
}

/// A logical placement of attachment content in one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentReference {
    pub id: String,
    /// Owning deduplicated row. Filled in by the registry on insert.
    pub dedup_id: String,
    pub org_id: String,
    pub domain_id: String,
    pub user_id: String,
    pub mailbox_id: Option<String>,
    pub message_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub content_id: Option<String>,
    pub is_inline: bool,
    pub created_at: DateTime<Utc>,
}

/// Answer to "has this organization stored this content before?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationResult {
    pub is_duplicate: bool,
    pub existing: Option<DeduplicatedAttachment>,
    pub content_hash: String,
    /// Bytes a new placement would not have to write
    pub space_saved: i64,
}

/// Aggregate deduplication figures for one organization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeduplicationStats {
    /// Logical placements (sum of reference counts)
    pub total_attachments: i64,
    /// Physical copies
    pub unique_attachments: i64,
    pub duplicate_count: i64,
    pub storage_used: i64,
    pub storage_saved: i64,
    /// Logical bytes per physical byte; 1.0 when nothing is shared
    pub dedup_ratio: f64,
}

/// Lowercase hex SHA-256 digest of attachment content
pub fn compute_content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_content_hash() {
        assert_eq!(
            compute_content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(compute_content_hash(b"").len(), 64);
    }

    #[test]
    fn test_new_attachment_starts_with_one_reference() {
        let att = DeduplicatedAttachment::new("org", "hash", "org/d/u/attachments/2024/01/a", 10, "text/plain");
        assert_eq!(att.ref_count, 1);
        assert!(!att.is_orphaned());
        assert_eq!(att.first_seen_at, att.last_seen_at);
    }
}
