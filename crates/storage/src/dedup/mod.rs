//! Per-organization, content-addressed attachment deduplication
//!
//! One physical blob per `(org_id, content_hash)`; every logical placement
//! is an [`AttachmentReference`](crate::models::AttachmentReference) that
//! holds a count on it. Blobs whose count reaches zero are collected by
//! [`DeduplicationService::cleanup_orphans`] after a grace period.

mod registry;

pub use registry::SqliteDedupRegistry;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{
    AttachmentReference, DeduplicatedAttachment, DeduplicationResult, DeduplicationStats,
};

/// Outcome of one orphan collection run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    pub deleted: usize,
    pub bytes_freed: i64,
    /// Rows kept because their blob could not be deleted; retried next run
    pub failed: usize,
}

pub trait DeduplicationService: Send + Sync {
    fn check_duplicate(&self, org_id: &str, content_hash: &str) -> Result<DeduplicationResult>;

    /// Insert a new row with one reference, atomically
    fn register_attachment(
        &self,
        attachment: &DeduplicatedAttachment,
        reference: &AttachmentReference,
    ) -> Result<()>;

    /// Insert a reference and bump the count. Returns the new count.
    fn add_reference(&self, dedup_id: &str, reference: &AttachmentReference) -> Result<i64>;

    /// Delete a reference and drop the count (floor zero). Returns the new count.
    ///
    /// Never deletes the blob.
    fn remove_reference(&self, reference_id: &str) -> Result<i64>;

    /// Delete orphans older than the grace period along with their blobs
    fn cleanup_orphans(&self) -> Result<CleanupStats>;

    fn get_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<(DeduplicatedAttachment, AttachmentReference)>;

    fn references_for_message(&self, message_id: &str) -> Result<Vec<AttachmentReference>>;

    fn stats(&self, org_id: &str) -> Result<DeduplicationStats>;
}
