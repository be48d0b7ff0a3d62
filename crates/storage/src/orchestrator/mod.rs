//! Message and attachment placement across tenants
//!
//! Composes a [`BlobStore`](crate::blob::BlobStore), the quota ledger and the
//! deduplication registry. Storage keys are derived, never chosen by callers.

mod domain;

pub use domain::DomainStorage;

use std::time::Duration;

use crate::error::Result;
use crate::models::{
    AttachmentMetadata, CopyRequest, MessageMetadata, MoveRequest, StorageObject,
    StoreAttachmentRequest, StoreMessageRequest,
};

pub trait DomainStorageService: Send + Sync {
    /// Check quota, write the message and charge its mailbox
    fn store_message(&self, req: StoreMessageRequest) -> Result<StorageObject>;

    fn get_message(
        &self,
        org_id: &str,
        domain_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<(Vec<u8>, Option<MessageMetadata>)>;

    /// Delete the message and credit the mailbox recorded in its metadata
    fn delete_message(
        &self,
        org_id: &str,
        domain_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<()>;

    /// Place an attachment, sharing content within the organization when a
    /// content hash is supplied. Attachments are not charged to quota.
    fn store_attachment(&self, req: StoreAttachmentRequest) -> Result<AttachmentMetadata>;

    fn get_attachment(
        &self,
        org_id: &str,
        domain_id: &str,
        user_id: &str,
        attachment_id: &str,
    ) -> Result<(Vec<u8>, AttachmentMetadata)>;

    fn delete_attachment(
        &self,
        org_id: &str,
        domain_id: &str,
        user_id: &str,
        attachment_id: &str,
    ) -> Result<()>;

    /// Total bytes and object count under a domain
    fn get_domain_size(&self, org_id: &str, domain_id: &str) -> Result<(i64, i64)>;

    fn get_user_size(&self, org_id: &str, domain_id: &str, user_id: &str) -> Result<(i64, i64)>;

    /// Copy an object to another tenant placement and return the new key.
    ///
    /// Fails before any copy is issued if the destination cannot take it.
    fn copy_between_domains(&self, req: &CopyRequest) -> Result<String>;

    /// Copy, then optionally delete the source. Returns the new key.
    fn move_between_domains(&self, req: &MoveRequest) -> Result<String>;

    fn presigned_upload_url(&self, key: &str, content_type: &str, ttl: Duration) -> Result<String>;

    fn presigned_download_url(&self, key: &str, ttl: Duration) -> Result<String>;
}
