//! Domain models for quotas, deduplicated attachments and stored objects

mod dedup;
mod quota;
mod storage;

pub use dedup::{
    AttachmentReference, DeduplicatedAttachment, DeduplicationResult, DeduplicationStats,
    compute_content_hash,
};
pub use quota::{
    CreateQuotaRequest, Quota, QuotaCheckResult, QuotaInfo, QuotaLevel, QuotaStatus,
    UpdateQuotaRequest, UsageUpdate,
};
pub use storage::{
    AttachmentMetadata, CopyRequest, METADATA_SCHEMA_VERSION, MessageMetadata, Metadata,
    MoveRequest, ObjectKind, ObjectMetadata, StorageKey, StorageObject, StoreAttachmentRequest,
    StoreMessageRequest, key_object_id,
};
