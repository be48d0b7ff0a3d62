//! Storage crate - Resource management core for multi-tenant mail storage
//!
//! This crate provides:
//! - A hierarchical quota ledger (organization → domain → user → mailbox)
//!   with atomic check-and-update and expiring reservations
//! - A per-organization, reference-counted attachment deduplication registry
//! - A storage orchestrator placing messages and attachments in a blob store
//!   and moving them between tenants
//! - An operation journal that repairs blob writes whose accounting was lost
//!
//! Blob backends are pluggable through [`BlobStore`]; quota, reservation and
//! deduplication state lives in one SQLite database.

pub mod blob;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod journal;
pub mod models;
pub mod orchestrator;
pub mod quota;
pub mod tasks;

pub use blob::{BlobStore, CompletedPart, FileBlobStore, InMemoryBlobStore, ListPage};
pub use config::StorageConfig;
pub use db::Database;
pub use dedup::{CleanupStats, DeduplicationService, SqliteDedupRegistry};
pub use error::{ErrorKind, Result, StorageError};
pub use journal::{JournalEntry, JournalOp, JournalState, OperationJournal, ReconcileStats};
pub use models::{
    AttachmentMetadata, AttachmentReference, CopyRequest, CreateQuotaRequest,
    DeduplicatedAttachment, DeduplicationResult, DeduplicationStats, MessageMetadata, Metadata,
    MoveRequest, ObjectMetadata, Quota, QuotaCheckResult, QuotaInfo, QuotaLevel, QuotaStatus,
    StorageKey, StorageObject, StoreAttachmentRequest, StoreMessageRequest, UpdateQuotaRequest,
    UsageUpdate, compute_content_hash,
};
pub use orchestrator::{DomainStorage, DomainStorageService};
pub use quota::{
    InMemoryReservationStore, QuotaService, Reservation, ReservationState, ReservationStore,
    SqliteQuotaLedger, SqliteReservationStore, SweepStats, spawn_reservation_sweeper,
};
pub use tasks::{TaskHandle, spawn_periodic};
