//! Integration tests for the storage crate
//!
//! These tests drive the orchestrator end to end over the SQLite ledger and
//! registry, with in-memory and on-disk blob stores.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use storage::models::Metadata;
use storage::{
    BlobStore, CompletedPart, CopyRequest, CreateQuotaRequest, Database, DeduplicationService,
    DomainStorage, DomainStorageService, ErrorKind, FileBlobStore, InMemoryBlobStore, ListPage,
    MessageMetadata, MoveRequest, OperationJournal, QuotaLevel, QuotaService, SqliteDedupRegistry,
    SqliteQuotaLedger, StorageConfig, StorageError, StorageObject, StoreAttachmentRequest,
    StoreMessageRequest, compute_content_hash,
};
use tempfile::TempDir;

/// In-memory store whose deletes can be switched to fail
#[derive(Default)]
struct FlakyBlobStore {
    inner: InMemoryBlobStore,
    fail_deletes: AtomicBool,
}

impl BlobStore for FlakyBlobStore {
    fn put(&self, key: &str, data: &[u8], content_type: &str, metadata: &Metadata) -> anyhow::Result<()> {
        self.inner.put(key, data, content_type, metadata)
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<(Vec<u8>, StorageObject)>> {
        self.inner.get(key)
    }

    fn get_metadata(&self, key: &str) -> anyhow::Result<Option<StorageObject>> {
        self.inner.get_metadata(key)
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("backend unavailable while deleting {key}");
        }
        self.inner.delete(key)
    }

    fn copy(&self, source_key: &str, dest_key: &str, metadata: Option<&Metadata>) -> anyhow::Result<()> {
        self.inner.copy(source_key, dest_key, metadata)
    }

    fn list(&self, prefix: &str, max_keys: usize, start_after: Option<&str>) -> anyhow::Result<ListPage> {
        self.inner.list(prefix, max_keys, start_after)
    }

    fn presigned_upload_url(&self, key: &str, content_type: &str, ttl: Duration) -> anyhow::Result<String> {
        self.inner.presigned_upload_url(key, content_type, ttl)
    }

    fn presigned_download_url(&self, key: &str, ttl: Duration) -> anyhow::Result<String> {
        self.inner.presigned_download_url(key, ttl)
    }

    fn initiate_multipart(&self, key: &str, content_type: &str, metadata: &Metadata) -> anyhow::Result<String> {
        self.inner.initiate_multipart(key, content_type, metadata)
    }

    fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, data: &[u8]) -> anyhow::Result<String> {
        self.inner.upload_part(key, upload_id, part_number, data)
    }

    fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> anyhow::Result<()> {
        self.inner.complete_multipart(key, upload_id, parts)
    }

    fn abort_multipart(&self, key: &str, upload_id: &str) -> anyhow::Result<()> {
        self.inner.abort_multipart(key, upload_id)
    }
}

struct Harness {
    storage: DomainStorage,
    blobs: Arc<FlakyBlobStore>,
    ledger: Arc<SqliteQuotaLedger>,
    dedup: Arc<SqliteDedupRegistry>,
    journal: Arc<OperationJournal>,
}

/// Two domains in one organization:
/// - a.com with 10 000 bytes, mailbox inbox-a
/// - b.com with 1 000 bytes, mailbox inbox-b
fn harness() -> Harness {
    let config = StorageConfig {
        orphan_grace_period_secs: 0,
        ..Default::default()
    };
    let db = Arc::new(Database::open_in_memory().unwrap());
    let blobs = Arc::new(FlakyBlobStore::default());
    let ledger = Arc::new(SqliteQuotaLedger::new(Arc::clone(&db), config.clone()));
    let dedup = Arc::new(SqliteDedupRegistry::new(
        Arc::clone(&db),
        blobs.clone(),
        config.orphan_grace_period(),
    ));
    let journal = Arc::new(OperationJournal::new(Arc::clone(&db)));

    let org = ledger
        .create_quota(CreateQuotaRequest::new(QuotaLevel::Organization, "org").with_total_bytes(100_000))
        .unwrap();
    for (domain, mailbox, total) in [("a.com", "inbox-a", 10_000), ("b.com", "inbox-b", 1_000)] {
        let domain = ledger
            .create_quota(
                CreateQuotaRequest::new(QuotaLevel::Domain, domain)
                    .with_parent(org.id.clone())
                    .with_total_bytes(total),
            )
            .unwrap();
        ledger
            .create_quota(
                CreateQuotaRequest::new(QuotaLevel::Mailbox, mailbox)
                    .with_parent(domain.id)
                    .with_total_bytes(5_000),
            )
            .unwrap();
    }

    let storage = DomainStorage::new(blobs.clone(), ledger.clone(), dedup.clone(), config)
        .with_journal(Arc::clone(&journal));
    Harness {
        storage,
        blobs,
        ledger,
        dedup,
        journal,
    }
}

fn used(h: &Harness, level: QuotaLevel, entity_id: &str) -> i64 {
    h.ledger.get_quota(level, entity_id).unwrap().used_bytes
}

fn message(domain: &str, user: &str, mailbox: &str, id: &str, size: usize) -> StoreMessageRequest {
    StoreMessageRequest {
        org_id: "org".into(),
        domain_id: domain.into(),
        user_id: user.into(),
        mailbox_id: mailbox.into(),
        folder_id: None,
        message_id: id.into(),
        content: vec![b'x'; size],
        content_type: "message/rfc822".into(),
        metadata: Some(MessageMetadata {
            subject: format!("Message {id}"),
            from: "sender@example.org".into(),
            to: vec![format!("{user}@{domain}")],
            ..Default::default()
        }),
    }
}

fn invoice(message_id: &str, content: &[u8]) -> StoreAttachmentRequest {
    StoreAttachmentRequest {
        org_id: "org".into(),
        domain_id: "a.com".into(),
        user_id: "alice".into(),
        mailbox_id: Some("inbox-a".into()),
        message_id: message_id.into(),
        filename: "invoice.pdf".into(),
        content_type: "application/pdf".into(),
        content: content.to_vec(),
        content_hash: Some(compute_content_hash(content)),
        content_id: None,
        is_inline: false,
    }
}

fn no_stale_journal_entries(h: &Harness) -> bool {
    h.journal
        .stale(Utc::now() + chrono::Duration::seconds(1))
        .unwrap()
        .is_empty()
}

#[test]
fn test_message_store_get_delete_accounting() {
    let h = harness();

    let object = h.storage.store_message(message("a.com", "alice", "inbox-a", "m1", 700)).unwrap();
    assert_eq!(object.size, 700);
    assert_eq!(used(&h, QuotaLevel::Mailbox, "inbox-a"), 700);
    assert_eq!(used(&h, QuotaLevel::Domain, "a.com"), 700);
    assert_eq!(used(&h, QuotaLevel::Organization, "org"), 700);

    let (data, metadata) = h.storage.get_message("org", "a.com", "alice", "m1").unwrap();
    assert_eq!(data.len(), 700);
    let metadata = metadata.unwrap();
    assert_eq!(metadata.subject, "Message m1");
    assert_eq!(metadata.mailbox_id, "inbox-a");

    assert_eq!(h.storage.get_user_size("org", "a.com", "alice").unwrap(), (700, 1));
    assert_eq!(h.storage.get_domain_size("org", "a.com").unwrap(), (700, 1));

    h.storage.delete_message("org", "a.com", "alice", "m1").unwrap();
    assert_eq!(used(&h, QuotaLevel::Mailbox, "inbox-a"), 0);
    assert_eq!(used(&h, QuotaLevel::Organization, "org"), 0);
    assert!(h.storage.get_message("org", "a.com", "alice", "m1").unwrap_err().is_not_found());
    assert!(h.storage.delete_message("org", "a.com", "alice", "m1").unwrap_err().is_not_found());

    assert!(no_stale_journal_entries(&h));
}

#[test]
fn test_message_rejected_at_domain_level() {
    let h = harness();
    // Mailbox has 5 000 bytes, b.com only 1 000.
    let err = h
        .storage
        .store_message(message("b.com", "bob", "inbox-b", "big", 1_500))
        .unwrap_err();
    match err {
        StorageError::QuotaExceeded {
            level,
            entity_id,
            available_bytes,
            requested_bytes,
            ..
        } => {
            assert_eq!(level, QuotaLevel::Domain);
            assert_eq!(entity_id, "b.com");
            assert_eq!(available_bytes, 1_000);
            assert_eq!(requested_bytes, 1_500);
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
    assert_eq!(h.storage.get_domain_size("org", "b.com").unwrap(), (0, 0));
}

/// Same invoice attached to two messages: one blob, two references
#[test]
fn test_attachment_deduplicated_across_messages() {
    let h = harness();
    let content: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();

    let first = h.storage.store_attachment(invoice("m1", &content)).unwrap();
    assert_eq!(first.ref_count, 1);
    let puts_after_first = h.blobs.inner.put_count();

    let second = h.storage.store_attachment(invoice("m2", &content)).unwrap();
    assert_eq!(second.ref_count, 2);
    assert_eq!(h.blobs.inner.put_count(), puts_after_first);
    assert_eq!(second.storage_key, first.storage_key);
    assert_ne!(second.attachment_id, first.attachment_id);

    for placed in [&first, &second] {
        let (data, meta) = h
            .storage
            .get_attachment("org", "a.com", "alice", &placed.attachment_id)
            .unwrap();
        assert_eq!(data, content);
        assert_eq!(meta.filename, "invoice.pdf");
        assert_eq!(meta.size, 2048);
        assert_eq!(meta.content_hash, Some(compute_content_hash(&content)));
    }

    // Attachments never touch quota.
    assert_eq!(used(&h, QuotaLevel::Mailbox, "inbox-a"), 0);
}

#[test]
fn test_attachment_round_trip() {
    let h = harness();
    let content = b"%PDF-1.7 quarterly report".to_vec();

    let placed = h.storage.store_attachment(invoice("m1", &content)).unwrap();
    let (data, meta) = h
        .storage
        .get_attachment("org", "a.com", "alice", &placed.attachment_id)
        .unwrap();

    assert_eq!(data, content);
    assert_eq!(meta.content_hash, placed.content_hash);
    assert_eq!(meta.filename, placed.filename);
    assert_eq!(meta.size, placed.size);
    assert_eq!(meta.message_id, "m1");
}

#[test]
fn test_last_reference_then_cleanup_frees_blob() {
    let h = harness();
    let content = vec![9u8; 1024];
    let placements: Vec<_> = (0..3)
        .map(|i| h.storage.store_attachment(invoice(&format!("m{i}"), &content)).unwrap())
        .collect();
    let key = placements[0].storage_key.clone();

    for placed in &placements {
        h.storage
            .delete_attachment("org", "a.com", "alice", &placed.attachment_id)
            .unwrap();
    }
    assert!(h.blobs.exists(&key).unwrap());

    let stats = h.dedup.cleanup_orphans().unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.bytes_freed, 1024);
    assert!(!h.blobs.exists(&key).unwrap());
}

#[test]
fn test_concurrent_identical_uploads_share_one_blob() {
    let h = harness();
    let content = vec![42u8; 512];

    let placements: Vec<_> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let storage = &h.storage;
                let content = &content;
                s.spawn(move || storage.store_attachment(invoice(&format!("m{i}"), content)).unwrap())
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let stats = h.dedup.stats("org").unwrap();
    assert_eq!(stats.unique_attachments, 1);
    assert_eq!(stats.total_attachments, 8);
    assert_eq!(h.blobs.inner.len(), 1);

    for placed in &placements {
        let (data, _) = h
            .storage
            .get_attachment("org", "a.com", "alice", &placed.attachment_id)
            .unwrap();
        assert_eq!(data, content);
    }
}

/// A 500-byte object cannot land in a domain with 100 bytes left
#[test]
fn test_copy_rejected_before_any_copy() {
    let h = harness();
    let source = h.storage.store_message(message("a.com", "alice", "inbox-a", "m1", 500)).unwrap();
    h.ledger.update_usage("inbox-b", 900).unwrap();
    let objects_before = h.blobs.inner.len();

    let err = h
        .storage
        .copy_between_domains(&CopyRequest {
            source_key: source.key.clone(),
            dest_org_id: "org".into(),
            dest_domain_id: "b.com".into(),
            dest_user_id: "bob".into(),
            dest_mailbox_id: "inbox-b".into(),
        })
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    match err {
        StorageError::QuotaExceeded {
            level,
            available_bytes,
            requested_bytes,
            ..
        } => {
            assert_eq!(level, QuotaLevel::Domain);
            assert_eq!(available_bytes, 100);
            assert_eq!(requested_bytes, 500);
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }

    assert_eq!(h.blobs.inner.len(), objects_before);
    assert!(h.blobs.exists(&source.key).unwrap());
    assert_eq!(used(&h, QuotaLevel::Domain, "a.com"), 500);
    assert_eq!(used(&h, QuotaLevel::Domain, "b.com"), 900);
    assert_eq!(h.storage.get_domain_size("org", "b.com").unwrap(), (0, 0));
}

#[test]
fn test_copy_between_domains() {
    let h = harness();
    let source = h.storage.store_message(message("a.com", "alice", "inbox-a", "m1", 300)).unwrap();

    let dest_key = h
        .storage
        .copy_between_domains(&CopyRequest {
            source_key: source.key.clone(),
            dest_org_id: "org".into(),
            dest_domain_id: "b.com".into(),
            dest_user_id: "bob".into(),
            dest_mailbox_id: "inbox-b".into(),
        })
        .unwrap();

    assert!(dest_key.starts_with("org/b.com/bob/messages/"));
    assert!(dest_key.ends_with("/m1"));
    assert!(h.blobs.exists(&source.key).unwrap());
    assert_eq!(used(&h, QuotaLevel::Mailbox, "inbox-a"), 300);
    assert_eq!(used(&h, QuotaLevel::Mailbox, "inbox-b"), 300);
    assert_eq!(used(&h, QuotaLevel::Organization, "org"), 600);

    let (_, metadata) = h.storage.get_message("org", "b.com", "bob", "m1").unwrap();
    assert_eq!(metadata.unwrap().mailbox_id, "inbox-b");
}

#[test]
fn test_move_between_domains() {
    let h = harness();
    let source = h.storage.store_message(message("a.com", "alice", "inbox-a", "m1", 300)).unwrap();

    let dest_key = h
        .storage
        .move_between_domains(&MoveRequest {
            copy: CopyRequest {
                source_key: source.key.clone(),
                dest_org_id: "org".into(),
                dest_domain_id: "b.com".into(),
                dest_user_id: "bob".into(),
                dest_mailbox_id: "inbox-b".into(),
            },
            delete_source: true,
        })
        .unwrap();

    assert!(!h.blobs.exists(&source.key).unwrap());
    assert!(h.blobs.exists(&dest_key).unwrap());
    assert_eq!(used(&h, QuotaLevel::Mailbox, "inbox-a"), 0);
    assert_eq!(used(&h, QuotaLevel::Domain, "a.com"), 0);
    assert_eq!(used(&h, QuotaLevel::Mailbox, "inbox-b"), 300);
    assert_eq!(used(&h, QuotaLevel::Organization, "org"), 300);

    // Delete at the new home credits the destination mailbox.
    h.storage.delete_message("org", "b.com", "bob", "m1").unwrap();
    assert_eq!(used(&h, QuotaLevel::Mailbox, "inbox-b"), 0);
    assert!(no_stale_journal_entries(&h));
}

#[test]
fn test_move_reports_partial_failure() {
    let h = harness();
    let source = h.storage.store_message(message("a.com", "alice", "inbox-a", "m1", 300)).unwrap();
    h.blobs.fail_deletes.store(true, Ordering::SeqCst);

    let err = h
        .storage
        .move_between_domains(&MoveRequest {
            copy: CopyRequest {
                source_key: source.key.clone(),
                dest_org_id: "org".into(),
                dest_domain_id: "b.com".into(),
                dest_user_id: "bob".into(),
                dest_mailbox_id: "inbox-b".into(),
            },
            delete_source: true,
        })
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    match &err {
        StorageError::PartialFailure {
            operation,
            completed,
            failed_step,
            source_key,
            dest_key,
            source: cause,
        } => {
            assert_eq!(*operation, "move");
            assert_eq!(completed, &vec!["copy", "update_destination_usage"]);
            assert_eq!(*failed_step, "delete_source");
            assert_eq!(source_key, &source.key);
            assert!(dest_key.starts_with("org/b.com/bob/"));
            assert!(cause.is_retryable());
            assert!(h.blobs.exists(dest_key).unwrap());
        }
        other => panic!("expected PartialFailure, got {other:?}"),
    }

    // Source untouched and still charged; destination charged once.
    assert!(h.blobs.exists(&source.key).unwrap());
    assert_eq!(used(&h, QuotaLevel::Mailbox, "inbox-a"), 300);
    assert_eq!(used(&h, QuotaLevel::Mailbox, "inbox-b"), 300);
    assert!(no_stale_journal_entries(&h));
}

#[test]
fn test_presigned_urls_pass_through() {
    let h = harness();
    let url = h
        .storage
        .presigned_upload_url("org/a.com/alice/messages/2024/05/m9", "message/rfc822", Duration::from_secs(300))
        .unwrap();
    assert!(url.contains("op=upload"));
}

/// On-disk database and blob root, reopened between phases
#[test]
fn test_file_backed_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        database_path: dir.path().join("storage.db"),
        blob_root: dir.path().join("blobs"),
        ..Default::default()
    };

    let open = || {
        let db = Arc::new(Database::open(&config.database_path, config.busy_timeout()).unwrap());
        let blobs: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(&config.blob_root).unwrap());
        let ledger = Arc::new(SqliteQuotaLedger::new(Arc::clone(&db), config.clone()));
        let dedup = Arc::new(SqliteDedupRegistry::new(
            Arc::clone(&db),
            Arc::clone(&blobs),
            config.orphan_grace_period(),
        ));
        let journal = Arc::new(OperationJournal::new(Arc::clone(&db)));
        let storage = DomainStorage::new(blobs, ledger.clone(), dedup, config.clone())
            .with_journal(Arc::clone(&journal));
        (storage, ledger, journal)
    };

    let attachment_id = {
        let (storage, ledger, _) = open();
        ledger
            .create_quota(CreateQuotaRequest::new(QuotaLevel::Mailbox, "inbox-a").with_total_bytes(10_000))
            .unwrap();
        storage.store_message(message("a.com", "alice", "inbox-a", "m1", 1_200)).unwrap();
        storage
            .store_attachment(invoice("m1", b"compressible compressible compressible"))
            .unwrap()
            .attachment_id
    };

    let (storage, ledger, journal) = open();
    assert_eq!(ledger.get_quota(QuotaLevel::Mailbox, "inbox-a").unwrap().used_bytes, 1_200);

    let (data, _) = storage.get_message("org", "a.com", "alice", "m1").unwrap();
    assert_eq!(data, vec![b'x'; 1_200]);
    let (data, meta) = storage.get_attachment("org", "a.com", "alice", &attachment_id).unwrap();
    assert_eq!(data, b"compressible compressible compressible");
    assert_eq!(meta.filename, "invoice.pdf");

    let (bytes, count) = storage.get_user_size("org", "a.com", "alice").unwrap();
    assert_eq!(count, 2);
    assert_eq!(bytes, 1_200 + 38);
    assert!(journal.stale(Utc::now() + chrono::Duration::seconds(1)).unwrap().is_empty());
}

/// A writer and a separate maintenance process over one database file
#[test]
fn test_maintenance_process_keeps_writer_holds() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        database_path: dir.path().join("storage.db"),
        shared_reservations: true,
        ..Default::default()
    };
    let open = || {
        let db = Arc::new(Database::open(&config.database_path, config.busy_timeout()).unwrap());
        SqliteQuotaLedger::new(db, config.clone())
    };
    let writer = open();
    let maintenance = open();
    assert!(maintenance.reservations_shared());
    writer
        .create_quota(CreateQuotaRequest::new(QuotaLevel::Mailbox, "m1").with_total_bytes(1_000))
        .unwrap();

    let first = writer.reserve_quota("m1", 600).unwrap();
    assert_eq!(maintenance.recompute_reserved_bytes().unwrap(), 0);
    assert!(writer.reserve_quota("m1", 600).unwrap_err().is_quota_exceeded());

    writer.commit_reservation(&first).unwrap();
    let quota = maintenance.get_quota(QuotaLevel::Mailbox, "m1").unwrap();
    assert!(quota.used_bytes <= quota.total_bytes);
    assert_eq!(quota.used_bytes, 600);
    assert_eq!(quota.reserved_bytes, 0);

    // Without a shared store a second process cannot see the writer's holds.
    let local = SqliteQuotaLedger::new(
        Arc::new(Database::open(&config.database_path, config.busy_timeout()).unwrap()),
        StorageConfig {
            shared_reservations: false,
            ..config.clone()
        },
    );
    assert!(!local.reservations_shared());
}
