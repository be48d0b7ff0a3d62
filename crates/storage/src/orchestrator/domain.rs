use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use super::DomainStorageService;
use crate::blob::{BlobStore, LIST_PAGE_SIZE, etag};
use crate::config::StorageConfig;
use crate::dedup::DeduplicationService;
use crate::error::{Result, StorageError};
use crate::journal::{JournalOp, OperationJournal};
use crate::models::{
    AttachmentMetadata, AttachmentReference, CopyRequest, DeduplicatedAttachment,
    METADATA_SCHEMA_VERSION, MessageMetadata, Metadata, MoveRequest, ObjectMetadata, StorageKey,
    StorageObject, StoreAttachmentRequest, StoreMessageRequest, compute_content_hash,
    key_object_id,
};
use crate::quota::QuotaService;

/// Storage orchestrator over one blob store, ledger and registry
pub struct DomainStorage {
    blobs: Arc<dyn BlobStore>,
    quota: Arc<dyn QuotaService>,
    dedup: Arc<dyn DeduplicationService>,
    journal: Option<Arc<OperationJournal>>,
    config: StorageConfig,
}

/// Result of the copy half of a copy or move
struct Copied {
    source: StorageObject,
    source_mailbox: Option<String>,
    dest_key: String,
    /// Destination usage update; the copy itself succeeded
    accounting: Result<()>,
}

impl DomainStorage {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        quota: Arc<dyn QuotaService>,
        dedup: Arc<dyn DeduplicationService>,
        config: StorageConfig,
    ) -> Self {
        Self {
            blobs,
            quota,
            dedup,
            journal: None,
            config,
        }
    }

    /// Record blob mutations so unaccounted writes can be reconciled
    pub fn with_journal(mut self, journal: Arc<OperationJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Scan a prefix for the object whose final key segment is `object_id`
    fn find_object(&self, prefix: &str, object_id: &str) -> Result<Option<StorageObject>> {
        let mut marker: Option<String> = None;
        loop {
            let page = self.blobs.list(prefix, LIST_PAGE_SIZE, marker.as_deref())?;
            if let Some(found) = page
                .objects
                .into_iter()
                .find(|o| key_object_id(&o.key) == object_id)
            {
                return Ok(Some(found));
            }
            match page.next_marker {
                Some(next) if page.is_truncated => marker = Some(next),
                _ => return Ok(None),
            }
        }
    }

    fn journal_begin(
        &self,
        operation: JournalOp,
        key: &str,
        mailbox_id: Option<&str>,
        delta: i64,
    ) -> Result<Option<String>> {
        match &self.journal {
            Some(journal) => journal.begin(operation, key, mailbox_id, delta).map(Some),
            None => Ok(None),
        }
    }

    fn journal_applied(&self, entry: Option<&str>) {
        if let (Some(journal), Some(id)) = (&self.journal, entry)
            && let Err(e) = journal.mark_blob_applied(id)
        {
            warn!("Failed to advance journal entry {}: {}", id, e);
        }
    }

    fn journal_complete(&self, entry: Option<&str>) {
        if let (Some(journal), Some(id)) = (&self.journal, entry)
            && let Err(e) = journal.complete(id)
        {
            warn!("Failed to close journal entry {}: {}", id, e);
        }
    }

    /// Apply the usage delta of a blob change that already happened.
    ///
    /// On failure the journal entry stays `blob_applied` for reconciliation.
    fn account(&self, entry: Option<&str>, mailbox_id: &str, delta: i64) -> Result<()> {
        self.journal_applied(entry);
        self.quota.update_usage(mailbox_id, delta)?;
        self.journal_complete(entry);
        Ok(())
    }

    fn attachment_object_metadata(
        req: &StoreAttachmentRequest,
        attachment_id: &str,
        content_hash: &str,
    ) -> Result<Metadata> {
        let mut meta = ObjectMetadata::new(&req.org_id, &req.domain_id, &req.user_id);
        meta.mailbox_id = req.mailbox_id.clone();
        meta.message_id = Some(req.message_id.clone());
        meta.attachment_id = Some(attachment_id.to_string());
        meta.filename = Some(req.filename.clone());
        meta.content_hash = Some(content_hash.to_string());
        meta.to_map()
    }

    fn store_direct(&self, req: StoreAttachmentRequest, content_hash: String) -> Result<AttachmentMetadata> {
        let now = Utc::now();
        let attachment_id = uuid::Uuid::new_v4().to_string();
        let key = StorageKey::attachment(&req.org_id, &req.domain_id, &req.user_id, &attachment_id, now)?
            .to_string();
        let metadata = Self::attachment_object_metadata(&req, &attachment_id, &content_hash)?;

        self.blobs.put(&key, &req.content, &req.content_type, &metadata)?;
        info!("Stored attachment: key={} size={}", key, req.content.len());

        Ok(placed(&req, attachment_id, content_hash, key, 1, now))
    }

    fn store_deduplicated(
        &self,
        req: StoreAttachmentRequest,
        content_hash: String,
    ) -> Result<AttachmentMetadata> {
        let reference = new_reference(&req);

        let lookup = self.dedup.check_duplicate(&req.org_id, &content_hash)?;
        if let Some(existing) = lookup.existing {
            match self.dedup.add_reference(&existing.id, &reference) {
                Ok(ref_count) => {
                    info!(
                        "Deduplicated attachment: org={} hash={} ref_count={} saved={}",
                        req.org_id, content_hash, ref_count, lookup.space_saved
                    );
                    return Ok(placed(
                        &req,
                        reference.id,
                        content_hash,
                        existing.storage_key,
                        ref_count,
                        reference.created_at,
                    ));
                }
                Err(e) if e.is_not_found() => {
                    debug!("Shared content vanished before reference, storing fresh: hash={}", content_hash);
                }
                Err(e) => return Err(e),
            }
        }

        let mut attachment = DeduplicatedAttachment::new(
            req.org_id.clone(),
            content_hash.clone(),
            String::new(),
            req.content.len() as i64,
            req.content_type.clone(),
        );
        attachment.storage_key = StorageKey::attachment(
            &req.org_id,
            &req.domain_id,
            &req.user_id,
            &attachment.id,
            reference.created_at,
        )?
        .to_string();
        let metadata = Self::attachment_object_metadata(&req, &attachment.id, &content_hash)?;
        self.blobs
            .put(&attachment.storage_key, &req.content, &req.content_type, &metadata)?;

        match self.dedup.register_attachment(&attachment, &reference) {
            Ok(()) => {
                info!(
                    "Stored attachment: key={} size={} hash={}",
                    attachment.storage_key, attachment.size, content_hash
                );
                Ok(placed(
                    &req,
                    reference.id,
                    content_hash,
                    attachment.storage_key,
                    1,
                    reference.created_at,
                ))
            }
            Err(StorageError::AlreadyExists { .. }) => {
                // A concurrent upload of the same content registered first.
                self.discard_blob(&attachment.storage_key);
                let winner = self
                    .dedup
                    .check_duplicate(&req.org_id, &content_hash)?
                    .existing
                    .ok_or_else(|| StorageError::not_found("deduplicated attachment", content_hash.clone()))?;
                let ref_count = self.dedup.add_reference(&winner.id, &reference)?;
                Ok(placed(
                    &req,
                    reference.id,
                    content_hash,
                    winner.storage_key,
                    ref_count,
                    reference.created_at,
                ))
            }
            Err(e) => {
                self.discard_blob(&attachment.storage_key);
                Err(e)
            }
        }
    }

    fn discard_blob(&self, key: &str) {
        if let Err(e) = self.blobs.delete(key) {
            warn!("Failed to remove unregistered blob {}: {}", key, e);
        }
    }

    /// Whether a directly listed attachment object is the shared copy of a
    /// deduplicated row
    fn is_shared_content(&self, org_id: &str, object: &StorageObject) -> Result<bool> {
        let Some(content_hash) = ObjectMetadata::from_map(&object.metadata).content_hash else {
            return Ok(false);
        };
        let lookup = self.dedup.check_duplicate(org_id, &content_hash)?;
        Ok(lookup.existing.is_some_and(|e| e.storage_key == object.key))
    }

    fn copy_object(&self, req: &CopyRequest) -> Result<Copied> {
        let source_key = StorageKey::parse(&req.source_key)
            .ok_or_else(|| StorageError::invalid(format!("not a storage key: {}", req.source_key)))?;
        let dest_key = source_key
            .relocated(&req.dest_org_id, &req.dest_domain_id, &req.dest_user_id)?
            .to_string();
        if dest_key == req.source_key {
            return Err(StorageError::invalid(format!(
                "source and destination are the same: {dest_key}"
            )));
        }

        let source = self
            .blobs
            .get_metadata(&req.source_key)?
            .ok_or_else(|| StorageError::not_found("object", req.source_key.clone()))?;

        let check = self.quota.check_quota(&req.dest_mailbox_id, source.size)?;
        if !check.allowed {
            warn!(
                "Copy rejected: {} -> {} size={} ({} {} has {} bytes available)",
                req.source_key, dest_key, source.size, check.level, check.entity_id, check.available_bytes
            );
            return Err(check.into_error());
        }

        let mut meta = ObjectMetadata::from_map(&source.metadata);
        let source_mailbox = meta.mailbox_id.clone();
        meta.schema_version = METADATA_SCHEMA_VERSION;
        meta.org_id = Some(req.dest_org_id.clone());
        meta.domain_id = Some(req.dest_domain_id.clone());
        meta.user_id = Some(req.dest_user_id.clone());
        meta.mailbox_id = Some(req.dest_mailbox_id.clone());
        if let Some(message) = meta.message.as_mut() {
            message.mailbox_id = req.dest_mailbox_id.clone();
        }
        let metadata = meta.to_map()?;

        let entry = self.journal_begin(
            JournalOp::CopyIn,
            &dest_key,
            Some(&req.dest_mailbox_id),
            source.size,
        )?;
        if let Err(e) = self.blobs.copy(&req.source_key, &dest_key, Some(&metadata)) {
            self.journal_complete(entry.as_deref());
            return Err(e.into());
        }
        let accounting = self.account(entry.as_deref(), &req.dest_mailbox_id, source.size);

        Ok(Copied {
            source,
            source_mailbox,
            dest_key,
            accounting,
        })
    }
}

impl DomainStorageService for DomainStorage {
    fn store_message(&self, req: StoreMessageRequest) -> Result<StorageObject> {
        let size = req.content.len() as i64;
        let check = self.quota.check_quota(&req.mailbox_id, size)?;
        if !check.allowed {
            warn!(
                "Message rejected: mailbox={} size={} ({} {} has {} bytes available)",
                req.mailbox_id, size, check.level, check.entity_id, check.available_bytes
            );
            return Err(check.into_error());
        }

        let now = Utc::now();
        let at = req.metadata.as_ref().and_then(|m| m.date).unwrap_or(now);
        let key = StorageKey::message(&req.org_id, &req.domain_id, &req.user_id, &req.message_id, at)?
            .to_string();

        let mut message = req.metadata.unwrap_or_default();
        message.message_id = req.message_id.clone();
        message.mailbox_id = req.mailbox_id.clone();
        if message.folder_id.is_none() {
            message.folder_id = req.folder_id.clone();
        }
        message.size = size;
        message.created_at.get_or_insert(now);
        message.updated_at = Some(now);

        let mut meta = ObjectMetadata::new(&req.org_id, &req.domain_id, &req.user_id);
        meta.mailbox_id = Some(req.mailbox_id.clone());
        meta.folder_id = message.folder_id.clone();
        meta.message_id = Some(req.message_id.clone());
        meta.message = Some(message);
        let metadata = meta.to_map()?;

        let entry = self.journal_begin(JournalOp::StoreMessage, &key, Some(&req.mailbox_id), size)?;
        if let Err(e) = self.blobs.put(&key, &req.content, &req.content_type, &metadata) {
            self.journal_complete(entry.as_deref());
            return Err(e.into());
        }
        if let Err(e) = self.account(entry.as_deref(), &req.mailbox_id, size) {
            error!(
                "Stored message without accounting: key={} mailbox={} size={}: {}",
                key, req.mailbox_id, size, e
            );
        }
        info!("Stored message: key={} mailbox={} size={}", key, req.mailbox_id, size);

        Ok(StorageObject {
            etag: etag(&req.content),
            key,
            size,
            content_type: req.content_type,
            last_modified: now,
            metadata,
        })
    }

    fn get_message(
        &self,
        org_id: &str,
        domain_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<(Vec<u8>, Option<MessageMetadata>)> {
        let prefix = StorageKey::messages_prefix(org_id, domain_id, user_id);
        let object = self
            .find_object(&prefix, message_id)?
            .ok_or_else(|| StorageError::not_found("message", message_id))?;
        let (data, object) = self
            .blobs
            .get(&object.key)?
            .ok_or_else(|| StorageError::not_found("message", message_id))?;
        Ok((data, ObjectMetadata::from_map(&object.metadata).message))
    }

    fn delete_message(
        &self,
        org_id: &str,
        domain_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<()> {
        let prefix = StorageKey::messages_prefix(org_id, domain_id, user_id);
        let object = self
            .find_object(&prefix, message_id)?
            .ok_or_else(|| StorageError::not_found("message", message_id))?;
        let mailbox_id = ObjectMetadata::from_map(&object.metadata).mailbox_id;

        let entry = self.journal_begin(
            JournalOp::DeleteMessage,
            &object.key,
            mailbox_id.as_deref(),
            -object.size,
        )?;
        if let Err(e) = self.blobs.delete(&object.key) {
            self.journal_complete(entry.as_deref());
            return Err(e.into());
        }

        match mailbox_id.as_deref() {
            Some(mailbox_id) => {
                if let Err(e) = self.account(entry.as_deref(), mailbox_id, -object.size) {
                    error!(
                        "Deleted message without accounting: key={} mailbox={} size={}: {}",
                        object.key, mailbox_id, object.size, e
                    );
                }
            }
            None => {
                warn!("Deleted message with no mailbox recorded: key={}", object.key);
                self.journal_complete(entry.as_deref());
            }
        }
        info!("Deleted message: key={} size={}", object.key, object.size);
        Ok(())
    }

    fn store_attachment(&self, req: StoreAttachmentRequest) -> Result<AttachmentMetadata> {
        let computed = compute_content_hash(&req.content);
        if let Some(supplied) = &req.content_hash
            && !supplied.eq_ignore_ascii_case(&computed)
        {
            return Err(StorageError::invalid(format!(
                "content hash mismatch for {}: supplied {supplied}, computed {computed}",
                req.filename
            )));
        }

        if self.config.deduplication_enabled && req.content_hash.is_some() {
            self.store_deduplicated(req, computed)
        } else {
            self.store_direct(req, computed)
        }
    }

    fn get_attachment(
        &self,
        org_id: &str,
        domain_id: &str,
        user_id: &str,
        attachment_id: &str,
    ) -> Result<(Vec<u8>, AttachmentMetadata)> {
        match self.dedup.get_by_reference(attachment_id) {
            Ok((shared, reference)) => {
                if reference.org_id != org_id {
                    return Err(StorageError::not_found("attachment", attachment_id));
                }
                let (data, _) = self
                    .blobs
                    .get(&shared.storage_key)?
                    .ok_or_else(|| StorageError::not_found("attachment blob", shared.storage_key.clone()))?;
                let metadata = AttachmentMetadata {
                    attachment_id: reference.id,
                    message_id: reference.message_id,
                    org_id: reference.org_id,
                    domain_id: reference.domain_id,
                    user_id: reference.user_id,
                    filename: reference.filename,
                    content_type: reference.content_type,
                    size: reference.size,
                    content_hash: Some(shared.content_hash),
                    storage_key: shared.storage_key,
                    ref_count: shared.ref_count,
                    created_at: reference.created_at,
                };
                return Ok((data, metadata));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let prefix = StorageKey::attachments_prefix(org_id, domain_id, user_id);
        let object = self
            .find_object(&prefix, attachment_id)?
            .ok_or_else(|| StorageError::not_found("attachment", attachment_id))?;
        let (data, object) = self
            .blobs
            .get(&object.key)?
            .ok_or_else(|| StorageError::not_found("attachment", attachment_id))?;
        let meta = ObjectMetadata::from_map(&object.metadata);

        let metadata = AttachmentMetadata {
            attachment_id: attachment_id.to_string(),
            message_id: meta.message_id.unwrap_or_default(),
            org_id: org_id.to_string(),
            domain_id: domain_id.to_string(),
            user_id: user_id.to_string(),
            filename: meta.filename.unwrap_or_default(),
            content_type: object.content_type,
            size: object.size,
            content_hash: meta.content_hash,
            storage_key: object.key,
            ref_count: 1,
            created_at: object.last_modified,
        };
        Ok((data, metadata))
    }

    fn delete_attachment(
        &self,
        org_id: &str,
        domain_id: &str,
        user_id: &str,
        attachment_id: &str,
    ) -> Result<()> {
        match self.dedup.get_by_reference(attachment_id) {
            Ok((_, reference)) => {
                if reference.org_id != org_id {
                    return Err(StorageError::not_found("attachment", attachment_id));
                }
                let ref_count = self.dedup.remove_reference(attachment_id)?;
                info!("Removed attachment reference: id={} ref_count={}", attachment_id, ref_count);
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let prefix = StorageKey::attachments_prefix(org_id, domain_id, user_id);
        let object = self
            .find_object(&prefix, attachment_id)?
            .ok_or_else(|| StorageError::not_found("attachment", attachment_id))?;
        if self.is_shared_content(org_id, &object)? {
            return Err(StorageError::invalid(format!(
                "{attachment_id} is shared content; delete its references instead"
            )));
        }
        self.blobs.delete(&object.key)?;
        info!("Deleted attachment: key={} size={}", object.key, object.size);
        Ok(())
    }

    fn get_domain_size(&self, org_id: &str, domain_id: &str) -> Result<(i64, i64)> {
        Ok(self.blobs.prefix_size(&StorageKey::domain_prefix(org_id, domain_id))?)
    }

    fn get_user_size(&self, org_id: &str, domain_id: &str, user_id: &str) -> Result<(i64, i64)> {
        Ok(self
            .blobs
            .prefix_size(&StorageKey::user_prefix(org_id, domain_id, user_id))?)
    }

    fn copy_between_domains(&self, req: &CopyRequest) -> Result<String> {
        let copied = self.copy_object(req)?;
        if let Err(e) = copied.accounting {
            error!(
                "Copied without accounting: {} -> {} mailbox={} size={}: {}",
                req.source_key, copied.dest_key, req.dest_mailbox_id, copied.source.size, e
            );
        }
        info!(
            "Copied object: {} -> {} size={}",
            req.source_key, copied.dest_key, copied.source.size
        );
        Ok(copied.dest_key)
    }

    fn move_between_domains(&self, req: &MoveRequest) -> Result<String> {
        let Copied {
            source,
            source_mailbox,
            dest_key,
            accounting,
        } = self.copy_object(&req.copy)?;
        let source_key = &req.copy.source_key;

        let partial = |completed: Vec<&'static str>, failed_step: &'static str, cause: StorageError| {
            error!(
                "Move stopped at {}: {} -> {}: {}",
                failed_step, source_key, dest_key, cause
            );
            StorageError::PartialFailure {
                operation: "move",
                completed,
                failed_step,
                source_key: source_key.clone(),
                dest_key: dest_key.clone(),
                source: Box::new(cause),
            }
        };

        if let Err(e) = accounting {
            return Err(partial(vec!["copy"], "update_destination_usage", e));
        }
        if !req.delete_source {
            info!("Moved object (source kept): {} -> {}", source_key, dest_key);
            return Ok(dest_key);
        }

        let done = vec!["copy", "update_destination_usage"];
        let entry = match self.journal_begin(
            JournalOp::DeleteSource,
            source_key,
            source_mailbox.as_deref(),
            -source.size,
        ) {
            Ok(entry) => entry,
            Err(e) => return Err(partial(done, "delete_source", e)),
        };
        if let Err(e) = self.blobs.delete(source_key) {
            self.journal_complete(entry.as_deref());
            return Err(partial(done, "delete_source", e.into()));
        }

        match source_mailbox.as_deref() {
            Some(mailbox_id) => {
                if let Err(e) = self.account(entry.as_deref(), mailbox_id, -source.size) {
                    let done = vec!["copy", "update_destination_usage", "delete_source"];
                    return Err(partial(done, "update_source_usage", e));
                }
            }
            None => {
                warn!("Moved object with no source mailbox recorded: key={}", source_key);
                self.journal_complete(entry.as_deref());
            }
        }

        info!("Moved object: {} -> {} size={}", source_key, dest_key, source.size);
        Ok(dest_key)
    }

    fn presigned_upload_url(&self, key: &str, content_type: &str, ttl: Duration) -> Result<String> {
        Ok(self.blobs.presigned_upload_url(key, content_type, ttl)?)
    }

    fn presigned_download_url(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(self.blobs.presigned_download_url(key, ttl)?)
    }
}

fn new_reference(req: &StoreAttachmentRequest) -> AttachmentReference {
    AttachmentReference {
        id: uuid::Uuid::new_v4().to_string(),
        dedup_id: String::new(),
        org_id: req.org_id.clone(),
        domain_id: req.domain_id.clone(),
        user_id: req.user_id.clone(),
        mailbox_id: req.mailbox_id.clone(),
        message_id: req.message_id.clone(),
        filename: req.filename.clone(),
        content_type: req.content_type.clone(),
        size: req.content.len() as i64,
        content_id: req.content_id.clone(),
        is_inline: req.is_inline,
        created_at: Utc::now(),
    }
}

fn placed(
    req: &StoreAttachmentRequest,
    attachment_id: String,
    content_hash: String,
    storage_key: String,
    ref_count: i64,
    created_at: DateTime<Utc>,
) -> AttachmentMetadata {
    AttachmentMetadata {
        attachment_id,
        message_id: req.message_id.clone(),
        org_id: req.org_id.clone(),
        domain_id: req.domain_id.clone(),
        user_id: req.user_id.clone(),
        filename: req.filename.clone(),
        content_type: req.content_type.clone(),
        size: req.content.len() as i64,
        content_hash: Some(content_hash),
        storage_key,
        ref_count,
        created_at,
    }
}
