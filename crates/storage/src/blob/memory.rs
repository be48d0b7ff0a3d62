//! In-memory blob storage for tests and single-process tooling

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;

use super::{BlobStore, CompletedPart, ListPage, assemble_parts, etag, validate_key};
use crate::models::{Metadata, StorageObject};

struct StoredBlob {
    data: Vec<u8>,
    object: StorageObject,
}

struct PendingUpload {
    key: String,
    content_type: String,
    metadata: Metadata,
    parts: BTreeMap<u32, Vec<u8>>,
}

/// Blob store backed by an ordered map
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: RwLock<BTreeMap<String, StoredBlob>>,
    uploads: RwLock<HashMap<String, PendingUpload>>,
    puts: AtomicUsize,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls (multipart completion included)
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(&self, key: &str, data: &[u8], content_type: &str, metadata: &Metadata) -> Result<()> {
        validate_key(key)?;
        let object = StorageObject {
            key: key.to_string(),
            size: data.len() as i64,
            content_type: content_type.to_string(),
            etag: etag(data),
            last_modified: Utc::now(),
            metadata: metadata.clone(),
        };
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), StoredBlob { data: data.to_vec(), object });
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, StorageObject)>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .get(key)
            .map(|blob| (blob.data.clone(), blob.object.clone())))
    }

    fn get_metadata(&self, key: &str) -> Result<Option<StorageObject>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.get(key).map(|blob| blob.object.clone()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn copy(&self, source_key: &str, dest_key: &str, metadata: Option<&Metadata>) -> Result<()> {
        validate_key(dest_key)?;
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let source = objects
            .get(source_key)
            .ok_or_else(|| anyhow!("copy source not found: {source_key}"))?;

        let mut object = source.object.clone();
        object.key = dest_key.to_string();
        object.last_modified = Utc::now();
        if let Some(metadata) = metadata {
            object.metadata = metadata.clone();
        }
        let data = source.data.clone();
        objects.insert(dest_key.to_string(), StoredBlob { data, object });
        Ok(())
    }

    fn list(&self, prefix: &str, max_keys: usize, start_after: Option<&str>) -> Result<ListPage> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let lower = match start_after {
            Some(marker) if marker >= prefix => Bound::Excluded(marker.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };

        let mut matching = objects
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, blob)| blob.object.clone());

        let page: Vec<StorageObject> = matching.by_ref().take(max_keys.max(1)).collect();
        let is_truncated = matching.next().is_some();
        let next_marker = if is_truncated {
            page.last().map(|o| o.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            objects: page,
            is_truncated,
            next_marker,
        })
    }

    fn presigned_upload_url(&self, key: &str, _content_type: &str, ttl: Duration) -> Result<String> {
        validate_key(key)?;
        Ok(format!("memory://{key}?op=upload&expires={}", expires_at(ttl)))
    }

    fn presigned_download_url(&self, key: &str, ttl: Duration) -> Result<String> {
        validate_key(key)?;
        Ok(format!("memory://{key}?op=download&expires={}", expires_at(ttl)))
    }

    fn initiate_multipart(&self, key: &str, content_type: &str, metadata: &Metadata) -> Result<String> {
        validate_key(key)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.uploads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                upload_id.clone(),
                PendingUpload {
                    key: key.to_string(),
                    content_type: content_type.to_string(),
                    metadata: metadata.clone(),
                    parts: BTreeMap::new(),
                },
            );
        Ok(upload_id)
    }

    fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, data: &[u8]) -> Result<String> {
        if part_number == 0 {
            anyhow::bail!("part numbers start at 1");
        }
        let mut uploads = self.uploads.write().unwrap_or_else(PoisonError::into_inner);
        let upload = uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| anyhow!("unknown upload {upload_id} for {key}"))?;
        upload.parts.insert(part_number, data.to_vec());
        Ok(etag(data))
    }

    fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> Result<()> {
        let upload = {
            let mut uploads = self.uploads.write().unwrap_or_else(PoisonError::into_inner);
            match uploads.get(upload_id) {
                Some(u) if u.key == key => uploads.remove(upload_id),
                _ => None,
            }
        }
        .ok_or_else(|| anyhow!("unknown upload {upload_id} for {key}"))?;

        let data = assemble_parts(&upload.parts, parts)?;
        self.put(&upload.key, &data, &upload.content_type, &upload.metadata)
    }

    fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(upload_id);
        Ok(())
    }
}

fn expires_at(ttl: Duration) -> i64 {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .map(|t| t.timestamp())
        .unwrap_or(i64::MAX)
}
