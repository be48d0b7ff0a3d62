//! Blob storage trait for message and attachment bytes
//!
//! Keys are opaque UTF-8 strings; the orchestrator is the only component
//! that gives them structure.

mod file;
mod memory;

pub use file::FileBlobStore;
pub use memory::InMemoryBlobStore;

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{Metadata, StorageObject};

/// Page size used by [`BlobStore::list_all`]
pub const LIST_PAGE_SIZE: usize = 1000;

/// One page of a prefix listing, ordered by key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<StorageObject>,
    pub is_truncated: bool,
    /// Pass as `start_after` to fetch the next page
    pub next_marker: Option<String>,
}

/// A part acknowledged by [`BlobStore::upload_part`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Trait for blob storage operations
///
/// Implementations handle compression/decompression internally.
pub trait BlobStore: Send + Sync {
    /// Store an object, replacing any previous object under the key
    fn put(&self, key: &str, data: &[u8], content_type: &str, metadata: &Metadata) -> Result<()>;

    /// Retrieve an object and its description
    ///
    /// Returns None if the object doesn't exist.
    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, StorageObject)>>;

    /// Describe an object without reading its bytes
    fn get_metadata(&self, key: &str) -> Result<Option<StorageObject>>;

    /// Check if an object exists
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get_metadata(key)?.is_some())
    }

    /// Delete an object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Server-side copy. `metadata` replaces the source metadata when given.
    fn copy(&self, source_key: &str, dest_key: &str, metadata: Option<&Metadata>) -> Result<()>;

    /// List objects whose key starts with `prefix`, after `start_after`
    fn list(&self, prefix: &str, max_keys: usize, start_after: Option<&str>) -> Result<ListPage>;

    /// Follow `next_marker` until the listing is exhausted
    fn list_all(&self, prefix: &str) -> Result<Vec<StorageObject>> {
        let mut objects = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self.list(prefix, LIST_PAGE_SIZE, marker.as_deref())?;
            objects.extend(page.objects);
            match page.next_marker {
                Some(next) if page.is_truncated => marker = Some(next),
                _ => break,
            }
        }
        Ok(objects)
    }

    /// Total bytes and object count under a prefix
    fn prefix_size(&self, prefix: &str) -> Result<(i64, i64)> {
        let objects = self.list_all(prefix)?;
        let bytes = objects.iter().map(|o| o.size).sum();
        Ok((bytes, objects.len() as i64))
    }

    fn presigned_upload_url(&self, key: &str, content_type: &str, ttl: Duration) -> Result<String>;

    fn presigned_download_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Start a multipart upload and return its upload id
    fn initiate_multipart(&self, key: &str, content_type: &str, metadata: &Metadata) -> Result<String>;

    /// Upload one part (1-based numbering) and return its etag
    fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, data: &[u8]) -> Result<String>;

    /// Assemble the listed parts, in order, into the final object
    fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> Result<()>;

    fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// Content fingerprint reported as an object's etag
pub(crate) fn etag(data: &[u8]) -> String {
    hex::encode(&Sha256::digest(data)[..16])
}

/// Reject keys that could escape a store's namespace
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        anyhow::bail!("invalid blob key: {key:?}");
    }
    if key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        anyhow::bail!("invalid blob key: {key:?}");
    }
    Ok(())
}

/// Join parts for completion, checking numbering and etags
pub(crate) fn assemble_parts(
    uploaded: &std::collections::BTreeMap<u32, Vec<u8>>,
    parts: &[CompletedPart],
) -> Result<Vec<u8>> {
    if parts.is_empty() {
        anyhow::bail!("multipart upload completed with no parts");
    }
    let mut data = Vec::new();
    let mut previous = 0;
    for part in parts {
        if part.part_number <= previous {
            anyhow::bail!("parts must be listed in ascending order");
        }
        previous = part.part_number;
        let bytes = uploaded
            .get(&part.part_number)
            .ok_or_else(|| anyhow::anyhow!("part {} was never uploaded", part.part_number))?;
        if etag(bytes) != part.etag {
            anyhow::bail!("etag mismatch for part {}", part.part_number);
        }
        data.extend_from_slice(bytes);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("org/dom/user/messages/2024/01/m1").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/b/").is_err());
    }

    #[test]
    fn test_assemble_parts() {
        let mut uploaded = std::collections::BTreeMap::new();
        uploaded.insert(1, b"hello ".to_vec());
        uploaded.insert(2, b"world".to_vec());
        let parts = vec![
            CompletedPart { part_number: 1, etag: etag(b"hello ") },
            CompletedPart { part_number: 2, etag: etag(b"world") },
        ];
        assert_eq!(assemble_parts(&uploaded, &parts).unwrap(), b"hello world");

        let reversed: Vec<_> = parts.iter().rev().cloned().collect();
        assert!(assemble_parts(&uploaded, &reversed).is_err());

        let bad_etag = vec![CompletedPart { part_number: 1, etag: "nope".into() }];
        assert!(assemble_parts(&uploaded, &bad_etag).is_err());
    }
}
