//! File-based blob storage with zstd compression

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use walkdir::WalkDir;

use super::{BlobStore, CompletedPart, ListPage, assemble_parts, etag, validate_key};
use crate::models::{Metadata, StorageObject};

const DATA_SUFFIX: &str = ".zst";
const SIDECAR_SUFFIX: &str = ".meta.json";
const MANIFEST_FILE: &str = "manifest.json";

/// Per-object description written next to the compressed bytes
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    size: i64,
    etag: String,
    last_modified: DateTime<Utc>,
    #[serde(default)]
    metadata: Metadata,
}

/// Multipart upload bookkeeping
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    key: String,
    content_type: String,
    metadata: Metadata,
}

/// File-based blob storage with zstd compression
///
/// Keys map onto the directory tree, so tenant prefixes shard naturally:
/// ```text
/// root/
///   objects/
///     org1/example.com/alice/messages/2024/03/
///       m-42.zst          # compressed bytes
///       m-42.meta.json    # content type, size, etag, metadata
///   uploads/
///     <upload id>/
///       manifest.json
///       part-00001
/// ```
pub struct FileBlobStore {
    root: PathBuf,
    compression_level: i32,
}

impl FileBlobStore {
    /// Create a new file blob store at the given path
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root.join("objects")).context("Failed to create blob storage directory")?;
        fs::create_dir_all(root.join("uploads")).context("Failed to create upload staging directory")?;
        let root = fs::canonicalize(root)
            .with_context(|| format!("Failed to resolve blob root {}", root.display()))?;
        Ok(Self {
            root,
            compression_level: 3, // Good balance of speed vs compression
        })
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.objects_dir().join(format!("{key}{DATA_SUFFIX}"))
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.objects_dir().join(format!("{key}{SIDECAR_SUFFIX}"))
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf> {
        let id = uuid::Uuid::parse_str(upload_id)
            .with_context(|| format!("Malformed upload id {upload_id:?}"))?;
        Ok(self.root.join("uploads").join(id.to_string()))
    }

    fn read_sidecar(&self, key: &str) -> Result<Option<Sidecar>> {
        let path = self.sidecar_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let sidecar = serde_json::from_slice(&raw)
            .with_context(|| format!("Corrupt metadata sidecar {}", path.display()))?;
        Ok(Some(sidecar))
    }

    fn object_for(&self, key: &str, sidecar: Sidecar) -> StorageObject {
        StorageObject {
            key: key.to_string(),
            size: sidecar.size,
            content_type: sidecar.content_type,
            etag: sidecar.etag,
            last_modified: sidecar.last_modified,
            metadata: sidecar.metadata,
        }
    }

    fn decompress(&self, path: &Path) -> Result<Vec<u8>> {
        let compressed = fs::read(path)?;
        let mut decoder = zstd::Decoder::new(compressed.as_slice())?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .context("Failed to decompress blob")?;
        Ok(decompressed)
    }

    /// Key for a data file, relative to the objects directory
    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(self.objects_dir()).ok()?;
        let segments: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        let joined = segments?.join("/");
        joined.strip_suffix(DATA_SUFFIX).map(str::to_string)
    }

    fn file_url(&self, key: &str, op: &str, ttl: Duration) -> Result<String> {
        validate_key(key)?;
        let mut url = Url::from_file_path(self.data_path(key))
            .map_err(|_| anyhow!("Blob path for {key} is not absolute"))?;
        let ttl = chrono::Duration::from_std(ttl).context("Presign expiry out of range")?;
        let expires = Utc::now()
            .checked_add_signed(ttl)
            .context("Presign expiry out of range")?;
        url.query_pairs_mut()
            .append_pair("op", op)
            .append_pair("expires", &expires.timestamp().to_string());
        Ok(url.into())
    }
}

/// Write via a uniquely named temp file, then rename over the target
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Blob path has no file name")?;
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    fs::write(&temp_path, bytes)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

impl BlobStore for FileBlobStore {
    fn put(&self, key: &str, data: &[u8], content_type: &str, metadata: &Metadata) -> Result<()> {
        validate_key(key)?;

        let compressed =
            zstd::encode_all(data, self.compression_level).context("Failed to compress blob")?;
        let sidecar = Sidecar {
            content_type: content_type.to_string(),
            size: data.len() as i64,
            etag: etag(data),
            last_modified: Utc::now(),
            metadata: metadata.clone(),
        };

        // Data first: a reader never sees a sidecar without bytes behind it.
        write_atomic(&self.data_path(key), &compressed)?;
        write_atomic(&self.sidecar_path(key), &serde_json::to_vec(&sidecar)?)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, StorageObject)>> {
        validate_key(key)?;
        let path = self.data_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let data = self.decompress(&path)?;
        let Some(sidecar) = self.read_sidecar(key)? else {
            return Ok(None);
        };
        Ok(Some((data, self.object_for(key, sidecar))))
    }

    fn get_metadata(&self, key: &str) -> Result<Option<StorageObject>> {
        validate_key(key)?;
        if !self.data_path(key).exists() {
            return Ok(None);
        }
        Ok(self.read_sidecar(key)?.map(|s| self.object_for(key, s)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        for path in [self.sidecar_path(key), self.data_path(key)] {
            if path.exists() {
                fs::remove_file(&path).with_context(|| format!("Failed to delete {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn copy(&self, source_key: &str, dest_key: &str, metadata: Option<&Metadata>) -> Result<()> {
        validate_key(source_key)?;
        validate_key(dest_key)?;
        let mut sidecar = self
            .read_sidecar(source_key)?
            .ok_or_else(|| anyhow!("copy source not found: {source_key}"))?;
        let compressed = fs::read(self.data_path(source_key))
            .with_context(|| format!("Failed to read copy source {source_key}"))?;

        sidecar.last_modified = Utc::now();
        if let Some(metadata) = metadata {
            sidecar.metadata = metadata.clone();
        }
        write_atomic(&self.data_path(dest_key), &compressed)?;
        write_atomic(&self.sidecar_path(dest_key), &serde_json::to_vec(&sidecar)?)?;
        Ok(())
    }

    fn list(&self, prefix: &str, max_keys: usize, start_after: Option<&str>) -> Result<ListPage> {
        // Only walk the deepest directory the prefix names in full.
        let base = match prefix.rfind('/') {
            Some(idx) => self.objects_dir().join(&prefix[..idx]),
            None => self.objects_dir(),
        };
        if !base.is_dir() {
            return Ok(ListPage::default());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&base) {
            let entry = entry.context("Failed to walk blob directory")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = self.key_for(entry.path()) else {
                continue;
            };
            if key.starts_with(prefix) && start_after.is_none_or(|marker| key.as_str() > marker) {
                keys.push(key);
            }
        }
        keys.sort();

        let max_keys = max_keys.max(1);
        let is_truncated = keys.len() > max_keys;
        keys.truncate(max_keys);

        let mut objects = Vec::with_capacity(keys.len());
        for key in &keys {
            // Skip objects deleted while we were walking.
            if let Some(sidecar) = self.read_sidecar(key)? {
                objects.push(self.object_for(key, sidecar));
            }
        }

        Ok(ListPage {
            objects,
            is_truncated,
            next_marker: if is_truncated { keys.last().cloned() } else { None },
        })
    }

    fn presigned_upload_url(&self, key: &str, _content_type: &str, ttl: Duration) -> Result<String> {
        self.file_url(key, "upload", ttl)
    }

    fn presigned_download_url(&self, key: &str, ttl: Duration) -> Result<String> {
        self.file_url(key, "download", ttl)
    }

    fn initiate_multipart(&self, key: &str, content_type: &str, metadata: &Metadata) -> Result<String> {
        validate_key(key)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir)?;
        let manifest = Manifest {
            key: key.to_string(),
            content_type: content_type.to_string(),
            metadata: metadata.clone(),
        };
        write_atomic(&dir.join(MANIFEST_FILE), &serde_json::to_vec(&manifest)?)?;
        Ok(upload_id)
    }

    fn upload_part(&self, key: &str, upload_id: &str, part_number: u32, data: &[u8]) -> Result<String> {
        if part_number == 0 {
            anyhow::bail!("part numbers start at 1");
        }
        let dir = self.upload_dir(upload_id)?;
        let manifest: Manifest = config::load_json_file(&dir.join(MANIFEST_FILE))
            .with_context(|| format!("Unknown upload {upload_id}"))?;
        if manifest.key != key {
            anyhow::bail!("upload {upload_id} belongs to {}", manifest.key);
        }
        write_atomic(&dir.join(format!("part-{part_number:05}")), data)?;
        Ok(etag(data))
    }

    fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> Result<()> {
        let dir = self.upload_dir(upload_id)?;
        let manifest: Manifest = config::load_json_file(&dir.join(MANIFEST_FILE))
            .with_context(|| format!("Unknown upload {upload_id}"))?;
        if manifest.key != key {
            anyhow::bail!("upload {upload_id} belongs to {}", manifest.key);
        }

        let mut uploaded = BTreeMap::new();
        for part in parts {
            let path = dir.join(format!("part-{:05}", part.part_number));
            if path.exists() {
                uploaded.insert(part.part_number, fs::read(&path)?);
            }
        }
        let data = assemble_parts(&uploaded, parts)?;

        self.put(key, &data, &manifest.content_type, &manifest.metadata)?;
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<()> {
        let dir = self.upload_dir(upload_id)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY: &str = "org1/example.com/alice/messages/2024/03/m-42";

    fn store() -> (tempfile::TempDir, FileBlobStore) {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get() {
        let (_dir, store) = store();
        let mut metadata = Metadata::new();
        metadata.insert("mailbox-id".into(), "inbox".into());

        store.put(KEY, b"Hello, world!", "message/rfc822", &metadata).unwrap();
        let (data, object) = store.get(KEY).unwrap().unwrap();

        assert_eq!(data, b"Hello, world!");
        assert_eq!(object.key, KEY);
        assert_eq!(object.size, 13);
        assert_eq!(object.content_type, "message/rfc822");
        assert_eq!(object.metadata.get("mailbox-id").unwrap(), "inbox");
    }

    #[test]
    fn test_get_nonexistent() {
        let (_dir, store) = store();
        assert!(store.get(KEY).unwrap().is_none());
        assert!(store.get_metadata(KEY).unwrap().is_none());
    }

    #[test]
    fn test_exists_and_delete() {
        let (_dir, store) = store();
        assert!(!store.exists(KEY).unwrap());

        store.put(KEY, b"data", "text/plain", &Metadata::new()).unwrap();
        assert!(store.exists(KEY).unwrap());

        store.delete(KEY).unwrap();
        assert!(!store.exists(KEY).unwrap());
        store.delete(KEY).unwrap();
    }

    #[test]
    fn test_compression() {
        let (_dir, store) = store();
        // Create a string that compresses well
        let data = "Hello, world! ".repeat(1000);

        store.put(KEY, data.as_bytes(), "text/plain", &Metadata::new()).unwrap();

        let compressed_size = fs::metadata(store.data_path(KEY)).unwrap().len();
        assert!(
            compressed_size < data.len() as u64,
            "Compressed size {} should be less than original {}",
            compressed_size,
            data.len()
        );

        let (retrieved, object) = store.get(KEY).unwrap().unwrap();
        assert_eq!(retrieved, data.as_bytes());
        assert_eq!(object.size, data.len() as i64);
    }

    #[test]
    fn test_list_with_partial_segment_prefix() {
        let (_dir, store) = store();
        for id in ["m1", "m2", "m3"] {
            let key = format!("org1/example.com/alice/messages/2024/03/{id}");
            store.put(&key, id.as_bytes(), "text/plain", &Metadata::new()).unwrap();
        }
        store
            .put("org1/example.com/alfred/messages/2024/03/x", b"x", "text/plain", &Metadata::new())
            .unwrap();

        let page = store.list("org1/example.com/al", 10, None).unwrap();
        assert_eq!(page.objects.len(), 4);

        let page = store.list("org1/example.com/alice/", 2, None).unwrap();
        assert_eq!(page.objects.len(), 2);
        assert!(page.is_truncated);
        let rest = store
            .list("org1/example.com/alice/", 2, page.next_marker.as_deref())
            .unwrap();
        assert_eq!(rest.objects.len(), 1);
        assert!(!rest.is_truncated);
        assert_eq!(rest.objects[0].key, "org1/example.com/alice/messages/2024/03/m3");

        assert!(store.list("nobody/", 10, None).unwrap().objects.is_empty());
    }

    #[test]
    fn test_copy() {
        let (_dir, store) = store();
        store.put(KEY, b"payload", "message/rfc822", &Metadata::new()).unwrap();

        let mut replaced = Metadata::new();
        replaced.insert("mailbox-id".into(), "archive".into());
        let dest = "org2/other.com/bob/messages/2024/03/m-42";
        store.copy(KEY, dest, Some(&replaced)).unwrap();

        let (data, object) = store.get(dest).unwrap().unwrap();
        assert_eq!(data, b"payload");
        assert_eq!(object.metadata.get("mailbox-id").unwrap(), "archive");
        assert!(store.exists(KEY).unwrap());
    }

    #[test]
    fn test_rejects_traversal() {
        let (_dir, store) = store();
        assert!(store.put("../escape", b"x", "text/plain", &Metadata::new()).is_err());
        assert!(store.get("a/../../etc/passwd").is_err());
    }

    #[test]
    fn test_multipart() {
        let (_dir, store) = store();
        let upload_id = store.initiate_multipart(KEY, "application/pdf", &Metadata::new()).unwrap();
        let e1 = store.upload_part(KEY, &upload_id, 1, b"part one, ").unwrap();
        let e2 = store.upload_part(KEY, &upload_id, 2, b"part two").unwrap();
        assert!(store.upload_part("other/key", &upload_id, 3, b"x").is_err());

        store
            .complete_multipart(
                KEY,
                &upload_id,
                &[
                    CompletedPart { part_number: 1, etag: e1 },
                    CompletedPart { part_number: 2, etag: e2 },
                ],
            )
            .unwrap();

        let (data, object) = store.get(KEY).unwrap().unwrap();
        assert_eq!(data, b"part one, part two");
        assert_eq!(object.content_type, "application/pdf");
        assert!(!store.upload_dir(&upload_id).unwrap().exists());
    }

    #[test]
    fn test_presigned_download_url() {
        let (_dir, store) = store();
        let url = store.presigned_download_url(KEY, Duration::from_secs(300)).unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.contains("m-42.zst"));
        assert!(url.contains("op=download"));
        assert!(url.contains("expires="));
    }
}
