//! Storage keys, stored objects and their typed metadata

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Flat string map as accepted by blob stores
pub type Metadata = BTreeMap<String, String>;

/// Current layout of [`ObjectMetadata`] when flattened
pub const METADATA_SCHEMA_VERSION: u32 = 1;

mod keys {
    pub const SCHEMA_VERSION: &str = "schema-version";
    pub const ORG_ID: &str = "org-id";
    pub const DOMAIN_ID: &str = "domain-id";
    pub const USER_ID: &str = "user-id";
    pub const MAILBOX_ID: &str = "mailbox-id";
    pub const FOLDER_ID: &str = "folder-id";
    pub const MESSAGE_ID: &str = "message-id";
    pub const ATTACHMENT_ID: &str = "attachment-id";
    pub const FILENAME: &str = "filename";
    pub const CONTENT_HASH: &str = "content-hash";
    pub const MESSAGE_METADATA: &str = "message-metadata";
}

/// Which family of objects a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Messages,
    Attachments,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Messages => "messages",
            ObjectKind::Attachments => "attachments",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "messages" => Some(ObjectKind::Messages),
            "attachments" => Some(ObjectKind::Attachments),
            _ => None,
        }
    }
}

/// Placement of an object in the tenant hierarchy.
///
/// Rendered as `{org}/{domain}/{user}/{messages|attachments}/{YYYY}/{MM}/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub org_id: String,
    pub domain_id: String,
    pub user_id: String,
    pub kind: ObjectKind,
    pub year: i32,
    pub month: u32,
    pub object_id: String,
}

impl StorageKey {
    pub fn message(
        org_id: &str,
        domain_id: &str,
        user_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        Self::build(org_id, domain_id, user_id, ObjectKind::Messages, message_id, at)
    }

    pub fn attachment(
        org_id: &str,
        domain_id: &str,
        user_id: &str,
        attachment_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        Self::build(org_id, domain_id, user_id, ObjectKind::Attachments, attachment_id, at)
    }

    fn build(
        org_id: &str,
        domain_id: &str,
        user_id: &str,
        kind: ObjectKind,
        object_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        for (name, value) in [
            ("org id", org_id),
            ("domain id", domain_id),
            ("user id", user_id),
            ("object id", object_id),
        ] {
            validate_segment(name, value)?;
        }
        Ok(Self {
            org_id: org_id.to_string(),
            domain_id: domain_id.to_string(),
            user_id: user_id.to_string(),
            kind,
            year: at.year(),
            month: at.month(),
            object_id: object_id.to_string(),
        })
    }

    /// Parse a rendered key. Returns `None` for anything not produced by this type.
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        let [org, domain, user, kind, year, month, id] = parts.as_slice() else {
            return None;
        };
        if [org, domain, user, id].iter().any(|s| s.is_empty()) {
            return None;
        }
        if year.len() != 4 || month.len() != 2 {
            return None;
        }
        let year: i32 = year.parse().ok()?;
        let month: u32 = month.parse().ok()?;
        if !(1..=12).contains(&month) {
            return None;
        }
        Some(Self {
            org_id: org.to_string(),
            domain_id: domain.to_string(),
            user_id: user.to_string(),
            kind: ObjectKind::parse(kind)?,
            year,
            month,
            object_id: id.to_string(),
        })
    }

    /// Same object id and date bucket under another tenant placement
    pub fn relocated(&self, org_id: &str, domain_id: &str, user_id: &str) -> Result<Self> {
        for (name, value) in [("org id", org_id), ("domain id", domain_id), ("user id", user_id)] {
            validate_segment(name, value)?;
        }
        Ok(Self {
            org_id: org_id.to_string(),
            domain_id: domain_id.to_string(),
            user_id: user_id.to_string(),
            ..self.clone()
        })
    }

    pub fn domain_prefix(org_id: &str, domain_id: &str) -> String {
        format!("{org_id}/{domain_id}/")
    }

    pub fn user_prefix(org_id: &str, domain_id: &str, user_id: &str) -> String {
        format!("{org_id}/{domain_id}/{user_id}/")
    }

    pub fn messages_prefix(org_id: &str, domain_id: &str, user_id: &str) -> String {
        format!("{org_id}/{domain_id}/{user_id}/messages/")
    }

    pub fn attachments_prefix(org_id: &str, domain_id: &str, user_id: &str) -> String {
        format!("{org_id}/{domain_id}/{user_id}/attachments/")
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{:04}/{:02}/{}",
            self.org_id,
            self.domain_id,
            self.user_id,
            self.kind.as_str(),
            self.year,
            self.month,
            self.object_id
        )
    }
}

fn validate_segment(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(StorageError::invalid(format!("{name} must not be empty")));
    }
    if value.contains('/') || value == "." || value == ".." {
        return Err(StorageError::invalid(format!("{name} is not a valid key segment: {value:?}")));
    }
    Ok(())
}

/// Final path segment of a key
pub fn key_object_id(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// An object as described by the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageObject {
    pub key: String,
    pub size: i64,
    pub content_type: String,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Descriptive sidecar stored alongside a message body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageMetadata {
    pub message_id: String,
    pub mailbox_id: String,
    pub folder_id: Option<String>,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub size: i64,
    pub has_attachments: bool,
    pub flags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Typed view of the flat per-object metadata map.
///
/// Keys this type does not know about survive a round trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// 0 for objects written before the map carried a version
    pub schema_version: u32,
    pub org_id: Option<String>,
    pub domain_id: Option<String>,
    pub user_id: Option<String>,
    pub mailbox_id: Option<String>,
    pub folder_id: Option<String>,
    pub message_id: Option<String>,
    pub attachment_id: Option<String>,
    pub filename: Option<String>,
    pub content_hash: Option<String>,
    pub message: Option<MessageMetadata>,
    pub extra: Metadata,
}

impl ObjectMetadata {
    pub fn new(org_id: &str, domain_id: &str, user_id: &str) -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            org_id: Some(org_id.to_string()),
            domain_id: Some(domain_id.to_string()),
            user_id: Some(user_id.to_string()),
            ..Default::default()
        }
    }

    pub fn to_map(&self) -> Result<Metadata> {
        let mut map = self.extra.clone();
        map.insert(keys::SCHEMA_VERSION.into(), self.schema_version.to_string());

        let known = [
            (keys::ORG_ID, &self.org_id),
            (keys::DOMAIN_ID, &self.domain_id),
            (keys::USER_ID, &self.user_id),
            (keys::MAILBOX_ID, &self.mailbox_id),
            (keys::FOLDER_ID, &self.folder_id),
            (keys::MESSAGE_ID, &self.message_id),
            (keys::ATTACHMENT_ID, &self.attachment_id),
            (keys::FILENAME, &self.filename),
            (keys::CONTENT_HASH, &self.content_hash),
        ];
        for (key, value) in known {
            if let Some(value) = value {
                map.insert(key.into(), value.clone());
            }
        }

        if let Some(message) = &self.message {
            map.insert(keys::MESSAGE_METADATA.into(), serde_json::to_string(message)?);
        }
        Ok(map)
    }

    /// Read a stored map. Never fails: malformed entries stay in `extra`.
    pub fn from_map(map: &Metadata) -> Self {
        let mut extra = map.clone();
        let mut take = |key: &str| extra.remove(key);

        let schema_version = match take(keys::SCHEMA_VERSION) {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        let org_id = take(keys::ORG_ID);
        let domain_id = take(keys::DOMAIN_ID);
        let user_id = take(keys::USER_ID);
        let mailbox_id = take(keys::MAILBOX_ID);
        let folder_id = take(keys::FOLDER_ID);
        let message_id = take(keys::MESSAGE_ID);
        let attachment_id = take(keys::ATTACHMENT_ID);
        let filename = take(keys::FILENAME);
        let content_hash = take(keys::CONTENT_HASH);

        let message = match extra.remove(keys::MESSAGE_METADATA) {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(message) => Some(message),
                Err(e) => {
                    log::warn!("Unreadable message metadata sidecar: {}", e);
                    extra.insert(keys::MESSAGE_METADATA.into(), raw);
                    None
                }
            },
            None => None,
        };

        Self {
            schema_version,
            org_id,
            domain_id,
            user_id,
            mailbox_id,
            folder_id,
            message_id,
            attachment_id,
            filename,
            content_hash,
            message,
            extra,
        }
    }
}

/// What callers learn about a placed or fetched attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    /// Reference id for deduplicated content, object id otherwise
    pub attachment_id: String,
    pub message_id: String,
    pub org_id: String,
    pub domain_id: String,
    pub user_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub content_hash: Option<String>,
    pub storage_key: String,
    pub ref_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessageRequest {
    pub org_id: String,
    pub domain_id: String,
    pub user_id: String,
    pub mailbox_id: String,
    pub folder_id: Option<String>,
    pub message_id: String,
    pub content: Vec<u8>,
    pub content_type: String,
    pub metadata: Option<MessageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreAttachmentRequest {
    pub org_id: String,
    pub domain_id: String,
    pub user_id: String,
    pub mailbox_id: Option<String>,
    pub message_id: String,
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
    /// Lowercase hex SHA-256 of `content`; enables deduplication when present
    pub content_hash: Option<String>,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub source_key: String,
    pub dest_org_id: String,
    pub dest_domain_id: String,
    pub dest_user_id: String,
    pub dest_mailbox_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    pub copy: CopyRequest,
    pub delete_source: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn march_2024() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_message_key_layout() {
        let key = StorageKey::message("org1", "example.com", "alice", "m-42", march_2024()).unwrap();
        assert_eq!(key.to_string(), "org1/example.com/alice/messages/2024/03/m-42");
    }

    #[test]
    fn test_attachment_key_layout() {
        let key = StorageKey::attachment("org1", "example.com", "alice", "a-1", march_2024()).unwrap();
        assert_eq!(key.to_string(), "org1/example.com/alice/attachments/2024/03/a-1");
        assert!(key.to_string().starts_with(&StorageKey::attachments_prefix("org1", "example.com", "alice")));
    }

    #[test]
    fn test_parse_key() {
        let key = StorageKey::parse("org1/example.com/alice/messages/2024/03/m-42").unwrap();
        assert_eq!(key.org_id, "org1");
        assert_eq!(key.domain_id, "example.com");
        assert_eq!(key.user_id, "alice");
        assert_eq!(key.kind, ObjectKind::Messages);
        assert_eq!((key.year, key.month), (2024, 3));
        assert_eq!(key.object_id, "m-42");
        assert_eq!(key.to_string(), "org1/example.com/alice/messages/2024/03/m-42");
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert!(StorageKey::parse("org1/example.com/alice/messages/m-42").is_none());
        assert!(StorageKey::parse("org1/example.com/alice/drafts/2024/03/m-42").is_none());
        assert!(StorageKey::parse("org1/example.com/alice/messages/2024/13/m-42").is_none());
        assert!(StorageKey::parse("org1//alice/messages/2024/03/m-42").is_none());
        assert!(StorageKey::parse("org1/example.com/alice/messages/2024/03/m-42/extra").is_none());
    }

    #[test]
    fn test_invalid_segments_rejected() {
        assert!(StorageKey::message("org1", "", "alice", "m", march_2024()).is_err());
        assert!(StorageKey::message("org1", "d", "al/ice", "m", march_2024()).is_err());
        assert!(StorageKey::message("org1", "d", "alice", "..", march_2024()).is_err());
    }

    #[test]
    fn test_relocated_keeps_object_and_bucket() {
        let key = StorageKey::message("org1", "a.com", "alice", "m-1", march_2024()).unwrap();
        let moved = key.relocated("org2", "b.com", "bob").unwrap();
        assert_eq!(moved.to_string(), "org2/b.com/bob/messages/2024/03/m-1");
    }

    #[test]
    fn test_key_object_id() {
        assert_eq!(key_object_id("o/d/u/messages/2024/03/m-1"), "m-1");
        assert_eq!(key_object_id("bare"), "bare");
    }

    #[test]
    fn test_metadata_round_trip_keeps_unknown_keys() {
        let mut meta = ObjectMetadata::new("org1", "example.com", "alice");
        meta.mailbox_id = Some("inbox-1".into());
        meta.message_id = Some("m-1".into());
        meta.message = Some(MessageMetadata {
            message_id: "m-1".into(),
            subject: "Quarterly report".into(),
            to: vec!["bob@example.com".into()],
            date: Some(march_2024()),
            ..Default::default()
        });
        meta.extra.insert("x-origin".into(), "smtp".into());

        let map = meta.to_map().unwrap();
        assert_eq!(map.get("schema-version").unwrap(), "1");
        assert_eq!(map.get("x-origin").unwrap(), "smtp");

        let back = ObjectMetadata::from_map(&map);
        assert_eq!(back, meta);
    }

    #[test]
    fn test_legacy_map_without_version() {
        let mut map = Metadata::new();
        map.insert("mailbox-id".into(), "inbox".into());
        map.insert("message-metadata".into(), "{not json".into());

        let meta = ObjectMetadata::from_map(&map);
        assert_eq!(meta.schema_version, 0);
        assert_eq!(meta.mailbox_id.as_deref(), Some("inbox"));
        assert!(meta.message.is_none());
        assert_eq!(meta.extra.get("message-metadata").unwrap(), "{not json");
    }
}
