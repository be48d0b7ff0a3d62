//! Error types for quota, deduplication and placement operations

use crate::models::QuotaLevel;

/// Result alias used throughout the crate
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Coarse classification callers use to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A hard limit would be exceeded. Terminal and user-visible.
    QuotaExceeded,
    /// A quota, reservation, reference or blob key is absent.
    NotFound,
    /// Database or blob store trouble. Safe to retry.
    Transient,
    /// Programmer error such as committing an unknown reservation. Never retried.
    InvariantViolation,
    /// A multi-step operation stopped after some steps took effect.
    PartialFailure,
    /// The request itself is malformed.
    InvalidInput,
    /// The request collides with an existing row.
    Conflict,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(
        "{level} quota exceeded for {entity_id}: requested {requested_bytes} bytes, \
         {available_bytes} available (used {used_bytes} of {limit_bytes})"
    )]
    QuotaExceeded {
        level: QuotaLevel,
        entity_id: String,
        available_bytes: i64,
        requested_bytes: i64,
        used_bytes: i64,
        limit_bytes: i64,
    },

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("reservation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("{resource} already exists: {id}")]
    AlreadyExists { resource: &'static str, id: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("blob store error: {0:#}")]
    Blob(#[from] anyhow::Error),

    #[error(
        "{operation} stopped at {failed_step} after {completed:?} \
         (source {source_key}, destination {dest_key}): {source}"
    )]
    PartialFailure {
        operation: &'static str,
        completed: Vec<&'static str>,
        failed_step: &'static str,
        source_key: String,
        dest_key: String,
        #[source]
        source: Box<StorageError>,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ReservationNotFound(_) | Self::InvalidTransition { .. } => {
                ErrorKind::InvariantViolation
            }
            Self::AlreadyExists { .. } => ErrorKind::Conflict,
            Self::Database(_) | Self::Blob(_) => ErrorKind::Transient,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::InvalidInput(_) | Self::Serialization(_) => ErrorKind::InvalidInput,
        }
    }

    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// True for missing rows and keys, including an already-finished reservation.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::ReservationNotFound(_))
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

/// Detect a UNIQUE/CHECK constraint failure from SQLite.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_exceeded_message_names_level_and_amounts() {
        let err = StorageError::QuotaExceeded {
            level: QuotaLevel::Domain,
            entity_id: "example.org".into(),
            available_bytes: 100,
            requested_bytes: 500,
            used_bytes: 900,
            limit_bytes: 1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("domain"));
        assert!(msg.contains("example.org"));
        assert!(msg.contains("500"));
        assert!(msg.contains("100 available"));
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_reservation_not_found_is_invariant_violation() {
        let err = StorageError::ReservationNotFound("r-1".into());
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        let err = StorageError::from(anyhow::anyhow!("connection reset"));
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());

        let err = StorageError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_partial_failure_carries_detail() {
        let err = StorageError::PartialFailure {
            operation: "move",
            completed: vec!["copy"],
            failed_step: "delete source",
            source_key: "o/a/u/messages/2024/01/m1".into(),
            dest_key: "o/b/u/messages/2024/01/m1".into(),
            source: Box::new(StorageError::from(anyhow::anyhow!("bucket offline"))),
        };
        let msg = err.to_string();
        assert!(msg.contains("delete source"));
        assert!(msg.contains("o/a/u/messages/2024/01/m1"));
        assert!(msg.contains("o/b/u/messages/2024/01/m1"));
        assert!(msg.contains("bucket offline"));
        assert_eq!(err.kind(), ErrorKind::PartialFailure);
    }
}
