//! Configuration for the storage core
//!
//! Settings are resolved in layers (later layers win):
//! 1. Built-in defaults
//! 2. JSON file (~/.config/mail-storage/storage.json)
//! 3. `STORAGE_*` environment variables

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::models::QuotaLevel;

/// Config filename in the shared config directory
const CONFIG_FILE: &str = "storage.json";

const GIB: i64 = 1024 * 1024 * 1024;
const TIB: i64 = 1024 * GIB;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding quotas, reservations, dedup rows and the journal
    pub database_path: PathBuf,
    /// Root directory of the file blob store
    pub blob_root: PathBuf,
    pub db_busy_timeout_ms: u64,

    pub default_org_quota_bytes: i64,
    pub default_domain_quota_bytes: i64,
    pub default_user_quota_bytes: i64,
    pub default_mailbox_quota_bytes: i64,
    /// Soft limit percentage given to new quotas
    pub quota_warning_percent: u32,

    pub deduplication_enabled: bool,

    pub reservation_ttl_secs: u64,
    pub reservation_sweep_interval_secs: u64,
    /// Share reservations through the database instead of process memory
    pub shared_reservations: bool,

    pub orphan_grace_period_secs: u64,
    pub orphan_cleanup_interval_secs: u64,

    pub journal_reconcile_interval_secs: u64,
    /// Journal entries younger than this are assumed to be in flight
    pub journal_stale_after_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = config::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("storage.db"),
            blob_root: data_dir.join("blobs"),
            db_busy_timeout_ms: 5_000,
            default_org_quota_bytes: TIB,
            default_domain_quota_bytes: 100 * GIB,
            default_user_quota_bytes: 10 * GIB,
            default_mailbox_quota_bytes: 5 * GIB,
            quota_warning_percent: 90,
            deduplication_enabled: true,
            reservation_ttl_secs: 15 * 60,
            reservation_sweep_interval_secs: 60,
            shared_reservations: false,
            orphan_grace_period_secs: 7 * 24 * 60 * 60,
            orphan_cleanup_interval_secs: 60 * 60,
            journal_reconcile_interval_secs: 5 * 60,
            journal_stale_after_secs: 10 * 60,
        }
    }
}

impl StorageConfig {
    /// Load configuration using the layering described in the module docs
    pub fn load() -> Result<Self> {
        let base = if config::config_exists(CONFIG_FILE) {
            log::info!("Loading storage config from {}", CONFIG_FILE);
            config::load_json(CONFIG_FILE)?
        } else {
            Self::default()
        };
        base.with_env_overrides()
    }

    /// Load from a specific JSON file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let base: Self = config::load_json_file(path)?;
        base.with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        override_from_env(&mut self.database_path, "STORAGE_DATABASE_PATH")?;
        override_from_env(&mut self.blob_root, "STORAGE_BLOB_ROOT")?;
        override_from_env(&mut self.db_busy_timeout_ms, "STORAGE_DB_BUSY_TIMEOUT_MS")?;
        override_from_env(&mut self.default_org_quota_bytes, "STORAGE_DEFAULT_ORG_QUOTA_BYTES")?;
        override_from_env(
            &mut self.default_domain_quota_bytes,
            "STORAGE_DEFAULT_DOMAIN_QUOTA_BYTES",
        )?;
        override_from_env(&mut self.default_user_quota_bytes, "STORAGE_DEFAULT_USER_QUOTA_BYTES")?;
        override_from_env(
            &mut self.default_mailbox_quota_bytes,
            "STORAGE_DEFAULT_MAILBOX_QUOTA_BYTES",
        )?;
        override_from_env(&mut self.quota_warning_percent, "STORAGE_QUOTA_WARNING_PERCENT")?;
        override_from_env(&mut self.deduplication_enabled, "STORAGE_DEDUPLICATION_ENABLED")?;
        override_from_env(&mut self.reservation_ttl_secs, "STORAGE_RESERVATION_TTL_SECS")?;
        override_from_env(
            &mut self.reservation_sweep_interval_secs,
            "STORAGE_RESERVATION_SWEEP_INTERVAL_SECS",
        )?;
        override_from_env(&mut self.shared_reservations, "STORAGE_SHARED_RESERVATIONS")?;
        override_from_env(&mut self.orphan_grace_period_secs, "STORAGE_ORPHAN_GRACE_PERIOD_SECS")?;
        override_from_env(
            &mut self.orphan_cleanup_interval_secs,
            "STORAGE_ORPHAN_CLEANUP_INTERVAL_SECS",
        )?;
        override_from_env(
            &mut self.journal_reconcile_interval_secs,
            "STORAGE_JOURNAL_RECONCILE_INTERVAL_SECS",
        )?;
        override_from_env(&mut self.journal_stale_after_secs, "STORAGE_JOURNAL_STALE_AFTER_SECS")?;
        Ok(self)
    }

    /// Total bytes given to a new quota at `level` when the request leaves it at zero
    pub fn default_quota_bytes(&self, level: QuotaLevel) -> i64 {
        match level {
            QuotaLevel::Organization => self.default_org_quota_bytes,
            QuotaLevel::Domain => self.default_domain_quota_bytes,
            QuotaLevel::User => self.default_user_quota_bytes,
            QuotaLevel::Mailbox => self.default_mailbox_quota_bytes,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.db_busy_timeout_ms)
    }

    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.reservation_ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.reservation_sweep_interval_secs.max(1))
    }

    pub fn orphan_grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.orphan_grace_period_secs))
    }

    pub fn orphan_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_cleanup_interval_secs.max(1))
    }

    pub fn journal_reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.journal_reconcile_interval_secs.max(1))
    }

    pub fn journal_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.journal_stale_after_secs))
    }
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1_000)
}

fn override_from_env<T>(target: &mut T, key: &str) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = config::env_override(key)? {
        log::debug!("Config override from {}", key);
        *target = value;
    }
    Ok(())
}
