//! Quota model and capacity arithmetic

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Percentage points below the hard limit where a quota turns critical.
const CRITICAL_MARGIN_PCT: f64 = 5.0;

/// Position of a quota in the tenant hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaLevel {
    Organization,
    Domain,
    User,
    Mailbox,
}

impl QuotaLevel {
    pub const ALL: [QuotaLevel; 4] = [
        QuotaLevel::Organization,
        QuotaLevel::Domain,
        QuotaLevel::User,
        QuotaLevel::Mailbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaLevel::Organization => "organization",
            QuotaLevel::Domain => "domain",
            QuotaLevel::User => "user",
            QuotaLevel::Mailbox => "mailbox",
        }
    }
}

impl fmt::Display for QuotaLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuotaLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| format!("unknown quota level: {s}"))
    }
}

/// Health of a quota relative to its soft and hard limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaStatus {
    Ok,
    Warning,
    Critical,
    Exceeded,
}

impl QuotaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaStatus::Ok => "ok",
            QuotaStatus::Warning => "warning",
            QuotaStatus::Critical => "critical",
            QuotaStatus::Exceeded => "exceeded",
        }
    }
}

impl fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte allowance for one entity at one level of the hierarchy.
///
/// `total_bytes == 0` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub id: String,
    pub level: QuotaLevel,
    pub entity_id: String,
    pub parent_id: Option<String>,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub reserved_bytes: i64,
    pub soft_limit_pct: u32,
    pub hard_limit_pct: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Quota {
    pub fn is_unlimited(&self) -> bool {
        self.total_bytes == 0
    }

    /// Bytes above which writes are rejected. Zero when unlimited.
    pub fn hard_limit_bytes(&self) -> i64 {
        percent_of(self.total_bytes, self.hard_limit_pct)
    }

    /// Bytes above which warnings are raised. Zero when unlimited.
    pub fn soft_limit_bytes(&self) -> i64 {
        percent_of(self.total_bytes, self.soft_limit_pct)
    }

    /// Remaining capacity under the hard limit, counting held reservations.
    ///
    /// Unlimited quotas report `i64::MAX`.
    pub fn available_bytes(&self) -> i64 {
        if self.is_unlimited() {
            return i64::MAX;
        }
        self.hard_limit_bytes()
            .saturating_sub(self.used_bytes)
            .saturating_sub(self.reserved_bytes)
            .max(0)
    }

    /// Used bytes as a percentage of the total allowance
    pub fn usage_percent(&self) -> f64 {
        if self.is_unlimited() {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    pub fn status(&self) -> QuotaStatus {
        if self.is_unlimited() {
            return QuotaStatus::Ok;
        }
        let usage = self.usage_percent();
        let hard = f64::from(self.hard_limit_pct);
        if usage >= hard {
            QuotaStatus::Exceeded
        } else if usage >= hard - CRITICAL_MARGIN_PCT {
            QuotaStatus::Critical
        } else if usage >= f64::from(self.soft_limit_pct) {
            QuotaStatus::Warning
        } else {
            QuotaStatus::Ok
        }
    }

    /// Whether `bytes` more fit under the hard limit alongside used and reserved bytes.
    ///
    /// A sum past `i64::MAX` never fits.
    pub fn can_accommodate(&self, bytes: i64) -> bool {
        if self.is_unlimited() {
            return true;
        }
        self.used_bytes
            .checked_add(self.reserved_bytes)
            .and_then(|held| held.checked_add(bytes))
            .is_some_and(|projected| projected <= self.hard_limit_bytes())
    }
}

/// `pct` percent of `total`, saturating at `i64::MAX`
fn percent_of(total: i64, pct: u32) -> i64 {
    let bytes = i128::from(total) * i128::from(pct) / 100;
    i64::try_from(bytes).unwrap_or(if bytes < 0 { i64::MIN } else { i64::MAX })
}

/// Outcome of walking the quota chain for a prospective write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaCheckResult {
    pub allowed: bool,
    pub status: QuotaStatus,
    /// The level that denied the write, or the tightest level when allowed
    pub level: QuotaLevel,
    pub entity_id: String,
    pub available_bytes: i64,
    pub required_bytes: i64,
    pub used_bytes: i64,
    pub limit_bytes: i64,
    pub message: Option<String>,
}

impl QuotaCheckResult {
    pub(crate) fn allowed(quota: &Quota, required_bytes: i64) -> Self {
        Self {
            allowed: true,
            status: quota.status(),
            level: quota.level,
            entity_id: quota.entity_id.clone(),
            available_bytes: quota.available_bytes(),
            required_bytes,
            used_bytes: quota.used_bytes,
            limit_bytes: quota.hard_limit_bytes(),
            message: None,
        }
    }

    /// Result for a chain with no quota rows at all.
    pub(crate) fn unlimited(level: QuotaLevel, entity_id: &str, required_bytes: i64) -> Self {
        Self {
            allowed: true,
            status: QuotaStatus::Ok,
            level,
            entity_id: entity_id.to_string(),
            available_bytes: i64::MAX,
            required_bytes,
            used_bytes: 0,
            limit_bytes: 0,
            message: Some(format!("no {level} quota configured for {entity_id}")),
        }
    }

    pub(crate) fn denied(quota: &Quota, required_bytes: i64) -> Self {
        let available = quota.available_bytes();
        Self {
            allowed: false,
            status: QuotaStatus::Exceeded,
            level: quota.level,
            entity_id: quota.entity_id.clone(),
            available_bytes: available,
            required_bytes,
            used_bytes: quota.used_bytes,
            limit_bytes: quota.hard_limit_bytes(),
            message: Some(format!(
                "{} quota exceeded: {} bytes available, {} required",
                quota.level, available, required_bytes
            )),
        }
    }

    /// Convert a denied check into the error surfaced to callers.
    pub fn into_error(self) -> crate::StorageError {
        crate::StorageError::QuotaExceeded {
            level: self.level,
            entity_id: self.entity_id,
            available_bytes: self.available_bytes,
            requested_bytes: self.required_bytes,
            used_bytes: self.used_bytes,
            limit_bytes: self.limit_bytes,
        }
    }
}

/// Quota plus its derived figures and the same view of its parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub quota: Quota,
    pub status: QuotaStatus,
    pub available_bytes: i64,
    pub usage_percent: f64,
    pub parent: Option<Box<QuotaInfo>>,
}

impl QuotaInfo {
    pub fn new(quota: Quota) -> Self {
        Self {
            status: quota.status(),
            available_bytes: quota.available_bytes(),
            usage_percent: quota.usage_percent(),
            quota,
            parent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateQuotaRequest {
    pub level: QuotaLevel,
    pub entity_id: String,
    pub parent_id: Option<String>,
    /// Zero selects the configured default for the level
    pub total_bytes: i64,
    pub soft_limit_pct: Option<u32>,
    pub hard_limit_pct: Option<u32>,
}

impl CreateQuotaRequest {
    pub fn new(level: QuotaLevel, entity_id: impl Into<String>) -> Self {
        Self {
            level,
            entity_id: entity_id.into(),
            parent_id: None,
            total_bytes: 0,
            soft_limit_pct: None,
            hard_limit_pct: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_total_bytes(mut self, total_bytes: i64) -> Self {
        self.total_bytes = total_bytes;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateQuotaRequest {
    pub total_bytes: Option<i64>,
    pub soft_limit_pct: Option<u32>,
    pub hard_limit_pct: Option<u32>,
}

/// Result of a successful atomic check-and-update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageUpdate {
    pub used_bytes: i64,
    /// Hard limit in bytes, zero when unlimited
    pub limit_bytes: i64,
}
