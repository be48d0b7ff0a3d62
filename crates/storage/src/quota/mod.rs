//! Hierarchical quota ledger
//!
//! Usage is tracked per level (organization, domain, user, mailbox). Limits
//! are enforced race-free on the mailbox row; ancestors are checked by a
//! walk that does not lock them together with the leaf.

mod ledger;
mod reservation;
mod sweeper;

pub use ledger::SqliteQuotaLedger;
pub use reservation::{
    InMemoryReservationStore, Reservation, ReservationState, ReservationStore,
    SqliteReservationStore,
};
pub use sweeper::spawn_reservation_sweeper;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{
    CreateQuotaRequest, Quota, QuotaCheckResult, QuotaInfo, QuotaLevel, UpdateQuotaRequest,
    UsageUpdate,
};

/// Outcome of one expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    pub expired: usize,
    pub bytes_released: i64,
    pub failed: usize,
}

/// Capacity accounting consumed by the orchestrator and protocol layers
pub trait QuotaService: Send + Sync {
    fn get_quota(&self, level: QuotaLevel, entity_id: &str) -> Result<Quota>;

    fn get_quota_by_id(&self, id: &str) -> Result<Quota>;

    fn create_quota(&self, req: CreateQuotaRequest) -> Result<Quota>;

    fn update_quota(&self, id: &str, req: UpdateQuotaRequest) -> Result<Quota>;

    /// Delete a quota, re-parenting its children to its own parent
    fn delete_quota(&self, id: &str) -> Result<()>;

    /// Walk mailbox → ancestors and report the first level that cannot take `bytes`
    fn check_quota(&self, mailbox_id: &str, bytes: i64) -> Result<QuotaCheckResult>;

    /// Same walk starting at a domain
    fn check_domain_quota(&self, domain_id: &str, bytes: i64) -> Result<QuotaCheckResult>;

    /// Apply `delta` to the mailbox and every ancestor, flooring each at zero
    fn update_usage(&self, mailbox_id: &str, delta: i64) -> Result<()>;

    fn get_quota_info(&self, mailbox_id: &str) -> Result<QuotaInfo>;

    fn get_domain_quota_info(&self, domain_id: &str) -> Result<QuotaInfo>;

    /// Hold `bytes` on the mailbox row and return the reservation id
    fn reserve_quota(&self, mailbox_id: &str, bytes: i64) -> Result<String>;

    fn commit_reservation(&self, reservation_id: &str) -> Result<()>;

    fn release_reservation(&self, reservation_id: &str) -> Result<()>;

    /// Force-release every live reservation that expired at or before `now`
    fn sweep_expired_reservations(&self, now: DateTime<Utc>) -> Result<SweepStats>;

    /// Race-free check-and-increment on the mailbox row
    fn atomic_check_and_update(&self, mailbox_id: &str, bytes: i64) -> Result<UsageUpdate>;

    /// Rewrite mailbox `reserved_bytes` from the live reservation set.
    /// Returns how many rows changed.
    ///
    /// Only sound when the reservation store sees every holder of the quota
    /// rows: a shared store, or a process-local one in the only process
    /// writing the database. Holds owned by other processes are erased.
    fn recompute_reserved_bytes(&self) -> Result<usize>;
}
