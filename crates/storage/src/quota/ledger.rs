//! SQLite-backed quota ledger

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::reservation::{
    InMemoryReservationStore, Reservation, ReservationState, ReservationStore,
    SqliteReservationStore,
};
use super::{QuotaService, SweepStats};
use crate::config::StorageConfig;
use crate::db::{Database, from_millis, to_millis};
use crate::error::{Result, StorageError, is_constraint_violation};
use crate::models::{
    CreateQuotaRequest, Quota, QuotaCheckResult, QuotaInfo, QuotaLevel, UpdateQuotaRequest,
    UsageUpdate,
};

const QUOTA_COLUMNS: &str = "id, level, entity_id, parent_id, total_bytes, used_bytes, \
     reserved_bytes, soft_limit_pct, hard_limit_pct, created_at, updated_at";

/// Parent hops allowed before a chain is treated as cyclic
const MAX_DEPTH: usize = 16;

/// Hard-limit percentages above this are rejected as typos
const MAX_HARD_LIMIT_PCT: u32 = 1000;

pub struct SqliteQuotaLedger {
    db: Arc<Database>,
    reservations: Arc<dyn ReservationStore>,
    config: StorageConfig,
}

impl SqliteQuotaLedger {
    /// Ledger whose reservation store follows `config.shared_reservations`
    pub fn new(db: Arc<Database>, config: StorageConfig) -> Self {
        let reservations: Arc<dyn ReservationStore> = if config.shared_reservations {
            Arc::new(SqliteReservationStore::new(Arc::clone(&db)))
        } else {
            Arc::new(InMemoryReservationStore::new())
        };
        Self::with_reservation_store(db, reservations, config)
    }

    pub fn with_reservation_store(
        db: Arc<Database>,
        reservations: Arc<dyn ReservationStore>,
        config: StorageConfig,
    ) -> Self {
        Self {
            db,
            reservations,
            config,
        }
    }

    pub fn reservations(&self) -> &Arc<dyn ReservationStore> {
        &self.reservations
    }

    /// Whether holds taken by other processes are visible to this ledger.
    /// Sweeping and recomputing from a separate process need this.
    pub fn reservations_shared(&self) -> bool {
        self.reservations.is_shared()
    }

    fn row_to_quota(row: &Row<'_>) -> rusqlite::Result<Quota> {
        Ok(Quota {
            id: row.get(0)?,
            level: row.get(1)?,
            entity_id: row.get(2)?,
            parent_id: row.get(3)?,
            total_bytes: row.get(4)?,
            used_bytes: row.get(5)?,
            reserved_bytes: row.get(6)?,
            soft_limit_pct: row.get(7)?,
            hard_limit_pct: row.get(8)?,
            created_at: from_millis(row.get(9)?),
            updated_at: from_millis(row.get(10)?),
        })
    }

    fn load(conn: &Connection, level: QuotaLevel, entity_id: &str) -> Result<Option<Quota>> {
        let quota = conn
            .query_row(
                &format!("SELECT {QUOTA_COLUMNS} FROM quotas WHERE level = ?1 AND entity_id = ?2"),
                params![level, entity_id],
                Self::row_to_quota,
            )
            .optional()?;
        Ok(quota)
    }

    fn load_by_id(conn: &Connection, id: &str) -> Result<Option<Quota>> {
        let quota = conn
            .query_row(
                &format!("SELECT {QUOTA_COLUMNS} FROM quotas WHERE id = ?1"),
                [id],
                Self::row_to_quota,
            )
            .optional()?;
        Ok(quota)
    }

    /// `start` followed by each ancestor up to the root
    fn chain(conn: &Connection, start: Quota) -> Result<Vec<Quota>> {
        let mut parent_id = start.parent_id.clone();
        let mut chain = vec![start];
        while let Some(id) = parent_id {
            if chain.len() >= MAX_DEPTH {
                return Err(StorageError::invalid(format!(
                    "quota hierarchy above {id} is deeper than {MAX_DEPTH} levels"
                )));
            }
            match Self::load_by_id(conn, &id)? {
                Some(parent) => {
                    parent_id = parent.parent_id.clone();
                    chain.push(parent);
                }
                None => {
                    // No row means no parent link either; the level is unlimited.
                    warn!("Dangling quota parent: parent_id={}", id);
                    parent_id = None;
                }
            }
        }
        Ok(chain)
    }

    /// Add `delta` to each ancestor starting at `parent`, flooring at zero
    fn apply_to_ancestors(
        conn: &Connection,
        mut parent: Option<String>,
        delta: i64,
        now: i64,
    ) -> Result<()> {
        let mut hops = 0;
        while let Some(id) = parent {
            hops += 1;
            if hops > MAX_DEPTH {
                return Err(StorageError::invalid(format!(
                    "quota hierarchy above {id} is deeper than {MAX_DEPTH} levels"
                )));
            }
            let next: Option<Option<String>> = conn
                .query_row(
                    "UPDATE quotas
                     SET used_bytes = MAX(0, used_bytes + ?1), updated_at = ?2
                     WHERE id = ?3
                     RETURNING parent_id",
                    params![delta, now, id],
                    |row| row.get(0),
                )
                .optional()?;
            parent = match next {
                Some(next) => next,
                None => {
                    warn!("Dangling quota parent: parent_id={}", id);
                    None
                }
            };
        }
        Ok(())
    }

    fn check_from(
        &self,
        level: QuotaLevel,
        entity_id: &str,
        bytes: i64,
    ) -> Result<(QuotaCheckResult, Vec<Quota>)> {
        validate_bytes(bytes)?;

        let chain = {
            let conn = self.db.lock();
            match Self::load(&conn, level, entity_id)? {
                Some(start) => Self::chain(&conn, start)?,
                None => Vec::new(),
            }
        };

        if let Some(denied) = chain.iter().find(|q| !q.can_accommodate(bytes)) {
            warn!(
                "Quota exceeded: level={} entity={} requested={} available={}",
                denied.level,
                denied.entity_id,
                bytes,
                denied.available_bytes()
            );
            let result = QuotaCheckResult::denied(denied, bytes);
            return Ok((result, chain));
        }

        for quota in chain.iter().filter(|q| !q.is_unlimited()) {
            let projected = quota
                .used_bytes
                .saturating_add(quota.reserved_bytes)
                .saturating_add(bytes);
            if projected > quota.soft_limit_bytes() {
                warn!(
                    "Soft limit crossed: level={} entity={} projected={} soft_limit={}",
                    quota.level,
                    quota.entity_id,
                    projected,
                    quota.soft_limit_bytes()
                );
            }
        }

        let result = match chain.iter().min_by_key(|q| q.available_bytes()) {
            Some(tightest) => QuotaCheckResult::allowed(tightest, bytes),
            None => {
                debug!("No quota row: level={} entity={}, allowing", level, entity_id);
                QuotaCheckResult::unlimited(level, entity_id, bytes)
            }
        };
        Ok((result, chain))
    }

    fn info_for(&self, level: QuotaLevel, entity_id: &str) -> Result<QuotaInfo> {
        let conn = self.db.lock();
        let start = Self::load(&conn, level, entity_id)?
            .ok_or_else(|| StorageError::not_found("quota", format!("{level}/{entity_id}")))?;
        let chain = Self::chain(&conn, start)?;

        chain
            .into_iter()
            .rev()
            .fold(None, |parent: Option<QuotaInfo>, quota| {
                let mut info = QuotaInfo::new(quota);
                info.parent = parent.map(Box::new);
                Some(info)
            })
            .ok_or_else(|| StorageError::not_found("quota", format!("{level}/{entity_id}")))
    }

    /// Take a live reservation out of the store and settle it in the database.
    ///
    /// If the database update fails the reservation is put back so the
    /// caller (or the next sweep) can retry.
    fn finish(&self, reservation_id: &str, next: ReservationState) -> Result<Reservation> {
        let mut reservation = self
            .reservations
            .take(reservation_id)?
            .ok_or_else(|| StorageError::ReservationNotFound(reservation_id.to_string()))?;
        reservation.transition(next)?;

        let now = to_millis(Utc::now());
        let settled = match next {
            ReservationState::Committed => self.db.transaction(|tx| {
                let parent: Option<Option<String>> = tx
                    .query_row(
                        "UPDATE quotas
                         SET reserved_bytes = MAX(0, reserved_bytes - ?1),
                             used_bytes = used_bytes + ?1,
                             updated_at = ?2
                         WHERE level = 'mailbox' AND entity_id = ?3
                         RETURNING parent_id",
                        params![reservation.bytes, now, reservation.mailbox_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(parent) = parent {
                    Self::apply_to_ancestors(tx, parent, reservation.bytes, now)?;
                }
                Ok(())
            }),
            _ => {
                let conn = self.db.lock();
                conn.execute(
                    "UPDATE quotas
                     SET reserved_bytes = MAX(0, reserved_bytes - ?1), updated_at = ?2
                     WHERE level = 'mailbox' AND entity_id = ?3",
                    params![reservation.bytes, now, reservation.mailbox_id],
                )
                .map(|_| ())
                .map_err(StorageError::from)
            }
        };

        if let Err(e) = settled {
            reservation.state = ReservationState::Reserved;
            if let Err(restore) = self.reservations.insert(&reservation) {
                error!(
                    "Failed to restore reservation {} after settle error: {}",
                    reservation.id, restore
                );
            }
            return Err(e);
        }

        Ok(reservation)
    }
}

fn validate_bytes(bytes: i64) -> Result<()> {
    if bytes < 0 {
        return Err(StorageError::invalid(format!("byte count must not be negative: {bytes}")));
    }
    Ok(())
}

fn validate_limits(total_bytes: i64, soft_pct: u32, hard_pct: u32) -> Result<()> {
    if total_bytes < 0 {
        return Err(StorageError::invalid("total_bytes must not be negative"));
    }
    if hard_pct == 0 || hard_pct > MAX_HARD_LIMIT_PCT {
        return Err(StorageError::invalid(format!(
            "hard_limit_pct must be between 1 and {MAX_HARD_LIMIT_PCT}"
        )));
    }
    if soft_pct > hard_pct {
        return Err(StorageError::invalid("soft_limit_pct must not exceed hard_limit_pct"));
    }
    // Limits are computed in SQL as total_bytes * hard_limit_pct.
    if total_bytes.checked_mul(i64::from(hard_pct)).is_none() {
        return Err(StorageError::invalid(format!(
            "total_bytes {total_bytes} at {hard_pct}% overflows the byte range"
        )));
    }
    Ok(())
}

impl QuotaService for SqliteQuotaLedger {
    fn get_quota(&self, level: QuotaLevel, entity_id: &str) -> Result<Quota> {
        let conn = self.db.lock();
        Self::load(&conn, level, entity_id)?
            .ok_or_else(|| StorageError::not_found("quota", format!("{level}/{entity_id}")))
    }

    fn get_quota_by_id(&self, id: &str) -> Result<Quota> {
        let conn = self.db.lock();
        Self::load_by_id(&conn, id)?.ok_or_else(|| StorageError::not_found("quota", id))
    }

    fn create_quota(&self, req: CreateQuotaRequest) -> Result<Quota> {
        let total_bytes = if req.total_bytes == 0 {
            self.config.default_quota_bytes(req.level)
        } else {
            req.total_bytes
        };
        let soft_limit_pct = req.soft_limit_pct.unwrap_or(self.config.quota_warning_percent);
        let hard_limit_pct = req.hard_limit_pct.unwrap_or(100);
        validate_limits(total_bytes, soft_limit_pct, hard_limit_pct)?;
        if req.entity_id.is_empty() {
            return Err(StorageError::invalid("entity_id must not be empty"));
        }

        let now = Utc::now();
        let quota = Quota {
            id: uuid::Uuid::new_v4().to_string(),
            level: req.level,
            entity_id: req.entity_id,
            parent_id: req.parent_id,
            total_bytes,
            used_bytes: 0,
            reserved_bytes: 0,
            soft_limit_pct,
            hard_limit_pct,
            created_at: now,
            updated_at: now,
        };

        self.db.transaction(|tx| {
            if let Some(parent_id) = &quota.parent_id
                && Self::load_by_id(tx, parent_id)?.is_none()
            {
                return Err(StorageError::not_found("parent quota", parent_id.clone()));
            }

            let inserted = tx.execute(
                &format!("INSERT INTO quotas ({QUOTA_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    quota.id,
                    quota.level,
                    quota.entity_id,
                    quota.parent_id,
                    quota.total_bytes,
                    quota.used_bytes,
                    quota.reserved_bytes,
                    quota.soft_limit_pct,
                    quota.hard_limit_pct,
                    to_millis(quota.created_at),
                    to_millis(quota.updated_at),
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(StorageError::AlreadyExists {
                    resource: "quota",
                    id: format!("{}/{}", quota.level, quota.entity_id),
                }),
                Err(e) => Err(e.into()),
            }
        })?;

        info!(
            "Created quota: level={} entity={} total_bytes={}",
            quota.level, quota.entity_id, quota.total_bytes
        );
        Ok(quota)
    }

    fn update_quota(&self, id: &str, req: UpdateQuotaRequest) -> Result<Quota> {
        let now = Utc::now();
        let updated = self.db.transaction(|tx| {
            let mut quota =
                Self::load_by_id(tx, id)?.ok_or_else(|| StorageError::not_found("quota", id))?;
            if let Some(total_bytes) = req.total_bytes {
                quota.total_bytes = total_bytes;
            }
            if let Some(soft) = req.soft_limit_pct {
                quota.soft_limit_pct = soft;
            }
            if let Some(hard) = req.hard_limit_pct {
                quota.hard_limit_pct = hard;
            }
            validate_limits(quota.total_bytes, quota.soft_limit_pct, quota.hard_limit_pct)?;
            quota.updated_at = now;

            tx.execute(
                "UPDATE quotas
                 SET total_bytes = ?1, soft_limit_pct = ?2, hard_limit_pct = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    quota.total_bytes,
                    quota.soft_limit_pct,
                    quota.hard_limit_pct,
                    to_millis(now),
                    id
                ],
            )?;
            Ok(quota)
        })?;

        info!(
            "Updated quota: level={} entity={} total_bytes={}",
            updated.level, updated.entity_id, updated.total_bytes
        );
        Ok(updated)
    }

    fn delete_quota(&self, id: &str) -> Result<()> {
        let now = to_millis(Utc::now());
        let reparented = self.db.transaction(|tx| {
            let parent_id: Option<String> = tx
                .query_row("SELECT parent_id FROM quotas WHERE id = ?1", [id], |row| row.get(0))
                .optional()?
                .ok_or_else(|| StorageError::not_found("quota", id))?;
            let reparented = tx.execute(
                "UPDATE quotas SET parent_id = ?1, updated_at = ?2 WHERE parent_id = ?3",
                params![parent_id, now, id],
            )?;
            tx.execute("DELETE FROM quotas WHERE id = ?1", [id])?;
            Ok(reparented)
        })?;

        info!("Deleted quota: id={} reparented_children={}", id, reparented);
        Ok(())
    }

    fn check_quota(&self, mailbox_id: &str, bytes: i64) -> Result<QuotaCheckResult> {
        self.check_from(QuotaLevel::Mailbox, mailbox_id, bytes)
            .map(|(result, _)| result)
    }

    fn check_domain_quota(&self, domain_id: &str, bytes: i64) -> Result<QuotaCheckResult> {
        self.check_from(QuotaLevel::Domain, domain_id, bytes)
            .map(|(result, _)| result)
    }

    fn update_usage(&self, mailbox_id: &str, delta: i64) -> Result<()> {
        let now = to_millis(Utc::now());
        self.db.transaction(|tx| {
            let parent: Option<Option<String>> = tx
                .query_row(
                    "UPDATE quotas
                     SET used_bytes = MAX(0, used_bytes + ?1), updated_at = ?2
                     WHERE level = 'mailbox' AND entity_id = ?3
                     RETURNING parent_id",
                    params![delta, now, mailbox_id],
                    |row| row.get(0),
                )
                .optional()?;
            match parent {
                Some(parent) => Self::apply_to_ancestors(tx, parent, delta, now),
                None => {
                    debug!("No mailbox quota: mailbox={}, usage not tracked", mailbox_id);
                    Ok(())
                }
            }
        })
    }

    fn get_quota_info(&self, mailbox_id: &str) -> Result<QuotaInfo> {
        self.info_for(QuotaLevel::Mailbox, mailbox_id)
    }

    fn get_domain_quota_info(&self, domain_id: &str) -> Result<QuotaInfo> {
        self.info_for(QuotaLevel::Domain, domain_id)
    }

    fn reserve_quota(&self, mailbox_id: &str, bytes: i64) -> Result<String> {
        let (check, chain) = self.check_from(QuotaLevel::Mailbox, mailbox_id, bytes)?;
        if !check.allowed {
            return Err(check.into_error());
        }

        let mut reservation = Reservation::new(mailbox_id, bytes, self.config.reservation_ttl());
        for quota in &chain {
            let id = Some(quota.entity_id.clone());
            match quota.level {
                QuotaLevel::Organization => reservation.org_id = id,
                QuotaLevel::Domain => reservation.domain_id = id,
                QuotaLevel::User => reservation.user_id = id,
                QuotaLevel::Mailbox => {}
            }
        }

        let held = if chain.is_empty() {
            false
        } else {
            let conn = self.db.lock();
            let updated = conn.execute(
                "UPDATE quotas
                 SET reserved_bytes = reserved_bytes + ?1, updated_at = ?2
                 WHERE level = 'mailbox' AND entity_id = ?3
                   AND (total_bytes = 0
                        OR used_bytes + reserved_bytes + ?1 <= total_bytes * hard_limit_pct / 100)",
                params![bytes, to_millis(reservation.created_at), mailbox_id],
            )?;
            if updated == 0 {
                // Another writer took the remaining capacity after our check.
                return Err(match Self::load(&conn, QuotaLevel::Mailbox, mailbox_id)? {
                    Some(current) => QuotaCheckResult::denied(&current, bytes).into_error(),
                    None => StorageError::not_found("quota", format!("mailbox/{mailbox_id}")),
                });
            }
            true
        };

        if let Err(e) = self.reservations.insert(&reservation) {
            if held {
                let conn = self.db.lock();
                if let Err(undo) = conn.execute(
                    "UPDATE quotas SET reserved_bytes = MAX(0, reserved_bytes - ?1)
                     WHERE level = 'mailbox' AND entity_id = ?2",
                    params![bytes, mailbox_id],
                ) {
                    error!("Failed to undo reservation hold on {}: {}", mailbox_id, undo);
                }
            }
            return Err(e);
        }

        info!(
            "Reserved quota: mailbox={} bytes={} reservation={}",
            mailbox_id, bytes, reservation.id
        );
        Ok(reservation.id)
    }

    fn commit_reservation(&self, reservation_id: &str) -> Result<()> {
        let reservation = self.finish(reservation_id, ReservationState::Committed)?;
        debug!(
            "Committed reservation: id={} mailbox={} bytes={}",
            reservation.id, reservation.mailbox_id, reservation.bytes
        );
        Ok(())
    }

    fn release_reservation(&self, reservation_id: &str) -> Result<()> {
        let reservation = self.finish(reservation_id, ReservationState::Released)?;
        debug!(
            "Released reservation: id={} mailbox={} bytes={}",
            reservation.id, reservation.mailbox_id, reservation.bytes
        );
        Ok(())
    }

    fn sweep_expired_reservations(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        for candidate in self.reservations.expired(now)? {
            match self.finish(&candidate.id, ReservationState::Expired) {
                Ok(reservation) => {
                    stats.expired += 1;
                    stats.bytes_released += reservation.bytes;
                }
                // Committed or released since the scan.
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!("Failed to expire reservation {}: {}", candidate.id, e);
                    stats.failed += 1;
                }
            }
        }

        if stats.expired > 0 {
            info!(
                "Expired reservations: count={} bytes={}",
                stats.expired, stats.bytes_released
            );
        }
        Ok(stats)
    }

    fn atomic_check_and_update(&self, mailbox_id: &str, bytes: i64) -> Result<UsageUpdate> {
        validate_bytes(bytes)?;
        let now = to_millis(Utc::now());

        let updated = self.db.transaction(|tx| {
            let row: Option<(i64, i64, Option<String>)> = tx
                .query_row(
                    "UPDATE quotas
                     SET used_bytes = used_bytes + ?1, updated_at = ?2
                     WHERE level = 'mailbox' AND entity_id = ?3
                       AND (total_bytes = 0
                            OR used_bytes + reserved_bytes + ?1 <= total_bytes * hard_limit_pct / 100)
                     RETURNING used_bytes, total_bytes * hard_limit_pct / 100, parent_id",
                    params![bytes, now, mailbox_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            match row {
                Some((used_bytes, limit_bytes, parent)) => {
                    Self::apply_to_ancestors(tx, parent, bytes, now)?;
                    Ok(Ok(UsageUpdate {
                        used_bytes,
                        limit_bytes,
                    }))
                }
                None => Ok(Err(Self::load(tx, QuotaLevel::Mailbox, mailbox_id)?)),
            }
        })?;

        match updated {
            Ok(update) => Ok(update),
            Err(Some(current)) => {
                warn!(
                    "Quota exceeded: level=mailbox entity={} requested={} used={} limit={}",
                    mailbox_id,
                    bytes,
                    current.used_bytes,
                    current.hard_limit_bytes()
                );
                Err(QuotaCheckResult::denied(&current, bytes).into_error())
            }
            Err(None) => Err(StorageError::not_found("quota", format!("mailbox/{mailbox_id}"))),
        }
    }

    /// Run while writers are quiet: a reservation taken between the
    /// snapshot and the rewrite is briefly under-counted. Erases holds this
    /// ledger's store cannot see; see [`Self::reservations_shared`].
    fn recompute_reserved_bytes(&self) -> Result<usize> {
        let mut expected: HashMap<String, i64> = HashMap::new();
        for reservation in self.reservations.all()? {
            *expected.entry(reservation.mailbox_id).or_default() += reservation.bytes;
        }

        let now = to_millis(Utc::now());
        let corrected = self.db.transaction(|tx| {
            let rows = {
                let mut stmt = tx.prepare(
                    "SELECT id, entity_id, reserved_bytes FROM quotas WHERE level = 'mailbox'",
                )?;
                stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?
            };

            let mut corrected = 0;
            for (id, mailbox_id, reserved) in rows {
                let want = expected.get(&mailbox_id).copied().unwrap_or(0);
                if want != reserved {
                    warn!(
                        "Reserved bytes drift: mailbox={} recorded={} live={}",
                        mailbox_id, reserved, want
                    );
                    tx.execute(
                        "UPDATE quotas SET reserved_bytes = ?1, updated_at = ?2 WHERE id = ?3",
                        params![want, now, id],
                    )?;
                    corrected += 1;
                }
            }
            Ok(corrected)
        })?;

        if corrected > 0 {
            info!("Recomputed reserved bytes: corrected_rows={}", corrected);
        }
        Ok(corrected)
    }
}
