//! Reservations and where live ones are kept

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::db::{Database, from_millis, to_millis};
use crate::error::{Result, StorageError};

/// Lifecycle of a reservation. Only `Reserved` has outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Reserved,
    Committed,
    Released,
    Expired,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "reserved",
            ReservationState::Committed => "committed",
            ReservationState::Released => "released",
            ReservationState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationState::Reserved)
    }

    pub fn can_transition_to(&self, next: ReservationState) -> bool {
        matches!(
            (self, next),
            (
                ReservationState::Reserved,
                ReservationState::Committed | ReservationState::Released | ReservationState::Expired
            )
        )
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-limited hold on mailbox capacity for bytes not yet written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub org_id: Option<String>,
    pub domain_id: Option<String>,
    pub user_id: Option<String>,
    pub mailbox_id: String,
    pub bytes: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ReservationState,
}

impl Reservation {
    pub fn new(mailbox_id: impl Into<String>, bytes: i64, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: None,
            domain_id: None,
            user_id: None,
            mailbox_id: mailbox_id.into(),
            bytes,
            created_at: now,
            expires_at: now + ttl,
            state: ReservationState::Reserved,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Move to a terminal state, refusing anything the state machine forbids
    pub fn transition(&mut self, next: ReservationState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(StorageError::InvalidTransition {
                id: self.id.clone(),
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Storage for live reservations.
///
/// `take` is the single point where a reservation leaves the live set, so
/// exactly one of commit, release or expiry can win for a given id.
pub trait ReservationStore: Send + Sync {
    fn insert(&self, reservation: &Reservation) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<Reservation>>;

    /// Remove and return a live reservation
    fn take(&self, id: &str) -> Result<Option<Reservation>>;

    /// Live reservations whose expiry is at or before `now`
    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>>;

    fn all(&self) -> Result<Vec<Reservation>>;

    /// Whether every process writing the quota rows sees the same entries
    fn is_shared(&self) -> bool {
        false
    }
}

/// Process-local reservations for single-instance deployments
#[derive(Default)]
pub struct InMemoryReservationStore {
    entries: RwLock<HashMap<String, Reservation>>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReservationStore for InMemoryReservationStore {
    fn insert(&self, reservation: &Reservation) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&reservation.id) {
            return Err(StorageError::AlreadyExists {
                resource: "reservation",
                id: reservation.id.clone(),
            });
        }
        entries.insert(reservation.id.clone(), reservation.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Reservation>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(id).cloned())
    }

    fn take(&self, id: &str) -> Result<Option<Reservation>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.remove(id))
    }

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.values().filter(|r| r.is_expired(now)).cloned().collect())
    }

    fn all(&self) -> Result<Vec<Reservation>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.values().cloned().collect())
    }
}

const RESERVATION_COLUMNS: &str =
    "id, org_id, domain_id, user_id, mailbox_id, reserved_bytes, expires_at, created_at";

/// Reservations in the shared `quota_reservations` table.
///
/// Any instance can commit, release or sweep any reservation.
pub struct SqliteReservationStore {
    db: Arc<Database>,
}

impl SqliteReservationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn row_to_reservation(row: &Row<'_>) -> rusqlite::Result<Reservation> {
        Ok(Reservation {
            id: row.get(0)?,
            org_id: row.get(1)?,
            domain_id: row.get(2)?,
            user_id: row.get(3)?,
            mailbox_id: row.get(4)?,
            bytes: row.get(5)?,
            expires_at: from_millis(row.get(6)?),
            created_at: from_millis(row.get(7)?),
            state: ReservationState::Reserved,
        })
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Reservation>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, Self::row_to_reservation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl ReservationStore for SqliteReservationStore {
    fn is_shared(&self) -> bool {
        true
    }

    fn insert(&self, reservation: &Reservation) -> Result<()> {
        let conn = self.db.lock();
        let inserted = conn.execute(
            "INSERT INTO quota_reservations
                (id, org_id, domain_id, user_id, mailbox_id, reserved_bytes, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                reservation.id,
                reservation.org_id,
                reservation.domain_id,
                reservation.user_id,
                reservation.mailbox_id,
                reservation.bytes,
                to_millis(reservation.expires_at),
                to_millis(reservation.created_at),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(e) if crate::error::is_constraint_violation(&e) => Err(StorageError::AlreadyExists {
                resource: "reservation",
                id: reservation.id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: &str) -> Result<Option<Reservation>> {
        let conn = self.db.lock();
        let reservation = conn
            .query_row(
                &format!("SELECT {RESERVATION_COLUMNS} FROM quota_reservations WHERE id = ?1"),
                [id],
                Self::row_to_reservation,
            )
            .optional()?;
        Ok(reservation)
    }

    fn take(&self, id: &str) -> Result<Option<Reservation>> {
        let conn = self.db.lock();
        let reservation = conn
            .query_row(
                &format!("DELETE FROM quota_reservations WHERE id = ?1 RETURNING {RESERVATION_COLUMNS}"),
                [id],
                Self::row_to_reservation,
            )
            .optional()?;
        Ok(reservation)
    }

    fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        self.query(
            &format!(
                "SELECT {RESERVATION_COLUMNS} FROM quota_reservations
                 WHERE expires_at <= ?1 ORDER BY expires_at"
            ),
            [to_millis(now)],
        )
    }

    fn all(&self) -> Result<Vec<Reservation>> {
        self.query(
            &format!("SELECT {RESERVATION_COLUMNS} FROM quota_reservations ORDER BY created_at"),
            [],
        )
    }
}
