//! Periodic release of expired reservations

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::QuotaService;
use crate::tasks::{TaskHandle, spawn_periodic};

/// Sweep expired reservations every `interval` until the handle is shut down.
///
/// Must be called from within a tokio runtime.
pub fn spawn_reservation_sweeper(ledger: Arc<dyn QuotaService>, interval: Duration) -> TaskHandle {
    spawn_periodic("reservation-sweep", interval, move || {
        ledger.sweep_expired_reservations(Utc::now())
    })
}
