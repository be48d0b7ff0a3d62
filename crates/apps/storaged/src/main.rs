//! storaged - maintenance daemon for the mail storage core
//!
//! Opens the shared database and blob root, then runs the reservation sweep,
//! orphan cleanup and journal reconciliation on fixed schedules until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use log::{error, info, warn};
use storage::{
    BlobStore, Database, DeduplicationService, FileBlobStore, OperationJournal, QuotaService,
    SqliteDedupRegistry, SqliteQuotaLedger, StorageConfig, spawn_periodic,
    spawn_reservation_sweeper,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let config = StorageConfig::load().context("Failed to load storage configuration")?;
    info!(
        "Opening storage: database={} blobs={}",
        config.database_path.display(),
        config.blob_root.display()
    );

    let db = Arc::new(Database::open(&config.database_path, config.busy_timeout())?);
    let blobs: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(&config.blob_root)?);
    let ledger = Arc::new(SqliteQuotaLedger::new(Arc::clone(&db), config.clone()));
    let dedup = Arc::new(SqliteDedupRegistry::new(
        Arc::clone(&db),
        Arc::clone(&blobs),
        config.orphan_grace_period(),
    ));
    let journal = Arc::new(OperationJournal::new(Arc::clone(&db)));

    // A process-local store here would hold none of the writers' reservations.
    let mut tasks = Vec::new();
    if ledger.reservations_shared() {
        let fixed = ledger.recompute_reserved_bytes()?;
        if fixed > 0 {
            info!("Cleared stale reserved bytes on {} mailboxes", fixed);
        }
        tasks.push(spawn_reservation_sweeper(
            ledger.clone(),
            config.sweep_interval(),
        ));
    } else {
        warn!(
            "shared_reservations is off; reservation sweep and reserved-bytes repair \
             are left to the processes that own the reservations"
        );
    }

    tasks.push(spawn_periodic(
        "orphan-cleanup",
        config.orphan_cleanup_interval(),
        move || dedup.cleanup_orphans(),
    ));

    let stale_after = config.journal_stale_after();
    let reconcile_ledger = ledger.clone();
    tasks.push(spawn_periodic(
        "journal-reconcile",
        config.journal_reconcile_interval(),
        move || journal.reconcile(&*blobs, &*reconcile_ledger, Utc::now() - stale_after),
    ));

    info!("storaged running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    for task in tasks {
        task.shutdown().await;
    }
    Ok(())
}
