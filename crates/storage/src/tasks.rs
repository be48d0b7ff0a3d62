//! Background maintenance loops on the tokio runtime
//!
//! Each job is a blocking call into the ledger, registry or journal, so it
//! runs on the blocking pool; the loop itself only waits on the interval
//! and the shutdown channel.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;

/// Handle to a running periodic job
pub struct TaskHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait for it to exit.
    ///
    /// A job already running is allowed to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!("Task {} ended abnormally: {}", self.name, e);
        }
        info!("Stopped task {}", self.name);
    }
}

/// Run `job` every `interval` until the returned handle is shut down or dropped.
///
/// The first run happens one interval after spawning. Errors are logged and
/// the loop keeps its schedule.
pub fn spawn_periodic<F, T>(name: &'static str, interval: Duration, job: F) -> TaskHandle
where
    F: Fn() -> Result<T> + Send + Sync + 'static,
    T: Debug + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let job = Arc::new(job);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let job = Arc::clone(&job);
                    match tokio::task::spawn_blocking(move || (*job)()).await {
                        Ok(Ok(outcome)) => debug!("Task {} finished: {:?}", name, outcome),
                        Ok(Err(e)) => error!("Task {} failed: {}", name, e),
                        Err(e) => error!("Task {} panicked: {}", name, e),
                    }
                }
            }
        }
    });

    info!("Started task {} (every {:?})", name, interval);
    TaskHandle {
        name,
        shutdown_tx,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = spawn_periodic("counter", Duration::from_millis(10), move || {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several runs, saw {seen}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_loop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = spawn_periodic("flaky", Duration::from_millis(10), move || -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(crate::StorageError::invalid("boom"))
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        handle.shutdown().await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
