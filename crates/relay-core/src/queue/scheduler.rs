//! Delayed-job promotion and stalled-job recovery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::memory::InMemoryJobQueue;

/// Background scheduler for an in-memory queue.
///
/// Each tick moves delayed jobs back to the waiting queue once their backoff
/// has elapsed and reclaims stalled active jobs whose worker died mid-flight.
/// At least one scheduler must run for retries to make progress; running
/// several is harmless because both operations are idempotent under the
/// queue lock.
pub struct QueueScheduler {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl QueueScheduler {
    pub fn spawn(queue: Arc<InMemoryJobQueue>, tick: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => continue,
                    _ = tokio::time::sleep(tick) => {}
                }

                let promoted = queue.promote_due_jobs().await;
                let reclaimed = queue.requeue_stalled_jobs().await;
                if promoted > 0 || reclaimed > 0 {
                    debug!(promoted, reclaimed, "scheduler tick");
                }
            }
        });

        Self { shutdown_tx, join }
    }

    /// Request shutdown without waiting for the loop to exit.
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already have exited
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for the scheduler task.
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}
