//! Background workers that drive the scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Kernel;

/// Pause after a failed tick before trying again.
const RETRY_DELAY: Duration = Duration::from_millis(500);

impl Kernel {
    /// Spawn `count` workers looping on [`Kernel::tick`].
    ///
    /// Each worker runs one agent at a time; ledger appends stay serialized by
    /// the ledger itself. Idle workers sleep until a submission wakes them.
    /// Workers exit once `shutdown` fires.
    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let kernel = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { kernel.worker_loop(worker, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, shutdown: CancellationToken) {
        tracing::debug!(worker, "Kernel worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.tick().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.work.notified() => {}
                    }
                }
                Err(e) => {
                    tracing::error!(worker, "Kernel tick failed: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
        tracing::debug!(worker, "Kernel worker stopped");
    }
}
