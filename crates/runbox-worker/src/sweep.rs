//! Crash recovery: reclaim jobs whose worker died mid-attempt.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use runbox_core::Result;
use runbox_core::driver::{ContainerDriver, ContainerHandle};
use runbox_core::error::DriverError;
use runbox_core::queue::JobQueue;
use runbox_core::store::JobStore;

/// Periodically resets claimed-but-never-finalized jobs to Pending and
/// removes any orphaned container they left behind.
///
/// A worker that dies mid-attempt leaves a claimed record without a
/// terminal status; once the job's budget plus a safety margin has passed,
/// the claim is considered dead and the job is re-delivered.
pub struct RecoverySweep {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    driver: Arc<dyn ContainerDriver>,
    interval: Duration,
    margin: Duration,
    stop_grace: Duration,
}

impl RecoverySweep {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        driver: Arc<dyn ContainerDriver>,
        interval: Duration,
        margin: Duration,
        stop_grace: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            driver,
            interval,
            margin,
            stop_grace,
        }
    }

    /// Run the sweep loop.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Starting recovery sweep");
        loop {
            sleep(self.interval).await;
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(reclaimed) => info!(reclaimed, "Recovery sweep reclaimed jobs"),
                Err(e) => warn!(error = %e, "Recovery sweep failed"),
            }
        }
    }

    /// One pass: reclaim every stale claim. Returns how many were reset.
    pub async fn sweep_once(&self) -> Result<usize> {
        let stale = self.store.stale_claims(Utc::now(), self.margin).await?;
        let mut reclaimed = 0;

        for record in stale {
            let id = record.id();
            warn!(
                job_id = %id,
                claimed_by = ?record.claimed_by,
                status = ?record.status,
                "Reclaiming stale job"
            );

            if let Some(container_id) = &record.container_id {
                self.remove_orphan(container_id).await;
            }

            if let Err(e) = self.store.reset_for_retry(&id).await {
                warn!(job_id = %id, error = %e, "Failed to reset stale job");
                continue;
            }
            if let Err(e) = self.queue.push(record.descriptor.clone()).await {
                warn!(job_id = %id, error = %e, "Failed to re-enqueue stale job");
                continue;
            }
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    /// Best-effort removal of a container the dead worker left behind.
    async fn remove_orphan(&self, container_id: &str) {
        let handle = ContainerHandle {
            id: container_id.to_string(),
        };
        match self.driver.inspect(&handle).await {
            Err(DriverError::NotFound(_)) => return,
            Ok(state) if state.running => {
                info!(container = %container_id, "Stopping orphaned container");
                if let Err(e) = self.driver.stop(&handle, self.stop_grace).await {
                    warn!(container = %container_id, error = %e, "Failed to stop orphan");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(container = %container_id, error = %e, "Failed to inspect orphan");
            }
        }
        if let Err(e) = self.driver.remove(&handle).await {
            warn!(container = %container_id, error = %e, "Failed to remove orphan");
        }
    }
}
