//! Worker that processes jobs from the queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use runbox_core::error::StoreError;
use runbox_core::job::{JobDescriptor, JobResult, JobStatus};
use runbox_core::queue::{Delivery, JobQueue};
use runbox_core::store::JobStore;
use runbox_engine::JobEngine;

/// A worker that claims and executes jobs, one at a time.
///
/// The queue entry is acknowledged only after the engine reached a terminal
/// state and the store recorded it, so a crash-interrupted job is
/// redelivered and safely reclaimed. Multiple workers run as independent
/// consumers of the same queue and store.
pub struct Worker {
    id: String,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    engine: Arc<JobEngine>,
    /// Ceiling on claims per job; errored attempts are re-enqueued below it.
    max_attempts: u32,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStore>,
        engine: Arc<JobEngine>,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            store,
            engine,
            max_attempts,
        }
    }

    /// Run the worker loop.
    pub async fn run(&self) {
        info!(worker_id = %self.id, "Starting worker");

        loop {
            match self.queue.pop().await {
                Ok(delivery) => self.process(delivery).await,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to pop from queue");
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let id = delivery.descriptor.id;

        match self.store.try_claim(&id, &self.id).await {
            Ok(true) => {
                info!(worker_id = %self.id, job_id = %id, "Claimed job");
                match self.engine.run(&delivery.descriptor).await {
                    Ok(result) => self.maybe_retry(&delivery.descriptor, &result).await,
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "Engine fault");
                    }
                }
            }
            Ok(false) => {
                // Redelivered descriptor for a job that is claimed or done.
                debug!(job_id = %id, "Dropping redelivered descriptor");
            }
            Err(StoreError::NotFound(_)) => {
                warn!(job_id = %id, "Delivered descriptor has no record");
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Claim failed");
            }
        }

        if let Err(e) = self.queue.ack(&delivery).await {
            warn!(job_id = %id, error = %e, "Failed to ack delivery");
        }
    }

    /// Re-enqueue a fresh attempt for retry-eligible outcomes. Errored is
    /// the only one: a Failed job would fail again on unchanged input, and
    /// TimedOut would exhaust the same budget again.
    async fn maybe_retry(&self, descriptor: &JobDescriptor, result: &JobResult) {
        if result.status != JobStatus::Errored {
            return;
        }
        let record = match self.store.get(&descriptor.id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(job_id = %descriptor.id, error = %e, "Cannot read record for retry");
                return;
            }
        };
        if record.attempt_count >= self.max_attempts {
            info!(
                job_id = %descriptor.id,
                attempts = record.attempt_count,
                "Giving up after errored attempt"
            );
            return;
        }
        info!(
            job_id = %descriptor.id,
            attempt = record.attempt_count,
            "Re-enqueueing errored job"
        );
        if let Err(e) = self.store.reset_for_retry(&descriptor.id).await {
            warn!(job_id = %descriptor.id, error = %e, "Failed to reset job for retry");
            return;
        }
        if let Err(e) = self.queue.push(descriptor.clone()).await {
            warn!(job_id = %descriptor.id, error = %e, "Failed to re-enqueue job");
        }
    }
}
