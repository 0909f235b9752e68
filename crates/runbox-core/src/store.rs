//! Job store trait - the source of truth for job state.
//!
//! The claim primitive is the sole mutual-exclusion mechanism for "who owns
//! this job"; no other locking exists in the system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::JobId;
use crate::error::StoreResult;
use crate::job::{JobDescriptor, JobRecord, JobResult, JobStatus};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a fresh Pending record for a newly submitted job.
    async fn insert(&self, descriptor: JobDescriptor) -> StoreResult<()>;

    /// Fetch the record for a job.
    async fn get(&self, id: &JobId) -> StoreResult<JobRecord>;

    /// Atomically claim a job for `worker`. Succeeds only when the record is
    /// Pending with no claimant; increments the attempt count on success.
    /// Two concurrent claims for the same job never both succeed.
    async fn try_claim(&self, id: &JobId, worker: &str) -> StoreResult<bool>;

    /// Move a job to `status`, recording `result` for terminal states.
    /// Rejects non-monotonic moves. Re-finalizing with the same terminal
    /// status and result is a no-op, so finalize is idempotent.
    async fn transition(
        &self,
        id: &JobId,
        status: JobStatus,
        result: Option<JobResult>,
    ) -> StoreResult<()>;

    /// Request cooperative cancellation. Returns false when the job is
    /// already terminal and the request has no effect.
    async fn request_cancel(&self, id: &JobId) -> StoreResult<bool>;

    /// Whether cancellation has been requested for a job.
    async fn cancel_requested(&self, id: &JobId) -> StoreResult<bool>;

    /// Record the container id of the active attempt.
    async fn set_container(&self, id: &JobId, container_id: &str) -> StoreResult<()>;

    /// Clear the recorded container id after cleanup.
    async fn clear_container(&self, id: &JobId) -> StoreResult<()>;

    /// Records claimed before `now - (max_duration + margin)` that never
    /// reached a terminal status: candidates for crash recovery.
    async fn stale_claims(&self, now: DateTime<Utc>, margin: Duration)
    -> StoreResult<Vec<JobRecord>>;

    /// Reset a job to Pending for a fresh attempt, clearing the claim, the
    /// container metadata and any prior result. Used by the recovery sweep
    /// and by the worker's retry policy; attempt counts are preserved.
    async fn reset_for_retry(&self, id: &JobId) -> StoreResult<()>;
}
