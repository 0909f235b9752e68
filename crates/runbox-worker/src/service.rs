//! Submission surface: the inbound interface to the runner.
//!
//! Validates requests up front, records a Pending job, and enqueues its
//! descriptor. Transport (HTTP or otherwise) lives outside this crate and
//! calls straight into this service.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use runbox_core::error::{Error, Result};
use runbox_core::job::{JobDescriptor, JobRecord, RepoLocator, SandboxSpec};
use runbox_core::queue::JobQueue;
use runbox_core::store::JobStore;
use runbox_core::JobId;
use runbox_git::validate_repo_url;

pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    allowed_hosts: Vec<String>,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        allowed_hosts: Vec<String>,
    ) -> Self {
        Self {
            store,
            queue,
            allowed_hosts,
        }
    }

    /// Accept a job: validate, record as Pending, enqueue.
    pub async fn submit(
        &self,
        repo: RepoLocator,
        sandbox: SandboxSpec,
        max_duration: Duration,
    ) -> Result<JobId> {
        validate_repo_url(&repo.url, &self.allowed_hosts)
            .map_err(|e| Error::InvalidInput(format!("repository URL: {e}")))?;
        if repo.reference.trim().is_empty() {
            return Err(Error::InvalidInput("reference must not be empty".to_string()));
        }
        if sandbox.image.trim().is_empty() {
            return Err(Error::InvalidInput("image must not be empty".to_string()));
        }
        if sandbox.command.is_empty() {
            return Err(Error::InvalidInput("command must not be empty".to_string()));
        }
        if max_duration.is_zero() {
            return Err(Error::InvalidInput("max duration must be positive".to_string()));
        }

        let descriptor = JobDescriptor {
            id: JobId::new(),
            repo,
            sandbox,
            submitted_at: Utc::now(),
            max_duration,
        };
        let id = descriptor.id;

        self.store.insert(descriptor.clone()).await?;
        self.queue.push(descriptor).await?;

        info!(job_id = %id, "Job submitted");
        Ok(id)
    }

    /// Current view of a job: status, timestamps, result once terminal.
    pub async fn status(&self, id: &JobId) -> Result<JobRecord> {
        Ok(self.store.get(id).await?)
    }

    /// Best-effort cancellation. Returns false when the job was already
    /// terminal and the request had no effect.
    pub async fn cancel(&self, id: &JobId) -> Result<bool> {
        let accepted = self.store.request_cancel(id).await?;
        info!(job_id = %id, accepted, "Cancellation requested");
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runbox_core::job::JobStatus;
    use runbox_engine::{MemoryJobQueue, MemoryJobStore};

    fn service() -> (JobService, Arc<MemoryJobStore>, Arc<MemoryJobQueue>) {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let service = JobService::new(
            store.clone(),
            queue.clone(),
            vec!["github.com".to_string()],
        );
        (service, store, queue)
    }

    fn locator() -> RepoLocator {
        RepoLocator {
            url: "https://github.com/example/example.git".to_string(),
            reference: "main".to_string(),
        }
    }

    fn sandbox() -> SandboxSpec {
        SandboxSpec::new("alpine:latest", vec!["true".to_string()])
    }

    #[tokio::test]
    async fn test_submit_records_and_enqueues() {
        let (service, store, queue) = service();

        let id = service
            .submit(locator(), sandbox(), Duration::from_secs(30))
            .await
            .unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempt_count, 0);
        assert_eq!(queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_input() {
        let (service, _, queue) = service();

        let mut off_list = locator();
        off_list.url = "https://evil.example.com/a/b".to_string();
        assert!(
            service
                .submit(off_list, sandbox(), Duration::from_secs(30))
                .await
                .is_err()
        );

        let mut no_reference = locator();
        no_reference.reference = " ".to_string();
        assert!(
            service
                .submit(no_reference, sandbox(), Duration::from_secs(30))
                .await
                .is_err()
        );

        let mut no_command = sandbox();
        no_command.command.clear();
        assert!(
            service
                .submit(locator(), no_command, Duration::from_secs(30))
                .await
                .is_err()
        );

        assert!(
            service
                .submit(locator(), sandbox(), Duration::ZERO)
                .await
                .is_err()
        );

        assert_eq!(queue.ready_len().await, 0, "rejected jobs are never queued");
    }

    #[tokio::test]
    async fn test_cancel_is_best_effort() {
        let (service, store, _) = service();
        let id = service
            .submit(locator(), sandbox(), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(service.cancel(&id).await.unwrap());
        assert!(store.cancel_requested(&id).await.unwrap());

        assert!(service.cancel(&JobId::new()).await.is_err());
    }
}
