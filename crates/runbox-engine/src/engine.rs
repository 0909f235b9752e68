//! The job execution engine: one attempt, checkout to terminal status.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use runbox_core::driver::{ContainerDriver, ContainerHandle};
use runbox_core::error::{DriverError, Result};
use runbox_core::job::{
    BindMount, CapturedLogs, JobDescriptor, JobResult, JobStatus, SandboxSpec, WORKSPACE_DIR,
};
use runbox_core::store::JobStore;
use runbox_core::vcs::{VcsClient, WorkingTree};
use runbox_core::JobId;

use crate::logs::LogCollector;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory working trees are checked out under.
    pub work_dir: PathBuf,
    /// Cap on captured container output, in bytes.
    pub log_cap_bytes: usize,
    /// Grace window between the stop signal and the forced kill.
    pub stop_grace: Duration,
    /// Slice length of one deadline-bounded wait call; cancellation is
    /// polled between slices.
    pub wait_tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("runbox-trees"),
            log_cap_bytes: 256 * 1024,
            stop_grace: Duration::from_secs(10),
            wait_tick: Duration::from_secs(1),
        }
    }
}

/// Name of the container backing one attempt.
pub fn container_name(id: &JobId, attempt: u32) -> String {
    format!("runbox-job-{id}-a{attempt}")
}

/// What one supervised attempt came to. Converted into a [`JobResult`] by
/// the finalize step.
struct Outcome {
    status: JobStatus,
    exit_code: Option<i64>,
    logs: CapturedLogs,
    message: Option<String>,
}

impl Outcome {
    fn errored(message: String, logs: CapturedLogs) -> Self {
        Self {
            status: JobStatus::Errored,
            exit_code: None,
            logs,
            message: Some(message),
        }
    }
}

/// Drives one claimed job attempt through the lifecycle state machine.
///
/// The engine performs no retries of its own; a failed attempt is reported
/// and the worker decides whether to re-enqueue a fresh one. Partial state
/// from a failed attempt is never reused.
pub struct JobEngine {
    driver: Arc<dyn ContainerDriver>,
    vcs: Arc<dyn VcsClient>,
    store: Arc<dyn JobStore>,
    config: EngineConfig,
}

impl JobEngine {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        vcs: Arc<dyn VcsClient>,
        store: Arc<dyn JobStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            driver,
            vcs,
            store,
            config,
        }
    }

    /// Run one attempt of a claimed job to a terminal status.
    ///
    /// Every exit path out of provisioning or later stops and removes the
    /// attempt's container exactly once; cleanup failures are logged and
    /// never flip the decided status.
    pub async fn run(&self, descriptor: &JobDescriptor) -> Result<JobResult> {
        let id = descriptor.id;
        let started = Instant::now();
        let attempt = self.store.get(&id).await?.attempt_count;

        self.store.transition(&id, JobStatus::Checkout, None).await?;

        let dest = self
            .config
            .work_dir
            .join(format!("{id}-a{attempt}"));

        let tree = match self.vcs.checkout(&descriptor.repo, &dest).await {
            Ok(tree) => tree,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Checkout failed");
                let message = format!("checkout failed ({}): {e}", e.kind());
                return self
                    .finalize(descriptor, started, Outcome::errored(message, CapturedLogs::default()))
                    .await;
            }
        };
        info!(job_id = %id, commit = %tree.commit, "Checked out working tree");

        // Poll point: after checkout, before provisioning.
        if self.store.cancel_requested(&id).await? {
            self.cleanup_tree(&dest).await;
            let outcome = Outcome {
                status: JobStatus::Cancelled,
                exit_code: None,
                logs: CapturedLogs::default(),
                message: Some("cancelled before provisioning".to_string()),
            };
            return self.finalize(descriptor, started, outcome).await;
        }

        self.store
            .transition(&id, JobStatus::Provisioning, None)
            .await?;

        let spec = sandbox_with_workspace(&descriptor.sandbox, &tree);
        let handle = match self.driver.create(&container_name(&id, attempt), &spec).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Provisioning failed");
                self.cleanup_tree(&dest).await;
                let message = format!("provisioning failed: {e}");
                return self
                    .finalize(descriptor, started, Outcome::errored(message, CapturedLogs::default()))
                    .await;
            }
        };
        if let Err(e) = self.store.set_container(&id, &handle.id).await {
            self.cleanup_container(&id, &handle).await;
            self.cleanup_tree(&dest).await;
            return self
                .finalize(
                    descriptor,
                    started,
                    Outcome::errored(format!("store fault: {e}"), CapturedLogs::default()),
                )
                .await;
        }

        let outcome = self.supervise(descriptor, &handle).await;

        self.cleanup_container(&id, &handle).await;
        self.cleanup_tree(&dest).await;
        self.finalize(descriptor, started, outcome).await
    }

    /// Start the container and supervise it to an outcome. Never leaves the
    /// container unaccounted for; the caller performs cleanup.
    async fn supervise(&self, descriptor: &JobDescriptor, handle: &ContainerHandle) -> Outcome {
        let id = descriptor.id;

        if let Err(e) = self.driver.start(handle).await {
            return Outcome::errored(
                format!("failed to start container: {e}"),
                CapturedLogs::default(),
            );
        }
        if let Err(e) = self.store.transition(&id, JobStatus::Running, None).await {
            return Outcome::errored(format!("store fault: {e}"), CapturedLogs::default());
        }

        let collector = match self.driver.attach_output(handle).await {
            Ok(stream) => LogCollector::collect(stream, self.config.log_cap_bytes),
            Err(e) => {
                return Outcome::errored(
                    format!("failed to attach output: {e}"),
                    CapturedLogs::default(),
                );
            }
        };

        let run_started = Instant::now();
        loop {
            // Deadline first, then the cancel flag: whichever condition is
            // observed first on a tick decides the terminal status.
            let elapsed = run_started.elapsed();
            if elapsed >= descriptor.max_duration {
                return self
                    .interrupt(
                        handle,
                        collector,
                        JobStatus::TimedOut,
                        format!(
                            "max duration of {}s elapsed",
                            descriptor.max_duration.as_secs()
                        ),
                    )
                    .await;
            }

            match self.store.cancel_requested(&id).await {
                Ok(true) => {
                    return self
                        .interrupt(
                            handle,
                            collector,
                            JobStatus::Cancelled,
                            "cancelled by request".to_string(),
                        )
                        .await;
                }
                Ok(false) => {}
                Err(e) => {
                    let logs = collector.finish().await;
                    return Outcome::errored(format!("store fault: {e}"), logs);
                }
            }

            let slice = self.config.wait_tick.min(descriptor.max_duration - elapsed);
            match self.driver.wait(handle, slice).await {
                Ok(exit_code) => {
                    if let Err(e) = self
                        .store
                        .transition(&id, JobStatus::Collecting, None)
                        .await
                    {
                        let logs = collector.finish().await;
                        return Outcome::errored(format!("store fault: {e}"), logs);
                    }
                    let logs = collector.finish().await;
                    let status = if exit_code == 0 {
                        JobStatus::Succeeded
                    } else {
                        JobStatus::Failed
                    };
                    return Outcome {
                        status,
                        exit_code: Some(exit_code),
                        logs,
                        message: None,
                    };
                }
                Err(DriverError::DeadlineExceeded) => continue,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Driver fault while supervising");
                    let logs = collector.finish().await;
                    return Outcome::errored(format!("engine fault while running: {e}"), logs);
                }
            }
        }
    }

    /// Stop a still-running container for a timeout or a cancellation and
    /// collect whatever output it produced.
    async fn interrupt(
        &self,
        handle: &ContainerHandle,
        collector: LogCollector,
        status: JobStatus,
        message: String,
    ) -> Outcome {
        if let Err(e) = self.driver.stop(handle, self.config.stop_grace).await {
            warn!(container = %handle.id, error = %e, "Failed to stop container");
        }
        let logs = collector.finish().await;
        Outcome {
            status,
            exit_code: None,
            logs,
            message: Some(message),
        }
    }

    /// Unconditional container cleanup: stop if still running, then remove.
    /// Best-effort; failures are logged and never escalated.
    async fn cleanup_container(&self, id: &JobId, handle: &ContainerHandle) {
        match self.driver.inspect(handle).await {
            Ok(state) if state.running => {
                if let Err(e) = self.driver.stop(handle, self.config.stop_grace).await {
                    warn!(container = %handle.id, error = %e, "Cleanup stop failed");
                }
            }
            Ok(_) | Err(DriverError::NotFound(_)) => {}
            Err(e) => {
                warn!(container = %handle.id, error = %e, "Cleanup inspect failed");
            }
        }
        if let Err(e) = self.driver.remove(handle).await {
            warn!(container = %handle.id, error = %e, "Cleanup remove failed");
        }
        if let Err(e) = self.store.clear_container(id).await {
            warn!(job_id = %id, error = %e, "Failed to clear container metadata");
        }
    }

    async fn cleanup_tree(&self, dest: &Path) {
        if !dest.exists() {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(dest).await {
            warn!(path = %dest.display(), error = %e, "Failed to remove working tree");
        }
    }

    /// Record the terminal state. The store's monotonic-transition guard
    /// keeps the first recorded terminal status authoritative.
    async fn finalize(
        &self,
        descriptor: &JobDescriptor,
        started: Instant,
        outcome: Outcome,
    ) -> Result<JobResult> {
        let result = JobResult {
            status: outcome.status,
            exit_code: outcome.exit_code,
            logs: outcome.logs,
            duration_ms: started.elapsed().as_millis() as u64,
            message: outcome.message,
        };
        self.store
            .transition(&descriptor.id, outcome.status, Some(result.clone()))
            .await?;
        info!(
            job_id = %descriptor.id,
            status = ?result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "Job attempt finished"
        );
        Ok(result)
    }
}

/// The job's sandbox spec plus the working-tree mount, read-only unless the
/// spec demands otherwise, with the workspace as the default working dir.
fn sandbox_with_workspace(sandbox: &SandboxSpec, tree: &WorkingTree) -> SandboxSpec {
    let mut spec = sandbox.clone();
    spec.mounts.insert(
        0,
        BindMount {
            source: tree.path.to_string_lossy().to_string(),
            target: WORKSPACE_DIR.to_string(),
            read_only: !sandbox.workspace_writable,
        },
    );
    if spec.working_dir.is_none() {
        spec.working_dir = Some(WORKSPACE_DIR.to_string());
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use runbox_core::job::{NetworkMode, SandboxSpec};

    #[test]
    fn test_container_name_is_deterministic_per_attempt() {
        let id = JobId::new();
        assert_eq!(container_name(&id, 1), container_name(&id, 1));
        assert_ne!(container_name(&id, 1), container_name(&id, 2));
        assert!(container_name(&id, 1).starts_with("runbox-job-"));
    }

    #[test]
    fn test_workspace_mount_defaults_to_read_only() {
        let sandbox = SandboxSpec::new("alpine:latest", vec!["true".to_string()]);
        let tree = WorkingTree {
            path: "/tmp/tree".into(),
            commit: "abc123".to_string(),
        };
        let spec = sandbox_with_workspace(&sandbox, &tree);
        assert_eq!(spec.mounts[0].source, "/tmp/tree");
        assert_eq!(spec.mounts[0].target, WORKSPACE_DIR);
        assert!(spec.mounts[0].read_only);
        assert_eq!(spec.working_dir.as_deref(), Some(WORKSPACE_DIR));
        assert_eq!(spec.network, NetworkMode::None);
    }

    #[test]
    fn test_workspace_mount_honors_writable_spec() {
        let mut sandbox = SandboxSpec::new("alpine:latest", vec!["true".to_string()]);
        sandbox.workspace_writable = true;
        sandbox.working_dir = Some("/src".to_string());
        let tree = WorkingTree {
            path: "/tmp/tree".into(),
            commit: "abc123".to_string(),
        };
        let spec = sandbox_with_workspace(&sandbox, &tree);
        assert!(!spec.mounts[0].read_only);
        assert_eq!(spec.working_dir.as_deref(), Some("/src"));
    }
}
