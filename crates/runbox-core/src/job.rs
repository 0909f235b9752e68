//! Job descriptors, records, statuses and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::JobId;

/// Mount path of the checked-out working tree inside the container.
pub const WORKSPACE_DIR: &str = "/workspace";

/// A repository plus the reference to check out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoLocator {
    /// Clone URL of the repository.
    pub url: String,
    /// Branch, tag or commit to check out. Must resolve to a single commit.
    pub reference: String,
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Host path.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// Resource caps applied to the sandbox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory cap in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU cap in units of 1e-9 cores.
    pub nano_cpus: Option<i64>,
}

impl Default for ResourceLimits {
    /// Hardened defaults: 512 MiB of memory and half a CPU.
    fn default() -> Self {
        Self {
            memory_bytes: Some(512 * 1024 * 1024),
            nano_cpus: Some(500_000_000),
        }
    }
}

/// Network policy for the sandbox container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network access. The default.
    None,
    /// Engine-managed bridge network.
    Bridge,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
        }
    }
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::None
    }
}

/// How a job's container must be provisioned. Pure value, no identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Container image to run.
    pub image: String,
    /// Command to execute, as an argv vector. Never interpolated into a
    /// shell string by the runner.
    pub command: Vec<String>,
    /// Additional bind mounts, in order. The working tree mount is added by
    /// the engine and is not listed here.
    pub mounts: Vec<BindMount>,
    /// Resource caps.
    pub limits: ResourceLimits,
    /// Network policy.
    pub network: NetworkMode,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Working directory inside the container. Defaults to the workspace.
    pub working_dir: Option<String>,
    /// Mount the working tree read-write instead of read-only.
    pub workspace_writable: bool,
}

impl SandboxSpec {
    /// A spec that runs `command` in `image` with default hardening.
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            command,
            mounts: Vec::new(),
            limits: ResourceLimits::default(),
            network: NetworkMode::default(),
            env: HashMap::new(),
            working_dir: None,
            workspace_writable: false,
        }
    }
}

/// Immutable input describing one job. Created at submission, consumed by
/// the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub repo: RepoLocator,
    pub sandbox: SandboxSpec,
    pub submitted_at: DateTime<Utc>,
    /// Wall-clock budget for one attempt.
    pub max_duration: Duration,
}

/// Lifecycle status of a job attempt.
///
/// `Pending -> Checkout -> Provisioning -> Running -> Collecting` followed by
/// exactly one of the terminal states. Transitions are monotonic; a terminal
/// status never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Checkout,
    Provisioning,
    Running,
    Collecting,
    Succeeded,
    Failed,
    Errored,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded
                | JobStatus::Failed
                | JobStatus::Errored
                | JobStatus::TimedOut
                | JobStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// Errored is reachable from every non-terminal state (unhandled faults
    /// are classified, not dropped). Cancelled is reachable from every
    /// non-terminal state because cancellation is polled cooperatively.
    pub fn can_transition(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, JobStatus::Errored) | (_, JobStatus::Cancelled) => true,
            (JobStatus::Pending, JobStatus::Checkout) => true,
            (JobStatus::Checkout, JobStatus::Provisioning) => true,
            (JobStatus::Provisioning, JobStatus::Running) => true,
            (JobStatus::Running, JobStatus::Collecting) => true,
            (JobStatus::Running, JobStatus::TimedOut) => true,
            (JobStatus::Collecting, JobStatus::Succeeded) => true,
            (JobStatus::Collecting, JobStatus::Failed) => true,
            _ => false,
        }
    }
}

/// Captured container output, bounded by the engine's log cap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedLogs {
    pub stdout: String,
    pub stderr: String,
    /// Set when output exceeded the cap and was cut off. The affected
    /// stream ends with [`CapturedLogs::TRUNCATION_MARKER`].
    pub truncated: bool,
}

impl CapturedLogs {
    pub const TRUNCATION_MARKER: &'static str = "\n[output truncated]";

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Outcome of a completed attempt. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Terminal status the attempt reached.
    pub status: JobStatus,
    /// Exit code of the job's own process, when it ran to an exit.
    pub exit_code: Option<i64>,
    /// Captured stdout/stderr, possibly truncated.
    pub logs: CapturedLogs,
    /// Wall-clock duration of the attempt.
    pub duration_ms: u64,
    /// Failure classification detail for Errored/TimedOut/Cancelled.
    pub message: Option<String>,
}

/// Mutable record of a job, keyed by [`JobId`] and owned by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub descriptor: JobDescriptor,
    pub status: JobStatus,
    /// Worker identity holding the current claim.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of claims taken for this job, across retries.
    pub attempt_count: u32,
    /// Cooperative cancellation flag, observed at the engine's poll points.
    pub cancel_requested: bool,
    /// Engine-side container id of the active attempt, for the recovery
    /// sweep's orphan cross-reference. Cleared on cleanup.
    pub container_id: Option<String>,
    /// Outcome of the last completed attempt. None until terminal.
    pub result: Option<JobResult>,
}

impl JobRecord {
    /// A fresh record for a newly submitted job.
    pub fn new(descriptor: JobDescriptor) -> Self {
        Self {
            descriptor,
            status: JobStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            started_at: None,
            finished_at: None,
            attempt_count: 0,
            cancel_requested: false,
            container_id: None,
            result: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.descriptor.id
    }
}
