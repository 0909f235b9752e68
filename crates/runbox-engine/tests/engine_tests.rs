//! Engine lifecycle tests against a scripted container driver and a fake
//! checkout client.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use runbox_core::JobId;
use runbox_core::driver::{
    ContainerDriver, ContainerHandle, ContainerState, OutputLine, OutputStream,
};
use runbox_core::error::{CheckoutError, DriverError, DriverResult};
use runbox_core::job::{JobDescriptor, JobStatus, RepoLocator, SandboxSpec};
use runbox_core::store::JobStore;
use runbox_core::vcs::{VcsClient, WorkingTree};
use runbox_engine::{EngineConfig, JobEngine, MemoryJobStore};

#[derive(Default)]
struct Calls {
    create: usize,
    start: usize,
    stop: usize,
    remove: usize,
}

#[derive(Clone, Copy)]
enum ExitBehavior {
    Exit(i64),
    Never,
}

struct MockDriver {
    fail_create: bool,
    exit: ExitBehavior,
    output: Vec<OutputLine>,
    calls: Mutex<Calls>,
}

impl MockDriver {
    fn exiting(code: i64, stdout: &str) -> Self {
        Self {
            fail_create: false,
            exit: ExitBehavior::Exit(code),
            output: vec![OutputLine {
                stream: OutputStream::Stdout,
                content: stdout.to_string(),
            }],
            calls: Mutex::new(Calls::default()),
        }
    }

    fn hanging() -> Self {
        Self {
            fail_create: false,
            exit: ExitBehavior::Never,
            output: vec![],
            calls: Mutex::new(Calls::default()),
        }
    }

    fn failing_create() -> Self {
        Self {
            fail_create: true,
            exit: ExitBehavior::Exit(0),
            output: vec![],
            calls: Mutex::new(Calls::default()),
        }
    }

    fn counts(&self) -> (usize, usize, usize, usize) {
        let calls = self.calls.lock().unwrap();
        (calls.create, calls.start, calls.stop, calls.remove)
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn create(&self, name: &str, _spec: &SandboxSpec) -> DriverResult<ContainerHandle> {
        self.calls.lock().unwrap().create += 1;
        if self.fail_create {
            return Err(DriverError::ResourceUnavailable(
                "image unavailable".to_string(),
            ));
        }
        Ok(ContainerHandle {
            id: format!("mock-{name}"),
        })
    }

    async fn start(&self, _handle: &ContainerHandle) -> DriverResult<()> {
        self.calls.lock().unwrap().start += 1;
        Ok(())
    }

    async fn attach_output(
        &self,
        _handle: &ContainerHandle,
    ) -> DriverResult<BoxStream<'static, OutputLine>> {
        Ok(Box::pin(tokio_stream::iter(self.output.clone())))
    }

    async fn wait(&self, _handle: &ContainerHandle, deadline: Duration) -> DriverResult<i64> {
        match self.exit {
            ExitBehavior::Exit(code) => Ok(code),
            ExitBehavior::Never => {
                tokio::time::sleep(deadline).await;
                Err(DriverError::DeadlineExceeded)
            }
        }
    }

    async fn stop(&self, _handle: &ContainerHandle, _grace: Duration) -> DriverResult<()> {
        self.calls.lock().unwrap().stop += 1;
        Ok(())
    }

    async fn remove(&self, _handle: &ContainerHandle) -> DriverResult<()> {
        self.calls.lock().unwrap().remove += 1;
        Ok(())
    }

    async fn inspect(&self, _handle: &ContainerHandle) -> DriverResult<ContainerState> {
        Ok(ContainerState {
            running: false,
            exit_code: None,
        })
    }
}

struct FakeVcs {
    fail: Option<CheckoutError>,
}

impl FakeVcs {
    fn working() -> Self {
        Self { fail: None }
    }

    fn unknown_reference() -> Self {
        Self {
            fail: Some(CheckoutError::ReferenceNotFound(
                "couldn't find remote ref refs/heads/no-such-branch".to_string(),
            )),
        }
    }
}

#[async_trait]
impl VcsClient for FakeVcs {
    async fn checkout(
        &self,
        _locator: &RepoLocator,
        dest: &Path,
    ) -> Result<WorkingTree, CheckoutError> {
        if let Some(err) = &self.fail {
            return Err(match err {
                CheckoutError::Network(m) => CheckoutError::Network(m.clone()),
                CheckoutError::ReferenceNotFound(m) => CheckoutError::ReferenceNotFound(m.clone()),
                CheckoutError::Io(e) => CheckoutError::Io(std::io::Error::new(e.kind(), e.to_string())),
            });
        }
        tokio::fs::create_dir_all(dest).await?;
        tokio::fs::write(dest.join("README.md"), b"fixture").await?;
        Ok(WorkingTree {
            path: dest.to_path_buf(),
            commit: "abc123".to_string(),
        })
    }
}

fn descriptor(max_duration: Duration) -> JobDescriptor {
    JobDescriptor {
        id: JobId::new(),
        repo: RepoLocator {
            url: "https://github.com/example/example.git".to_string(),
            reference: "main".to_string(),
        },
        sandbox: SandboxSpec::new(
            "alpine:latest",
            vec!["echo".to_string(), "hello".to_string()],
        ),
        submitted_at: Utc::now(),
        max_duration,
    }
}

fn test_work_dir() -> PathBuf {
    std::env::temp_dir().join(format!("runbox-engine-test-{}", uuid::Uuid::now_v7()))
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        work_dir: test_work_dir(),
        log_cap_bytes: 64 * 1024,
        stop_grace: Duration::from_millis(100),
        wait_tick: Duration::from_millis(10),
    }
}

struct Harness {
    engine: JobEngine,
    driver: Arc<MockDriver>,
    store: Arc<MemoryJobStore>,
}

fn harness(driver: MockDriver, vcs: FakeVcs) -> Harness {
    let driver = Arc::new(driver);
    let store = Arc::new(MemoryJobStore::new());
    let engine = JobEngine::new(
        driver.clone(),
        Arc::new(vcs),
        store.clone(),
        engine_config(),
    );
    Harness {
        engine,
        driver,
        store,
    }
}

async fn submit_and_claim(store: &MemoryJobStore, desc: &JobDescriptor) {
    store.insert(desc.clone()).await.unwrap();
    assert!(store.try_claim(&desc.id, "worker-1").await.unwrap());
}

#[tokio::test]
async fn test_successful_job_reaches_succeeded_with_logs() {
    let h = harness(MockDriver::exiting(0, "hello\n"), FakeVcs::working());
    let desc = descriptor(Duration::from_secs(30));
    submit_and_claim(&h.store, &desc).await;

    let result = h.engine.run(&desc).await.unwrap();

    assert_eq!(result.status, JobStatus::Succeeded);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.logs.stdout.contains("hello"));

    let record = h.store.get(&desc.id).await.unwrap();
    assert_eq!(record.status, JobStatus::Succeeded);
    assert!(record.finished_at.is_some());
    assert!(record.container_id.is_none(), "container metadata cleared");

    let (create, start, _stop, remove) = h.driver.counts();
    assert_eq!(create, 1);
    assert_eq!(start, 1);
    assert_eq!(remove, 1, "exactly one remove per provisioned attempt");
}

#[tokio::test]
async fn test_checkout_failure_never_creates_a_container() {
    let h = harness(MockDriver::exiting(0, ""), FakeVcs::unknown_reference());
    let desc = descriptor(Duration::from_secs(30));
    submit_and_claim(&h.store, &desc).await;

    let result = h.engine.run(&desc).await.unwrap();

    assert_eq!(result.status, JobStatus::Errored);
    let message = result.message.unwrap();
    assert!(message.contains("reference-not-found"), "{message}");

    let (create, _, _, remove) = h.driver.counts();
    assert_eq!(create, 0, "no container may exist for a failed checkout");
    assert_eq!(remove, 0);

    let record = h.store.get(&desc.id).await.unwrap();
    assert_eq!(record.status, JobStatus::Errored);
}

#[tokio::test]
async fn test_elapsed_budget_times_the_job_out() {
    let h = harness(MockDriver::hanging(), FakeVcs::working());
    let desc = descriptor(Duration::from_millis(50));
    submit_and_claim(&h.store, &desc).await;

    let result = h.engine.run(&desc).await.unwrap();

    assert_eq!(result.status, JobStatus::TimedOut);
    assert_ne!(result.status, JobStatus::Succeeded);
    assert!(result.exit_code.is_none());

    let (_, _, stop, remove) = h.driver.counts();
    assert!(stop >= 1, "timed-out container must be stopped");
    assert_eq!(remove, 1);

    let record = h.store.get(&desc.id).await.unwrap();
    assert_eq!(record.status, JobStatus::TimedOut);
}

#[tokio::test]
async fn test_nonzero_exit_is_failed_not_errored() {
    let h = harness(MockDriver::exiting(1, "boom\n"), FakeVcs::working());
    let desc = descriptor(Duration::from_secs(30));
    submit_and_claim(&h.store, &desc).await;

    let result = h.engine.run(&desc).await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.exit_code, Some(1));
    assert!(result.logs.stdout.contains("boom"));

    let (_, _, _, remove) = h.driver.counts();
    assert_eq!(remove, 1);
}

#[tokio::test]
async fn test_provisioning_failure_is_errored() {
    let h = harness(MockDriver::failing_create(), FakeVcs::working());
    let desc = descriptor(Duration::from_secs(30));
    submit_and_claim(&h.store, &desc).await;

    let result = h.engine.run(&desc).await.unwrap();

    assert_eq!(result.status, JobStatus::Errored);
    let message = result.message.unwrap();
    assert!(message.contains("provisioning failed"), "{message}");

    let (create, start, _, remove) = h.driver.counts();
    assert_eq!(create, 1);
    assert_eq!(start, 0);
    assert_eq!(remove, 0, "no handle was ever allocated");
}

#[tokio::test]
async fn test_cancel_before_provisioning_skips_the_container() {
    let h = harness(MockDriver::exiting(0, ""), FakeVcs::working());
    let desc = descriptor(Duration::from_secs(30));
    submit_and_claim(&h.store, &desc).await;
    h.store.request_cancel(&desc.id).await.unwrap();

    let result = h.engine.run(&desc).await.unwrap();

    assert_eq!(result.status, JobStatus::Cancelled);
    let (create, _, _, _) = h.driver.counts();
    assert_eq!(create, 0);
}

#[tokio::test]
async fn test_cancel_during_run_stops_the_container() {
    let h = harness(MockDriver::hanging(), FakeVcs::working());
    let desc = descriptor(Duration::from_secs(30));
    submit_and_claim(&h.store, &desc).await;

    let store = h.store.clone();
    let id = desc.id;
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.request_cancel(&id).await.unwrap();
    });

    let result = h.engine.run(&desc).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(result.status, JobStatus::Cancelled);
    let (_, _, stop, remove) = h.driver.counts();
    assert!(stop >= 1);
    assert_eq!(remove, 1);

    let record = h.store.get(&desc.id).await.unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_finalize_records_exactly_one_terminal_status() {
    let h = harness(MockDriver::exiting(0, "hello\n"), FakeVcs::working());
    let desc = descriptor(Duration::from_secs(30));
    submit_and_claim(&h.store, &desc).await;

    let result = h.engine.run(&desc).await.unwrap();
    assert_eq!(result.status, JobStatus::Succeeded);

    // Replaying the same terminal write is a no-op; a conflicting one fails.
    h.store
        .transition(&desc.id, JobStatus::Succeeded, Some(result.clone()))
        .await
        .unwrap();
    assert!(
        h.store
            .transition(&desc.id, JobStatus::Errored, None)
            .await
            .is_err()
    );
}
