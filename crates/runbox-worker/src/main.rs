//! Runbox worker daemon and one-shot runner.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

use runbox_core::driver::ContainerDriver;
use runbox_core::job::{RepoLocator, SandboxSpec};
use runbox_core::queue::JobQueue;
use runbox_core::store::JobStore;
use runbox_core::vcs::VcsClient;
use runbox_docker::DockerDriver;
use runbox_engine::{JobEngine, MemoryJobQueue, MemoryJobStore};
use runbox_git::GitClient;
use runbox_worker::{JobService, RecoverySweep, Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "runbox", about = "Sandboxed repository job runner", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: WorkerConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker daemon.
    Serve,
    /// Submit one job, wait for it, and print the result.
    Run {
        /// Repository URL
        #[arg(long)]
        repo: String,
        /// Branch, tag or commit to check out
        #[arg(long, default_value = "main")]
        reference: String,
        /// Container image for the sandbox
        #[arg(long, default_value = "alpine:latest")]
        image: String,
        /// Seconds the job may run
        #[arg(long, default_value = "300")]
        max_duration_secs: u64,
        /// Mount the working tree read-write
        #[arg(long)]
        writable: bool,
        /// Command to run in the sandbox
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
}

struct Runtime {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    driver: Arc<dyn ContainerDriver>,
    engine: Arc<JobEngine>,
}

fn wire(config: &WorkerConfig) -> anyhow::Result<Runtime> {
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
    let driver: Arc<dyn ContainerDriver> = Arc::new(DockerDriver::new()?);
    let vcs: Arc<dyn VcsClient> = Arc::new(GitClient::new());
    let engine = Arc::new(JobEngine::new(
        driver.clone(),
        vcs,
        store.clone(),
        config.engine_config(),
    ));
    Ok(Runtime {
        store,
        queue,
        driver,
        engine,
    })
}

fn spawn_workers(config: &WorkerConfig, runtime: &Runtime) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for n in 0..config.workers {
        let worker = Worker::new(
            format!("worker-{n}"),
            runtime.queue.clone(),
            runtime.store.clone(),
            runtime.engine.clone(),
            config.max_attempts,
        );
        handles.push(tokio::spawn(async move { worker.run().await }));
    }

    let sweep = RecoverySweep::new(
        runtime.store.clone(),
        runtime.queue.clone(),
        runtime.driver.clone(),
        config.sweep_interval(),
        config.sweep_margin(),
        config.stop_grace(),
    );
    handles.push(tokio::spawn(async move { sweep.run().await }));
    handles
}

async fn serve(config: WorkerConfig) -> anyhow::Result<()> {
    let runtime = wire(&config)?;
    info!(workers = config.workers, "Starting runbox");
    let handles = spawn_workers(&config, &runtime);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_once(
    config: WorkerConfig,
    repo: String,
    reference: String,
    image: String,
    max_duration_secs: u64,
    writable: bool,
    command: Vec<String>,
) -> anyhow::Result<()> {
    let runtime = wire(&config)?;
    let handles = spawn_workers(&config, &runtime);

    let service = JobService::new(
        runtime.store.clone(),
        runtime.queue.clone(),
        config.allowed_hosts.clone(),
    );

    let mut sandbox = SandboxSpec::new(image, command);
    sandbox.workspace_writable = writable;

    let id = service
        .submit(
            RepoLocator {
                url: repo,
                reference,
            },
            sandbox,
            Duration::from_secs(max_duration_secs),
        )
        .await?;

    let record = loop {
        let record = service.status(&id).await?;
        if record.status.is_terminal() {
            break record;
        }
        sleep(Duration::from_millis(200)).await;
    };

    for handle in handles {
        handle.abort();
    }

    println!("{}", serde_json::to_string_pretty(&record)?);
    if record.status != runbox_core::job::JobStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve(cli.config).await,
        Commands::Run {
            repo,
            reference,
            image,
            max_duration_secs,
            writable,
            command,
        } => {
            run_once(
                cli.config,
                repo,
                reference,
                image,
                max_duration_secs,
                writable,
                command,
            )
            .await
        }
    }
}
