//! Worker configuration, from flags and environment.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use runbox_engine::EngineConfig;

#[derive(Parser, Debug, Clone)]
pub struct WorkerConfig {
    /// Directory working trees are checked out under.
    #[arg(long, env = "RUNBOX_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Number of worker slots; each processes one job at a time.
    #[arg(long, env = "RUNBOX_WORKERS", default_value = "2")]
    pub workers: usize,

    /// Claims allowed per job; errored attempts are retried below this.
    #[arg(long, env = "RUNBOX_MAX_ATTEMPTS", default_value = "3")]
    pub max_attempts: u32,

    /// Cap on captured container output, in bytes.
    #[arg(long, env = "RUNBOX_LOG_CAP_BYTES", default_value = "262144")]
    pub log_cap_bytes: usize,

    /// Seconds between the stop signal and the forced kill.
    #[arg(long, env = "RUNBOX_STOP_GRACE_SECS", default_value = "10")]
    pub stop_grace_secs: u64,

    /// Seconds between recovery sweeps.
    #[arg(long, env = "RUNBOX_SWEEP_INTERVAL_SECS", default_value = "30")]
    pub sweep_interval_secs: u64,

    /// Safety margin in seconds on top of a job's budget before its claim
    /// counts as stale.
    #[arg(long, env = "RUNBOX_SWEEP_MARGIN_SECS", default_value = "60")]
    pub sweep_margin_secs: u64,

    /// Repository hosts accepted at submission.
    #[arg(
        long,
        env = "RUNBOX_ALLOWED_HOSTS",
        default_value = "github.com,gitlab.com,bitbucket.org",
        value_delimiter = ','
    )]
    pub allowed_hosts: Vec<String>,
}

impl WorkerConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("runbox-trees"))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn sweep_margin(&self) -> Duration {
        Duration::from_secs(self.sweep_margin_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            work_dir: self.work_dir(),
            log_cap_bytes: self.log_cap_bytes,
            stop_grace: self.stop_grace(),
            ..EngineConfig::default()
        }
    }
}
