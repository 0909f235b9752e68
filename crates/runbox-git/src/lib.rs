//! Git checkout client for Runbox.
//!
//! Materializes a repository at a requested reference into a fresh working
//! directory using the `git` CLI, and validates repository URLs at
//! submission time.

pub mod validate;

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use runbox_core::error::CheckoutError;
use runbox_core::job::RepoLocator;
use runbox_core::vcs::{VcsClient, WorkingTree};

pub use validate::{InvalidRepoUrl, validate_repo_url};

/// Checkout client backed by the `git` CLI.
#[derive(Debug, Default)]
pub struct GitClient;

impl GitClient {
    pub fn new() -> Self {
        Self
    }

    async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<String, CheckoutError> {
        let mut cmd = Command::new("git");
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd.output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            Err(classify_git_failure(&stderr))
        }
    }

    /// Detach HEAD at the requested reference so branches, tags and commits
    /// all resolve the same way. An ambiguous name is rejected: git only
    /// warns about it and picks one, which would make the checkout
    /// non-reproducible.
    async fn detach_at(dest: &Path, reference: &str) -> Result<(), CheckoutError> {
        let output = Command::new("git")
            .args(["checkout", "--detach", reference])
            .current_dir(dest)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(classify_git_failure(&stderr));
        }
        if stderr.to_lowercase().contains("is ambiguous") {
            return Err(CheckoutError::ReferenceNotFound(format!(
                "reference '{reference}' is ambiguous"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VcsClient for GitClient {
    async fn checkout(
        &self,
        locator: &RepoLocator,
        dest: &Path,
    ) -> Result<WorkingTree, CheckoutError> {
        // Destination must not pre-exist or must be empty.
        if dest.exists() {
            let mut entries = tokio::fs::read_dir(dest).await?;
            if entries.next_entry().await?.is_some() {
                return Err(CheckoutError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("destination not empty: {}", dest.display()),
                )));
            }
        } else if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let dest_str = dest.display().to_string();
        info!(url = %locator.url, reference = %locator.reference, path = %dest_str, "Cloning repository");

        let cloned = Self::run_git(&["clone", locator.url.as_str(), dest_str.as_str()], None).await;
        let result = match cloned {
            Ok(_) => Self::detach_at(dest, &locator.reference).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            // Clean up the partial clone so a retry starts fresh.
            if dest.exists() {
                if let Err(cleanup) = tokio::fs::remove_dir_all(dest).await {
                    warn!(path = %dest_str, error = %cleanup, "Failed to clean up partial checkout");
                }
            }
            return Err(e);
        }

        let commit = Self::run_git(&["rev-parse", "HEAD"], Some(dest)).await?;
        info!(commit = %commit, path = %dest_str, "Checkout complete");

        Ok(WorkingTree {
            path: dest.to_path_buf(),
            commit,
        })
    }
}

/// Classify git stderr into the checkout error taxonomy.
fn classify_git_failure(stderr: &str) -> CheckoutError {
    let lower = stderr.to_lowercase();
    let reference_markers = [
        "did not match any file",
        "unknown revision",
        "pathspec",
        "couldn't find remote ref",
        "is ambiguous",
    ];
    let network_markers = [
        "could not resolve host",
        "unable to access",
        "connection refused",
        "connection timed out",
        "repository not found",
        "could not read from remote",
    ];

    if reference_markers.iter().any(|m| lower.contains(m)) {
        CheckoutError::ReferenceNotFound(stderr.trim().to_string())
    } else if network_markers.iter().any(|m| lower.contains(m)) {
        CheckoutError::Network(stderr.trim().to_string())
    } else {
        CheckoutError::Io(std::io::Error::other(stderr.trim().to_string()))
    }
}
