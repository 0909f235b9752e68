//! Version-control client trait.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::CheckoutError;
use crate::job::RepoLocator;

/// A materialized checkout.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    /// Directory holding the checked-out files.
    pub path: PathBuf,
    /// Commit the reference resolved to.
    pub commit: String,
}

#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Materialize `locator` under `dest`.
    ///
    /// `dest` must not pre-exist or must be empty; the locator's reference
    /// must resolve to a single commit. No retries happen here - retry
    /// policy belongs to the worker.
    async fn checkout(
        &self,
        locator: &RepoLocator,
        dest: &Path,
    ) -> std::result::Result<WorkingTree, CheckoutError>;
}
