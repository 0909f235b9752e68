//! Error types for Runbox.

use thiserror::Error;

use crate::job::JobStatus;

/// Top-level error for engine and worker code paths.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure while materializing a working tree from version control.
///
/// None of these are retried by the checkout client itself; retry policy
/// belongs to the worker.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("remote unreachable: {0}")]
    Network(String),

    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckoutError {
    /// Short classification tag recorded in job results.
    pub fn kind(&self) -> &'static str {
        match self {
            CheckoutError::Network(_) => "network",
            CheckoutError::ReferenceNotFound(_) => "reference-not-found",
            CheckoutError::Io(_) => "io",
        }
    }
}

/// Failure surfaced by the container driver.
///
/// Connection loss is distinct and retryable at the call site; it is never
/// mapped to "container finished".
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("engine connection lost: {0}")]
    ConnectionLost(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("engine fault: {0}")]
    EngineFault(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Failure from the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("duplicate job: {0}")]
    Duplicate(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
