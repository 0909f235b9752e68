//! Worker process for Runbox.
//!
//! Pulls job descriptors from the queue, claims them through the store's
//! atomic claim primitive, drives the execution engine, and recovers jobs
//! left behind by crashed workers.

pub mod config;
pub mod service;
pub mod sweep;
pub mod worker;

pub use config::WorkerConfig;
pub use service::JobService;
pub use sweep::RecoverySweep;
pub use worker::Worker;
