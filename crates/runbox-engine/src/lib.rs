//! Job execution engine for Runbox.
//!
//! Drives one job attempt through its lifecycle: checkout, container
//! provisioning, supervised execution with timeout and cancellation, output
//! collection, and unconditional container cleanup. Also provides the
//! in-memory reference implementations of the job store and job queue.

pub mod engine;
pub mod logs;
pub mod memory;

pub use engine::{EngineConfig, JobEngine, container_name};
pub use logs::LogCollector;
pub use memory::{MemoryJobQueue, MemoryJobStore};
