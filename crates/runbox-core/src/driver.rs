//! Container driver trait and container-facing types.
//!
//! The driver is a thin abstraction over the container engine's control
//! socket. All operations other than [`ContainerDriver::wait`] are expected
//! to return quickly or fail fast.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::DriverResult;
use crate::job::SandboxSpec;

/// Opaque handle to a created container. Owned by the engine for the
/// lifetime of one job attempt and released (removed) on every exit path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Engine-assigned container id.
    pub id: String,
}

/// Liveness snapshot of a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Control surface of the container engine.
///
/// Connection loss surfaces as [`DriverError::ConnectionLost`], distinct
/// from any container outcome. The engine serializes conflicting operations
/// itself; the driver must tolerate concurrent use of the shared socket.
///
/// [`DriverError::ConnectionLost`]: crate::error::DriverError::ConnectionLost
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create a container for `spec`, named `name`. Does not start it.
    async fn create(&self, name: &str, spec: &SandboxSpec) -> DriverResult<ContainerHandle>;

    /// Start a created container.
    async fn start(&self, handle: &ContainerHandle) -> DriverResult<()>;

    /// Attach to the container's output as a live stream.
    async fn attach_output(
        &self,
        handle: &ContainerHandle,
    ) -> DriverResult<BoxStream<'static, OutputLine>>;

    /// Block until the container exits, up to `deadline`. Returns the exit
    /// code, or [`DriverError::DeadlineExceeded`] when the deadline elapses
    /// first.
    ///
    /// [`DriverError::DeadlineExceeded`]: crate::error::DriverError::DeadlineExceeded
    async fn wait(&self, handle: &ContainerHandle, deadline: Duration) -> DriverResult<i64>;

    /// Stop the container: graceful signal, then forced kill once `grace`
    /// elapses.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> DriverResult<()>;

    /// Remove the container. Tolerates an already-removed container.
    async fn remove(&self, handle: &ContainerHandle) -> DriverResult<()>;

    /// Current liveness snapshot.
    async fn inspect(&self, handle: &ContainerHandle) -> DriverResult<ContainerState>;
}
