//! Docker implementation of the container driver.
//!
//! Talks to the local Docker daemon over its control socket via bollard.
//! Connection loss surfaces as `DriverError::ConnectionLost`, never as a
//! container outcome.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::time::Duration;
use tracing::{debug, info, warn};

use runbox_core::driver::{ContainerDriver, ContainerHandle, ContainerState, OutputLine, OutputStream};
use runbox_core::error::{DriverError, DriverResult};
use runbox_core::job::SandboxSpec;

/// Container driver backed by the local Docker daemon.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect to the local Docker daemon.
    pub fn new() -> DriverResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::ConnectionLost(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Pull the image unless it is already present.
    async fn ensure_image(&self, image: &str) -> DriverResult<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_engine_error(e)),
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        let mut pull_error = None;
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                    pull_error = Some(e);
                }
            }
        }

        // The pull stream reports per-layer noise; what matters is whether
        // the image exists afterwards.
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(_) => Err(DriverError::ResourceUnavailable(format!(
                "image {} unavailable{}",
                image,
                pull_error
                    .map(|e| format!(": {e}"))
                    .unwrap_or_default()
            ))),
        }
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, name: &str, spec: &SandboxSpec) -> DriverResult<ContainerHandle> {
        self.ensure_image(&spec.image).await?;

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let binds: Option<Vec<String>> = if spec.mounts.is_empty() {
            None
        } else {
            Some(
                spec.mounts
                    .iter()
                    .map(|m| {
                        let mode = if m.read_only { "ro" } else { "rw" };
                        format!("{}:{}:{}", m.source, m.target, mode)
                    })
                    .collect(),
            )
        };

        let host_config = HostConfig {
            binds,
            memory: spec.limits.memory_bytes,
            nano_cpus: spec.limits.nano_cpus,
            network_mode: Some(spec.network.as_str().to_string()),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        info!(container = %name, image = %spec.image, "Creating container");
        let created = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(map_engine_error)?;

        Ok(ContainerHandle { id: created.id })
    }

    async fn start(&self, handle: &ContainerHandle) -> DriverResult<()> {
        info!(container = %handle.id, "Starting container");
        self.docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_engine_error)
    }

    async fn attach_output(
        &self,
        handle: &ContainerHandle,
    ) -> DriverResult<BoxStream<'static, OutputLine>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self.docker.logs(&handle.id, Some(options));

        let mapped = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (OutputStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (OutputStream::Stdout, message),
                    };
                    Some(OutputLine {
                        stream,
                        content: String::from_utf8_lossy(&message).to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped))
    }

    async fn wait(&self, handle: &ContainerHandle, deadline: Duration) -> DriverResult<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&handle.id, Some(options));

        match tokio::time::timeout(deadline, stream.next()).await {
            Err(_) => Err(DriverError::DeadlineExceeded),
            Ok(Some(Ok(response))) => Ok(response.status_code),
            // A non-zero exit reaches us as a wait "error" carrying the code.
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => Ok(code),
            Ok(Some(Err(e))) => Err(map_engine_error(e)),
            Ok(None) => Err(DriverError::EngineFault(
                "wait stream ended without a result".to_string(),
            )),
        }
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> DriverResult<()> {
        info!(container = %handle.id, grace_secs = grace.as_secs(), "Stopping container");
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped. 404: already gone.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(map_engine_error(e)),
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> DriverResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(map_engine_error(e)),
        }
    }

    async fn inspect(&self, handle: &ContainerHandle) -> DriverResult<ContainerState> {
        let inspected = self
            .docker
            .inspect_container(&handle.id, None)
            .await
            .map_err(map_engine_error)?;

        let state = inspected
            .state
            .ok_or_else(|| DriverError::EngineFault("container has no state".to_string()))?;

        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
        })
    }
}

/// Map a bollard error onto the driver error surface.
fn map_engine_error(e: bollard::errors::Error) -> DriverError {
    use bollard::errors::Error as B;
    match e {
        B::DockerResponseServerError {
            status_code: 404,
            message,
        } => DriverError::NotFound(message),
        B::DockerResponseServerError {
            status_code,
            message,
        } => DriverError::EngineFault(format!("status {status_code}: {message}")),
        B::IOError { err } => DriverError::ConnectionLost(err.to_string()),
        other => {
            let message = other.to_string();
            let lower = message.to_lowercase();
            if lower.contains("connection") || lower.contains("socket") || lower.contains("transport")
            {
                DriverError::ConnectionLost(message)
            } else {
                DriverError::EngineFault(message)
            }
        }
    }
}


/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use runbox_core::job::{NetworkMode, SandboxSpec};

    fn spec(command: Vec<&str>) -> SandboxSpec {
        SandboxSpec::new(
            "alpine:latest",
            command.into_iter().map(String::from).collect(),
        )
    }

    fn unique_name(tag: &str) -> String {
        format!("runbox-test-{}-{}", tag, uuid::Uuid::now_v7())
    }

    #[tokio::test]
    #[ignore]
    async fn test_driver_connects() {
        assert!(DockerDriver::new().is_ok(), "Should connect to Docker daemon");
    }

    #[tokio::test]
    #[ignore]
    async fn test_container_lifecycle() {
        let driver = DockerDriver::new().unwrap();
        let handle = driver
            .create(&unique_name("lifecycle"), &spec(vec!["echo", "hello"]))
            .await
            .expect("Should create container");

        driver.start(&handle).await.expect("Should start container");

        let code = driver
            .wait(&handle, Duration::from_secs(30))
            .await
            .expect("Should wait for exit");
        assert_eq!(code, 0);

        let mut output = driver
            .attach_output(&handle)
            .await
            .expect("Should attach output");
        let mut all = String::new();
        while let Some(line) = output.next().await {
            all.push_str(&line.content);
        }
        assert!(all.contains("hello"));

        driver.remove(&handle).await.expect("Should remove container");
    }

    #[tokio::test]
    #[ignore]
    async fn test_nonzero_exit_is_reported() {
        let driver = DockerDriver::new().unwrap();
        let handle = driver
            .create(&unique_name("exit"), &spec(vec!["sh", "-c", "exit 42"]))
            .await
            .unwrap();
        driver.start(&handle).await.unwrap();

        let code = driver.wait(&handle, Duration::from_secs(30)).await.unwrap();
        assert_eq!(code, 42);

        driver.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_wait_deadline_and_stop() {
        let driver = DockerDriver::new().unwrap();
        let handle = driver
            .create(&unique_name("deadline"), &spec(vec!["sleep", "300"]))
            .await
            .unwrap();
        driver.start(&handle).await.unwrap();

        let err = driver
            .wait(&handle, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::DeadlineExceeded));

        let state = driver.inspect(&handle).await.unwrap();
        assert!(state.running);

        driver.stop(&handle, Duration::from_secs(1)).await.unwrap();
        driver.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_network_disabled_by_default() {
        let driver = DockerDriver::new().unwrap();
        let sandbox = spec(vec!["sh", "-c", "wget -T 2 -q -O- http://example.com"]);
        assert_eq!(sandbox.network, NetworkMode::None);

        let handle = driver.create(&unique_name("netnone"), &sandbox).await.unwrap();
        driver.start(&handle).await.unwrap();
        let code = driver.wait(&handle, Duration::from_secs(30)).await.unwrap();
        assert_ne!(code, 0, "network should be unreachable");

        driver.remove(&handle).await.unwrap();
    }
}
