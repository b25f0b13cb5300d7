/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Docker-daemon execution backend.
//!
//! Runs each job attempt as a locally created container:
//!
//! 1. **provision** — pull and validate the image, stage the resolved
//!    inputs into a per-attempt temp directory, create the container with
//!    host-enforced resource limits (`/input` is bind-mounted read-only).
//! 2. **execute** — start the container and wait for exit, racing the
//!    configured wall-clock limit and the cancellation flag; capture
//!    stdout/stderr after exit.
//! 3. **collect_outputs** — download `/output` from the stopped container
//!    as a tar stream and unpack it into the staging directory.
//! 4. **cleanup** — force-remove the container; the staging directory is
//!    removed when the handle drops.
//!
//! Containers run as a non-root user with all capabilities dropped and, by
//! default, no network. An explicit allowlist network can be configured per
//! deployment.

use std::time::{Duration, Instant};

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
    LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{
    truncate_log, CancellationFlag, ComponentExecutor, ExecutionHandle, ExecutionReport,
    ExecutionSpec, HandleState,
};
use crate::config::DockerSettings;
use crate::error::ComponentError;
use crate::io::{BoundSource, RawOutput};
use crate::limits::GpuRequest;

/// Label stamped on every container this backend creates, so stray
/// containers can be attributed and reaped.
pub const MANAGED_BY_LABEL: &str = "gantry";

/// Executor backed by the local Docker daemon.
pub struct DockerExecutor {
    settings: DockerSettings,
}

impl DockerExecutor {
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }

    /// Connections are established per operation: the daemon being
    /// unreachable is a transient, per-attempt condition, not a
    /// constructor-time failure.
    fn connect(&self) -> Result<Docker, ComponentError> {
        Docker::connect_with_local_defaults().map_err(|e| ComponentError::BackendUnavailable {
            message: format!("could not connect to Docker daemon: {e}"),
        })
    }

    async fn ensure_image(&self, docker: &Docker, reference: &str) -> Result<(), ComponentError> {
        if !self.settings.pull_images {
            return Ok(());
        }

        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut stream = docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(map_pull_error)?;
        }
        Ok(())
    }
}

fn map_pull_error(error: bollard::errors::Error) -> ComponentError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => ComponentError::ImageInvalid { message },
        other => ComponentError::BackendUnavailable {
            message: other.to_string(),
        },
    }
}

fn map_daemon_error(error: bollard::errors::Error) -> ComponentError {
    ComponentError::BackendUnavailable {
        message: error.to_string(),
    }
}

/// Builds the container configuration for one attempt.
fn container_config(
    spec: &ExecutionSpec,
    settings: &DockerSettings,
    input_dir: &std::path::Path,
) -> Config<String> {
    let limits = &spec.limits;

    let device_requests = match limits.gpu {
        GpuRequest::None => None,
        // The daemon picks the device; type selection is a scheduler
        // concern the local backend cannot express.
        GpuRequest::Any | GpuRequest::Type(_) => Some(vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            count: Some(1),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]),
    };

    let labels = std::collections::HashMap::from([
        ("managed_by".to_string(), MANAGED_BY_LABEL.to_string()),
        ("job_id".to_string(), spec.job_id.to_string()),
    ]);

    Config {
        image: Some(spec.image_reference.clone()),
        user: Some(settings.user.clone()),
        labels: Some(labels),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(settings.network.is_none()),
        host_config: Some(HostConfig {
            auto_remove: Some(false),
            binds: Some(vec![format!("{}:/input:ro", input_dir.display())]),
            memory: Some(limits.memory_bytes()),
            nano_cpus: Some(limits.nano_cpus()),
            pids_limit: Some(settings.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            network_mode: settings.network.clone(),
            device_requests,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn stage_inputs(spec: &ExecutionSpec, input_dir: &std::path::Path) -> Result<(), ComponentError> {
    for binding in &spec.inputs {
        let destination = input_dir.join(&binding.relative_path);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ComponentError::BackendUnavailable {
                message: format!("could not stage {}: {e}", binding.relative_path),
            })?;
        }
        match &binding.source {
            BoundSource::File { path } => {
                std::fs::copy(path, &destination).map_err(|e| {
                    ComponentError::BackendUnavailable {
                        message: format!("could not stage {}: {e}", binding.relative_path),
                    }
                })?;
            }
            BoundSource::Inline { bytes } => {
                std::fs::write(&destination, bytes).map_err(|e| {
                    ComponentError::BackendUnavailable {
                        message: format!("could not stage {}: {e}", binding.relative_path),
                    }
                })?;
            }
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl ComponentExecutor for DockerExecutor {
    async fn provision(&self, spec: &ExecutionSpec) -> Result<ExecutionHandle, ComponentError> {
        let docker = self.connect()?;
        self.ensure_image(&docker, &spec.image_reference).await?;

        let staging = tempfile::TempDir::new().map_err(|e| {
            ComponentError::BackendUnavailable {
                message: format!("could not create staging directory: {e}"),
            }
        })?;
        let input_dir = staging.path().join("input");
        std::fs::create_dir_all(&input_dir).map_err(|e| {
            ComponentError::BackendUnavailable {
                message: format!("could not create staging directory: {e}"),
            }
        })?;
        stage_inputs(spec, &input_dir)?;

        let container_name = format!("gantry-{}", spec.job_id);
        let config = container_config(spec, &self.settings, &input_dir);
        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(map_pull_error)?;

        debug!(job_id = %spec.job_id, container = %container_name, "Container provisioned");

        Ok(ExecutionHandle {
            job_id: spec.job_id,
            state: HandleState::Docker {
                container_name,
                staging,
            },
        })
    }

    async fn execute(
        &self,
        spec: &ExecutionSpec,
        handle: &mut ExecutionHandle,
    ) -> Result<ExecutionReport, ComponentError> {
        let HandleState::Docker { container_name, .. } = &handle.state else {
            return Err(ComponentError::BackendUnavailable {
                message: "handle does not belong to the Docker backend".into(),
            });
        };
        let docker = self.connect()?;

        docker
            .start_container(container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_daemon_error)?;

        let started = Instant::now();
        let limit_secs = spec.limits.time_limit_secs;
        let exit_code = wait_for_exit(&docker, container_name, limit_secs, &spec.cancellation)
            .await?;
        let exec_duration = started.elapsed();

        let (stdout, stderr) = capture_logs(&docker, container_name).await;

        if exit_code != 0 {
            return Err(ComponentError::ExecutionFailed {
                exit_code,
                detail: stderr,
            });
        }

        info!(
            job_id = %handle.job_id,
            container = %container_name,
            elapsed_ms = exec_duration.as_millis() as u64,
            "Container exited cleanly"
        );

        Ok(ExecutionReport {
            exit_code,
            stdout,
            stderr,
            exec_duration,
            used_warm_pool: false,
            warm_pool_duration: None,
        })
    }

    async fn collect_outputs(
        &self,
        spec: &ExecutionSpec,
        handle: &ExecutionHandle,
    ) -> Result<Vec<RawOutput>, ComponentError> {
        let HandleState::Docker {
            container_name,
            staging,
        } = &handle.state
        else {
            return Err(ComponentError::BackendUnavailable {
                message: "handle does not belong to the Docker backend".into(),
            });
        };
        let docker = self.connect()?;

        // The stopped container's /output comes back as one tar stream.
        let mut stream = docker.download_from_container(
            container_name,
            Some(DownloadFromContainerOptions {
                path: "/output".to_string(),
            }),
        );
        let mut archive_bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => ComponentError::OutputMissing {
                    interface: spec
                        .expected_outputs
                        .first()
                        .map(|o| o.interface_slug.clone())
                        .unwrap_or_else(|| "output".to_string()),
                },
                other => map_daemon_error(other),
            })?;
            archive_bytes.extend_from_slice(&chunk);
        }

        let collected = staging.path().join("collected");
        let mut archive = tar::Archive::new(archive_bytes.as_slice());
        archive
            .unpack(&collected)
            .map_err(|e| ComponentError::BackendUnavailable {
                message: format!("could not unpack output archive: {e}"),
            })?;

        spec.expected_outputs
            .iter()
            .map(|expected| {
                // download_from_container("/output") prefixes entries with
                // the directory name
                let path = collected.join("output").join(&expected.relative_path);
                let bytes =
                    std::fs::read(&path).map_err(|_| ComponentError::OutputMissing {
                        interface: expected.interface_slug.clone(),
                    })?;
                Ok(RawOutput {
                    interface_slug: expected.interface_slug.clone(),
                    relative_path: expected.relative_path.clone(),
                    bytes,
                })
            })
            .collect()
    }

    async fn cleanup(&self, handle: ExecutionHandle) {
        let HandleState::Docker {
            container_name,
            staging,
        } = handle.state
        else {
            return;
        };

        match self.connect() {
            Ok(docker) => {
                if let Err(e) = docker
                    .remove_container(
                        &container_name,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await
                {
                    warn!(container = %container_name, error = %e, "Failed to remove container");
                }
            }
            Err(e) => {
                warn!(container = %container_name, error = %e, "Skipping container removal");
            }
        }

        // Staging directory is removed on drop
        drop(staging);
    }
}

/// Waits for the container to exit, racing the wall-clock limit and the
/// cancellation flag. The container is killed on either interruption.
async fn wait_for_exit(
    docker: &Docker,
    container_name: &str,
    limit_secs: u64,
    cancellation: &CancellationFlag,
) -> Result<i64, ComponentError> {
    let mut wait_stream = docker.wait_container(
        container_name,
        Some(WaitContainerOptions {
            condition: "not-running".to_string(),
        }),
    );
    let deadline = tokio::time::sleep(Duration::from_secs(limit_secs));
    tokio::pin!(deadline);
    let mut cancel_poll = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            next = wait_stream.next() => {
                return match next {
                    Some(Ok(response)) => Ok(response.status_code),
                    // bollard surfaces non-zero exits through the error path
                    Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                        Ok(code)
                    }
                    Some(Err(e)) => Err(map_daemon_error(e)),
                    None => {
                        // Stream closed without a response; ask the daemon directly
                        let inspect = docker
                            .inspect_container(container_name, None)
                            .await
                            .map_err(map_daemon_error)?;
                        Ok(inspect
                            .state
                            .and_then(|state| state.exit_code)
                            .unwrap_or(-1))
                    }
                };
            }
            _ = &mut deadline => {
                kill_container(docker, container_name).await;
                return Err(ComponentError::ExecutionTimeout { limit_secs });
            }
            _ = cancel_poll.tick() => {
                if cancellation.is_cancelled() {
                    kill_container(docker, container_name).await;
                    return Err(ComponentError::Cancelled);
                }
            }
        }
    }
}

async fn kill_container(docker: &Docker, container_name: &str) {
    if let Err(e) = docker
        .kill_container(container_name, None::<KillContainerOptions<String>>)
        .await
    {
        // It may have exited in the meantime
        warn!(container = %container_name, error = %e, "Failed to kill container");
    }
}

async fn capture_logs(docker: &Docker, container_name: &str) -> (String, String) {
    let mut stdout = String::new();
    let mut stderr = String::new();

    let mut logs = docker.logs(
        container_name,
        Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        }),
    );
    while let Some(output) = logs.next().await {
        match output {
            Ok(LogOutput::StdOut { message }) => {
                stdout.push_str(&String::from_utf8_lossy(&message));
            }
            Ok(LogOutput::StdErr { message }) => {
                stderr.push_str(&String::from_utf8_lossy(&message));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(container = %container_name, error = %e, "Log stream error");
                break;
            }
        }
    }

    (truncate_log(stdout), truncate_log(stderr))
}
