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

//! Managed-batch execution backend.
//!
//! Submits each job attempt to a remote batch service that shares the
//! platform's storage, then drives an explicit polling loop until the
//! remote execution reaches a terminal state: bounded poll interval,
//! bounded total wait (the job's time limit plus the configured queue
//! allowance), and the cancellation flag checked between polls. No
//! callbacks, no hidden scheduling — the loop below is the whole state
//! machine.
//!
//! The service reports whether warm-pool capacity served the attempt;
//! warm-pool time is billing-relevant and tracked separately from
//! execution time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::{
    truncate_log, ComponentExecutor, ExecutionHandle, ExecutionReport, ExecutionSpec, HandleState,
};
use crate::config::BatchSettings;
use crate::error::ComponentError;
use crate::io::{BoundSource, RawOutput};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One input as the remote service receives it. File-backed values are
/// passed by storage key — the service shares the platform's storage —
/// and inline JSON is passed verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchInputContent {
    StorageKey { key: String },
    InlineJson { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInput {
    pub relative_path: String,
    pub content: BatchInputContent,
}

/// Submission payload for one remote execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub job_id: Uuid,
    pub image_reference: String,
    pub cpu_count: u32,
    pub memory_gb: u32,
    pub gpu: String,
    pub time_limit_secs: u64,
    pub inputs: Vec<BatchInput>,
    pub expected_outputs: Vec<String>,
    pub warm_pool: bool,
}

/// Remote execution state as reported by the service.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteJobState {
    /// Queued or starting.
    Pending,
    Running,
    Succeeded {
        exec_duration_secs: u64,
        used_warm_pool: bool,
        warm_pool_duration_secs: Option<u64>,
    },
    Failed {
        /// `Some` when the container itself exited non-zero; `None` when
        /// the infrastructure failed before or around it.
        exit_code: Option<i64>,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RemoteLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Wire contract to the batch service.
///
/// Kept as a trait so the polling machinery is testable without a live
/// service; [`HttpBatchApi`] is the production implementation.
#[async_trait]
pub trait BatchApi: Send + Sync {
    async fn submit(&self, submission: &BatchSubmission) -> Result<String, ComponentError>;
    async fn describe(&self, remote_id: &str) -> Result<RemoteJobState, ComponentError>;
    async fn logs(&self, remote_id: &str) -> Result<RemoteLogs, ComponentError>;
    async fn fetch_output(
        &self,
        remote_id: &str,
        relative_path: &str,
    ) -> Result<Option<Vec<u8>>, ComponentError>;
    async fn cancel(&self, remote_id: &str) -> Result<(), ComponentError>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    status: String,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    exec_duration_secs: Option<u64>,
    #[serde(default)]
    used_warm_pool: bool,
    #[serde(default)]
    warm_pool_duration_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// HTTP client for the batch service.
pub struct HttpBatchApi {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpBatchApi {
    pub fn new(settings: &BatchSettings) -> Result<Self, ComponentError> {
        let base_url =
            Url::parse(&settings.base_url).map_err(|e| ComponentError::BackendUnavailable {
                message: format!("invalid batch service URL: {e}"),
            })?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ComponentError::BackendUnavailable {
                message: format!("could not build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url,
            auth_token: settings.auth_token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ComponentError> {
        self.base_url
            .join(path)
            .map_err(|e| ComponentError::BackendUnavailable {
                message: format!("invalid endpoint {path}: {e}"),
            })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn map_http_error(error: reqwest::Error) -> ComponentError {
    ComponentError::BackendUnavailable {
        message: format!("batch service request failed: {error}"),
    }
}

#[async_trait]
impl BatchApi for HttpBatchApi {
    async fn submit(&self, submission: &BatchSubmission) -> Result<String, ComponentError> {
        let url = self.endpoint("v1/executions")?;
        let response = self
            .request(self.client.post(url))
            .json(submission)
            .send()
            .await
            .map_err(map_http_error)?;

        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let message = response.text().await.unwrap_or_default();
            return Err(ComponentError::ImageInvalid { message });
        }
        let response = response.error_for_status().map_err(map_http_error)?;
        let body: SubmitResponse = response.json().await.map_err(map_http_error)?;
        Ok(body.id)
    }

    async fn describe(&self, remote_id: &str) -> Result<RemoteJobState, ComponentError> {
        let url = self.endpoint(&format!("v1/executions/{remote_id}"))?;
        let body: DescribeResponse = self
            .request(self.client.get(url))
            .send()
            .await
            .map_err(map_http_error)?
            .error_for_status()
            .map_err(map_http_error)?
            .json()
            .await
            .map_err(map_http_error)?;

        let state = match body.status.as_str() {
            "pending" | "starting" => RemoteJobState::Pending,
            "running" => RemoteJobState::Running,
            "succeeded" => RemoteJobState::Succeeded {
                exec_duration_secs: body.exec_duration_secs.unwrap_or_default(),
                used_warm_pool: body.used_warm_pool,
                warm_pool_duration_secs: body.warm_pool_duration_secs,
            },
            "failed" => RemoteJobState::Failed {
                exit_code: body.exit_code,
                reason: body.reason.unwrap_or_else(|| "unknown failure".to_string()),
            },
            other => {
                return Err(ComponentError::BackendUnavailable {
                    message: format!("batch service reported unknown status \"{other}\""),
                })
            }
        };
        Ok(state)
    }

    async fn logs(&self, remote_id: &str) -> Result<RemoteLogs, ComponentError> {
        let url = self.endpoint(&format!("v1/executions/{remote_id}/logs"))?;
        let body: LogsResponse = self
            .request(self.client.get(url))
            .send()
            .await
            .map_err(map_http_error)?
            .error_for_status()
            .map_err(map_http_error)?
            .json()
            .await
            .map_err(map_http_error)?;

        Ok(RemoteLogs {
            stdout: body.stdout,
            stderr: body.stderr,
        })
    }

    async fn fetch_output(
        &self,
        remote_id: &str,
        relative_path: &str,
    ) -> Result<Option<Vec<u8>>, ComponentError> {
        let mut url = self.endpoint(&format!("v1/executions/{remote_id}/outputs"))?;
        url.query_pairs_mut().append_pair("path", relative_path);

        let response = self
            .request(self.client.get(url))
            .send()
            .await
            .map_err(map_http_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(map_http_error)?;
        let bytes = response.bytes().await.map_err(map_http_error)?;
        Ok(Some(bytes.to_vec()))
    }

    async fn cancel(&self, remote_id: &str) -> Result<(), ComponentError> {
        let url = self.endpoint(&format!("v1/executions/{remote_id}/cancel"))?;
        self.request(self.client.post(url))
            .send()
            .await
            .map_err(map_http_error)?
            .error_for_status()
            .map_err(map_http_error)?;
        Ok(())
    }
}

/// Executor backed by a managed batch service.
pub struct BatchExecutor {
    api: Arc<dyn BatchApi>,
    settings: BatchSettings,
}

impl BatchExecutor {
    pub fn new(settings: BatchSettings) -> Result<Self, ComponentError> {
        let api = Arc::new(HttpBatchApi::new(&settings)?);
        Ok(Self { api, settings })
    }

    /// Builds the executor over a custom API implementation.
    pub fn with_api(api: Arc<dyn BatchApi>, settings: BatchSettings) -> Self {
        Self { api, settings }
    }

    fn submission(&self, spec: &ExecutionSpec) -> BatchSubmission {
        BatchSubmission {
            job_id: spec.job_id,
            image_reference: spec.image_reference.clone(),
            cpu_count: spec.limits.cpu_count,
            memory_gb: spec.limits.memory_gb,
            gpu: spec.limits.gpu.to_string(),
            time_limit_secs: spec.limits.time_limit_secs,
            inputs: spec
                .inputs
                .iter()
                .map(|binding| BatchInput {
                    relative_path: binding.relative_path.clone(),
                    content: match &binding.source {
                        BoundSource::File { path } => BatchInputContent::StorageKey {
                            key: path.display().to_string(),
                        },
                        BoundSource::Inline { bytes } => BatchInputContent::InlineJson {
                            text: String::from_utf8_lossy(bytes).into_owned(),
                        },
                    },
                })
                .collect(),
            expected_outputs: spec
                .expected_outputs
                .iter()
                .map(|output| output.relative_path.clone())
                .collect(),
            warm_pool: self.settings.warm_pool,
        }
    }
}

#[async_trait]
impl ComponentExecutor for BatchExecutor {
    async fn provision(&self, spec: &ExecutionSpec) -> Result<ExecutionHandle, ComponentError> {
        let remote_id = self.api.submit(&self.submission(spec)).await?;
        debug!(job_id = %spec.job_id, remote_id = %remote_id, "Submitted to batch service");

        Ok(ExecutionHandle {
            job_id: spec.job_id,
            state: HandleState::Batch { remote_id },
        })
    }

    async fn execute(
        &self,
        spec: &ExecutionSpec,
        handle: &mut ExecutionHandle,
    ) -> Result<ExecutionReport, ComponentError> {
        let HandleState::Batch { remote_id } = &handle.state else {
            return Err(ComponentError::BackendUnavailable {
                message: "handle does not belong to the batch backend".into(),
            });
        };
        let remote_id = remote_id.clone();

        let limit_secs = spec.limits.time_limit_secs;
        let deadline = Instant::now()
            + Duration::from_secs(limit_secs)
            + self.settings.max_queue_wait;

        loop {
            if spec.cancellation.is_cancelled() {
                if let Err(e) = self.api.cancel(&remote_id).await {
                    warn!(remote_id = %remote_id, error = %e, "Failed to cancel remote execution");
                }
                return Err(ComponentError::Cancelled);
            }

            match self.api.describe(&remote_id).await? {
                RemoteJobState::Pending | RemoteJobState::Running => {
                    if Instant::now() >= deadline {
                        if let Err(e) = self.api.cancel(&remote_id).await {
                            warn!(
                                remote_id = %remote_id,
                                error = %e,
                                "Failed to cancel overdue remote execution"
                            );
                        }
                        return Err(ComponentError::ExecutionTimeout { limit_secs });
                    }
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                RemoteJobState::Succeeded {
                    exec_duration_secs,
                    used_warm_pool,
                    warm_pool_duration_secs,
                } => {
                    let logs = self.api.logs(&remote_id).await.unwrap_or_else(|e| {
                        warn!(remote_id = %remote_id, error = %e, "Could not fetch remote logs");
                        RemoteLogs::default()
                    });

                    info!(
                        job_id = %handle.job_id,
                        remote_id = %remote_id,
                        exec_secs = exec_duration_secs,
                        warm_pool = used_warm_pool,
                        "Remote execution succeeded"
                    );

                    return Ok(ExecutionReport {
                        exit_code: 0,
                        stdout: truncate_log(logs.stdout),
                        stderr: truncate_log(logs.stderr),
                        exec_duration: Duration::from_secs(exec_duration_secs),
                        used_warm_pool,
                        warm_pool_duration: warm_pool_duration_secs.map(Duration::from_secs),
                    });
                }
                RemoteJobState::Failed { exit_code, reason } => {
                    return Err(match exit_code {
                        // The algorithm itself failed
                        Some(code) => ComponentError::ExecutionFailed {
                            exit_code: code,
                            detail: reason,
                        },
                        // The infrastructure failed around it
                        None => ComponentError::BackendUnavailable { message: reason },
                    });
                }
            }
        }
    }

    async fn collect_outputs(
        &self,
        spec: &ExecutionSpec,
        handle: &ExecutionHandle,
    ) -> Result<Vec<RawOutput>, ComponentError> {
        let HandleState::Batch { remote_id } = &handle.state else {
            return Err(ComponentError::BackendUnavailable {
                message: "handle does not belong to the batch backend".into(),
            });
        };

        let mut outputs = Vec::with_capacity(spec.expected_outputs.len());
        for expected in &spec.expected_outputs {
            let bytes = self
                .api
                .fetch_output(remote_id, &expected.relative_path)
                .await?
                .ok_or_else(|| ComponentError::OutputMissing {
                    interface: expected.interface_slug.clone(),
                })?;
            outputs.push(RawOutput {
                interface_slug: expected.interface_slug.clone(),
                relative_path: expected.relative_path.clone(),
                bytes,
            });
        }
        Ok(outputs)
    }

    async fn cleanup(&self, handle: ExecutionHandle) {
        let HandleState::Batch { remote_id } = handle.state else {
            return;
        };
        // Idempotent on the service side; a finished execution ignores it
        if let Err(e) = self.api.cancel(&remote_id).await {
            debug!(remote_id = %remote_id, error = %e, "Remote cleanup cancel failed");
        }
    }
}
