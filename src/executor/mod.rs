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

//! Backend executor contract.
//!
//! A [`ComponentExecutor`] runs one container image with bound inputs and
//! validated limits and hands back raw outputs — independent of whether the
//! infrastructure underneath is a local Docker daemon
//! ([`DockerExecutor`](docker::DockerExecutor)) or a managed batch service
//! ([`BatchExecutor`](batch::BatchExecutor)). Which backend runs is a
//! deployment decision made once at startup
//! ([`BackendKind`](crate::config::BackendKind)), not a per-job one.
//!
//! The contract is a strict sequence per attempt:
//!
//! ```text
//! provision -> execute -> collect_outputs -> cleanup
//!                └────────── on any error ──┘
//! ```
//!
//! `cleanup` must be called exactly once on every exit path; the dispatcher
//! owns that guarantee. A handle is only valid for the attempt that
//! provisioned it.

pub mod batch;
pub mod docker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ComponentError;
use crate::io::{InputBinding, OutputSpec, RawOutput};
use crate::limits::ValidatedLimits;

/// Cap on captured stdout/stderr persisted with a job.
pub const MAX_LOG_BYTES: usize = 64 * 1024;

/// Cooperative cancellation signal, checked by backends between blocking
/// steps and polls.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    inner: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// Everything a backend needs to run one job attempt.
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub job_id: Uuid,
    /// Digest-pinned image reference, e.g. `registry.example.org/algo@sha256:…`.
    pub image_reference: String,
    pub inputs: Vec<InputBinding>,
    pub expected_outputs: Vec<OutputSpec>,
    pub limits: ValidatedLimits,
    pub cancellation: CancellationFlag,
}

/// Backend-specific state for one in-flight execution.
///
/// Owned by the dispatch attempt that provisioned it and released by
/// [`ComponentExecutor::cleanup`] on every exit path.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub job_id: Uuid,
    pub(crate) state: HandleState,
}

#[derive(Debug)]
pub(crate) enum HandleState {
    Docker {
        container_name: String,
        staging: tempfile::TempDir,
    },
    Batch {
        remote_id: String,
    },
    External {
        reference: String,
    },
}

impl ExecutionHandle {
    /// Creates a handle for an executor implemented outside this crate.
    /// The built-in backends construct their own handles.
    pub fn external(job_id: Uuid, reference: impl Into<String>) -> Self {
        Self {
            job_id,
            state: HandleState::External {
                reference: reference.into(),
            },
        }
    }

    /// Backend-assigned identifier, for logging.
    pub fn reference(&self) -> &str {
        match &self.state {
            HandleState::Docker { container_name, .. } => container_name,
            HandleState::Batch { remote_id } => remote_id,
            HandleState::External { reference } => reference,
        }
    }
}

/// What a finished container execution looked like.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub exec_duration: Duration,
    /// Whether pre-allocated warm-pool capacity served this attempt.
    /// Billing-relevant; only the batch backend ever sets it.
    pub used_warm_pool: bool,
    pub warm_pool_duration: Option<Duration>,
}

/// Uniform contract over execution infrastructure.
#[async_trait]
pub trait ComponentExecutor: Send + Sync {
    /// Validates the image is executable and allocates backend resources.
    ///
    /// Fails with [`ComponentError::BackendUnavailable`] when the
    /// infrastructure cannot be reached and [`ComponentError::ImageInvalid`]
    /// when the image fails validation. On error, any partially allocated
    /// state has already been released — there is no handle to clean up.
    async fn provision(&self, spec: &ExecutionSpec) -> Result<ExecutionHandle, ComponentError>;

    /// Runs the container to completion or to the configured time limit.
    ///
    /// The container runs as a non-root user, with no network access beyond
    /// the deployment's explicit allowlist, and with resource limits
    /// enforced by the host or orchestrator.
    async fn execute(
        &self,
        spec: &ExecutionSpec,
        handle: &mut ExecutionHandle,
    ) -> Result<ExecutionReport, ComponentError>;

    /// Reads the expected outputs from the finished container.
    async fn collect_outputs(
        &self,
        spec: &ExecutionSpec,
        handle: &ExecutionHandle,
    ) -> Result<Vec<RawOutput>, ComponentError>;

    /// Releases everything the attempt allocated. Must be invoked on every
    /// exit path; failures are logged, never propagated.
    async fn cleanup(&self, handle: ExecutionHandle);
}

/// Resolves the deployment's configured backend into a strategy object.
///
/// This is the only place backend selection happens; everything downstream
/// holds a `dyn ComponentExecutor` and never asks which variant it has.
pub fn executor_for(
    config: &crate::config::GantryConfig,
) -> Result<Arc<dyn ComponentExecutor>, ComponentError> {
    match config.backend {
        crate::config::BackendKind::Docker => Ok(Arc::new(docker::DockerExecutor::new(
            config.docker.clone(),
        ))),
        crate::config::BackendKind::Batch => {
            Ok(Arc::new(batch::BatchExecutor::new(config.batch.clone())?))
        }
    }
}

/// Truncates captured container output to [`MAX_LOG_BYTES`], keeping the
/// tail.
pub(crate) fn truncate_log(log: String) -> String {
    if log.len() <= MAX_LOG_BYTES {
        return log;
    }
    let tail_start = log.len() - MAX_LOG_BYTES;
    // Avoid splitting a UTF-8 sequence
    let boundary = (tail_start..log.len())
        .find(|index| log.is_char_boundary(*index))
        .unwrap_or(log.len());
    log[boundary..].to_string()
}
