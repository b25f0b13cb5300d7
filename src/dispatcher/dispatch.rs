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

//! One dispatch attempt, end to end.
//!
//! The attempt sequence is: resolve inputs → validate limits → provision →
//! execute → collect outputs → materialize outputs → persist. Input
//! resolution and limit validation run before any infrastructure is
//! touched, so configuration and data problems never allocate capacity.
//!
//! `cleanup` is guaranteed exactly once for every attempt that provisioned
//! a handle, whatever `execute` or `collect_outputs` did — and a retry is
//! only scheduled after that cleanup has completed, which is what
//! serializes attempts per job.
//!
//! Nothing escapes [`Dispatcher::dispatch`]: every failure is converted
//! into a [`DispatchOutcome`] and the job record carries the detail.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::error::ComponentError;
use crate::executor::{CancellationFlag, ComponentExecutor, ExecutionReport, ExecutionSpec};
use crate::io::{self, OutputSpec, RawOutput};
use crate::limits::{self, LimitCeiling};
use crate::models::execution_event::{ExecutionEvent, ExecutionEventType};
use crate::models::job::{Job, JobStatus};
use crate::models::value::ComponentInterfaceValue;
use crate::retry::RetryPolicy;
use crate::store::JobStore;

/// What a dispatch attempt decided. The queue consumer acts on this; no
/// control flow rides on exceptions.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The job succeeded and its outputs are persisted.
    Completed,
    /// A recoverable failure; the job is scheduled for attempt `attempt`
    /// after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// The job reached terminal failure (or was cancelled mid-attempt).
    Fatal { reason: String },
}

/// Runs individual job attempts against the configured backend.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn ComponentExecutor>,
    retry_policy: RetryPolicy,
    ceiling: LimitCeiling,
    storage_root: PathBuf,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn ComponentExecutor>,
        retry_policy: RetryPolicy,
        ceiling: LimitCeiling,
        storage_root: PathBuf,
    ) -> Self {
        Self {
            store,
            executor,
            retry_policy,
            ceiling,
            storage_root,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Runs one attempt for an already claimed job (status `Started`).
    ///
    /// `attempt` is zero-based and equals the job's retry count at claim
    /// time.
    pub async fn dispatch(
        &self,
        mut job: Job,
        attempt: u32,
        cancellation: CancellationFlag,
    ) -> DispatchOutcome {
        let job_id = job.id;
        info!(job_id = %job_id, attempt, "Dispatching job");

        match self.run_attempt(&job, cancellation).await {
            Ok((outputs, report)) => self.complete(&mut job, outputs, report).await,
            Err(ComponentError::Cancelled) => {
                // The cancel path owns the state transition; this attempt
                // just stops.
                info!(job_id = %job_id, "Attempt aborted by cancellation");
                DispatchOutcome::Fatal {
                    reason: "cancelled".to_string(),
                }
            }
            Err(error) => self.fail_or_retry(&mut job, attempt, error).await,
        }
    }

    /// The provision → execute → collect sequence, with cleanup on every
    /// path that allocated a handle.
    async fn run_attempt(
        &self,
        job: &Job,
        cancellation: CancellationFlag,
    ) -> Result<(Vec<ComponentInterfaceValue>, ExecutionReport), ComponentError> {
        let inputs = io::materialize_inputs(&job.inputs)?;
        let limits = limits::validate(&job.limits, &self.ceiling)?;

        let image = self.store.get_image(job.image_id).await?;
        if !image.is_executable() {
            return Err(ComponentError::ImageInvalid {
                message: format!("image {} is not marked ready", image.id),
            });
        }

        let spec = ExecutionSpec {
            job_id: job.id,
            image_reference: image.reference(),
            inputs,
            expected_outputs: job.expected_outputs.iter().map(OutputSpec::from).collect(),
            limits,
            cancellation,
        };

        let mut handle = self.executor.provision(&spec).await?;

        let attempt_result = match self.executor.execute(&spec, &mut handle).await {
            Ok(report) => self
                .executor
                .collect_outputs(&spec, &handle)
                .await
                .map(|raw| (report, raw)),
            Err(error) => Err(error),
        };

        // Exactly once, on every path, and before any retry is scheduled
        self.executor.cleanup(handle).await;

        let (report, raw_outputs) = attempt_result?;
        let outputs = self.materialize(job, &raw_outputs)?;
        Ok((outputs, report))
    }

    fn materialize(
        &self,
        job: &Job,
        raw_outputs: &[RawOutput],
    ) -> Result<Vec<ComponentInterfaceValue>, ComponentError> {
        let storage = self.storage_root.join(job.id.to_string());
        io::materialize_outputs(raw_outputs, &job.expected_outputs, &storage)
    }

    async fn complete(
        &self,
        job: &mut Job,
        outputs: Vec<ComponentInterfaceValue>,
        report: ExecutionReport,
    ) -> DispatchOutcome {
        let output_count = outputs.len();
        if let Err(error) = job.mark_succeeded(outputs, report.exec_duration) {
            error!(job_id = %job.id, %error, "Could not mark job succeeded");
            return DispatchOutcome::Fatal {
                reason: error.to_string(),
            };
        }
        job.stdout = Some(report.stdout);
        job.stderr = Some(report.stderr);
        job.used_warm_pool = report.used_warm_pool;
        job.warm_pool_duration = report.warm_pool_duration;

        match self.store.save_transition(job, JobStatus::Started).await {
            Ok(true) => {}
            Ok(false) => {
                // The job moved underneath us: cancelled while completing
                warn!(job_id = %job.id, "Completion lost the status race");
                return DispatchOutcome::Fatal {
                    reason: "job state changed during attempt".to_string(),
                };
            }
            Err(error) => {
                error!(job_id = %job.id, %error, "Could not persist completion");
                return DispatchOutcome::Fatal {
                    reason: error.to_string(),
                };
            }
        }

        self.record(
            job.id,
            ExecutionEventType::JobCompleted,
            Some(json!({
                "outputs": output_count,
                "exec_duration_secs": report.exec_duration.as_secs(),
                "used_warm_pool": report.used_warm_pool,
            })),
        )
        .await;

        info!(
            job_id = %job.id,
            outputs = output_count,
            "Job state change: Started -> Succeeded"
        );
        DispatchOutcome::Completed
    }

    async fn fail_or_retry(
        &self,
        job: &mut Job,
        attempt: u32,
        error: ComponentError,
    ) -> DispatchOutcome {
        if self.retry_policy.should_retry(attempt, &error) {
            return self.schedule_retry(job, attempt, error).await;
        }

        // Distinguish "gave up" from "can never succeed": an exhausted
        // budget is recorded on top of the underlying error, whose last
        // line stays the user-visible reason.
        let exhausted = self.retry_policy.conditions_allow(&error);
        let detail = if exhausted {
            let budget = ComponentError::MaxRetriesExceeded {
                attempts: attempt + 1,
            };
            format!("{budget}\n{}", diagnostic_detail(&error))
        } else {
            diagnostic_detail(&error)
        };

        if let Err(transition_error) = job.mark_failed(&detail) {
            error!(job_id = %job.id, error = %transition_error, "Could not mark job failed");
            return DispatchOutcome::Fatal {
                reason: transition_error.to_string(),
            };
        }

        match self.store.save_transition(job, JobStatus::Started).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "Failure lost the status race");
                return DispatchOutcome::Fatal {
                    reason: "job state changed during attempt".to_string(),
                };
            }
            Err(store_error) => {
                error!(job_id = %job.id, error = %store_error, "Could not persist failure");
                return DispatchOutcome::Fatal {
                    reason: store_error.to_string(),
                };
            }
        }

        let reason = job
            .error_message
            .clone()
            .unwrap_or_else(|| error.to_string());
        self.record(
            job.id,
            ExecutionEventType::JobFailed,
            Some(json!({
                "attempt": attempt,
                "retries_exhausted": exhausted,
                "error": reason,
            })),
        )
        .await;

        error!(
            job_id = %job.id,
            %error,
            retries_exhausted = exhausted,
            "Job state change: Started -> Failed"
        );
        DispatchOutcome::Fatal { reason }
    }

    async fn schedule_retry(
        &self,
        job: &mut Job,
        attempt: u32,
        error: ComponentError,
    ) -> DispatchOutcome {
        let delay = self.retry_policy.calculate_delay(attempt);
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));

        if let Err(transition_error) = job.mark_retry(retry_at, diagnostic_detail(&error)) {
            error!(job_id = %job.id, error = %transition_error, "Could not schedule retry");
            return DispatchOutcome::Fatal {
                reason: transition_error.to_string(),
            };
        }

        match self.store.save_transition(job, JobStatus::Started).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "Retry scheduling lost the status race");
                return DispatchOutcome::Fatal {
                    reason: "job state changed during attempt".to_string(),
                };
            }
            Err(store_error) => {
                error!(job_id = %job.id, error = %store_error, "Could not persist retry");
                return DispatchOutcome::Fatal {
                    reason: store_error.to_string(),
                };
            }
        }

        self.record(
            job.id,
            ExecutionEventType::JobRetryScheduled,
            Some(json!({
                "attempt": attempt + 1,
                "retry_at": retry_at.to_rfc3339(),
                "error": error.user_message(),
            })),
        )
        .await;

        warn!(
            job_id = %job.id,
            attempt = attempt + 1,
            delay_secs = delay.as_secs(),
            error = %error,
            "Job state change: Started -> Retry"
        );
        DispatchOutcome::Retry {
            attempt: attempt + 1,
            delay,
        }
    }

    pub(crate) async fn record(
        &self,
        job_id: uuid::Uuid,
        event_type: ExecutionEventType,
        event_data: Option<serde_json::Value>,
    ) {
        let event = ExecutionEvent::new(job_id, event_type, event_data);
        if let Err(error) = self.store.record_event(event).await {
            warn!(job_id = %job_id, %error, "Could not record execution event");
        }
    }
}

/// Full diagnostic text persisted with a failed job. For container exits
/// this is the captured stderr, whose last line becomes the user message.
fn diagnostic_detail(error: &ComponentError) -> String {
    match error {
        ComponentError::ExecutionFailed { exit_code, detail } if !detail.trim().is_empty() => {
            format!("Container exited with code {exit_code}\n{detail}")
        }
        other => other.to_string(),
    }
}
