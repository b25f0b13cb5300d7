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

//! The job record and its state machine.
//!
//! A [`Job`] is one execution of a container image against a set of bound
//! input values. Its status moves through a fixed state machine:
//!
//! ```text
//! Pending ──> Started ──> Succeeded
//!    ^           │ ├────> Failed
//!    │           │ └────> Cancelled
//!    │           └──> Retry ──> Started   (bounded by the retry policy)
//!    └── requeue (administrative, from a terminal state)
//! ```
//!
//! Transitions are monotonic: no path leads from a terminal state back to a
//! running one except the explicit administrative requeue, which resets the
//! retry counter and durations. All transition methods validate the current
//! status and return [`ComponentError::InvalidTransition`] otherwise, so a
//! duplicate queue delivery can never rewind a job.
//!
//! After creation a job is mutated exclusively by the dispatcher and the
//! backend completion path — never by user-facing code.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::interface::ComponentInterface;
use super::value::ComponentInterfaceValue;
use crate::error::ComponentError;
use crate::limits::{GpuRequest, ResourceLimits};

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Started,
    /// Waiting for a scheduled re-dispatch after a recoverable failure.
    Retry,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states admit no transitions except administrative requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "Pending"),
            JobStatus::Started => write!(f, "Started"),
            JobStatus::Retry => write!(f, "Retry"),
            JobStatus::Succeeded => write!(f, "Succeeded"),
            JobStatus::Failed => write!(f, "Failed"),
            JobStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Billing-relevant usage of a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobUtilization {
    pub exec_duration: Duration,
    pub invoke_duration: Duration,
    pub memory_gb: u32,
    pub gpu: GpuRequest,
    pub used_warm_pool: bool,
}

impl JobUtilization {
    /// Memory-seconds consumed, the platform's compute-cost proxy.
    pub fn gb_seconds(&self) -> u64 {
        self.memory_gb as u64 * self.exec_duration.as_secs()
    }
}

/// One execution of a container image against a set of bound inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// The [`ContainerImage`](super::container_image::ContainerImage) to run.
    pub image_id: Uuid,
    status: JobStatus,
    pub limits: ResourceLimits,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When the next attempt becomes claimable, for jobs in
    /// [`JobStatus::Retry`].
    pub retry_at: Option<DateTime<Utc>>,

    /// Number of retries performed so far.
    pub retries: u32,

    /// User-safe failure summary: the last meaningful line of the detail.
    pub error_message: Option<String>,
    /// Full diagnostic detail, operator-only.
    pub detailed_error: Option<String>,
    /// Captured container output, operator-only.
    pub stdout: Option<String>,
    pub stderr: Option<String>,

    pub exec_duration: Option<Duration>,
    pub invoke_duration: Option<Duration>,
    pub used_warm_pool: bool,
    pub warm_pool_duration: Option<Duration>,

    pub inputs: Vec<ComponentInterfaceValue>,
    /// Output slots the container is expected to fill.
    pub expected_outputs: Vec<ComponentInterface>,
    outputs: Vec<ComponentInterfaceValue>,
}

impl Job {
    /// Creates a job in [`JobStatus::Pending`].
    pub fn new(
        image_id: Uuid,
        inputs: Vec<ComponentInterfaceValue>,
        expected_outputs: Vec<ComponentInterface>,
        limits: ResourceLimits,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            image_id,
            status: JobStatus::Pending,
            limits,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            retry_at: None,
            retries: 0,
            error_message: None,
            detailed_error: None,
            stdout: None,
            stderr: None,
            exec_duration: None,
            invoke_duration: None,
            used_warm_pool: false,
            warm_pool_duration: None,
            inputs,
            expected_outputs,
            outputs: Vec::new(),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Output values. Non-empty exactly when the job is
    /// [`JobStatus::Succeeded`].
    pub fn outputs(&self) -> &[ComponentInterfaceValue] {
        &self.outputs
    }

    fn transition(&mut self, valid_from: &[JobStatus], to: JobStatus) -> Result<(), ComponentError> {
        if !valid_from.contains(&self.status) {
            return Err(ComponentError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Marks the job as started. Valid from `Pending` or `Retry`.
    pub fn mark_started(&mut self) -> Result<(), ComponentError> {
        self.transition(&[JobStatus::Pending, JobStatus::Retry], JobStatus::Started)?;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.retry_at = None;
        Ok(())
    }

    /// Marks the job as succeeded, binding its output values and recording
    /// durations. Valid from `Started`; the output set must be non-empty —
    /// a job without outputs did not succeed.
    pub fn mark_succeeded(
        &mut self,
        outputs: Vec<ComponentInterfaceValue>,
        exec_duration: Duration,
    ) -> Result<(), ComponentError> {
        if outputs.is_empty() {
            return Err(ComponentError::InvalidTransition {
                from: self.status,
                to: JobStatus::Succeeded,
            });
        }
        self.transition(&[JobStatus::Started], JobStatus::Succeeded)?;

        let now = Utc::now();
        self.completed_at = Some(now);
        self.exec_duration = Some(exec_duration);
        self.invoke_duration = self.started_at.map(|started| {
            let total = (now - started).to_std().unwrap_or_default();
            total.saturating_sub(exec_duration)
        });
        self.outputs = outputs;
        Ok(())
    }

    /// Marks the job as failed, recording the full detail for operators and
    /// surfacing only its last meaningful line to users. Valid from
    /// `Started`.
    pub fn mark_failed(&mut self, detail: impl Into<String>) -> Result<(), ComponentError> {
        self.transition(&[JobStatus::Started], JobStatus::Failed)?;
        let detail = detail.into();
        self.error_message = Some(crate::error::summarize_for_user(&detail));
        self.detailed_error = Some(detail);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Schedules a retry after a recoverable failure. Valid from `Started`;
    /// increments the retry counter and resets the attempt timestamps.
    pub fn mark_retry(
        &mut self,
        retry_at: DateTime<Utc>,
        detail: impl Into<String>,
    ) -> Result<(), ComponentError> {
        self.transition(&[JobStatus::Started], JobStatus::Retry)?;
        let detail = detail.into();
        self.retries += 1;
        self.retry_at = Some(retry_at);
        self.started_at = None;
        self.completed_at = None;
        self.error_message = Some(crate::error::summarize_for_user(&detail));
        self.detailed_error = Some(detail);
        Ok(())
    }

    /// Cancels the job. Valid from `Pending`, `Started` or `Retry` (a
    /// scheduled retry is a delayed `Pending`).
    pub fn cancel(&mut self) -> Result<(), ComponentError> {
        self.transition(
            &[JobStatus::Pending, JobStatus::Started, JobStatus::Retry],
            JobStatus::Cancelled,
        )?;
        self.completed_at = Some(Utc::now());
        self.retry_at = None;
        Ok(())
    }

    /// Administrative requeue: re-enters `Pending` from a terminal state,
    /// resetting the retry counter, durations, warm-pool flags and error
    /// fields.
    pub fn requeue(&mut self) -> Result<(), ComponentError> {
        self.transition(
            &[JobStatus::Failed, JobStatus::Cancelled],
            JobStatus::Pending,
        )?;
        self.retries = 0;
        self.started_at = None;
        self.completed_at = None;
        self.retry_at = None;
        self.error_message = None;
        self.detailed_error = None;
        self.stdout = None;
        self.stderr = None;
        self.exec_duration = None;
        self.invoke_duration = None;
        self.used_warm_pool = false;
        self.warm_pool_duration = None;
        self.outputs.clear();
        Ok(())
    }

    /// Whether this job's next attempt is claimable at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Retry => self.retry_at.map(|at| at <= now).unwrap_or(true),
            _ => false,
        }
    }

    /// Compute utilization for a succeeded job, [`None`] otherwise.
    pub fn utilization(&self) -> Option<JobUtilization> {
        if self.status != JobStatus::Succeeded {
            return None;
        }
        Some(JobUtilization {
            exec_duration: self.exec_duration.unwrap_or_default(),
            invoke_duration: self.invoke_duration.unwrap_or_default(),
            memory_gb: self.limits.memory_gb,
            gpu: self.limits.gpu,
            used_warm_pool: self.used_warm_pool,
        })
    }
}
