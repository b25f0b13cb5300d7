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

//! Execution events: the audit trail of job state changes.
//!
//! Every transition the control plane performs on a job is recorded as an
//! event alongside the state change, so an operator can reconstruct exactly
//! what happened to a job and when.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of state change an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionEventType {
    JobCreated,
    JobClaimed,
    JobRetryScheduled,
    JobCompleted,
    JobFailed,
    JobCancelled,
    JobRequeued,
    JobStalled,
}

impl ExecutionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionEventType::JobCreated => "job_created",
            ExecutionEventType::JobClaimed => "job_claimed",
            ExecutionEventType::JobRetryScheduled => "job_retry_scheduled",
            ExecutionEventType::JobCompleted => "job_completed",
            ExecutionEventType::JobFailed => "job_failed",
            ExecutionEventType::JobCancelled => "job_cancelled",
            ExecutionEventType::JobRequeued => "job_requeued",
            ExecutionEventType::JobStalled => "job_stalled",
        }
    }
}

/// One recorded state change for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: Uuid,
    pub job_id: Uuid,
    pub event_type: ExecutionEventType,
    /// Event-specific detail (attempt numbers, retry times, error summaries).
    pub event_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(
        job_id: Uuid,
        event_type: ExecutionEventType,
        event_data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            event_type,
            event_data,
            created_at: Utc::now(),
        }
    }
}
