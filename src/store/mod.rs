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

//! Persistence boundary for the control plane.
//!
//! The control plane never constructs SQL — it talks to a [`JobStore`],
//! which exposes record access plus the handful of atomic operations
//! dispatch correctness depends on:
//!
//! - **Compare-and-set saves** ([`JobStore::save_transition`]): a job row is
//!   only written if its stored status still matches what the caller
//!   observed, so duplicate queue deliveries and concurrent workers cannot
//!   clobber each other's transitions.
//! - **Atomic claiming** ([`JobStore::claim_job`],
//!   [`JobStore::claim_due_jobs`]): moves a due job to `Started` in one
//!   step; at most one claimer wins.
//!
//! Retry scheduling rides on the same mechanism: a retry is a job whose
//! `retry_at` lies in the future, and the claim operations simply skip rows
//!   that are not yet due — a delayed queue without a second queue system.
//!
//! The store also publishes a work signal ([`JobStore::work_notifier`])
//! whenever a write makes new work claimable, so the processor wakes
//! immediately instead of waiting out its poll interval.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::ComponentError;
use crate::models::container_image::ContainerImage;
use crate::models::execution_event::ExecutionEvent;
use crate::models::job::{Job, JobStatus};

pub use memory::InMemoryStore;

/// Persistence interface consumed by the control plane.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job and signals the work notifier.
    async fn create_job(&self, job: Job) -> Result<(), ComponentError>;

    async fn get_job(&self, id: Uuid) -> Result<Job, ComponentError>;

    async fn filter_jobs(&self, status: JobStatus) -> Result<Vec<Job>, ComponentError>;

    /// Compare-and-set save: writes `job` only if the stored status still
    /// equals `expected`. Returns `false` when the guard fails — the caller
    /// observed a stale status and must re-read.
    async fn save_transition(
        &self,
        job: &Job,
        expected: JobStatus,
    ) -> Result<bool, ComponentError>;

    /// Unconditional bulk write, for administrative tooling. Carries no
    /// status guard; the dispatch path always goes through
    /// [`JobStore::save_transition`].
    async fn bulk_update(&self, jobs: &[Job]) -> Result<(), ComponentError>;

    /// Atomically claims a specific job if it is due at `now`, transitioning
    /// it to `Started`. Returns `None` when the job is not claimable — the
    /// normal outcome for a duplicate queue delivery.
    async fn claim_job(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, ComponentError>;

    /// Atomically claims up to `limit` due jobs, oldest first.
    async fn claim_due_jobs(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, ComponentError>;

    /// Jobs still `Started` past their time limit plus `grace` — stalled
    /// workers, killed processes, lost messages.
    async fn stalled_jobs(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<Job>, ComponentError>;

    /// Persists a container image. The pair `(owner_scope, digest)` is
    /// unique; a duplicate is rejected.
    async fn create_image(&self, image: ContainerImage) -> Result<(), ComponentError>;

    async fn get_image(&self, id: Uuid) -> Result<ContainerImage, ComponentError>;

    async fn record_event(&self, event: ExecutionEvent) -> Result<(), ComponentError>;

    async fn events_for_job(&self, job_id: Uuid) -> Result<Vec<ExecutionEvent>, ComponentError>;

    /// Signalled whenever a write makes new work claimable.
    fn work_notifier(&self) -> Arc<Notify>;
}
