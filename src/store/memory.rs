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

//! In-memory [`JobStore`] implementation.
//!
//! Backs the embedded runner and the test-suite. All operations take a
//! single mutex over the store state, which makes every operation — in
//! particular claim and compare-and-set — trivially atomic. Nothing here
//! blocks while holding the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use super::JobStore;
use crate::error::ComponentError;
use crate::models::container_image::ContainerImage;
use crate::models::execution_event::ExecutionEvent;
use crate::models::job::{Job, JobStatus};

#[derive(Default)]
struct StoreState {
    jobs: HashMap<Uuid, Job>,
    images: HashMap<Uuid, ContainerImage>,
    events: Vec<ExecutionEvent>,
}

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    notify: Arc<Notify>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, ComponentError> {
        self.state.lock().map_err(|_| ComponentError::Store {
            message: "store mutex poisoned".into(),
        })
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(&self, job: Job) -> Result<(), ComponentError> {
        {
            let mut state = self.lock()?;
            state.jobs.insert(job.id, job);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, ComponentError> {
        let state = self.lock()?;
        state
            .jobs
            .get(&id)
            .cloned()
            .ok_or(ComponentError::NotFound {
                entity: "job",
                id: id.to_string(),
            })
    }

    async fn filter_jobs(&self, status: JobStatus) -> Result<Vec<Job>, ComponentError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status() == status)
            .cloned()
            .collect())
    }

    async fn save_transition(
        &self,
        job: &Job,
        expected: JobStatus,
    ) -> Result<bool, ComponentError> {
        let became_claimable = {
            let mut state = self.lock()?;
            let stored = state
                .jobs
                .get_mut(&job.id)
                .ok_or(ComponentError::NotFound {
                    entity: "job",
                    id: job.id.to_string(),
                })?;

            if stored.status() != expected {
                return Ok(false);
            }
            *stored = job.clone();
            matches!(job.status(), JobStatus::Pending | JobStatus::Retry)
        };

        if became_claimable {
            self.notify.notify_waiters();
        }
        Ok(true)
    }

    async fn bulk_update(&self, jobs: &[Job]) -> Result<(), ComponentError> {
        let mut state = self.lock()?;
        for job in jobs {
            if !state.jobs.contains_key(&job.id) {
                return Err(ComponentError::NotFound {
                    entity: "job",
                    id: job.id.to_string(),
                });
            }
        }
        for job in jobs {
            state.jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn claim_job(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, ComponentError> {
        let mut state = self.lock()?;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Err(ComponentError::NotFound {
                entity: "job",
                id: id.to_string(),
            });
        };

        if !job.is_due(now) {
            return Ok(None);
        }
        job.mark_started()?;
        Ok(Some(job.clone()))
    }

    async fn claim_due_jobs(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, ComponentError> {
        let mut state = self.lock()?;

        let mut due: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|job| job.is_due(now))
            .map(|job| job.id)
            .collect();

        // Oldest first, like a queue
        due.sort_by_key(|id| state.jobs[id].created_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let job = state.jobs.get_mut(&id).expect("id from the same lock");
            job.mark_started()?;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn stalled_jobs(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<Job>, ComponentError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .filter(|job| {
                job.status() == JobStatus::Started
                    && job.started_at.map_or(false, |started| {
                        let deadline = started
                            + chrono::Duration::seconds(job.limits.time_limit_secs as i64)
                            + chrono::Duration::from_std(grace).unwrap_or_default();
                        deadline < now
                    })
            })
            .cloned()
            .collect())
    }

    async fn create_image(&self, image: ContainerImage) -> Result<(), ComponentError> {
        let mut state = self.lock()?;
        let duplicate = state.images.values().any(|existing| {
            existing.owner_scope == image.owner_scope && existing.digest == image.digest
        });
        if duplicate {
            return Err(ComponentError::ImageInvalid {
                message: format!(
                    "image {} already exists in scope {}",
                    image.digest, image.owner_scope
                ),
            });
        }
        state.images.insert(image.id, image);
        Ok(())
    }

    async fn get_image(&self, id: Uuid) -> Result<ContainerImage, ComponentError> {
        let state = self.lock()?;
        state
            .images
            .get(&id)
            .cloned()
            .ok_or(ComponentError::NotFound {
                entity: "container image",
                id: id.to_string(),
            })
    }

    async fn record_event(&self, event: ExecutionEvent) -> Result<(), ComponentError> {
        let mut state = self.lock()?;
        state.events.push(event);
        Ok(())
    }

    async fn events_for_job(&self, job_id: Uuid) -> Result<Vec<ExecutionEvent>, ComponentError> {
        let state = self.lock()?;
        Ok(state
            .events
            .iter()
            .filter(|event| event.job_id == job_id)
            .cloned()
            .collect())
    }

    fn work_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}
