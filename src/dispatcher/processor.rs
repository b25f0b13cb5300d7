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

//! The queue consumer loop.
//!
//! [`JobProcessor::run`] waits for the store's work signal (with a poll
//! fallback for due retries), atomically claims due jobs, and executes each
//! under a semaphore that caps concurrent container executions. The caller
//! enqueues work by writing jobs to the store — the write path publishes
//! the signal, there is no hidden registry of handlers.
//!
//! A claim moves the job to `Started` with a compare-and-set, so a message
//! delivered twice (or two processors racing) runs the job once: the loser
//! simply finds nothing to claim.
//!
//! The processor also owns the stalled-job sweep and the administrative
//! operations: cancellation (which kills in-flight attempts through their
//! cancellation flags) and requeue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatch::{DispatchOutcome, Dispatcher};
use crate::config::GantryConfig;
use crate::error::ComponentError;
use crate::executor::{CancellationFlag, ComponentExecutor};
use crate::models::execution_event::ExecutionEventType;
use crate::models::job::{Job, JobStatus};
use crate::store::JobStore;

/// Long-running consumer that turns persisted jobs into executions.
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    settings: crate::config::ProcessorSettings,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    in_flight: Arc<Mutex<HashMap<Uuid, CancellationFlag>>>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn ComponentExecutor>,
        config: &GantryConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            executor,
            config.retry_policy.clone(),
            config.limit_ceiling.clone(),
            config.storage_root.clone(),
        ));

        Self {
            store,
            dispatcher,
            settings: config.processor.clone(),
            semaphore: Arc::new(Semaphore::new(config.processor.max_concurrent_jobs)),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Persists a new job and signals the consumer loop. This is the
    /// explicit enqueue point for the write path.
    pub async fn submit(&self, job: Job) -> Result<Uuid, ComponentError> {
        let job_id = job.id;
        self.store.create_job(job).await?;
        self.dispatcher
            .record(
                job_id,
                ExecutionEventType::JobCreated,
                None,
            )
            .await;
        debug!(job_id = %job_id, "Job submitted");
        Ok(job_id)
    }

    /// Runs the consumer loop until [`JobProcessor::shutdown`] is called,
    /// then drains in-flight attempts before returning.
    pub async fn run(&self) -> Result<(), ComponentError> {
        info!(
            max_concurrent = self.settings.max_concurrent_jobs,
            poll_secs = self.settings.poll_interval.as_secs(),
            "Job processor starting"
        );

        let work = self.store.work_notifier();
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        let mut last_reap = tokio::time::Instant::now();

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = work.notified() => {}
                _ = poll.tick() => {}
                _ = self.shutdown_notify.notified() => break,
            }

            if last_reap.elapsed() >= self.settings.reap_interval {
                last_reap = tokio::time::Instant::now();
                self.reap_stalled().await;
            }

            if let Err(error) = self.claim_and_spawn().await {
                error!(%error, "Claim cycle failed");
            }
        }

        // Drain: wait for every slot to come back
        let _permits = self
            .semaphore
            .acquire_many(self.settings.max_concurrent_jobs as u32)
            .await;
        info!("Job processor stopped");
        Ok(())
    }

    /// Requests loop termination. In-flight attempts finish; queued jobs
    /// stay claimable for the next run.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    async fn claim_and_spawn(&self) -> Result<(), ComponentError> {
        loop {
            let free_slots = self.semaphore.available_permits();
            if free_slots == 0 {
                debug!("All execution slots busy, skipping claim");
                return Ok(());
            }

            let batch = free_slots.min(self.settings.claim_batch_size);
            let claimed = self.store.claim_due_jobs(batch, Utc::now()).await?;
            if claimed.is_empty() {
                return Ok(());
            }

            for job in claimed {
                self.dispatcher
                    .record(
                        job.id,
                        ExecutionEventType::JobClaimed,
                        Some(json!({"attempt": job.retries})),
                    )
                    .await;
                self.spawn_attempt(job).await;
            }
        }
    }

    async fn spawn_attempt(&self, job: Job) {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // semaphore closed during shutdown
        };

        let cancellation = CancellationFlag::new();
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.insert(job.id, cancellation.clone());
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let in_flight = Arc::clone(&self.in_flight);
        let job_id = job.id;
        let attempt = job.retries;

        tokio::spawn(async move {
            let _permit = permit; // held for the whole attempt

            let outcome = dispatcher.dispatch(job, attempt, cancellation).await;
            match &outcome {
                DispatchOutcome::Completed => {
                    debug!(job_id = %job_id, "Attempt completed");
                }
                DispatchOutcome::Retry { attempt, delay } => {
                    debug!(
                        job_id = %job_id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "Attempt scheduled for retry"
                    );
                }
                DispatchOutcome::Fatal { reason } => {
                    debug!(job_id = %job_id, reason = %reason, "Attempt ended terminally");
                }
            }

            let mut in_flight = in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.remove(&job_id);
        });
    }

    /// Cancels a job: queued jobs transition directly, running jobs are
    /// signalled through their cancellation flag and their executor is
    /// cleaned up by the owning attempt.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), ComponentError> {
        let mut job = self.store.get_job(job_id).await?;
        let observed = job.status();
        job.cancel()?;

        if !self.store.save_transition(&job, observed).await? {
            // Lost the race — re-read and report what the job became
            let current = self.store.get_job(job_id).await?;
            return Err(ComponentError::InvalidTransition {
                from: current.status(),
                to: JobStatus::Cancelled,
            });
        }

        if observed == JobStatus::Started {
            let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(flag) = in_flight.get(&job_id) {
                flag.cancel();
            }
        }

        self.dispatcher
            .record(
                job_id,
                ExecutionEventType::JobCancelled,
                Some(json!({"was": observed.to_string()})),
            )
            .await;
        info!(job_id = %job_id, from = %observed, "Job state change: {} -> Cancelled", observed);
        Ok(())
    }

    /// Administrative requeue: resets counters and durations and re-enters
    /// `Pending`. Only valid on terminal jobs.
    pub async fn requeue_job(&self, job_id: Uuid) -> Result<(), ComponentError> {
        let mut job = self.store.get_job(job_id).await?;
        let observed = job.status();
        job.requeue()?;

        if !self.store.save_transition(&job, observed).await? {
            let current = self.store.get_job(job_id).await?;
            return Err(ComponentError::InvalidTransition {
                from: current.status(),
                to: JobStatus::Pending,
            });
        }

        self.dispatcher
            .record(
                job_id,
                ExecutionEventType::JobRequeued,
                Some(json!({"was": observed.to_string()})),
            )
            .await;
        info!(job_id = %job_id, "Job state change: {} -> Pending (requeue)", observed);
        Ok(())
    }

    /// Fails jobs stuck in `Started` past their time limit plus the
    /// configured grace — a crashed worker or a lost completion.
    async fn reap_stalled(&self) {
        let stalled = match self
            .store
            .stalled_jobs(Utc::now(), self.settings.stall_grace)
            .await
        {
            Ok(stalled) => stalled,
            Err(error) => {
                error!(%error, "Stalled-job sweep failed");
                return;
            }
        };

        for mut job in stalled {
            // Skip jobs this processor is still actively running
            {
                let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if in_flight.contains_key(&job.id) {
                    continue;
                }
            }

            warn!(
                job_id = %job.id,
                started_at = ?job.started_at,
                "Reaping stalled job"
            );
            if job
                .mark_failed("Execution stalled: no completion within the time limit")
                .is_err()
            {
                continue;
            }
            match self.store.save_transition(&job, JobStatus::Started).await {
                Ok(true) => {
                    self.dispatcher
                        .record(job.id, ExecutionEventType::JobStalled, None)
                        .await;
                }
                Ok(false) => debug!(job_id = %job.id, "Stalled job resolved itself"),
                Err(error) => error!(job_id = %job.id, %error, "Could not reap stalled job"),
            }
        }
    }

    /// Number of attempts currently holding execution slots.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
