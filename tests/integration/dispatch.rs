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

//! Dispatch-path behavior: retries, fatal classification, cleanup
//! discipline and the completeness invariant.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use gantry::dispatcher::{DispatchOutcome, Dispatcher};
use gantry::executor::CancellationFlag;
use gantry::limits::{LimitCeiling, ResourceLimits};
use gantry::models::job::JobStatus;
use gantry::models::value::{ComponentInterfaceValue, ValuePayload};
use gantry::retry::{RetryCondition, RetryPolicy};
use gantry::store::JobStore;

use crate::fixtures::{
    job_with_limits, metrics_interface, ready_image, simple_job, store, ScriptedExecutor, Step,
};

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .initial_delay(Duration::from_millis(1))
        .with_jitter(false)
        .retry_condition(RetryCondition::TransientOnly)
        .build()
}

fn dispatcher(
    store: Arc<gantry::store::InMemoryStore>,
    executor: Arc<ScriptedExecutor>,
    max_attempts: u32,
    storage: PathBuf,
) -> Dispatcher {
    Dispatcher::new(
        store,
        executor,
        policy(max_attempts),
        LimitCeiling::default(),
        storage,
    )
}

/// Claims the job (ignoring retry delays) and runs one attempt.
async fn drive_once(
    dispatcher: &Dispatcher,
    store: &gantry::store::InMemoryStore,
    job_id: uuid::Uuid,
) -> DispatchOutcome {
    let far_future = Utc::now() + chrono::Duration::days(1);
    let job = store
        .claim_job(job_id, far_future)
        .await
        .unwrap()
        .expect("job should be claimable");
    let attempt = job.retries;
    dispatcher
        .dispatch(job, attempt, CancellationFlag::new())
        .await
}

#[tokio::test]
async fn successful_attempt_persists_outputs_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Succeed {
        output_bytes: br#"{"dice": 0.91}"#,
    }]));
    let dispatcher = dispatcher(
        Arc::clone(&store),
        Arc::clone(&executor),
        3,
        dir.path().to_path_buf(),
    );

    let image_id = ready_image(&store).await;
    let job = simple_job(image_id);
    let job_id = job.id;
    store.create_job(job).await.unwrap();

    let outcome = drive_once(&dispatcher, &store, job_id).await;
    assert_eq!(outcome, DispatchOutcome::Completed);

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Succeeded);
    assert_eq!(job.outputs().len(), 1);
    assert_eq!(job.exec_duration, Some(Duration::from_secs(5)));
    assert!(job.utilization().is_some());

    assert_eq!(executor.provisions.load(Ordering::SeqCst), 1);
    assert_eq!(executor.cleanups.load(Ordering::SeqCst), 1);
}

/// Scenario: a job times out on every attempt. With three total attempts
/// the third failure is terminal, reported as an exhausted retry budget.
#[tokio::test]
async fn repeated_timeouts_exhaust_the_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Timeout]));
    let dispatcher = dispatcher(
        Arc::clone(&store),
        Arc::clone(&executor),
        3,
        dir.path().to_path_buf(),
    );

    let image_id = ready_image(&store).await;
    let job = simple_job(image_id);
    let job_id = job.id;
    store.create_job(job).await.unwrap();

    // Attempt 0 -> Retry with retries == 1
    let outcome = drive_once(&dispatcher, &store, job_id).await;
    assert!(matches!(outcome, DispatchOutcome::Retry { attempt: 1, .. }));
    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Retry);
    assert_eq!(job.retries, 1);

    // Attempt 1 -> Retry with retries == 2
    let outcome = drive_once(&dispatcher, &store, job_id).await;
    assert!(matches!(outcome, DispatchOutcome::Retry { attempt: 2, .. }));
    assert_eq!(store.get_job(job_id).await.unwrap().retries, 2);

    // Attempt 2 -> budget exhausted, terminal failure
    let outcome = drive_once(&dispatcher, &store, job_id).await;
    assert!(matches!(outcome, DispatchOutcome::Fatal { .. }));

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert_eq!(job.retries, 2);
    // The user sees the underlying timeout; the exhausted budget is
    // operator detail.
    assert_eq!(
        job.error_message.as_deref(),
        Some("Execution timed out after 60 seconds")
    );
    assert!(job
        .detailed_error
        .as_deref()
        .unwrap()
        .contains("Giving up after 3 attempts"));

    // One execution and one cleanup per attempt, never overlapping
    assert_eq!(executor.executions.load(Ordering::SeqCst), 3);
    assert_eq!(executor.cleanups.load(Ordering::SeqCst), 3);
    assert!(!executor.overlap_detected.load(Ordering::SeqCst));
}

/// Scenario: an input value references a file missing from storage. The
/// failure is fatal, happens before any provisioning, and leaves the retry
/// counter untouched.
#[tokio::test]
async fn unresolved_input_fails_before_provisioning() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Succeed {
        output_bytes: b"{}",
    }]));
    let dispatcher = dispatcher(
        Arc::clone(&store),
        Arc::clone(&executor),
        3,
        dir.path().to_path_buf(),
    );

    let image_id = ready_image(&store).await;
    let mut job = simple_job(image_id);
    let missing_input = ComponentInterfaceValue::new(
        gantry::models::interface::ComponentInterface::new(
            "ct-image",
            gantry::models::interface::InterfaceKind::Image,
            "images/ct.mha",
        )
        .unwrap(),
        ValuePayload::File {
            path: PathBuf::from("/storage/evaporated.mha"),
        },
    )
    .unwrap();
    job.inputs.push(missing_input);
    let job_id = job.id;
    store.create_job(job).await.unwrap();

    let outcome = drive_once(&dispatcher, &store, job_id).await;
    assert!(matches!(outcome, DispatchOutcome::Fatal { .. }));

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert_eq!(job.retries, 0);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("could not be resolved"));

    // No infrastructure was touched
    assert_eq!(executor.provisions.load(Ordering::SeqCst), 0);
    assert_eq!(executor.cleanups.load(Ordering::SeqCst), 0);
}

/// Scenario: the container writes metrics JSON containing NaN. Output
/// materialization rejects it, the job fails terminally, and no output
/// value is created.
#[tokio::test]
async fn malformed_output_is_fatal_with_no_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Succeed {
        output_bytes: br#"{"dice": NaN}"#,
    }]));
    let dispatcher = dispatcher(
        Arc::clone(&store),
        Arc::clone(&executor),
        3,
        dir.path().to_path_buf(),
    );

    let image_id = ready_image(&store).await;
    let job = simple_job(image_id);
    let job_id = job.id;
    store.create_job(job).await.unwrap();

    let outcome = drive_once(&dispatcher, &store, job_id).await;
    assert!(matches!(outcome, DispatchOutcome::Fatal { .. }));

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.outputs().is_empty());
    assert!(job.error_message.as_deref().unwrap().contains("malformed"));

    // The handle was still released exactly once
    assert_eq!(executor.cleanups.load(Ordering::SeqCst), 1);
}

/// A limit request above the scope ceiling never reaches the backend.
#[tokio::test]
async fn limits_above_ceiling_fail_before_provisioning() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Succeed {
        output_bytes: b"{}",
    }]));
    let dispatcher = dispatcher(
        Arc::clone(&store),
        Arc::clone(&executor),
        3,
        dir.path().to_path_buf(),
    );

    let image_id = ready_image(&store).await;
    let job = job_with_limits(
        image_id,
        ResourceLimits {
            cpu_count: 2,
            memory_gb: 512, // far above the default ceiling
            time_limit_secs: 60,
            gpu: gantry::limits::GpuRequest::None,
        },
    );
    let job_id = job.id;
    store.create_job(job).await.unwrap();

    let outcome = drive_once(&dispatcher, &store, job_id).await;
    assert!(matches!(outcome, DispatchOutcome::Fatal { .. }));

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("exceed the configured limits"));
    assert_eq!(executor.provisions.load(Ordering::SeqCst), 0);
}

/// A crash of the submitted algorithm is fatal: the user sees the last
/// stderr line, the operator keeps the full detail.
#[tokio::test]
async fn container_crash_is_fatal_and_surfaces_last_stderr_line() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::Crash {
        exit_code: 1,
        stderr: "Traceback (most recent call last):\n  ...\nValueError: empty scan",
    }]));
    let dispatcher = dispatcher(
        Arc::clone(&store),
        Arc::clone(&executor),
        3,
        dir.path().to_path_buf(),
    );

    let image_id = ready_image(&store).await;
    let job = simple_job(image_id);
    let job_id = job.id;
    store.create_job(job).await.unwrap();

    let outcome = drive_once(&dispatcher, &store, job_id).await;
    assert!(matches!(outcome, DispatchOutcome::Fatal { .. }));

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert_eq!(job.retries, 0, "algorithm crashes are not retried");
    assert_eq!(job.error_message.as_deref(), Some("ValueError: empty scan"));
    assert!(job
        .detailed_error
        .as_deref()
        .unwrap()
        .contains("Traceback"));
}

/// A transient backend outage retries, and a later attempt can succeed.
#[tokio::test]
async fn transient_outage_retries_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let executor = Arc::new(ScriptedExecutor::new(vec![
        Step::Unavailable,
        Step::Succeed {
            output_bytes: br#"{"dice": 0.77}"#,
        },
    ]));
    let dispatcher = dispatcher(
        Arc::clone(&store),
        Arc::clone(&executor),
        3,
        dir.path().to_path_buf(),
    );

    let image_id = ready_image(&store).await;
    let job = simple_job(image_id);
    let job_id = job.id;
    store.create_job(job).await.unwrap();

    let outcome = drive_once(&dispatcher, &store, job_id).await;
    assert!(matches!(outcome, DispatchOutcome::Retry { attempt: 1, .. }));

    let outcome = drive_once(&dispatcher, &store, job_id).await;
    assert_eq!(outcome, DispatchOutcome::Completed);

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Succeeded);
    assert_eq!(job.retries, 1);
    assert_eq!(job.outputs().len(), 1);
}

/// Duplicate delivery of the same dispatch message: the second claim loses
/// the compare-and-set and nothing runs twice.
#[tokio::test]
async fn duplicate_delivery_claims_once() {
    let store = store();
    let image_id = ready_image(&store).await;
    let job = simple_job(image_id);
    let job_id = job.id;
    store.create_job(job).await.unwrap();

    let now = Utc::now();
    let first = store.claim_job(job_id, now).await.unwrap();
    assert!(first.is_some());
    let second = store.claim_job(job_id, now).await.unwrap();
    assert!(second.is_none(), "duplicate delivery must not re-claim");
}

/// A missing expected output is fatal even though execution succeeded.
#[tokio::test]
async fn missing_output_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let executor = Arc::new(ScriptedExecutor::new(vec![Step::NoOutputs]));
    let dispatcher = dispatcher(
        Arc::clone(&store),
        Arc::clone(&executor),
        3,
        dir.path().to_path_buf(),
    );

    let image_id = ready_image(&store).await;
    let job = simple_job(image_id);
    let job_id = job.id;
    store.create_job(job).await.unwrap();

    let outcome = drive_once(&dispatcher, &store, job_id).await;
    assert!(matches!(outcome, DispatchOutcome::Fatal { .. }));

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.outputs().is_empty());
    assert_eq!(
        job.error_message.as_deref(),
        Some(format!("Required output \"{}\" was not produced", metrics_interface().slug).as_str())
    );
    assert_eq!(executor.cleanups.load(Ordering::SeqCst), 1);
}

/// Cancellation mid-attempt leaves the cancel path's transition in place
/// and still releases the executor.
#[tokio::test]
async fn cancellation_mid_attempt_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let executor = Arc::new(
        ScriptedExecutor::new(vec![Step::Succeed {
            output_bytes: br#"{"dice": 0.5}"#,
        }])
        .with_latency(Duration::from_millis(200)),
    );
    let dispatcher = Arc::new(dispatcher(
        Arc::clone(&store),
        Arc::clone(&executor),
        3,
        dir.path().to_path_buf(),
    ));

    let image_id = ready_image(&store).await;
    let job = simple_job(image_id);
    let job_id = job.id;
    store.create_job(job).await.unwrap();

    let claimed = store.claim_job(job_id, Utc::now()).await.unwrap().unwrap();
    let flag = CancellationFlag::new();

    let attempt = {
        let dispatcher = Arc::clone(&dispatcher);
        let flag = flag.clone();
        tokio::spawn(async move { dispatcher.dispatch(claimed, 0, flag).await })
    };

    // Cancel while the attempt is executing
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut job = store.get_job(job_id).await.unwrap();
    job.cancel().unwrap();
    assert!(store
        .save_transition(&job, JobStatus::Started)
        .await
        .unwrap());
    flag.cancel();

    let outcome = attempt.await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Fatal { .. }));

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Cancelled);
    assert!(job.outputs().is_empty());
    assert_eq!(executor.cleanups.load(Ordering::SeqCst), 1);
}
