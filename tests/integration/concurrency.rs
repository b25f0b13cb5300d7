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

//! Concurrency tests: claiming under contention and the processor's
//! execution-slot ceiling.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Barrier;

use gantry::config::GantryConfig;
use gantry::dispatcher::JobProcessor;
use gantry::models::job::JobStatus;
use gantry::store::JobStore;

use crate::fixtures::{init_tracing, ready_image, simple_job, store, ScriptedExecutor, Step};

/// Several workers claiming at once: every job is claimed exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn concurrent_claiming_produces_no_duplicates() {
    const NUM_JOBS: usize = 20;
    const NUM_WORKERS: usize = 4;

    init_tracing();
    let store = store();
    let image_id = ready_image(&store).await;

    let mut created = HashSet::new();
    for _ in 0..NUM_JOBS {
        let job = simple_job(image_id);
        created.insert(job.id);
        store.create_job(job).await.unwrap();
    }

    let barrier = Arc::new(Barrier::new(NUM_WORKERS));
    let mut workers = Vec::new();
    for _ in 0..NUM_WORKERS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        workers.push(tokio::spawn(async move {
            barrier.wait().await;
            let mut claimed = Vec::new();
            loop {
                let batch = store.claim_due_jobs(3, Utc::now()).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|job| job.id));
            }
            claimed
        }));
    }

    let mut all_claimed = Vec::new();
    for worker in workers {
        all_claimed.extend(worker.await.unwrap());
    }

    let unique: HashSet<_> = all_claimed.iter().copied().collect();
    assert_eq!(all_claimed.len(), unique.len(), "a job was claimed twice");
    assert_eq!(unique, created, "every job should be claimed exactly once");
}

/// The processor never exceeds its configured concurrency ceiling and
/// still completes everything.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial_test::serial]
async fn processor_respects_the_concurrency_ceiling() {
    const NUM_JOBS: usize = 12;
    const MAX_CONCURRENT: usize = 3;

    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = store();
    let executor = Arc::new(
        ScriptedExecutor::new(vec![Step::Succeed {
            output_bytes: br#"{"dice": 0.9}"#,
        }])
        .with_latency(Duration::from_millis(50)),
    );

    let mut config = GantryConfig::default();
    config.storage_root = dir.path().to_path_buf();
    config.processor.max_concurrent_jobs = MAX_CONCURRENT;
    config.processor.poll_interval = Duration::from_millis(20);

    let processor = Arc::new(JobProcessor::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::clone(&executor) as Arc<dyn gantry::executor::ComponentExecutor>,
        &config,
    ));

    let image_id = ready_image(&store).await;
    let mut job_ids = Vec::new();
    for _ in 0..NUM_JOBS {
        let job = simple_job(image_id);
        job_ids.push(processor.submit(job).await.unwrap());
    }

    let runner = {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move { processor.run().await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let done = {
            let mut done = true;
            for id in &job_ids {
                if !store.get_job(*id).await.unwrap().status().is_terminal() {
                    done = false;
                    break;
                }
            }
            done
        };
        if done {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    processor.shutdown();
    runner.await.unwrap().unwrap();

    for id in job_ids {
        assert_eq!(store.get_job(id).await.unwrap().status(), JobStatus::Succeeded);
    }
    assert!(
        executor.max_parallel.load(Ordering::SeqCst) <= MAX_CONCURRENT,
        "observed {} parallel executions, ceiling is {}",
        executor.max_parallel.load(Ordering::SeqCst),
        MAX_CONCURRENT
    );
    assert!(!executor.overlap_detected.load(Ordering::SeqCst));
}
