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

//! Shared fixtures: a scriptable executor and record builders.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use gantry::error::ComponentError;
use gantry::executor::{
    ComponentExecutor, ExecutionHandle, ExecutionReport, ExecutionSpec,
};
use gantry::io::RawOutput;
use gantry::models::container_image::{ContainerImage, ImageDigest};
use gantry::models::interface::{ComponentInterface, InterfaceKind};
use gantry::models::job::Job;
use gantry::limits::ResourceLimits;
use gantry::store::{InMemoryStore, JobStore};

/// What one scripted attempt should do.
#[derive(Debug, Clone)]
pub enum Step {
    /// Execute cleanly and produce the given bytes for every expected
    /// output.
    Succeed { output_bytes: &'static [u8] },
    /// Fail provisioning with a transient backend error.
    Unavailable,
    /// Run past the wall-clock limit.
    Timeout,
    /// The container exits non-zero with the given stderr.
    Crash { exit_code: i64, stderr: &'static str },
    /// Execute cleanly but produce nothing.
    NoOutputs,
}

/// Executor whose attempts follow a script, instrumented for the cleanup
/// and concurrency properties.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Step>>,
    pub provisions: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub executions: AtomicUsize,
    /// Set if two attempts for the same job were ever in flight at once.
    pub overlap_detected: AtomicBool,
    in_flight: Mutex<HashMap<Uuid, usize>>,
    /// Largest number of concurrently in-flight attempts across all jobs.
    pub max_parallel: AtomicUsize,
    /// Artificial execution latency, to exercise concurrency.
    pub latency: Duration,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            provisions: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            overlap_detected: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
            max_parallel: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Consumes the next step. The final step repeats, so short scripts
    /// describe steady-state behavior.
    fn next_step(&self) -> Step {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().expect("script exhausted")
        }
    }

    fn peek_step(&self) -> Step {
        let script = self.script.lock().unwrap();
        script.front().cloned().expect("script exhausted")
    }

    fn enter(&self, job_id: Uuid) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(job_id).or_insert(0);
        *count += 1;
        if *count > 1 {
            self.overlap_detected.store(true, Ordering::SeqCst);
        }
        let total: usize = in_flight.values().sum();
        self.max_parallel.fetch_max(total, Ordering::SeqCst);
    }

    fn exit(&self, job_id: Uuid) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(count) = in_flight.get_mut(&job_id) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&job_id);
            }
        }
    }
}

#[async_trait]
impl ComponentExecutor for ScriptedExecutor {
    async fn provision(&self, spec: &ExecutionSpec) -> Result<ExecutionHandle, ComponentError> {
        if matches!(self.peek_step(), Step::Unavailable) {
            self.next_step();
            return Err(ComponentError::BackendUnavailable {
                message: "daemon connection refused".to_string(),
            });
        }
        self.provisions.fetch_add(1, Ordering::SeqCst);
        self.enter(spec.job_id);
        Ok(ExecutionHandle::external(spec.job_id, "scripted"))
    }

    async fn execute(
        &self,
        spec: &ExecutionSpec,
        _handle: &mut ExecutionHandle,
    ) -> Result<ExecutionReport, ComponentError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.next_step() {
            Step::Succeed { .. } | Step::NoOutputs => Ok(ExecutionReport {
                exit_code: 0,
                stdout: "done".to_string(),
                stderr: String::new(),
                exec_duration: Duration::from_secs(5),
                used_warm_pool: false,
                warm_pool_duration: None,
            }),
            Step::Timeout => Err(ComponentError::ExecutionTimeout {
                limit_secs: spec.limits.time_limit_secs,
            }),
            Step::Crash { exit_code, stderr } => Err(ComponentError::ExecutionFailed {
                exit_code,
                detail: stderr.to_string(),
            }),
            Step::Unavailable => Err(ComponentError::BackendUnavailable {
                message: "daemon connection refused".to_string(),
            }),
        }
    }

    async fn collect_outputs(
        &self,
        spec: &ExecutionSpec,
        _handle: &ExecutionHandle,
    ) -> Result<Vec<RawOutput>, ComponentError> {
        // Only a terminal Succeed step reaches collection; the script keeps
        // its final step in place.
        match self.peek_step() {
            Step::Succeed { output_bytes } => Ok(spec
                .expected_outputs
                .iter()
                .map(|expected| RawOutput {
                    interface_slug: expected.interface_slug.clone(),
                    relative_path: expected.relative_path.clone(),
                    bytes: output_bytes.to_vec(),
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn cleanup(&self, handle: ExecutionHandle) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.exit(handle.job_id);
    }
}

pub fn metrics_interface() -> ComponentInterface {
    ComponentInterface::new("metrics-json", InterfaceKind::Json, "results.json").unwrap()
}

pub async fn ready_image(store: &InMemoryStore) -> Uuid {
    let mut image = ContainerImage::new(
        "phase-1",
        "registry.example.org/algo/lung-seg",
        ImageDigest::of_bytes(b"layers"),
    )
    .unwrap();
    image.mark_ready().unwrap();
    let id = image.id;
    store.create_image(image).await.unwrap();
    id
}

pub fn job_with_limits(image_id: Uuid, limits: ResourceLimits) -> Job {
    Job::new(
        image_id,
        Vec::new(),
        vec![metrics_interface()],
        limits,
    )
}

pub fn simple_job(image_id: Uuid) -> Job {
    job_with_limits(
        image_id,
        ResourceLimits {
            cpu_count: 2,
            memory_gb: 4,
            time_limit_secs: 60,
            gpu: gantry::limits::GpuRequest::None,
        },
    )
}

pub fn store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new())
}

/// Installs a subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
