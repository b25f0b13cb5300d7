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

//! # Gantry
//!
//! Gantry is the job-execution control plane of a medical-imaging challenge
//! platform: it turns a submitted container image plus a set of typed
//! interface values into a completed job with validated outputs, through a
//! pluggable execution backend, with bounded retries and a fully audited
//! state machine.
//!
//! ## Architecture
//!
//! - [`models`] — jobs, container images, interfaces and their bound
//!   values, execution events.
//! - [`store`] — the persistence boundary: compare-and-set saves and atomic
//!   claiming, with an in-memory implementation for embedded use and tests.
//! - [`io`] — value resolution between persisted interface values and the
//!   execution sandbox, with strict output validation.
//! - [`limits`] — per-scope resource ceilings, enforced before any
//!   provisioning.
//! - [`executor`] — the backend contract and its two implementations:
//!   a local Docker daemon and a managed batch service.
//! - [`retry`] — bounded retry policies with configurable backoff.
//! - [`dispatcher`] — the attempt orchestration ([`Dispatcher`]) and the
//!   consumer loop ([`JobProcessor`]).
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gantry::{
//!     config::GantryConfig, dispatcher::JobProcessor, executor::executor_for,
//!     store::InMemoryStore,
//! };
//!
//! let config = GantryConfig::from_toml_file("gantry.toml".as_ref())?;
//! let store = Arc::new(InMemoryStore::new());
//! let executor = executor_for(&config)?;
//! let processor = Arc::new(JobProcessor::new(store, executor, &config));
//!
//! // The write path enqueues explicitly; the processor loop does the rest.
//! processor.submit(job).await?;
//! processor.run().await?;
//! ```
//!
//! ## Execution guarantees
//!
//! - A job is claimed with an atomic compare-and-set: duplicate queue
//!   deliveries run it once.
//! - `cleanup` runs exactly once per attempt, on every exit path, before
//!   any retry is scheduled — attempts for one job never overlap.
//! - Recoverable failures are retried on a bounded, backoff-delayed
//!   schedule; exhausting the budget is recorded distinctly from a fatal
//!   error.
//! - A job has outputs exactly when it succeeded, and every output was
//!   validated against its interface before the job was marked so.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod io;
pub mod limits;
pub mod models;
pub mod retry;
pub mod store;

pub use config::{BackendKind, GantryConfig};
pub use dispatcher::{DispatchOutcome, Dispatcher, JobProcessor};
pub use error::{ComponentError, ConfigError};
pub use executor::{
    executor_for, ComponentExecutor, ExecutionHandle, ExecutionReport, ExecutionSpec,
};
pub use limits::{GpuRequest, GpuType, LimitCeiling, ResourceLimits};
pub use models::{
    ComponentInterface, ComponentInterfaceValue, ContainerImage, ImageDigest, ImageStatus,
    InterfaceKind, Job, JobStatus, ValuePayload,
};
pub use retry::{BackoffStrategy, RetryCondition, RetryPolicy};
pub use store::{InMemoryStore, JobStore};
