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

//! Dispatch orchestration.
//!
//! [`Dispatcher`] runs one job attempt end to end and reports what happened
//! as an explicit [`DispatchOutcome`] — the caller decides whether to
//! re-enqueue. [`JobProcessor`] is that caller: the long-running consumer
//! loop that claims due jobs, fans them out to the executor under a
//! concurrency ceiling, sweeps for stalled jobs, and exposes the
//! administrative operations (cancel, requeue).

mod dispatch;
mod processor;

pub use dispatch::{DispatchOutcome, Dispatcher};
pub use processor::JobProcessor;
