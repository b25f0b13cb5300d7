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

//! Resource-limit policy.
//!
//! Every job carries a [`ResourceLimits`] request; every owning scope (a
//! challenge phase, an algorithm) carries a [`LimitCeiling`]. [`validate`]
//! checks the request against the ceiling and produces [`ValidatedLimits`],
//! the only limit type the executor backends accept — so a job that asks for
//! more than its scope allows fails before any infrastructure is allocated.
//!
//! Memory is tracked in whole gigabytes and wall-clock time in whole
//! seconds. "No GPU" is represented distinctly from "any GPU".

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ComponentError;

/// GPU hardware classes a backend can schedule onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuType {
    T4,
    V100,
    A10G,
    A100,
}

impl fmt::Display for GpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuType::T4 => write!(f, "t4"),
            GpuType::V100 => write!(f, "v100"),
            GpuType::A10G => write!(f, "a10g"),
            GpuType::A100 => write!(f, "a100"),
        }
    }
}

/// A job's GPU request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "gpu_type", rename_all = "lowercase")]
pub enum GpuRequest {
    /// No GPU. Distinct from [`GpuRequest::Any`].
    #[default]
    None,
    /// Any GPU type the scope allows.
    Any,
    /// A specific GPU type.
    Type(GpuType),
}

impl fmt::Display for GpuRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuRequest::None => write!(f, "none"),
            GpuRequest::Any => write!(f, "any"),
            GpuRequest::Type(t) => write!(f, "{t}"),
        }
    }
}

/// Resource limits requested for one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_count: u32,
    /// Whole gigabytes.
    pub memory_gb: u32,
    /// Whole seconds of container wall-clock time.
    pub time_limit_secs: u64,
    pub gpu: GpuRequest,
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> i64 {
        self.memory_gb as i64 * 1024 * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        self.cpu_count as i64 * 1_000_000_000
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_count: 2,
            memory_gb: 4,
            time_limit_secs: 3600,
            gpu: GpuRequest::None,
        }
    }
}

/// Maximum resources a scope permits its jobs to request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCeiling {
    pub max_cpu_count: u32,
    pub max_memory_gb: u32,
    pub max_time_limit_secs: u64,
    /// GPU types jobs in this scope may request. An empty set means no GPU
    /// execution at all; [`GpuRequest::Any`] is satisfiable when the set is
    /// non-empty.
    pub allowed_gpus: Vec<GpuType>,
}

impl Default for LimitCeiling {
    fn default() -> Self {
        Self {
            max_cpu_count: 8,
            max_memory_gb: 32,
            max_time_limit_secs: 3600,
            allowed_gpus: Vec::new(),
        }
    }
}

/// Resource limits that passed [`validate`].
///
/// Executor backends only accept this type, which makes "validated before
/// provisioned" a compile-time property rather than a convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedLimits(ResourceLimits);

impl ValidatedLimits {
    pub fn limits(&self) -> &ResourceLimits {
        &self.0
    }
}

impl std::ops::Deref for ValidatedLimits {
    type Target = ResourceLimits;

    fn deref(&self) -> &ResourceLimits {
        &self.0
    }
}

/// Validates a job's requested limits against the scope's ceiling.
///
/// Pure function: no side effects beyond the returned value.
pub fn validate(
    requested: &ResourceLimits,
    ceiling: &LimitCeiling,
) -> Result<ValidatedLimits, ComponentError> {
    if requested.cpu_count == 0 {
        return Err(ComponentError::LimitExceeded {
            message: "cpu_count must be at least 1".into(),
        });
    }
    if requested.cpu_count > ceiling.max_cpu_count {
        return Err(ComponentError::LimitExceeded {
            message: format!(
                "{} CPUs requested, scope allows at most {}",
                requested.cpu_count, ceiling.max_cpu_count
            ),
        });
    }
    if requested.memory_gb == 0 {
        return Err(ComponentError::LimitExceeded {
            message: "memory_gb must be at least 1".into(),
        });
    }
    if requested.memory_gb > ceiling.max_memory_gb {
        return Err(ComponentError::LimitExceeded {
            message: format!(
                "{} GB memory requested, scope allows at most {} GB",
                requested.memory_gb, ceiling.max_memory_gb
            ),
        });
    }
    if requested.time_limit_secs == 0 {
        return Err(ComponentError::LimitExceeded {
            message: "time_limit_secs must be at least 1".into(),
        });
    }
    if requested.time_limit_secs > ceiling.max_time_limit_secs {
        return Err(ComponentError::LimitExceeded {
            message: format!(
                "{} second time limit requested, scope allows at most {}",
                requested.time_limit_secs, ceiling.max_time_limit_secs
            ),
        });
    }

    match requested.gpu {
        GpuRequest::None => {}
        GpuRequest::Any => {
            if ceiling.allowed_gpus.is_empty() {
                return Err(ComponentError::LimitExceeded {
                    message: "GPU requested but scope allows no GPU types".into(),
                });
            }
        }
        GpuRequest::Type(gpu_type) => {
            if !ceiling.allowed_gpus.contains(&gpu_type) {
                return Err(ComponentError::LimitExceeded {
                    message: format!("GPU type {gpu_type} is not in the scope's allowed set"),
                });
            }
        }
    }

    Ok(ValidatedLimits(*requested))
}
