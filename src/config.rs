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

//! Deployment configuration.
//!
//! One [`GantryConfig`] describes a deployment: which execution backend to
//! use, its settings, the processor's concurrency and polling behavior, the
//! retry policy and the resource ceiling. Construct it programmatically via
//! the builder or load it from a TOML file; both paths go through
//! [`GantryConfig::validate`].
//!
//! Backend selection is an explicit enum resolved once at startup — never a
//! configured class path resolved at runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::limits::LimitCeiling;
use crate::retry::RetryPolicy;

/// Which execution backend a deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local Docker daemon.
    Docker,
    /// Managed cloud batch service.
    Batch,
}

/// Settings for the Docker-daemon backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    /// UID:GID the container process runs as. Never root.
    pub user: String,
    pub pids_limit: i64,
    /// Name of a pre-provisioned allowlist network. `None` disables
    /// networking entirely.
    pub network: Option<String>,
    /// Pull the image before each run; disable for air-gapped daemons with
    /// pre-loaded images.
    pub pull_images: bool,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            user: "1000:1000".to_string(),
            pids_limit: 256,
            network: None,
            pull_images: true,
        }
    }
}

/// Settings for the managed-batch backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Base URL of the batch service API.
    pub base_url: String,
    pub auth_token: Option<String>,
    /// How often to poll a submitted execution for completion.
    pub poll_interval: Duration,
    /// How long an execution may sit queued before it counts against the
    /// wall-clock deadline.
    pub max_queue_wait: Duration,
    /// Keep compute capacity pre-allocated between jobs to cut cold-start
    /// latency. Billing-relevant.
    pub warm_pool: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            poll_interval: Duration::from_secs(10),
            max_queue_wait: Duration::from_secs(600),
            warm_pool: false,
        }
    }
}

/// Processor loop behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSettings {
    /// Ceiling on concurrent container executions, to respect
    /// infrastructure quotas.
    pub max_concurrent_jobs: usize,
    /// Fallback poll interval for due retries when no work signal arrives.
    pub poll_interval: Duration,
    /// How often the stalled-job sweep runs.
    pub reap_interval: Duration,
    /// Slack past a job's time limit before the sweep considers it stalled.
    pub stall_grace: Duration,
    /// Jobs claimed per wake-up.
    pub claim_batch_size: usize,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            poll_interval: Duration::from_secs(5),
            reap_interval: Duration::from_secs(60),
            stall_grace: Duration::from_secs(120),
            claim_batch_size: 8,
        }
    }
}

/// Complete deployment configuration.
///
/// Every section is optional in a TOML document; omitted sections take
/// their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GantryConfig {
    pub backend: BackendKind,
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub processor: ProcessorSettings,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub limit_ceiling: LimitCeiling,
    /// Where output artifacts are persisted.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/gantry/outputs")
}

impl Default for GantryConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Docker,
            docker: DockerSettings::default(),
            batch: BatchSettings::default(),
            processor: ProcessorSettings::default(),
            retry_policy: RetryPolicy::default(),
            limit_ceiling: LimitCeiling::default(),
            storage_root: PathBuf::from("/var/lib/gantry/outputs"),
        }
    }
}

impl GantryConfig {
    pub fn builder() -> GantryConfigBuilder {
        GantryConfigBuilder::default()
    }

    /// Loads and validates configuration from a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: GantryConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Checks the configuration for values that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processor.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                field: "processor.max_concurrent_jobs",
                message: "must be at least 1".into(),
            });
        }
        if self.processor.claim_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "processor.claim_batch_size",
                message: "must be at least 1".into(),
            });
        }
        if self.processor.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "processor.poll_interval",
                message: "must be non-zero".into(),
            });
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry_policy.max_attempts",
                message: "must be at least 1".into(),
            });
        }
        if self.docker.user.trim().is_empty() || self.docker.user.starts_with("0:") {
            return Err(ConfigError::Invalid {
                field: "docker.user",
                message: "containers must not run as root".into(),
            });
        }
        if self.backend == BackendKind::Batch {
            Url::parse(&self.batch.base_url).map_err(|e| ConfigError::Invalid {
                field: "batch.base_url",
                message: e.to_string(),
            })?;
            if self.batch.poll_interval.is_zero() {
                return Err(ConfigError::Invalid {
                    field: "batch.poll_interval",
                    message: "must be non-zero".into(),
                });
            }
        }
        if self.limit_ceiling.max_memory_gb == 0 || self.limit_ceiling.max_time_limit_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "limit_ceiling",
                message: "ceiling values must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Builder for [`GantryConfig`].
#[derive(Debug, Default)]
pub struct GantryConfigBuilder {
    backend: Option<BackendKind>,
    docker: Option<DockerSettings>,
    batch: Option<BatchSettings>,
    processor: Option<ProcessorSettings>,
    retry_policy: Option<RetryPolicy>,
    limit_ceiling: Option<LimitCeiling>,
    storage_root: Option<PathBuf>,
}

impl GantryConfigBuilder {
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn docker(mut self, settings: DockerSettings) -> Self {
        self.docker = Some(settings);
        self
    }

    pub fn batch(mut self, settings: BatchSettings) -> Self {
        self.batch = Some(settings);
        self
    }

    pub fn processor(mut self, settings: ProcessorSettings) -> Self {
        self.processor = Some(settings);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn limit_ceiling(mut self, ceiling: LimitCeiling) -> Self {
        self.limit_ceiling = Some(ceiling);
        self
    }

    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    pub fn build(self) -> Result<GantryConfig, ConfigError> {
        let defaults = GantryConfig::default();
        let config = GantryConfig {
            backend: self.backend.unwrap_or(defaults.backend),
            docker: self.docker.unwrap_or(defaults.docker),
            batch: self.batch.unwrap_or(defaults.batch),
            processor: self.processor.unwrap_or(defaults.processor),
            retry_policy: self.retry_policy.unwrap_or(defaults.retry_policy),
            limit_ceiling: self.limit_ceiling.unwrap_or(defaults.limit_ceiling),
            storage_root: self.storage_root.unwrap_or(defaults.storage_root),
        };
        config.validate()?;
        Ok(config)
    }
}
