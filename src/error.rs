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

//! Error types for the job-execution control plane.
//!
//! A single taxonomy, [`ComponentError`], covers every failure the dispatch
//! path can produce. Each variant carries an explicit transience
//! classification: transient errors are eligible for the retry path, fatal
//! errors terminate the job immediately. The classification here is the
//! default; a [`RetryPolicy`](crate::retry::RetryPolicy) can tighten or
//! loosen it per deployment.

use thiserror::Error;

use crate::models::job::JobStatus;

/// Maximum length of the user-facing error message stored on a job.
///
/// Full diagnostic detail (stack traces, container logs) is retained
/// separately for operators and never shown to end users.
pub const USER_MESSAGE_MAX_LEN: usize = 1024;

/// Errors produced by the job-execution control plane.
#[derive(Debug, Error)]
pub enum ComponentError {
    /// The execution infrastructure could not be reached. Transient.
    #[error("Execution backend unavailable: {message}")]
    BackendUnavailable { message: String },

    /// The container image failed validation or could not be resolved. Fatal.
    #[error("Container image invalid: {message}")]
    ImageInvalid { message: String },

    /// Requested resources exceed the ceiling configured for the owning
    /// scope. Fatal; raised before any infrastructure is provisioned.
    #[error("Requested resources exceed the configured limits: {message}")]
    LimitExceeded { message: String },

    /// The container ran past its configured wall-clock limit. Retryable,
    /// but counts against the retry budget.
    #[error("Execution timed out after {limit_secs} seconds")]
    ExecutionTimeout { limit_secs: u64 },

    /// The container exited with a non-zero status. Fatal.
    #[error("Execution failed with exit code {exit_code}")]
    ExecutionFailed { exit_code: i64, detail: String },

    /// A required output was not produced by the container. Fatal.
    #[error("Required output \"{interface}\" was not produced")]
    OutputMissing { interface: String },

    /// An output was produced but failed kind or schema validation. Fatal.
    #[error("Output \"{interface}\" is malformed: {message}")]
    OutputMalformed { interface: String, message: String },

    /// An input value references backing storage that does not exist. Fatal.
    #[error("Input \"{interface}\" could not be resolved: {message}")]
    UnresolvedReference { interface: String, message: String },

    /// A value's payload does not match its interface's declared kind. Fatal.
    #[error("Value for \"{interface}\" is {actual}, expected {expected}")]
    KindMismatch {
        interface: String,
        expected: String,
        actual: String,
    },

    /// The retry budget was exhausted. Terminal; distinguishes "we gave up"
    /// from "this can never succeed".
    #[error("Giving up after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    /// The job was cancelled while an attempt was in flight.
    #[error("Job was cancelled")]
    Cancelled,

    /// A state transition that the job state machine does not permit.
    #[error("Invalid job state transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// The persistence layer failed. Transient.
    #[error("Store operation failed: {message}")]
    Store { message: String },

    /// A record the control plane expected to exist was not found.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
}

impl ComponentError {
    /// Whether this error is transient and eligible for the retry path.
    ///
    /// Everything else indicates a configuration or data problem that
    /// retrying cannot fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ComponentError::BackendUnavailable { .. }
                | ComponentError::ExecutionTimeout { .. }
                | ComponentError::Store { .. }
        )
    }

    /// The user-safe message for this error: the last meaningful line of any
    /// captured detail, truncated to [`USER_MESSAGE_MAX_LEN`].
    pub fn user_message(&self) -> String {
        match self {
            ComponentError::ExecutionFailed { detail, .. } if !detail.trim().is_empty() => {
                summarize_for_user(detail)
            }
            other => summarize_for_user(&other.to_string()),
        }
    }
}

/// Reduces diagnostic detail to its user-safe form: the last meaningful
/// line, truncated to [`USER_MESSAGE_MAX_LEN`].
pub fn summarize_for_user(detail: &str) -> String {
    truncate(last_meaningful_line(detail))
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration for {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Returns the last non-empty line of a block of diagnostic text.
///
/// Container stderr and tracebacks end with the line users actually need;
/// everything above it is operator material.
pub fn last_meaningful_line(detail: &str) -> &str {
    detail
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

fn truncate(message: &str) -> String {
    if message.chars().count() <= USER_MESSAGE_MAX_LEN {
        message.to_string()
    } else {
        let cut: String = message.chars().take(USER_MESSAGE_MAX_LEN - 1).collect();
        format!("{cut}…")
    }
}
