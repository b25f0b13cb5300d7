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

//! Retry policies with configurable backoff.
//!
//! A [`RetryPolicy`] bounds how many times a job may be re-dispatched after a
//! recoverable failure and how long to wait between attempts. Delays are
//! computed from a [`BackoffStrategy`] with optional jitter so that a burst
//! of failures does not re-dispatch in lockstep.
//!
//! Which errors are considered recoverable is itself part of the policy:
//! [`RetryCondition`] lets a deployment tighten the default transience
//! classification (retry nothing, retry everything, retry only transient
//! errors, or retry on message patterns).

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ComponentError;

/// Strategy for computing the delay before the next retry attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay for every attempt.
    Fixed,
    /// Delay grows linearly with the attempt number.
    Linear { multiplier: f64 },
    /// Delay grows exponentially: `initial * base^attempt * multiplier`.
    Exponential { base: f64, multiplier: f64 },
}

/// Condition that must hold for a failed attempt to be retried.
///
/// All conditions on a policy must be satisfied for a retry to be scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryCondition {
    /// Never retry.
    Never,
    /// Retry on any error.
    AllErrors,
    /// Retry only errors classified transient by
    /// [`ComponentError::is_transient`].
    TransientOnly,
    /// Retry when the error message contains any of the given patterns
    /// (case-insensitive).
    ErrorPattern { patterns: Vec<String> },
}

/// Bounded retry policy with backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts allowed, including the first one.
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay within ±50% to avoid retry stampedes.
    pub jitter: bool,
    pub retry_conditions: Vec<RetryCondition>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_strategy: BackoffStrategy::Exponential {
                base: 2.0,
                multiplier: 1.0,
            },
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(900),
            jitter: true,
            retry_conditions: vec![RetryCondition::TransientOnly],
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Whether a failed attempt should be retried.
    ///
    /// `attempt` is zero-based: the first execution is attempt 0, so a
    /// policy with `max_attempts = 3` permits retries after attempts 0
    /// and 1 and gives up after attempt 2.
    pub fn should_retry(&self, attempt: u32, error: &ComponentError) -> bool {
        attempt + 1 < self.max_attempts && self.conditions_allow(error)
    }

    /// Whether the policy's conditions consider this error recoverable at
    /// all, ignoring the attempt budget. An error that is recoverable but
    /// out of budget is reported as "gave up", not "can never succeed".
    pub fn conditions_allow(&self, error: &ComponentError) -> bool {
        self.retry_conditions
            .iter()
            .all(|condition| match condition {
                RetryCondition::Never => false,
                RetryCondition::AllErrors => true,
                RetryCondition::TransientOnly => error.is_transient(),
                RetryCondition::ErrorPattern { patterns } => {
                    let message = error.to_string().to_lowercase();
                    patterns
                        .iter()
                        .any(|pattern| message.contains(&pattern.to_lowercase()))
                }
            })
    }

    /// Computes the delay before re-dispatching after the given zero-based
    /// attempt, clamped to `max_delay`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let raw = match self.backoff_strategy {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear { multiplier } => initial * multiplier * (attempt + 1) as f64,
            BackoffStrategy::Exponential { base, multiplier } => {
                initial * multiplier * base.powi(attempt as i32)
            }
        };

        let capped = raw.min(self.max_delay.as_secs_f64());
        let final_secs = if self.jitter {
            // ±50%, never below zero
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            (capped * factor).min(self.max_delay.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(final_secs.max(0.0))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    backoff_strategy: Option<BackoffStrategy>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<bool>,
    retry_conditions: Option<Vec<RetryCondition>>,
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn backoff_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = Some(strategy);
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn retry_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_conditions
            .get_or_insert_with(Vec::new)
            .push(condition);
        self
    }

    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            backoff_strategy: self.backoff_strategy.unwrap_or(defaults.backoff_strategy),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
            retry_conditions: self.retry_conditions.unwrap_or(defaults.retry_conditions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy::builder()
            .backoff_strategy(strategy)
            .initial_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(300))
            .with_jitter(false)
            .build()
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = no_jitter(BackoffStrategy::Fixed);
        assert_eq!(policy.calculate_delay(0), Duration::from_secs(10));
        assert_eq!(policy.calculate_delay(5), Duration::from_secs(10));
    }

    #[test]
    fn linear_backoff_grows_with_attempt() {
        let policy = no_jitter(BackoffStrategy::Linear { multiplier: 1.0 });
        assert_eq!(policy.calculate_delay(0), Duration::from_secs(10));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(20));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(30));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = no_jitter(BackoffStrategy::Exponential {
            base: 2.0,
            multiplier: 1.0,
        });
        assert_eq!(policy.calculate_delay(0), Duration::from_secs(10));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(20));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(40));
        // 10 * 2^10 = 10240s, capped at 300s
        assert_eq!(policy.calculate_delay(10), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::builder()
            .backoff_strategy(BackoffStrategy::Fixed)
            .initial_delay(Duration::from_secs(100))
            .max_delay(Duration::from_secs(120))
            .with_jitter(true)
            .build();

        for _ in 0..100 {
            let delay = policy.calculate_delay(0);
            assert!(delay >= Duration::from_secs(50));
            assert!(delay <= Duration::from_secs(120));
        }
    }

    #[test]
    fn retry_budget_is_bounded() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .retry_condition(RetryCondition::AllErrors)
            .build();
        let error = ComponentError::BackendUnavailable {
            message: "down".into(),
        };

        assert!(policy.should_retry(0, &error));
        assert!(policy.should_retry(1, &error));
        assert!(!policy.should_retry(2, &error));
        assert!(!policy.should_retry(7, &error));
    }

    #[test]
    fn transient_only_rejects_fatal_errors() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(
            0,
            &ComponentError::BackendUnavailable {
                message: "down".into()
            }
        ));
        assert!(!policy.should_retry(
            0,
            &ComponentError::ImageInvalid {
                message: "bad".into()
            }
        ));
        assert!(!policy.should_retry(
            0,
            &ComponentError::OutputMalformed {
                interface: "metrics-json".into(),
                message: "NaN".into()
            }
        ));
    }

    #[test]
    fn never_condition_wins() {
        let policy = RetryPolicy::builder()
            .retry_condition(RetryCondition::Never)
            .build();
        assert!(!policy.should_retry(
            0,
            &ComponentError::BackendUnavailable {
                message: "down".into()
            }
        ));
    }

    #[test]
    fn error_pattern_matches_case_insensitively() {
        let policy = RetryPolicy::builder()
            .retry_condition(RetryCondition::ErrorPattern {
                patterns: vec!["Unavailable".into()],
            })
            .build();

        assert!(policy.should_retry(
            0,
            &ComponentError::BackendUnavailable {
                message: "daemon unavailable".into()
            }
        ));
        assert!(!policy.should_retry(
            0,
            &ComponentError::ExecutionTimeout { limit_secs: 60 }
        ));
    }
}
