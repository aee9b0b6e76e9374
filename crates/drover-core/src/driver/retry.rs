//! Task-level retry policy.
//!
//! Config-level defaults can be overridden per task through metadata keys
//! (`max_retries`, `initial_delay_ms`, `max_delay_ms`,
//! `backoff_multiplier`, `jitter`, `retry_strategy`), which in turn
//! override the engine defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DroverError;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffStrategy {
    /// `initial_delay * (attempt + 1)`
    Linear,
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Jitter fraction in `[0, 1]`; the delay is multiplied by
    /// `1 + U(-j/2, +j/2)`.
    pub jitter: f64,
    pub strategy: BackoffStrategy,
    /// Error codes (see [`DroverError::code`]) eligible for retry.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.0,
            strategy: BackoffStrategy::Exponential,
            retryable_errors: vec![
                "TIMEOUT".to_string(),
                "RATE_LIMIT".to_string(),
                "SPAWN_FAILED".to_string(),
                "RESOURCE_EXHAUSTED".to_string(),
                "ALL_MODELS_EXHAUSTED".to_string(),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), DroverError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(DroverError::ConfigInvalid {
                reason: format!("retry jitter must be within [0, 1], got {}", self.jitter),
            });
        }
        if self.backoff_multiplier < 1.0 {
            return Err(DroverError::ConfigInvalid {
                reason: format!(
                    "backoff_multiplier must be >= 1, got {}",
                    self.backoff_multiplier
                ),
            });
        }
        Ok(())
    }

    /// Whether this failure classification is eligible for retry.
    pub fn is_retryable(&self, error: &DroverError) -> bool {
        self.retryable_errors.iter().any(|code| code == error.code())
    }

    /// Deterministic delay for the given zero-based attempt.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Linear => {
                self.initial_delay.saturating_mul(attempt.saturating_add(1))
            }
            BackoffStrategy::Exponential => {
                let factor = self.backoff_multiplier.powi(attempt as i32);
                let ms = (self.initial_delay.as_millis() as f64 * factor).round();
                Duration::from_millis(ms.min(u64::MAX as f64) as u64)
            }
        };
        delay.min(self.max_delay)
    }

    /// [`Self::base_delay`] with the jitter factor applied.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        use rand::Rng;
        let half = self.jitter / 2.0;
        let factor = 1.0 + rand::rng().random_range(-half..=half);
        Duration::from_millis((base.as_millis() as f64 * factor).max(0.0) as u64)
    }

    /// Apply per-task metadata overrides on top of this policy.
    pub fn with_task_overrides(&self, task: &Task) -> RetryPolicy {
        let mut policy = self.clone();
        if let Some(n) = task.metadata_u64("max_retries") {
            policy.max_retries = n as u32;
        }
        if let Some(ms) = task.metadata_u64("initial_delay_ms") {
            policy.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = task.metadata_u64("max_delay_ms") {
            policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(m) = task.metadata_f64("backoff_multiplier") {
            policy.backoff_multiplier = m;
        }
        if let Some(j) = task.metadata_f64("jitter") {
            policy.jitter = j;
        }
        match task.metadata_str("retry_strategy") {
            Some("linear") => policy.strategy = BackoffStrategy::Linear,
            Some("exponential") => policy.strategy = BackoffStrategy::Exponential,
            _ => {}
        }
        policy
    }
}
