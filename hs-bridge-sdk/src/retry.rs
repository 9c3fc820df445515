use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for connection establishment.
///
/// The defaults express a fixed 5-second cadence retried until the instance
/// is disabled; setting `multiplier` above 1.0 opts into exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of attempts (None = retry until cancelled).
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Initial retry interval in milliseconds.
    #[serde(default = "RetryPolicy::default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Maximum retry interval cap in milliseconds.
    #[serde(default = "RetryPolicy::default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Randomization factor in [0.0, 1.0].
    #[serde(default)]
    pub randomization_factor: f64,

    /// Multiplicative factor per retry step. 1.0 keeps the cadence fixed.
    #[serde(default = "RetryPolicy::default_multiplier")]
    pub multiplier: f64,

    /// Optional maximum total elapsed time in milliseconds.
    #[serde(default)]
    pub max_elapsed_time_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_interval_ms: Self::default_initial_interval_ms(),
            max_interval_ms: Self::default_max_interval_ms(),
            randomization_factor: 0.0,
            multiplier: Self::default_multiplier(),
            max_elapsed_time_ms: None,
        }
    }
}

impl RetryPolicy {
    fn default_initial_interval_ms() -> u64 {
        5_000
    }

    fn default_max_interval_ms() -> u64 {
        5_000
    }

    fn default_multiplier() -> f64 {
        1.0
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }

    /// Fast cadence for tests.
    pub fn immediate() -> Self {
        Self {
            initial_interval_ms: 10,
            max_interval_ms: 10,
            ..Default::default()
        }
    }
}

/// Build an `ExponentialBackoff` from a policy. One builder per retry loop;
/// `max_attempts` must be enforced by the caller.
pub fn build_backoff(policy: &RetryPolicy) -> ExponentialBackoff {
    let mut bo = ExponentialBackoff {
        initial_interval: Duration::from_millis(policy.initial_interval_ms),
        randomization_factor: policy.randomization_factor,
        multiplier: policy.multiplier,
        max_interval: Duration::from_millis(policy.max_interval_ms),
        max_elapsed_time: policy.max_elapsed_time_ms.map(Duration::from_millis),
        ..ExponentialBackoff::default()
    };
    bo.reset();
    bo
}
