//! Retry policy for transient stage failures.

use std::time::Duration;

use crate::config::PipelineConfig;
use crate::errors::StageError;

/// Whether a failed attempt should be retried.
///
/// `attempt` is the 1-based number of the attempt that just failed; a stage
/// gets `max_retries` retries after its first attempt. Precondition failures
/// are never retried.
pub fn should_retry(error: &StageError, attempt: u32, max_retries: u32) -> bool {
    error.is_retryable() && attempt <= max_retries
}

/// Exponential backoff before retry number `retry` (1-based).
///
/// Formula: `base * 2^(retry-1)`, capped at `max`.
///
/// With base=2s, max=60s: 2s, 4s, 8s, 16s, 32s, 60s, 60s, ...
pub fn calculate_backoff(retry: u32, base: Duration, max: Duration) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }
    let multiplier = 2u32.saturating_pow(retry - 1);
    base.saturating_mul(multiplier).min(max)
}

/// Backoff for the retry following `failed_attempt`, per the run's config.
pub fn stage_backoff(config: &PipelineConfig, failed_attempt: u32) -> Duration {
    calculate_backoff(
        failed_attempt,
        Duration::from_millis(config.backoff_base_ms),
        Duration::from_millis(config.backoff_max_ms),
    )
}
