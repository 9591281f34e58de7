//! Backoff policy for flaky network operations.
//!
//! Only errors that classify themselves as transient are retried; terminal
//! failures (conflicts, bad credentials, local command errors) short-circuit
//! on the first attempt.

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use tracing::warn;

/// Error classification consumed by [`with_retry`].
pub trait Transient {
    /// True when the failure is plausibly temporary (transport-level) and a
    /// repeat attempt can succeed without operator intervention.
    fn is_transient(&self) -> bool;
}

/// Exponential backoff with a per-delay cap and a bounded attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor applied per retry.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-indexed):
    /// `min(base_delay * multiplier^(attempt-1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() {
            return self.max_delay;
        }
        // Clamp before constructing the Duration: a finite product can
        // still exceed what Duration::from_secs_f64 accepts.
        let capped = secs.clamp(0.0, self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails terminally, or exhausts the attempt
/// budget. The last error is returned unchanged so the caller can still
/// dispatch on its classification.
pub fn with_retry<T, E, F>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    E: Transient + Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
