//! Retry wait computation.
//!
//! Quota and transient failures back off exponentially
//! (`initial * multiplier^attempt`, capped) with ±10 % jitter so a restarted
//! run does not hit the quota boundary in lockstep with the previous one.
//! Everything else retries after a short fixed delay: a malformed or
//! repetitive response is a property of one sample, not of server load.

use crate::config::ExtractionConfig;
use crate::error::RemoteErrorKind;
use rand::Rng;
use std::time::Duration;

/// How a failed attempt should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Quota or transient remote failure: exponential backoff.
    Backoff,
    /// Malformed or low-quality output: short fixed delay.
    Quick,
    /// Retrying cannot help.
    Stop,
}

impl RetryClass {
    /// Retry class of a failed remote call.
    pub fn for_remote(kind: RemoteErrorKind) -> Self {
        match kind {
            RemoteErrorKind::QuotaExceeded | RemoteErrorKind::Transient => RetryClass::Backoff,
            RemoteErrorKind::Malformed => RetryClass::Quick,
            RemoteErrorKind::Fatal => RetryClass::Stop,
        }
    }
}

/// Stateless backoff calculator. The attempt counter belongs to the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Fractional jitter applied symmetrically, e.g. 0.1 for ±10 %.
    pub jitter: f64,
    /// Delay for [`RetryClass::Quick`].
    pub quick_delay: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            initial: config.initial_backoff,
            multiplier: config.backoff_multiplier,
            max: config.max_backoff,
            jitter: 0.1,
            quick_delay: config.retry_delay,
        }
    }

    /// Exponential delay before jitter: `min(initial * multiplier^attempt, max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(64) as i32);
        let secs = (self.initial.as_secs_f64() * exp).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Wait before retrying after `attempt` (0-based) failed with `class`.
    pub fn delay(&self, attempt: u32, class: RetryClass) -> Duration {
        match class {
            RetryClass::Backoff => {
                let base = self.base_delay(attempt).as_secs_f64();
                let factor = if self.jitter > 0.0 {
                    rand::thread_rng().gen_range(-self.jitter..=self.jitter)
                } else {
                    0.0
                };
                Duration::from_secs_f64((base * (1.0 + factor)).max(0.0))
            }
            RetryClass::Quick => self.quick_delay,
            RetryClass::Stop => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ExtractionConfig::default())
    }
}
