//! Provider ceilings and retry policy.

use std::time::Duration;

use rand::{Rng, thread_rng};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::{RateLimitOverride, RetryPolicyConfig};
use crate::error::{ErrorCode, IntegrationError};

/// Upper bound for the consecutive-error backoff curve.
pub const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(300);

/// Request ceilings for one provider. Each window is optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RateLimitConfig {
    pub requests_per_second: Option<u32>,
    pub requests_per_minute: Option<u32>,
    pub requests_per_hour: Option<u32>,
    /// Requests that may skip the per-request spacing; refills at the per-second rate
    pub burst_limit: Option<u32>,
}

impl RateLimitConfig {
    pub const fn per_second(rps: u32) -> Self {
        Self {
            requests_per_second: Some(rps),
            requests_per_minute: None,
            requests_per_hour: None,
            burst_limit: None,
        }
    }

    /// Gap the worker leaves between consecutive requests (`1000 / rps` ms).
    pub fn spacing(&self) -> Duration {
        match self.requests_per_second {
            Some(rps) if rps > 0 => Duration::from_millis(1000 / u64::from(rps)),
            _ => Duration::ZERO,
        }
    }

    pub fn with_override(mut self, overrides: &RateLimitOverride) -> Self {
        if let Some(v) = overrides.per_second {
            self.requests_per_second = Some(v);
        }
        if let Some(v) = overrides.per_minute {
            self.requests_per_minute = Some(v);
        }
        if let Some(v) = overrides.per_hour {
            self.requests_per_hour = Some(v);
        }
        if let Some(v) = overrides.burst {
            self.burst_limit = Some(v);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Linear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    /// When non-empty, only these codes are retried (still subject to the retryable flag)
    pub retryable_codes: Vec<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryPolicyConfig::default())
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: if config.backoff == "linear" {
                BackoffKind::Linear
            } else {
                BackoffKind::Exponential
            },
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_factor: config.jitter_factor,
            retryable_codes: config
                .retryable_codes
                .iter()
                .filter_map(|code| ErrorCode::parse(code))
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `attempts` is the number of attempts already made.
    pub fn should_retry(&self, error: &IntegrationError, attempts: u32) -> bool {
        error.retryable
            && attempts < self.max_attempts
            && (self.retryable_codes.is_empty() || self.retryable_codes.contains(&error.code))
    }

    /// Delay before retry number `retry` (1-based), honoring a larger provider `Retry-After`.
    pub fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let retry = retry.max(1);
        let computed = match self.backoff {
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(retry - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffKind::Linear => self.base_delay.saturating_mul(retry),
        }
        .min(self.max_delay);

        let delay = match retry_after {
            Some(hint) if hint > computed => hint,
            _ => computed,
        };

        let spread = delay.as_secs_f64() * self.jitter_factor;
        if spread > 0.0 {
            delay + Duration::from_secs_f64(thread_rng().gen_range(0.0..spread))
        } else {
            delay
        }
    }
}

/// Consecutive-error backoff: `base * 2^(errors-1)`, capped at five minutes.
pub fn error_backoff(base: Duration, consecutive_errors: u32) -> Duration {
    if consecutive_errors == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(consecutive_errors - 1);
    base.saturating_mul(factor).min(MAX_ERROR_BACKOFF)
}
