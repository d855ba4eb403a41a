//! Fixed-window counters and consecutive-error state for one (provider, scope).
//!
//! Timestamps are epoch milliseconds so that the record can be shared through the
//! cache between processes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::policy::{RateLimitConfig, error_backoff};

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WindowCounter {
    pub count: u32,
    pub reset_at_ms: i64,
}

impl WindowCounter {
    fn is_current(&self, now_ms: i64) -> bool {
        now_ms < self.reset_at_ms
    }

    /// Time until this window frees a slot, if it is saturated.
    fn blocked_for(&self, limit: Option<u32>, now_ms: i64) -> Option<i64> {
        let limit = limit?;
        (self.is_current(now_ms) && self.count >= limit).then(|| self.reset_at_ms - now_ms)
    }

    fn admit(&mut self, length_ms: i64, now_ms: i64) {
        if !self.is_current(now_ms) {
            self.count = 0;
            self.reset_at_ms = now_ms + length_ms;
        }
        self.count += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RateLimitMetrics {
    pub second: WindowCounter,
    pub minute: WindowCounter,
    pub hour: WindowCounter,
    pub consecutive_errors: u32,
    pub last_error_at_ms: Option<i64>,
    /// Provider-imposed pause (`Retry-After`)
    pub retry_after_until_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct RateLimitDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl RateLimitDecision {
    pub const ALLOWED: Self = Self {
        allowed: true,
        retry_after_ms: None,
    };

    fn blocked(wait_ms: i64) -> Self {
        Self {
            allowed: false,
            retry_after_ms: Some(wait_ms.max(1) as u64),
        }
    }
}

impl RateLimitMetrics {
    /// Checks, in order: explicit `Retry-After`, error-streak backoff, then each window.
    pub fn can_proceed(
        &self,
        limits: &RateLimitConfig,
        error_base: Duration,
        now_ms: i64,
    ) -> RateLimitDecision {
        if let Some(until) = self.retry_after_until_ms
            && now_ms < until
        {
            return RateLimitDecision::blocked(until - now_ms);
        }

        if let Some(last_error) = self.last_error_at_ms {
            let backoff = error_backoff(error_base, self.consecutive_errors).as_millis() as i64;
            let until = last_error + backoff;
            if now_ms < until {
                return RateLimitDecision::blocked(until - now_ms);
            }
        }

        [
            self.second.blocked_for(limits.requests_per_second, now_ms),
            self.minute.blocked_for(limits.requests_per_minute, now_ms),
            self.hour.blocked_for(limits.requests_per_hour, now_ms),
        ]
        .into_iter()
        .flatten()
        .min()
        .map(RateLimitDecision::blocked)
        .unwrap_or(RateLimitDecision::ALLOWED)
    }

    pub fn admit(&mut self, now_ms: i64) {
        self.second.admit(SECOND_MS, now_ms);
        self.minute.admit(MINUTE_MS, now_ms);
        self.hour.admit(HOUR_MS, now_ms);
    }

    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
        self.last_error_at_ms = None;
    }

    pub fn record_failure(&mut self, now_ms: i64, retry_after: Option<Duration>) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error_at_ms = Some(now_ms);
        if let Some(retry_after) = retry_after {
            self.retry_after_until_ms = Some(now_ms + retry_after.as_millis() as i64);
        }
    }
}
