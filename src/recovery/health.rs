//! Rolling one-hour health window per (tenant, provider).

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ErrorCode, IntegrationError};
use crate::models::{HealthMetrics, HealthStatus, ProviderType};

pub const HEALTH_WINDOW: Duration = Duration::from_secs(3600);

/// Error ratio at or above which an integration is unhealthy.
pub const UNHEALTHY_ERROR_RATE: f64 = 0.5;
/// Error ratio at or above which an integration is degraded.
pub const DEGRADED_ERROR_RATE: f64 = 0.25;

pub fn status_for(error_rate: f64) -> HealthStatus {
    if error_rate >= UNHEALTHY_ERROR_RATE {
        HealthStatus::Unhealthy
    } else if error_rate >= DEGRADED_ERROR_RATE {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthTracker {
    /// (timestamp, succeeded)
    samples: VecDeque<(DateTime<Utc>, bool)>,
    last_error: Option<String>,
    last_error_code: Option<ErrorCode>,
    disconnected: bool,
}

impl HealthTracker {
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.samples.push_back((now, true));
        self.disconnected = false;
        self.prune(now);
    }

    pub fn record_failure(&mut self, error: &IntegrationError, now: DateTime<Utc>) {
        self.samples.push_back((now, false));
        self.last_error = Some(error.message.clone());
        self.last_error_code = Some(error.code);
        self.prune(now);
    }

    /// Pin the status to `disconnected` until the next success.
    pub fn mark_disconnected(&mut self) {
        self.disconnected = true;
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - HEALTH_WINDOW;
        while self.samples.front().is_some_and(|(at, _)| *at < cutoff) {
            self.samples.pop_front();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && !self.disconnected
    }

    pub fn snapshot(
        &mut self,
        tenant_id: Uuid,
        provider: ProviderType,
        now: DateTime<Utc>,
    ) -> HealthMetrics {
        self.prune(now);
        let errors = self.samples.iter().filter(|(_, ok)| !ok).count() as u64;
        let successes = self.samples.len() as u64 - errors;
        let total = errors + successes;
        let error_rate = if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        };
        let status = if self.disconnected {
            HealthStatus::Disconnected
        } else {
            status_for(error_rate)
        };

        HealthMetrics {
            tenant_id,
            provider,
            success_count: successes,
            error_count: errors,
            error_rate,
            last_error: self.last_error.clone(),
            last_error_code: self.last_error_code,
            status,
            last_check: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err() -> IntegrationError {
        IntegrationError::new(ErrorCode::ServerError, ProviderType::Square, "boom")
    }

    #[test]
    fn thresholds_split_the_error_rate() {
        assert_eq!(status_for(0.0), HealthStatus::Healthy);
        assert_eq!(status_for(0.24), HealthStatus::Healthy);
        assert_eq!(status_for(0.25), HealthStatus::Degraded);
        assert_eq!(status_for(0.5), HealthStatus::Unhealthy);
    }

    #[test]
    fn snapshot_reflects_the_rolling_window() {
        let now = Utc::now();
        let tenant = Uuid::new_v4();
        let mut tracker = HealthTracker::default();

        tracker.record_failure(&err(), now - chrono::Duration::minutes(90));
        tracker.record_success(now - chrono::Duration::minutes(10));
        tracker.record_success(now - chrono::Duration::minutes(5));
        tracker.record_failure(&err(), now);

        let metrics = tracker.snapshot(tenant, ProviderType::Square, now);
        assert_eq!(metrics.success_count, 2);
        assert_eq!(metrics.error_count, 1);
        assert!((metrics.error_rate - 1.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(metrics.status, HealthStatus::Degraded);
        assert_eq!(metrics.last_error_code, Some(ErrorCode::ServerError));
    }

    #[test]
    fn disconnected_holds_until_success() {
        let now = Utc::now();
        let mut tracker = HealthTracker::default();
        tracker.mark_disconnected();
        assert_eq!(
            tracker.snapshot(Uuid::nil(), ProviderType::Clover, now).status,
            HealthStatus::Disconnected
        );

        tracker.record_success(now);
        assert_eq!(
            tracker.snapshot(Uuid::nil(), ProviderType::Clover, now).status,
            HealthStatus::Healthy
        );
    }

    #[test]
    fn idle_tracker_is_healthy() {
        let mut tracker = HealthTracker::default();
        let metrics = tracker.snapshot(Uuid::nil(), ProviderType::Shopify, Utc::now());
        assert_eq!(metrics.error_rate, 0.0);
        assert_eq!(metrics.status, HealthStatus::Healthy);
    }
}
