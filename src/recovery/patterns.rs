//! Repeating-failure detection keyed by (code, provider).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::ErrorCode;
use crate::events::IntegrationSignal;
use crate::models::ProviderType;

#[derive(Debug, Clone, Copy)]
struct PatternEntry {
    occurrences: u32,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Counts occurrences within a pattern lifetime and reports once at the threshold.
#[derive(Debug)]
pub struct PatternDetector {
    threshold: u32,
    lifetime: TimeDelta,
    entries: HashMap<(ErrorCode, ProviderType), PatternEntry>,
}

impl PatternDetector {
    pub fn new(threshold: u32, lifetime: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            lifetime: TimeDelta::from_std(lifetime).unwrap_or(TimeDelta::MAX),
            entries: HashMap::new(),
        }
    }

    pub fn observe(
        &mut self,
        code: ErrorCode,
        provider: ProviderType,
        now: DateTime<Utc>,
    ) -> Option<IntegrationSignal> {
        let lifetime = self.lifetime;
        let entry = self
            .entries
            .entry((code, provider))
            .or_insert(PatternEntry {
                occurrences: 0,
                first_seen: now,
                last_seen: now,
            });

        if now - entry.first_seen > lifetime {
            *entry = PatternEntry {
                occurrences: 0,
                first_seen: now,
                last_seen: now,
            };
        }

        entry.occurrences += 1;
        entry.last_seen = now;

        (entry.occurrences == self.threshold).then(|| IntegrationSignal::PatternDetected {
            provider,
            code,
            occurrences: entry.occurrences,
            first_seen: entry.first_seen,
            last_seen: entry.last_seen,
            suggested_resolution: suggested_resolution(code).to_string(),
        })
    }

    /// Drop patterns whose lifetime has lapsed.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let lifetime = self.lifetime;
        self.entries.retain(|_, entry| now - entry.first_seen <= lifetime);
    }

    pub fn occurrences(&self, code: ErrorCode, provider: ProviderType) -> u32 {
        self.entries
            .get(&(code, provider))
            .map(|entry| entry.occurrences)
            .unwrap_or(0)
    }
}

pub fn suggested_resolution(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::RateLimited => "Lower the request ceilings for this provider or spread sync windows",
        ErrorCode::AuthError => "Re-authorize the merchant; the refresh token may have been revoked",
        ErrorCode::Forbidden => "Check the OAuth scopes granted to the application",
        ErrorCode::NotFound => "Verify location and merchant identifiers in the integration settings",
        ErrorCode::ValidationError => "Review request parameters and provider configuration",
        ErrorCode::ServerError => "Provider outage suspected; check the provider status page",
        ErrorCode::ConnectionError => "Check network egress and provider API base URL",
        ErrorCode::TransformationFailed => "Provider payload shape changed; update the field mapping",
        ErrorCode::WebhookInvalidSignature => "Rotate the webhook secret and re-run webhook setup",
        ErrorCode::UnknownError => "Inspect the error audit log for details",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_exactly_once_at_threshold() {
        let mut detector = PatternDetector::new(3, Duration::from_secs(3600));
        let now = Utc::now();

        assert!(detector.observe(ErrorCode::ServerError, ProviderType::Square, now).is_none());
        assert!(detector.observe(ErrorCode::ServerError, ProviderType::Square, now).is_none());
        let signal = detector.observe(ErrorCode::ServerError, ProviderType::Square, now);
        assert!(matches!(
            signal,
            Some(IntegrationSignal::PatternDetected { occurrences: 3, .. })
        ));
        assert!(detector.observe(ErrorCode::ServerError, ProviderType::Square, now).is_none());
    }

    #[test]
    fn keys_are_independent_per_provider_and_code() {
        let mut detector = PatternDetector::new(2, Duration::from_secs(3600));
        let now = Utc::now();
        detector.observe(ErrorCode::ServerError, ProviderType::Square, now);
        detector.observe(ErrorCode::ServerError, ProviderType::Clover, now);
        detector.observe(ErrorCode::AuthError, ProviderType::Square, now);

        assert_eq!(detector.occurrences(ErrorCode::ServerError, ProviderType::Square), 1);
        assert_eq!(detector.occurrences(ErrorCode::ServerError, ProviderType::Clover), 1);
    }

    #[test]
    fn lapsed_pattern_starts_over() {
        let mut detector = PatternDetector::new(2, Duration::from_secs(60));
        let start = Utc::now();
        detector.observe(ErrorCode::RateLimited, ProviderType::Shopify, start);

        let later = start + chrono::Duration::seconds(120);
        assert!(detector.observe(ErrorCode::RateLimited, ProviderType::Shopify, later).is_none());
        assert_eq!(detector.occurrences(ErrorCode::RateLimited, ProviderType::Shopify), 1);

        detector.prune(later + chrono::Duration::seconds(120));
        assert_eq!(detector.occurrences(ErrorCode::RateLimited, ProviderType::Shopify), 0);
    }
}
