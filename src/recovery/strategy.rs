//! Recovery strategy table and the in-memory action record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::models::{ProviderType, RecoveryActionStatus, RecoveryActionType};

const REFRESH_DELAYS: [Duration; 1] = [Duration::from_secs(60)];
const RETRY_LADDER: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(60),
    Duration::from_secs(300),
];
const RESET_DELAYS: [Duration; 1] = [Duration::from_secs(300)];
const IMMEDIATE: [Duration; 1] = [Duration::ZERO];

/// How an action type is attempted: budget and delay ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStrategy {
    pub action: RecoveryActionType,
    pub max_attempts: u32,
    delays: &'static [Duration],
}

impl RecoveryStrategy {
    pub const fn for_action(action: RecoveryActionType) -> Self {
        match action {
            RecoveryActionType::RefreshToken => Self {
                action,
                max_attempts: 3,
                delays: &REFRESH_DELAYS,
            },
            RecoveryActionType::Retry => Self {
                action,
                max_attempts: 5,
                delays: &RETRY_LADDER,
            },
            RecoveryActionType::ResetConnection => Self {
                action,
                max_attempts: 2,
                delays: &RESET_DELAYS,
            },
            RecoveryActionType::DisableIntegration => Self {
                action,
                max_attempts: 1,
                delays: &IMMEDIATE,
            },
        }
    }

    /// Delay before attempt `attempt` (1-based); the last rung repeats.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[index]
    }
}

/// Remedial action for a classified error, if any.
pub fn strategy_for(code: ErrorCode) -> Option<RecoveryStrategy> {
    let action = match code {
        ErrorCode::AuthError => RecoveryActionType::RefreshToken,
        ErrorCode::RateLimited | ErrorCode::ConnectionError => RecoveryActionType::Retry,
        ErrorCode::ServerError => RecoveryActionType::ResetConnection,
        _ => return None,
    };
    Some(RecoveryStrategy::for_action(action))
}

/// Queued recovery action; at most one per (tenant, provider, type).
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct RecoveryAction {
    pub id: Uuid,
    pub action_type: RecoveryActionType,
    pub tenant_id: Uuid,
    pub provider: ProviderType,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub status: RecoveryActionStatus,
}

impl RecoveryAction {
    pub fn new(
        tenant_id: Uuid,
        provider: ProviderType,
        strategy: RecoveryStrategy,
        now: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type: strategy.action,
            tenant_id,
            provider,
            scheduled_at: now + strategy.delay_for(1),
            attempts: 0,
            max_attempts: strategy.max_attempts,
            last_error,
            status: RecoveryActionStatus::Pending,
        }
    }

    pub fn key(&self) -> ActionKey {
        (self.tenant_id, self.provider, self.action_type)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

pub type ActionKey = (Uuid, ProviderType, RecoveryActionType);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_table_matches_error_codes() {
        let auth = strategy_for(ErrorCode::AuthError).unwrap();
        assert_eq!(auth.action, RecoveryActionType::RefreshToken);
        assert_eq!(auth.max_attempts, 3);
        assert_eq!(auth.delay_for(1), Duration::from_secs(60));
        assert_eq!(auth.delay_for(3), Duration::from_secs(60));

        for code in [ErrorCode::RateLimited, ErrorCode::ConnectionError] {
            let retry = strategy_for(code).unwrap();
            assert_eq!(retry.action, RecoveryActionType::Retry);
            assert_eq!(retry.max_attempts, 5);
        }

        let reset = strategy_for(ErrorCode::ServerError).unwrap();
        assert_eq!(reset.action, RecoveryActionType::ResetConnection);
        assert_eq!(reset.max_attempts, 2);
        assert_eq!(reset.delay_for(1), Duration::from_secs(300));

        for code in [
            ErrorCode::Forbidden,
            ErrorCode::NotFound,
            ErrorCode::ValidationError,
            ErrorCode::TransformationFailed,
            ErrorCode::WebhookInvalidSignature,
            ErrorCode::UnknownError,
        ] {
            assert!(strategy_for(code).is_none(), "{code} has no strategy");
        }
    }

    #[test]
    fn retry_ladder_climbs_then_holds() {
        let retry = RecoveryStrategy::for_action(RecoveryActionType::Retry);
        let delays: Vec<u64> = (1..=6).map(|n| retry.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 5, 15, 60, 300, 300]);
    }

    #[test]
    fn new_action_is_scheduled_after_first_rung() {
        let now = Utc::now();
        let action = RecoveryAction::new(
            Uuid::new_v4(),
            ProviderType::Square,
            RecoveryStrategy::for_action(RecoveryActionType::Retry),
            now,
            None,
        );
        assert_eq!(action.scheduled_at, now + Duration::from_secs(1));
        assert!(!action.is_due(now));
        assert!(action.is_due(now + Duration::from_secs(1)));
        assert!(!action.is_exhausted());
    }
}
