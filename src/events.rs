//! In-process broadcast of integration lifecycle signals.
//!
//! The webhook and recovery managers publish here; operators, notifiers and tests
//! subscribe. Publishing never blocks and a bus without subscribers drops signals.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::models::{HealthStatus, ProviderType, RecoveryActionType};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegrationSignal {
    /// Same `(code, provider)` seen `occurrences` times within the retention window
    PatternDetected {
        provider: ProviderType,
        code: ErrorCode,
        occurrences: u32,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
        suggested_resolution: String,
    },
    SubscriptionDisabled {
        tenant_id: Uuid,
        provider: ProviderType,
        failure_count: i32,
    },
    IntegrationDisabled {
        tenant_id: Uuid,
        provider: ProviderType,
        reason: String,
    },
    RecoveryScheduled {
        tenant_id: Uuid,
        provider: ProviderType,
        action: RecoveryActionType,
        attempts: u32,
        scheduled_at: DateTime<Utc>,
    },
    RecoveryCompleted {
        tenant_id: Uuid,
        provider: ProviderType,
        action: RecoveryActionType,
    },
    RecoveryExhausted {
        tenant_id: Uuid,
        provider: ProviderType,
        action: RecoveryActionType,
        last_error: Option<String>,
    },
    HealthChanged {
        tenant_id: Uuid,
        provider: ProviderType,
        previous: HealthStatus,
        current: HealthStatus,
    },
}

#[derive(Debug, Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<IntegrationSignal>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, signal: IntegrationSignal) {
        tracing::debug!(?signal, "Publishing integration signal");
        // Err only means no live subscribers.
        let _ = self.sender.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntegrationSignal> {
        self.sender.subscribe()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_signals() {
        let bus = SignalBus::new();
        let mut rx = bus.subscribe();
        let tenant_id = Uuid::new_v4();

        bus.publish(IntegrationSignal::IntegrationDisabled {
            tenant_id,
            provider: ProviderType::Square,
            reason: "refresh exhausted".to_string(),
        });

        match rx.recv().await.unwrap() {
            IntegrationSignal::IntegrationDisabled { tenant_id: t, .. } => assert_eq!(t, tenant_id),
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        SignalBus::new().publish(IntegrationSignal::RecoveryCompleted {
            tenant_id: Uuid::nil(),
            provider: ProviderType::Clover,
            action: RecoveryActionType::Retry,
        });
    }
}
