//! Canonical domain events and the handler seam they are dispatched to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ProviderType, StandardizedTaxData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DomainEventKind {
    #[serde(rename = "transaction.created")]
    TransactionCreated,
    #[serde(rename = "transaction.updated")]
    TransactionUpdated,
    #[serde(rename = "transaction.refunded")]
    TransactionRefunded,
    #[serde(rename = "sync.completed")]
    SyncCompleted,
}

impl DomainEventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            DomainEventKind::TransactionCreated => "transaction.created",
            DomainEventKind::TransactionUpdated => "transaction.updated",
            DomainEventKind::TransactionRefunded => "transaction.refunded",
            DomainEventKind::SyncCompleted => "sync.completed",
        }
    }

    /// Ordered substring rules over the provider event name; refunds win over creates.
    pub fn from_event_name(event_name: &str) -> Self {
        let name = event_name.to_ascii_lowercase();
        if name.contains("refund") {
            DomainEventKind::TransactionRefunded
        } else if name.contains("create") {
            DomainEventKind::TransactionCreated
        } else if name.contains("update") {
            DomainEventKind::TransactionUpdated
        } else {
            DomainEventKind::SyncCompleted
        }
    }
}

impl std::fmt::Display for DomainEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized event handed to every registered handler.
#[derive(Debug, Clone, Serialize)]
pub struct DomainEvent {
    pub kind: DomainEventKind,
    pub provider: ProviderType,
    pub tenant_id: Uuid,
    /// Provider event name as delivered
    pub event_name: String,
    /// Present when the delivery carried a transaction that transformed cleanly
    pub transaction: Option<StandardizedTaxData>,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

#[async_trait]
pub trait WebhookEventHandler: Send + Sync {
    /// Label used in logs and metrics.
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_map_by_ordered_substring() {
        let cases = [
            ("payment.created", DomainEventKind::TransactionCreated),
            ("payment.updated", DomainEventKind::TransactionUpdated),
            ("refund.created", DomainEventKind::TransactionRefunded),
            ("refunds/create", DomainEventKind::TransactionRefunded),
            ("orders/create", DomainEventKind::TransactionCreated),
            ("orders/updated", DomainEventKind::TransactionUpdated),
            ("payments.UPDATE", DomainEventKind::TransactionUpdated),
            ("inventory.count.updated", DomainEventKind::TransactionUpdated),
            ("oauth.authorization.revoked", DomainEventKind::SyncCompleted),
        ];
        for (name, kind) in cases {
            assert_eq!(DomainEventKind::from_event_name(name), kind, "{name}");
        }
    }

    #[test]
    fn kinds_serialize_to_dotted_names() {
        assert_eq!(
            serde_json::to_value(DomainEventKind::TransactionRefunded).unwrap(),
            serde_json::json!("transaction.refunded")
        );
    }
}
