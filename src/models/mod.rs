//! # Data Models
//!
//! Domain types shared by the integration layer plus the SeaORM entities it persists.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod credentials;
pub mod health;
pub mod integration;
pub mod integration_error;
pub mod provider_type;
pub mod recovery_action;
pub mod tax_data;
pub mod webhook_subscription;

pub use credentials::AuthCredentials;
pub use health::{HealthMetrics, HealthStatus};
pub use integration::Entity as Integration;
pub use integration_error::Entity as IntegrationErrorLog;
pub use provider_type::{ProviderType, UnknownProvider};
pub use recovery_action::{Entity as RecoveryActionLog, RecoveryActionStatus, RecoveryActionType};
pub use tax_data::{
    JurisdictionScope, LineItem, LocationInfo, StandardizedTaxData, TaxLine, TransactionMetadata,
    TransactionStatus,
};
pub use webhook_subscription::Entity as WebhookSubscription;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "pos-connectors".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
