//! Webhook subscription entity model
//!
//! Per (tenant, provider) record of the provider-side webhook registration, its shared
//! secret and delivery health.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::ProviderType;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhook_subscriptions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub provider: String,

    /// Notification URL registered with the provider
    pub webhook_url: String,

    /// Subscribed provider event names (JSON array of strings)
    #[sea_orm(column_type = "JsonBinary")]
    pub events: JsonValue,

    /// Encrypted shared secret used for signature verification
    pub secret_ciphertext: Vec<u8>,

    pub is_active: bool,

    /// Consecutive processing failures since the last successful dispatch
    pub failure_count: i32,

    pub last_processed_at: Option<DateTimeWithTimeZone>,

    /// Provider-side account (merchant id, shop domain) used to route tenant-less deliveries
    pub external_account_id: Option<String>,

    pub provider_webhook_id: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn provider_type(&self) -> Option<ProviderType> {
        self.provider.parse().ok()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events
            .as_array()
            .map(|events| {
                events
                    .iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
