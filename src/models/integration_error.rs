//! Integration error audit entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "integration_errors")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Absent for provider-wide failures not tied to one tenant
    pub tenant_id: Option<Uuid>,
    pub provider: String,
    /// Classified error code (`RATE_LIMITED`, `AUTH_ERROR`, ...)
    pub code: String,
    pub status_code: Option<i32>,
    pub retryable: bool,
    pub message: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub details: Option<JsonValue>,
    /// Operation that surfaced the error (`get_transactions`, `webhook:payment.created`)
    pub operation: Option<String>,
    pub occurred_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
