//! Recovery action entity model
//!
//! Persistent mirror of the recovery engine's in-memory action queue.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Remedial operation scheduled against a failing integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionType {
    Retry,
    RefreshToken,
    ResetConnection,
    DisableIntegration,
}

impl RecoveryActionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            RecoveryActionType::Retry => "retry",
            RecoveryActionType::RefreshToken => "refresh_token",
            RecoveryActionType::ResetConnection => "reset_connection",
            RecoveryActionType::DisableIntegration => "disable_integration",
        }
    }
}

impl std::fmt::Display for RecoveryActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionStatus {
    Pending,
    Completed,
    Exhausted,
}

impl RecoveryActionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            RecoveryActionStatus::Pending => "pending",
            RecoveryActionStatus::Completed => "completed",
            RecoveryActionStatus::Exhausted => "exhausted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "recovery_actions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider: String,
    /// retry|refresh_token|reset_connection|disable_integration
    pub action_type: String,
    /// pending|completed|exhausted
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTimeWithTimeZone,
    pub last_error: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
