//! Recovery action repository
//!
//! Mirrors the in-memory recovery queue so pending work is visible to operators.

use anyhow::Result;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::RecoveryActionStatus;
use crate::models::recovery_action::{self, Entity as RecoveryActionLog};
use crate::recovery::RecoveryAction;

#[derive(Debug, Clone)]
pub struct RecoveryActionRepository {
    pub db: Arc<DatabaseConnection>,
}

impl RecoveryActionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert or update the row keyed by the action id
    pub async fn save(&self, action: &RecoveryAction) -> Result<recovery_action::Model> {
        let now = Utc::now();
        match RecoveryActionLog::find_by_id(action.id).one(&*self.db).await? {
            Some(existing) => {
                let mut active: recovery_action::ActiveModel = existing.into();
                active.status = Set(action.status.as_str().to_string());
                active.attempts = Set(action.attempts as i32);
                active.scheduled_at = Set(action.scheduled_at.into());
                active.last_error = Set(action.last_error.clone());
                active.updated_at = Set(now.into());
                Ok(active.update(&*self.db).await?)
            }
            None => {
                let row = recovery_action::ActiveModel {
                    id: Set(action.id),
                    tenant_id: Set(action.tenant_id),
                    provider: Set(action.provider.as_str().to_string()),
                    action_type: Set(action.action_type.as_str().to_string()),
                    status: Set(action.status.as_str().to_string()),
                    attempts: Set(action.attempts as i32),
                    max_attempts: Set(action.max_attempts as i32),
                    scheduled_at: Set(action.scheduled_at.into()),
                    last_error: Set(action.last_error.clone()),
                    created_at: Set(now.into()),
                    updated_at: Set(now.into()),
                };
                Ok(row.insert(&*self.db).await?)
            }
        }
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<recovery_action::Model>> {
        Ok(RecoveryActionLog::find_by_id(id).one(&*self.db).await?)
    }

    /// Pending rows ordered by due time
    pub async fn list_pending(&self) -> Result<Vec<recovery_action::Model>> {
        Ok(RecoveryActionLog::find()
            .filter(recovery_action::Column::Status.eq(RecoveryActionStatus::Pending.as_str()))
            .order_by_asc(recovery_action::Column::ScheduledAt)
            .all(&*self.db)
            .await?)
    }
}
