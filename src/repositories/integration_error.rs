//! Integration error audit repository

use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::IntegrationError;
use crate::models::ProviderType;
use crate::models::integration_error::{self, Entity as IntegrationErrorLog};

#[derive(Debug, Clone)]
pub struct IntegrationErrorRepository {
    pub db: Arc<DatabaseConnection>,
}

impl IntegrationErrorRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        tenant_id: Option<Uuid>,
        operation: Option<&str>,
        error: &IntegrationError,
    ) -> Result<integration_error::Model> {
        let row = integration_error::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            provider: Set(error.provider.as_str().to_string()),
            code: Set(error.code.as_str().to_string()),
            status_code: Set(error.status_code.map(i32::from)),
            retryable: Set(error.retryable),
            message: Set(error.message.clone()),
            details: Set(error.details.clone()),
            operation: Set(operation.map(str::to_string)),
            occurred_at: Set(Utc::now().into()),
        };
        Ok(row.insert(&*self.db).await?)
    }

    /// Audit rows for (tenant, provider) since `since`, newest first
    pub async fn recent(
        &self,
        tenant_id: Uuid,
        provider: ProviderType,
        since: DateTime<Utc>,
    ) -> Result<Vec<integration_error::Model>> {
        Ok(IntegrationErrorLog::find()
            .filter(integration_error::Column::TenantId.eq(tenant_id))
            .filter(integration_error::Column::Provider.eq(provider.as_str()))
            .filter(integration_error::Column::OccurredAt.gte(DateTimeWithTimeZone::from(since)))
            .order_by_desc(integration_error::Column::OccurredAt)
            .all(&*self.db)
            .await?)
    }

    pub async fn count_since(
        &self,
        tenant_id: Uuid,
        provider: ProviderType,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(IntegrationErrorLog::find()
            .filter(integration_error::Column::TenantId.eq(tenant_id))
            .filter(integration_error::Column::Provider.eq(provider.as_str()))
            .filter(integration_error::Column::OccurredAt.gte(DateTimeWithTimeZone::from(since)))
            .count(&*self.db)
            .await?)
    }

    /// Delete rows older than `cutoff`; returns the number removed
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = IntegrationErrorLog::delete_many()
            .filter(integration_error::Column::OccurredAt.lt(DateTimeWithTimeZone::from(cutoff)))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
