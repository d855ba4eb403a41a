//! Webhook subscription repository for database operations
//!
//! Upserts on (tenant, provider), keeps the shared secret encrypted, and tracks the
//! consecutive failure counter that drives automatic disablement.

use anyhow::{Result, anyhow};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{CryptoKey, SecretPurpose, decrypt_secret, encrypt_secret};
use crate::models::ProviderType;
use crate::models::webhook_subscription::{self, Entity as WebhookSubscription};

/// Fields written by `setup_webhooks`
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub tenant_id: Uuid,
    pub provider: ProviderType,
    pub webhook_url: String,
    pub events: Vec<String>,
    pub secret: String,
    pub external_account_id: Option<String>,
    pub provider_webhook_id: Option<String>,
}

/// Repository for webhook subscription database operations
#[derive(Debug, Clone)]
pub struct WebhookSubscriptionRepository {
    pub db: Arc<DatabaseConnection>,
    pub crypto_key: CryptoKey,
}

impl WebhookSubscriptionRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    pub async fn find(
        &self,
        tenant_id: Uuid,
        provider: ProviderType,
    ) -> Result<Option<webhook_subscription::Model>> {
        Ok(WebhookSubscription::find()
            .filter(webhook_subscription::Column::TenantId.eq(tenant_id))
            .filter(webhook_subscription::Column::Provider.eq(provider.as_str()))
            .one(&*self.db)
            .await?)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<webhook_subscription::Model>> {
        Ok(WebhookSubscription::find_by_id(id).one(&*self.db).await?)
    }

    /// Most recently updated subscription for a provider-side account
    pub async fn find_by_account(
        &self,
        provider: ProviderType,
        account_id: &str,
    ) -> Result<Option<webhook_subscription::Model>> {
        Ok(WebhookSubscription::find()
            .filter(webhook_subscription::Column::Provider.eq(provider.as_str()))
            .filter(webhook_subscription::Column::ExternalAccountId.eq(account_id))
            .order_by_desc(webhook_subscription::Column::UpdatedAt)
            .one(&*self.db)
            .await?)
    }

    /// Insert or replace the subscription for (tenant, provider), resetting its health
    pub async fn upsert(&self, new: NewSubscription) -> Result<webhook_subscription::Model> {
        let secret_ciphertext = encrypt_secret(
            &self.crypto_key,
            new.tenant_id,
            new.provider,
            SecretPurpose::WebhookSecret,
            &new.secret,
        )
        .map_err(|e| anyhow!("Webhook secret encryption failed: {}", e))?;
        let events = serde_json::to_value(&new.events)?;
        let now = Utc::now();

        match self.find(new.tenant_id, new.provider).await? {
            Some(existing) => {
                let mut active: webhook_subscription::ActiveModel = existing.into();
                active.webhook_url = Set(new.webhook_url);
                active.events = Set(events);
                active.secret_ciphertext = Set(secret_ciphertext);
                active.is_active = Set(true);
                active.failure_count = Set(0);
                active.external_account_id = Set(new.external_account_id);
                active.provider_webhook_id = Set(new.provider_webhook_id);
                active.updated_at = Set(now.into());
                Ok(active.update(&*self.db).await?)
            }
            None => {
                let active = webhook_subscription::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    tenant_id: Set(new.tenant_id),
                    provider: Set(new.provider.as_str().to_string()),
                    webhook_url: Set(new.webhook_url),
                    events: Set(events),
                    secret_ciphertext: Set(secret_ciphertext),
                    is_active: Set(true),
                    failure_count: Set(0),
                    last_processed_at: Set(None),
                    external_account_id: Set(new.external_account_id),
                    provider_webhook_id: Set(new.provider_webhook_id),
                    created_at: Set(now.into()),
                    updated_at: Set(now.into()),
                };
                Ok(active.insert(&*self.db).await?)
            }
        }
    }

    pub fn decrypt_secret(&self, model: &webhook_subscription::Model) -> Result<String> {
        let provider: ProviderType = model.provider.parse()?;
        decrypt_secret(
            &self.crypto_key,
            model.tenant_id,
            provider,
            SecretPurpose::WebhookSecret,
            &model.secret_ciphertext,
        )
        .map_err(|e| anyhow!("Webhook secret decryption failed: {}", e))
    }

    /// Reset the failure streak and stamp `last_processed_at`
    pub async fn record_success(&self, id: Uuid) -> Result<Option<webhook_subscription::Model>> {
        let Some(existing) = self.find_by_id(id).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        let mut active: webhook_subscription::ActiveModel = existing.into();
        active.failure_count = Set(0);
        active.last_processed_at = Set(Some(now.into()));
        active.updated_at = Set(now.into());
        Ok(Some(active.update(&*self.db).await?))
    }

    /// Increment the failure streak; returns the updated row
    pub async fn record_failure(&self, id: Uuid) -> Result<Option<webhook_subscription::Model>> {
        let Some(existing) = self.find_by_id(id).await? else {
            return Ok(None);
        };
        let failures = existing.failure_count.saturating_add(1);
        let mut active: webhook_subscription::ActiveModel = existing.into();
        active.failure_count = Set(failures);
        active.updated_at = Set(Utc::now().into());
        Ok(Some(active.update(&*self.db).await?))
    }

    pub async fn deactivate(&self, id: Uuid) -> Result<Option<webhook_subscription::Model>> {
        let Some(existing) = self.find_by_id(id).await? else {
            return Ok(None);
        };
        let mut active: webhook_subscription::ActiveModel = existing.into();
        active.is_active = Set(false);
        active.updated_at = Set(Utc::now().into());
        Ok(Some(active.update(&*self.db).await?))
    }
}
