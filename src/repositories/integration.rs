//! Integration repository for database operations
//!
//! Stores one row per (tenant, provider) with the access and refresh tokens encrypted
//! under AAD `tenant|provider|purpose`.

use anyhow::{Result, anyhow};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{CryptoKey, SecretPurpose, decrypt_secret, encrypt_secret};
use crate::models::integration::{self, Entity as Integration, STATUS_ACTIVE};
use crate::models::{AuthCredentials, ProviderType};

/// Repository for integration database operations
#[derive(Debug, Clone)]
pub struct IntegrationRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
    /// Crypto key for token encryption
    pub crypto_key: CryptoKey,
}

impl IntegrationRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    pub async fn find(
        &self,
        tenant_id: Uuid,
        provider: ProviderType,
    ) -> Result<Option<integration::Model>> {
        Ok(Integration::find()
            .filter(integration::Column::TenantId.eq(tenant_id))
            .filter(integration::Column::Provider.eq(provider.as_str()))
            .one(&*self.db)
            .await?)
    }

    /// Active integrations ordered by creation time, for the health-check loop
    pub async fn list_active(&self) -> Result<Vec<integration::Model>> {
        Ok(Integration::find()
            .filter(integration::Column::Status.eq(STATUS_ACTIVE))
            .order_by_asc(integration::Column::CreatedAt)
            .order_by_asc(integration::Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// Insert or replace the credentials for (tenant, provider) and mark the integration active
    pub async fn upsert_credentials(
        &self,
        tenant_id: Uuid,
        provider: ProviderType,
        credentials: &AuthCredentials,
    ) -> Result<integration::Model> {
        let access = encrypt_secret(
            &self.crypto_key,
            tenant_id,
            provider,
            SecretPurpose::AccessToken,
            &credentials.access_token,
        )
        .map_err(|e| anyhow!("Token encryption failed: {}", e))?;
        let refresh = credentials
            .refresh_token
            .as_deref()
            .map(|token| {
                encrypt_secret(
                    &self.crypto_key,
                    tenant_id,
                    provider,
                    SecretPurpose::RefreshToken,
                    token,
                )
            })
            .transpose()
            .map_err(|e| anyhow!("Token encryption failed: {}", e))?;

        let now = Utc::now();
        let expires_at = credentials.expires_at.map(Into::into);
        let metadata = Some(credentials.metadata());

        match self.find(tenant_id, provider).await? {
            Some(existing) => {
                let mut active: integration::ActiveModel = existing.into();
                active.access_token_ciphertext = Set(access);
                active.refresh_token_ciphertext = Set(refresh);
                active.expires_at = Set(expires_at);
                active.metadata = Set(metadata);
                active.status = Set(STATUS_ACTIVE.to_string());
                active.updated_at = Set(now.into());
                Ok(active.update(&*self.db).await?)
            }
            None => {
                let active = integration::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    tenant_id: Set(tenant_id),
                    provider: Set(provider.as_str().to_string()),
                    status: Set(STATUS_ACTIVE.to_string()),
                    access_token_ciphertext: Set(access),
                    refresh_token_ciphertext: Set(refresh),
                    expires_at: Set(expires_at),
                    metadata: Set(metadata),
                    created_at: Set(now.into()),
                    updated_at: Set(now.into()),
                };
                Ok(active.insert(&*self.db).await?)
            }
        }
    }

    /// Decrypt the stored tokens back into a credential bag
    pub fn credentials(&self, model: &integration::Model) -> Result<AuthCredentials> {
        let provider: ProviderType = model.provider.parse()?;
        let access_token = decrypt_secret(
            &self.crypto_key,
            model.tenant_id,
            provider,
            SecretPurpose::AccessToken,
            &model.access_token_ciphertext,
        )
        .map_err(|e| {
            tracing::error!(
                tenant_id = %model.tenant_id,
                provider = %model.provider,
                "Token decryption failed"
            );
            anyhow!("Token decryption failed: {}", e)
        })?;
        let refresh_token = model
            .refresh_token_ciphertext
            .as_deref()
            .map(|ct| {
                decrypt_secret(
                    &self.crypto_key,
                    model.tenant_id,
                    provider,
                    SecretPurpose::RefreshToken,
                    ct,
                )
            })
            .transpose()
            .map_err(|e| anyhow!("Token decryption failed: {}", e))?;

        let metadata = model.metadata.as_ref();
        let text = |key: &str| {
            metadata
                .and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Ok(AuthCredentials {
            access_token,
            refresh_token,
            shop_domain: text("shop_domain"),
            merchant_id: text("merchant_id"),
            expires_at: model.expires_at.map(|ts| ts.with_timezone(&Utc)),
            extra: metadata
                .and_then(|m| m.get("extra"))
                .and_then(|extra| serde_json::from_value(extra.clone()).ok())
                .unwrap_or_default(),
        })
    }

    pub async fn set_status(
        &self,
        tenant_id: Uuid,
        provider: ProviderType,
        status: &str,
    ) -> Result<Option<integration::Model>> {
        let Some(existing) = self.find(tenant_id, provider).await? else {
            return Ok(None);
        };
        let mut active: integration::ActiveModel = existing.into();
        active.status = Set(status.to_string());
        active.updated_at = Set(Utc::now().into());
        Ok(Some(active.update(&*self.db).await?))
    }
}
