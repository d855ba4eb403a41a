//! Test utilities for database and service setup.
//!
//! Provides an in-memory SQLite database with migrations applied plus helpers that
//! assemble the integration services against it.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use pos_connectors::cache::{LocalCache, SharedCacheRef};
use pos_connectors::connectors::{
    CloverConnector, ProviderHttpClient, Registry, ShopifyConnector, SquareConnector,
    register_clover_connector, register_shopify_connector, register_square_connector,
};
use pos_connectors::models::ProviderType;
use pos_connectors::crypto::CryptoKey;
use pos_connectors::events::SignalBus;
use pos_connectors::rate_limit::{RateLimitManager, RetryPolicy};
use pos_connectors::recovery::{ErrorHandler, RecoverySettings};
use pos_connectors::webhooks::{WebhookManager, WebhookSettings};
use sea_orm::{Database, DatabaseConnection};

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

pub fn test_crypto_key() -> CryptoKey {
    CryptoKey::new(vec![7u8; 32]).expect("test key is 32 bytes")
}

/// Error handler, webhook manager and their shared plumbing over one database.
pub struct TestServices {
    pub db: Arc<DatabaseConnection>,
    pub cache: SharedCacheRef,
    pub signals: SignalBus,
    pub errors: ErrorHandler,
    pub webhooks: WebhookManager,
}

impl TestServices {
    pub async fn new(registry: Registry) -> Result<Self> {
        Self::with_settings(registry, WebhookSettings::default(), RecoverySettings::default())
            .await
    }

    pub async fn with_settings(
        registry: Registry,
        webhook_settings: WebhookSettings,
        recovery_settings: RecoverySettings,
    ) -> Result<Self> {
        let db = setup_test_db_arc().await?;
        let cache = LocalCache::shared(1024);
        let signals = SignalBus::new();
        let errors = ErrorHandler::new(
            registry.clone(),
            db.clone(),
            test_crypto_key(),
            cache.clone(),
            signals.clone(),
            recovery_settings,
        );
        let webhooks = WebhookManager::new(
            registry,
            db.clone(),
            test_crypto_key(),
            cache.clone(),
            signals.clone(),
            errors.clone(),
            webhook_settings,
        );
        Ok(Self {
            db,
            cache,
            signals,
            errors,
            webhooks,
        })
    }
}

pub const SHOPIFY_API_SECRET: &str = "shpss_test_secret";
pub const SQUARE_CLIENT_ID: &str = "sq0idp-test";
pub const SQUARE_CLIENT_SECRET: &str = "sq0csp-test";
pub const CLOVER_CLIENT_ID: &str = "clover-app-test";

/// Rate limiter with no ceilings and retries disabled, for adapter tests.
pub fn test_rate_limiter() -> RateLimitManager {
    RateLimitManager::builder(LocalCache::shared(1024))
        .default_policy(RetryPolicy::no_retry())
        .build()
}

/// Registry whose three adapters all talk to `base_url` (a wiremock server).
pub fn mock_registry(base_url: &str, limiter: &RateLimitManager) -> Registry {
    let http = |provider| {
        ProviderHttpClient::new(provider, limiter.clone(), Duration::from_secs(5))
            .expect("http client builds")
    };
    let mut registry = Registry::new();
    register_square_connector(
        &mut registry,
        Arc::new(SquareConnector::new(
            http(ProviderType::Square),
            base_url.to_string(),
            Some(SQUARE_CLIENT_ID.to_string()),
            Some(SQUARE_CLIENT_SECRET.to_string()),
        )),
    );
    register_shopify_connector(
        &mut registry,
        Arc::new(ShopifyConnector::new(
            http(ProviderType::Shopify),
            "2024-01".to_string(),
            Some(base_url.to_string()),
            Some(SHOPIFY_API_SECRET.to_string()),
        )),
    );
    register_clover_connector(
        &mut registry,
        Arc::new(CloverConnector::new(
            http(ProviderType::Clover),
            base_url.to_string(),
            Some(CLOVER_CLIENT_ID.to_string()),
        )),
    );
    registry
}
