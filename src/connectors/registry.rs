//! Provider registry
//!
//! Maps each [`ProviderType`] to its connector and metadata. Built once at startup
//! and shared behind an `Arc`; the managers only ever see `dyn Connector`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::AppConfig;
use crate::connectors::http::ProviderHttpClient;
use crate::connectors::{
    CloverConnector, Connector, ProviderMetadata, ShopifyConnector, SquareConnector,
    register_clover_connector, register_shopify_connector, register_square_connector,
};
use crate::models::ProviderType;
use crate::rate_limit::RateLimitManager;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Provider '{provider}' is not registered")]
    ProviderNotRegistered { provider: ProviderType },
    #[error("HTTP client for '{provider}' could not be built: {message}")]
    HttpClient {
        provider: ProviderType,
        message: String,
    },
}

/// Provider registry that stores connectors and their metadata
#[derive(Clone, Default)]
pub struct Registry {
    connectors: HashMap<ProviderType, Arc<dyn Connector>>,
    metadata: HashMap<ProviderType, ProviderMetadata>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the Square, Shopify and Clover adapters wired to `limiter`.
    pub fn from_config(
        config: &AppConfig,
        limiter: &RateLimitManager,
    ) -> Result<Self, RegistryError> {
        let timeout = Duration::from_secs(config.http_timeout_seconds);
        let http = |provider| {
            ProviderHttpClient::new(provider, limiter.clone(), timeout).map_err(|err| {
                RegistryError::HttpClient {
                    provider,
                    message: err.to_string(),
                }
            })
        };
        let settings = &config.providers;
        let mut registry = Self::new();

        register_square_connector(
            &mut registry,
            Arc::new(SquareConnector::new(
                http(ProviderType::Square)?,
                settings.square_api_base.clone(),
                settings.square_client_id.clone(),
                settings.square_client_secret.clone(),
            )),
        );
        register_shopify_connector(
            &mut registry,
            Arc::new(ShopifyConnector::new(
                http(ProviderType::Shopify)?,
                settings.shopify_api_version.clone(),
                settings.shopify_api_base.clone(),
                settings.shopify_api_secret.clone(),
            )),
        );
        register_clover_connector(
            &mut registry,
            Arc::new(CloverConnector::new(
                http(ProviderType::Clover)?,
                settings.clover_api_base.clone(),
                settings.clover_client_id.clone(),
            )),
        );

        info!(providers = registry.connectors.len(), "Provider registry initialized");
        Ok(registry)
    }

    /// Register a new provider with its connector and metadata
    pub fn register(&mut self, connector: Arc<dyn Connector>, metadata: ProviderMetadata) {
        let provider = connector.provider();
        self.connectors.insert(provider, connector);
        self.metadata.insert(provider, metadata);
    }

    /// Get a connector by provider
    pub fn get(&self, provider: ProviderType) -> Result<Arc<dyn Connector>, RegistryError> {
        self.connectors
            .get(&provider)
            .cloned()
            .ok_or(RegistryError::ProviderNotRegistered { provider })
    }

    /// Get metadata for a specific provider
    pub fn get_metadata(&self, provider: ProviderType) -> Result<&ProviderMetadata, RegistryError> {
        self.metadata
            .get(&provider)
            .ok_or(RegistryError::ProviderNotRegistered { provider })
    }

    /// Metadata for all registered providers in declaration order
    pub fn list_metadata(&self) -> Vec<ProviderMetadata> {
        let mut metadata: Vec<_> = self.metadata.values().cloned().collect();
        metadata.sort_by_key(|m| m.provider);
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;

    #[tokio::test]
    async fn test_registry_unregistered_provider() {
        let registry = Registry::new();
        let result = registry.get(ProviderType::Square);
        assert!(matches!(
            result,
            Err(RegistryError::ProviderNotRegistered {
                provider: ProviderType::Square
            })
        ));
        assert!(registry.get_metadata(ProviderType::Clover).is_err());
    }

    #[tokio::test]
    async fn test_registry_from_config_registers_every_provider() {
        let limiter = RateLimitManager::builder(LocalCache::shared(8)).build();
        let registry = Registry::from_config(&AppConfig::default(), &limiter).unwrap();

        for provider in ProviderType::ALL {
            let connector = registry.get(provider).unwrap();
            assert_eq!(connector.provider(), provider);
        }

        let listed: Vec<_> = registry.list_metadata().iter().map(|m| m.provider).collect();
        assert_eq!(listed, ProviderType::ALL.to_vec());
    }
}
