//! Connectors module
//!
//! This module provides the adapter layer including:
//! - The `Connector` trait every POS integration implements
//! - Provider metadata and the registry used for lookup
//! - Rate-limited HTTP plumbing and the Square, Shopify and Clover adapters

pub mod clover;
pub mod http;
pub mod metadata;
pub mod registry;
pub mod shopify;
pub mod square;
pub mod trait_;

pub use clover::{CloverConnector, register_clover_connector};
pub use http::{ProviderHttpClient, ProviderResponse, RequestTemplate};
pub use metadata::{AuthType, ProviderMetadata, SignatureScheme, provider_metadata};
pub use registry::{Registry, RegistryError};
pub use shopify::{ShopifyConnector, register_shopify_connector};
pub use square::{SquareConnector, register_square_connector};
pub use trait_::{
    Connector, ConnectorError, MAX_TRANSACTIONS_PER_CALL, TransactionQuery, WebhookRegistration,
    WebhookSetupParams, WebhookValidation,
};
