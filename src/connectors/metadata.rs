//! Provider metadata types
//!
//! Static facts about each provider: how it authenticates, the scopes it needs,
//! how it signs webhooks and the request ceilings it publishes.

use serde::Serialize;
use utoipa::ToSchema;

use crate::models::ProviderType;
use crate::rate_limit::RateLimitConfig;

/// Authentication type supported by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// OAuth 2.0 authorization code flow
    OAuth2,
    /// Long-lived access token issued at app install
    AccessToken,
}

/// How a provider signs webhook deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    /// Base64 HMAC-SHA256 over notification URL + body
    HmacUrlAndBody,
    /// Base64 HMAC-SHA256 over the body
    HmacBody,
    /// Shared auth code echoed in a header
    SharedToken,
}

/// Metadata about a provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderMetadata {
    pub provider: ProviderType,
    pub auth_type: AuthType,
    pub scopes: Vec<&'static str>,
    /// Whether webhooks can be registered through the API
    pub webhook_api: bool,
    pub signature_header: &'static str,
    pub signature_scheme: SignatureScheme,
    pub default_limits: RateLimitConfig,
}

pub fn provider_metadata(provider: ProviderType) -> ProviderMetadata {
    match provider {
        ProviderType::Square => ProviderMetadata {
            provider,
            auth_type: AuthType::OAuth2,
            scopes: vec!["MERCHANT_PROFILE_READ", "PAYMENTS_READ", "ORDERS_READ"],
            webhook_api: true,
            signature_header: "x-square-hmacsha256-signature",
            signature_scheme: SignatureScheme::HmacUrlAndBody,
            default_limits: RateLimitConfig {
                requests_per_second: Some(10),
                requests_per_minute: Some(500),
                requests_per_hour: None,
                burst_limit: None,
            },
        },
        ProviderType::Shopify => ProviderMetadata {
            provider,
            auth_type: AuthType::AccessToken,
            scopes: vec!["read_orders", "read_locations"],
            webhook_api: true,
            signature_header: "x-shopify-hmac-sha256",
            signature_scheme: SignatureScheme::HmacBody,
            default_limits: RateLimitConfig {
                requests_per_second: Some(2),
                requests_per_minute: None,
                requests_per_hour: None,
                burst_limit: Some(40),
            },
        },
        ProviderType::Clover => ProviderMetadata {
            provider,
            auth_type: AuthType::OAuth2,
            scopes: vec!["MERCHANT_R", "PAYMENTS_R", "ORDERS_R"],
            webhook_api: false,
            signature_header: "x-clover-auth",
            signature_scheme: SignatureScheme::SharedToken,
            default_limits: RateLimitConfig {
                requests_per_second: Some(16),
                requests_per_minute: Some(1000),
                requests_per_hour: None,
                burst_limit: None,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_ceilings() {
        let square = provider_metadata(ProviderType::Square).default_limits;
        assert_eq!(square.requests_per_second, Some(10));
        assert_eq!(square.requests_per_minute, Some(500));

        let shopify = provider_metadata(ProviderType::Shopify).default_limits;
        assert_eq!(shopify.requests_per_second, Some(2));
        assert_eq!(shopify.burst_limit, Some(40));

        let clover = provider_metadata(ProviderType::Clover).default_limits;
        assert_eq!(clover.requests_per_second, Some(16));
        assert_eq!(clover.requests_per_minute, Some(1000));
    }

    #[test]
    fn signature_headers_are_lowercase() {
        for provider in ProviderType::ALL {
            let header = provider_metadata(provider).signature_header;
            assert_eq!(header, header.to_ascii_lowercase());
        }
    }
}
