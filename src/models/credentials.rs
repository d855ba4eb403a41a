//! Credential bag produced by a provider's authentication flow.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tokens and account identifiers for one tenant's connection to a provider.
///
/// Passed by value into adapters; adapters return an enriched copy from
/// `authenticate` and `refresh_credentials`.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthCredentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Shopify shop domain (`example.myshopify.com`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shop_domain: Option<String>,
    /// Square/Clover merchant identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider-specific extension fields
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl AuthCredentials {
    pub fn bearer<S: Into<String>>(access_token: S) -> Self {
        Self {
            access_token: access_token.into(),
            ..Self::default()
        }
    }

    pub fn with_refresh_token<S: Into<String>>(mut self, token: S) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn with_shop_domain<S: Into<String>>(mut self, domain: S) -> Self {
        self.shop_domain = Some(domain.into());
        self
    }

    pub fn with_merchant_id<S: Into<String>>(mut self, merchant_id: S) -> Self {
        self.merchant_id = Some(merchant_id.into());
        self
    }

    /// Returns `true` if the access token has a known expiry in the past.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    /// Non-secret identifying fields persisted alongside the encrypted tokens.
    pub fn metadata(&self) -> Value {
        serde_json::json!({
            "shop_domain": self.shop_domain,
            "merchant_id": self.merchant_id,
            "extra": self.extra,
        })
    }
}

impl fmt::Debug for AuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredentials")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("shop_domain", &self.shop_domain)
            .field("merchant_id", &self.merchant_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
