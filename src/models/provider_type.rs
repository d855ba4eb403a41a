//! Supported POS provider tags.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Closed set of point-of-sale systems the integration layer speaks to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Square,
    Shopify,
    Clover,
}

impl ProviderType {
    pub const ALL: [ProviderType; 3] = [
        ProviderType::Square,
        ProviderType::Shopify,
        ProviderType::Clover,
    ];

    /// Return the canonical string representation for this provider.
    pub const fn as_str(self) -> &'static str {
        match self {
            ProviderType::Square => "square",
            ProviderType::Shopify => "shopify",
            ProviderType::Clover => "clover",
        }
    }

    /// Upper-case form used in configuration keys (`RATE_LIMIT_SQUARE_PER_SECOND`).
    pub fn config_key(self) -> String {
        self.as_str().to_ascii_uppercase()
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderType {
    type Err = UnknownProvider;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ProviderType::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownProvider(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Square".parse::<ProviderType>(), Ok(ProviderType::Square));
        assert_eq!(" clover ".parse::<ProviderType>(), Ok(ProviderType::Clover));
        assert!("toast".parse::<ProviderType>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ProviderType::Shopify).unwrap();
        assert_eq!(json, "\"shopify\"");
    }
}
