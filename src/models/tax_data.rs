//! Canonical transaction record produced by the data transformer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use super::provider_type::ProviderType;

/// Canonical settlement status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    #[default]
    Completed,
    Pending,
    Failed,
    Refunded,
}

/// Level of government a tax line was levied by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JurisdictionScope {
    State,
    County,
    City,
    Municipal,
    Special,
    District,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TaxLine {
    pub name: String,
    /// Fractional rate (0.0825 for 8.25%)
    #[schema(value_type = String)]
    pub rate: Decimal,
    #[schema(value_type = String)]
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub tax_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<JurisdictionScope>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct LocationInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LineItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[schema(value_type = String)]
    pub quantity: Decimal,
    #[schema(value_type = String)]
    pub unit_price: Decimal,
    #[schema(value_type = String)]
    pub total_price: Decimal,
    #[schema(value_type = String)]
    pub tax_amount: Decimal,
}

/// Provenance attached to every canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TransactionMetadata {
    pub provider: ProviderType,
    pub transformed_at: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub original_payload: Value,
}

/// Provider-agnostic transaction with tax breakdown, amounts in decimal currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StandardizedTaxData {
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    #[schema(value_type = String)]
    pub total_amount: Decimal,
    #[schema(value_type = String)]
    pub total_tax: Decimal,
    pub tax_breakdown: Vec<TaxLine>,
    pub location: LocationInfo,
    pub line_items: Vec<LineItem>,
    pub currency: String,
    pub status: TransactionStatus,
    pub metadata: TransactionMetadata,
}

impl StandardizedTaxData {
    /// Sum of the tax-line amounts, which providers do not always reconcile with `total_tax`.
    /// `None` when the sum overflows.
    pub fn breakdown_total(&self) -> Option<Decimal> {
        self.tax_breakdown
            .iter()
            .try_fold(Decimal::ZERO, |sum, line| sum.checked_add(line.amount))
    }
}
