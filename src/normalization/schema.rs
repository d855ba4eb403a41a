//! Declarative per-provider field mappings.

use crate::models::ProviderType;

/// Where each canonical field lives in a provider's raw transaction payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxDataSchema {
    pub provider: ProviderType,
    /// Integer amounts are minor units (cents) and are divided by 100
    pub minor_units: bool,
    pub transaction_id: &'static str,
    pub timestamp: &'static str,
    pub total_amount: &'static str,
    pub total_tax: &'static str,
    pub currency: Option<&'static str>,
    pub status: Option<&'static str>,
    pub location: LocationSchema,
    pub tax_lines: Option<TaxLineSchema>,
    pub line_items: Option<LineItemSchema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationSchema {
    pub id: Option<&'static str>,
    pub name: Option<&'static str>,
    pub address: Option<&'static str>,
    pub timezone: Option<&'static str>,
}

/// Paths relative to each element of `list`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxLineSchema {
    /// Must end with `[]`
    pub list: &'static str,
    pub name: &'static str,
    pub rate: &'static str,
    /// Provider-specific fixed-point scale applied before percentage detection
    pub rate_divisor: Option<u32>,
    pub amount: &'static str,
    pub jurisdiction: Option<&'static str>,
    pub tax_type: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineItemSchema {
    pub list: &'static str,
    pub id: Option<&'static str>,
    pub name: &'static str,
    /// Absent quantity means one unit
    pub quantity: Option<&'static str>,
    pub unit_price: &'static str,
    /// Absent total is derived as `quantity * unit_price`
    pub total_price: Option<&'static str>,
    pub tax_amount: Option<&'static str>,
}

/// Square Payments/Orders objects.
pub static SQUARE_SCHEMA: TaxDataSchema = TaxDataSchema {
    provider: ProviderType::Square,
    minor_units: true,
    transaction_id: "id",
    timestamp: "created_at",
    total_amount: "total_money.amount",
    total_tax: "total_tax_money.amount",
    currency: Some("total_money.currency"),
    status: Some("status"),
    location: LocationSchema {
        id: Some("location_id"),
        name: None,
        address: None,
        timezone: None,
    },
    tax_lines: Some(TaxLineSchema {
        list: "taxes[]",
        name: "name",
        rate: "percentage",
        rate_divisor: None,
        amount: "applied_money.amount",
        jurisdiction: Some("name"),
        tax_type: Some("type"),
    }),
    line_items: Some(LineItemSchema {
        list: "line_items[]",
        id: Some("uid"),
        name: "name",
        quantity: Some("quantity"),
        unit_price: "base_price_money.amount",
        total_price: Some("total_money.amount"),
        tax_amount: Some("total_tax_money.amount"),
    }),
};

/// Shopify Admin REST order objects (amounts are decimal strings).
pub static SHOPIFY_SCHEMA: TaxDataSchema = TaxDataSchema {
    provider: ProviderType::Shopify,
    minor_units: false,
    transaction_id: "id",
    timestamp: "created_at",
    total_amount: "total_price",
    total_tax: "total_tax",
    currency: Some("currency"),
    status: Some("financial_status"),
    location: LocationSchema {
        id: Some("location_id"),
        name: Some("shipping_address.company"),
        address: Some("billing_address.address1"),
        timezone: None,
    },
    tax_lines: Some(TaxLineSchema {
        list: "tax_lines[]",
        name: "title",
        rate: "rate",
        rate_divisor: None,
        amount: "price",
        jurisdiction: Some("jurisdiction_type"),
        tax_type: Some("source"),
    }),
    line_items: Some(LineItemSchema {
        list: "line_items[]",
        id: Some("id"),
        name: "title",
        quantity: Some("quantity"),
        unit_price: "price",
        total_price: None,
        tax_amount: Some("tax_lines[0].price"),
    }),
};

/// Clover v3 payment objects; rates are fixed-point with five implied decimals.
pub static CLOVER_SCHEMA: TaxDataSchema = TaxDataSchema {
    provider: ProviderType::Clover,
    minor_units: true,
    transaction_id: "id",
    timestamp: "createdTime",
    total_amount: "amount",
    total_tax: "taxAmount",
    currency: Some("currency"),
    status: Some("result"),
    location: LocationSchema {
        id: Some("device.id"),
        name: None,
        address: None,
        timezone: None,
    },
    tax_lines: Some(TaxLineSchema {
        list: "taxRates.elements[]",
        name: "name",
        rate: "rate",
        rate_divisor: Some(100_000),
        amount: "taxAmount",
        jurisdiction: Some("name"),
        tax_type: None,
    }),
    line_items: Some(LineItemSchema {
        list: "lineItems.elements[]",
        id: Some("id"),
        name: "name",
        quantity: None,
        unit_price: "price",
        total_price: None,
        tax_amount: None,
    }),
};

pub fn schema_for(provider: ProviderType) -> &'static TaxDataSchema {
    match provider {
        ProviderType::Square => &SQUARE_SCHEMA,
        ProviderType::Shopify => &SHOPIFY_SCHEMA,
        ProviderType::Clover => &CLOVER_SCHEMA,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_provider_has_a_schema_tagged_with_itself() {
        for provider in ProviderType::ALL {
            let schema = schema_for(provider);
            assert_eq!(schema.provider, provider);
            if let Some(lines) = &schema.tax_lines {
                assert!(lines.list.ends_with("[]"));
            }
            if let Some(items) = &schema.line_items {
                assert!(items.list.ends_with("[]"));
            }
        }
    }
}
