//! Data transformer: provider payload + [`TaxDataSchema`] into [`StandardizedTaxData`].
//!
//! Pure and synchronous. Only the transaction id and timestamp are mandatory; every other
//! field degrades to a default so that a partially populated provider object still yields
//! a usable record. Monetary values always leave here in decimal currency units.

pub mod path;
pub mod schema;

use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::IntegrationError;
use crate::models::{
    JurisdictionScope, LineItem, LocationInfo, ProviderType, StandardizedTaxData, TaxLine,
    TransactionMetadata, TransactionStatus,
};

pub use schema::{TaxDataSchema, schema_for};

const DEFAULT_CURRENCY: &str = "USD";
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Transform with the provider's built-in schema.
pub fn transform_payload(
    provider: ProviderType,
    payload: &Value,
) -> Result<StandardizedTaxData, IntegrationError> {
    transform(schema_for(provider), payload)
}

pub fn transform(
    schema: &TaxDataSchema,
    payload: &Value,
) -> Result<StandardizedTaxData, IntegrationError> {
    let provider = schema.provider;

    let Some(transaction_id) = path::resolve_string(payload, schema.transaction_id) else {
        metrics::counter!("transformations_failed_total", "provider" => provider.as_str())
            .increment(1);
        return Err(IntegrationError::transformation_failed(
            provider,
            format!("missing transaction id at '{}'", schema.transaction_id),
            payload,
        ));
    };

    let Some(timestamp) = path::resolve(payload, schema.timestamp).and_then(parse_timestamp)
    else {
        metrics::counter!("transformations_failed_total", "provider" => provider.as_str())
            .increment(1);
        return Err(IntegrationError::transformation_failed(
            provider,
            format!("missing or unparseable timestamp at '{}'", schema.timestamp),
            payload,
        ));
    };

    let money_at = |root: &Value, field: &str| {
        path::resolve(root, field).and_then(|v| parse_money(v, schema.minor_units))
    };

    let total_amount = money_at(payload, schema.total_amount).unwrap_or(Decimal::ZERO);
    let total_tax = money_at(payload, schema.total_tax)
        .unwrap_or(Decimal::ZERO)
        .abs();

    let tax_breakdown = schema
        .tax_lines
        .as_ref()
        .map(|lines| {
            path::resolve_all(payload, lines.list)
                .into_iter()
                .map(|line| {
                    let name = path::resolve_string(line, lines.name)
                        .unwrap_or_else(|| "Tax".to_string());
                    let jurisdiction = lines
                        .jurisdiction
                        .and_then(|field| path::resolve_string(line, field));
                    let scope = jurisdiction
                        .as_deref()
                        .and_then(parse_scope)
                        .or_else(|| parse_scope(&name));
                    TaxLine {
                        rate: path::resolve(line, lines.rate)
                            .and_then(|v| parse_rate(v, lines.rate_divisor))
                            .unwrap_or(Decimal::ZERO),
                        amount: money_at(line, lines.amount).unwrap_or(Decimal::ZERO),
                        tax_type: lines
                            .tax_type
                            .and_then(|field| path::resolve_string(line, field)),
                        name,
                        jurisdiction,
                        scope,
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let line_items = schema
        .line_items
        .as_ref()
        .map(|items| {
            path::resolve_all(payload, items.list)
                .into_iter()
                .map(|item| {
                    let quantity = items
                        .quantity
                        .and_then(|field| path::resolve(item, field))
                        .and_then(parse_decimal)
                        .unwrap_or(Decimal::ONE);
                    let unit_price = money_at(item, items.unit_price).unwrap_or(Decimal::ZERO);
                    let total_price = items
                        .total_price
                        .and_then(|field| money_at(item, field))
                        .unwrap_or_else(|| {
                            quantity.checked_mul(unit_price).unwrap_or_else(|| {
                                tracing::warn!(
                                    provider = %provider,
                                    %quantity,
                                    %unit_price,
                                    "Line item total overflows, defaulting to zero"
                                );
                                Decimal::ZERO
                            })
                        });
                    LineItem {
                        id: items.id.and_then(|field| path::resolve_string(item, field)),
                        name: path::resolve_string(item, items.name).unwrap_or_default(),
                        quantity,
                        unit_price,
                        total_price,
                        tax_amount: items
                            .tax_amount
                            .and_then(|field| money_at(item, field))
                            .unwrap_or(Decimal::ZERO),
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let location = LocationInfo {
        id: schema
            .location
            .id
            .and_then(|field| path::resolve_string(payload, field)),
        name: schema
            .location
            .name
            .and_then(|field| path::resolve_string(payload, field)),
        address: schema
            .location
            .address
            .and_then(|field| path::resolve_string(payload, field)),
        timezone: schema
            .location
            .timezone
            .and_then(|field| path::resolve_string(payload, field)),
    };

    let currency = schema
        .currency
        .and_then(|field| path::resolve_string(payload, field))
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic()))
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let status = schema
        .status
        .and_then(|field| path::resolve_string(payload, field))
        .map(|raw| parse_status(&raw))
        .unwrap_or_default();

    let record = StandardizedTaxData {
        transaction_id,
        timestamp,
        total_amount,
        total_tax,
        tax_breakdown,
        location,
        line_items,
        currency,
        status,
        metadata: TransactionMetadata {
            provider,
            transformed_at: Utc::now(),
            original_payload: payload.clone(),
        },
    };

    let Some(breakdown_total) = record.breakdown_total() else {
        tracing::warn!(
            provider = %provider,
            transaction_id = %record.transaction_id,
            tax_lines = record.tax_breakdown.len(),
            "Tax breakdown overflows, skipping reconciliation"
        );
        metrics::counter!("transformations_total", "provider" => provider.as_str()).increment(1);
        return Ok(record);
    };
    if record.total_amount < breakdown_total.abs() {
        tracing::warn!(
            provider = %provider,
            transaction_id = %record.transaction_id,
            total_amount = %record.total_amount,
            breakdown_total = %breakdown_total,
            "Tax breakdown exceeds transaction total"
        );
    } else if !record.tax_breakdown.is_empty() && breakdown_total.abs() != record.total_tax {
        tracing::debug!(
            provider = %provider,
            transaction_id = %record.transaction_id,
            total_tax = %record.total_tax,
            breakdown_total = %breakdown_total,
            "Tax breakdown does not reconcile with total tax"
        );
    }

    metrics::counter!("transformations_total", "provider" => provider.as_str()).increment(1);
    Ok(record)
}

/// Money in decimal units. Integer literals from minor-unit providers are cents; a value
/// written with a decimal point (`50.0`, `"50.00"`) is already in currency units.
pub fn parse_money(value: &Value, minor_units: bool) -> Option<Decimal> {
    parse_money_at_depth(value, minor_units, 0)
}

fn parse_money_at_depth(value: &Value, minor_units: bool, depth: u8) -> Option<Decimal> {
    let (amount, integer_literal) = match value {
        Value::Object(map) if depth == 0 => {
            return map
                .get("amount")
                .and_then(|inner| parse_money_at_depth(inner, minor_units, depth + 1));
        }
        Value::Number(n) => (parse_decimal(value)?, n.is_i64() || n.is_u64()),
        Value::String(s) => (parse_decimal(value)?, !s.contains('.')),
        _ => return None,
    };

    if minor_units && integer_literal {
        Some(amount / Decimal::ONE_HUNDRED)
    } else {
        Some(amount)
    }
}

/// Numbers as-is; strings after dropping everything but digits, `.` and `-`.
pub fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(Decimal::from(i));
            }
            if let Some(u) = n.as_u64() {
                return Some(Decimal::from(u));
            }
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            Decimal::from_str(&cleaned).ok()
        }
        _ => None,
    }
}

/// Fractional tax rate; values above 1 are percentages.
pub fn parse_rate(value: &Value, divisor: Option<u32>) -> Option<Decimal> {
    let mut rate = parse_decimal(value)?;
    if let Some(divisor) = divisor.filter(|d| *d > 0) {
        rate /= Decimal::from(divisor);
    }
    if rate > Decimal::ONE {
        rate /= Decimal::ONE_HUNDRED;
    }
    Some(rate.normalize())
}

/// RFC 3339, naive ISO-8601 (assumed UTC) or epoch seconds/milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(naive.and_utc());
                }
            }
            s.parse::<i64>().ok().and_then(from_epoch)
        }
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

pub fn parse_status(raw: &str) -> TransactionStatus {
    let lower = raw.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["complet", "paid", "success", "approved", "captured"]) {
        TransactionStatus::Completed
    } else if has(&["pending", "processing", "authorized", "open"]) {
        TransactionStatus::Pending
    } else if has(&["fail", "error", "cancel", "declined"]) {
        TransactionStatus::Failed
    } else if has(&["refund", "void"]) {
        TransactionStatus::Refunded
    } else {
        TransactionStatus::Completed
    }
}

pub fn parse_scope(raw: &str) -> Option<JurisdictionScope> {
    let lower = raw.to_ascii_lowercase();
    [
        ("state", JurisdictionScope::State),
        ("county", JurisdictionScope::County),
        ("city", JurisdictionScope::City),
        ("municipal", JurisdictionScope::Municipal),
        ("special", JurisdictionScope::Special),
        ("district", JurisdictionScope::District),
    ]
    .into_iter()
    .find(|(needle, _)| lower.contains(needle))
    .map(|(_, scope)| scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn square_example_normalizes() {
        let payload = json!({
            "id": "p1",
            "created_at": "2024-01-01T00:00:00Z",
            "total_money": {"amount": 5000},
            "total_tax_money": {"amount": 400}
        });

        let record = transform_payload(ProviderType::Square, &payload).unwrap();
        assert_eq!(record.transaction_id, "p1");
        assert_eq!(record.total_amount, dec!(50.00));
        assert_eq!(record.total_tax, dec!(4.00));
        assert_eq!(record.currency, "USD");
        assert_eq!(record.status, TransactionStatus::Completed);
        assert_eq!(record.metadata.original_payload, payload);
    }

    #[test]
    fn minor_and_decimal_units_agree() {
        assert_eq!(parse_money(&json!(12345), true), Some(dec!(123.45)));
        assert_eq!(parse_money(&json!(123.45), true), Some(dec!(123.45)));
        assert_eq!(parse_money(&json!({"amount": 12345}), true), Some(dec!(123.45)));
        assert_eq!(parse_money(&json!("$1,234.50"), false), Some(dec!(1234.50)));
        assert_eq!(parse_money(&json!({"amount": {"amount": 1}}), true), None);
    }

    #[test]
    fn decimal_point_means_currency_units_even_for_minor_unit_providers() {
        assert_eq!(parse_money(&json!(50.0), true), Some(dec!(50.0)));
        assert_eq!(parse_money(&json!("50.00"), true), Some(dec!(50.00)));
        assert_eq!(parse_money(&json!("5000"), true), Some(dec!(50.00)));
    }

    #[test]
    fn overflowing_line_items_and_tax_lines_degrade_instead_of_panicking() {
        let huge = "79228162514264337593543950335";
        let payload = json!({
            "id": 450789469,
            "created_at": "2024-01-01T00:00:00Z",
            "total_price": "10.00",
            "line_items": [
                {"id": 1, "title": "Widget", "quantity": huge, "price": "2.00"}
            ],
            "tax_lines": [
                {"title": "State", "price": huge, "rate": 0.06},
                {"title": "City", "price": huge, "rate": 0.01}
            ]
        });

        let record = transform_payload(ProviderType::Shopify, &payload).unwrap();
        assert_eq!(record.line_items.len(), 1);
        assert_eq!(record.line_items[0].total_price, Decimal::ZERO);
        assert_eq!(record.tax_breakdown.len(), 2);
        assert_eq!(record.breakdown_total(), None);
    }

    #[test]
    fn missing_id_or_timestamp_fails_with_payload() {
        let payload = json!({"created_at": "2024-01-01T00:00:00Z"});
        let err = transform_payload(ProviderType::Square, &payload).unwrap_err();
        assert_eq!(err.code, ErrorCode::TransformationFailed);
        assert!(!err.retryable);
        assert_eq!(err.details.unwrap()["original_payload"], payload);

        let payload = json!({"id": "p2", "created_at": "yesterday"});
        let err = transform_payload(ProviderType::Square, &payload).unwrap_err();
        assert_eq!(err.code, ErrorCode::TransformationFailed);
    }

    #[test]
    fn total_tax_is_reported_non_negative() {
        let payload = json!({
            "id": "r1",
            "created_at": 1704067200,
            "total_money": {"amount": -5000},
            "total_tax_money": {"amount": -400}
        });
        let record = transform_payload(ProviderType::Square, &payload).unwrap();
        assert_eq!(record.total_tax, dec!(4.00));
        assert_eq!(record.total_amount, dec!(-50.00));
    }

    #[test]
    fn rates_above_one_are_percentages() {
        assert_eq!(parse_rate(&json!("8.25"), None), Some(dec!(0.0825)));
        assert_eq!(parse_rate(&json!(0.06), None), Some(dec!(0.06)));
        assert_eq!(parse_rate(&json!(825000), Some(100_000)), Some(dec!(0.0825)));
    }

    #[test]
    fn status_and_scope_map_by_substring() {
        assert_eq!(parse_status("COMPLETED"), TransactionStatus::Completed);
        assert_eq!(parse_status("paid"), TransactionStatus::Completed);
        assert_eq!(parse_status("processing"), TransactionStatus::Pending);
        assert_eq!(parse_status("CANCELED"), TransactionStatus::Failed);
        assert_eq!(parse_status("refunded"), TransactionStatus::Refunded);
        assert_eq!(parse_status("voided"), TransactionStatus::Refunded);
        assert_eq!(parse_status("mystery"), TransactionStatus::Completed);

        assert_eq!(parse_scope("CA State Tax"), Some(JurisdictionScope::State));
        assert_eq!(parse_scope("county"), Some(JurisdictionScope::County));
        assert_eq!(parse_scope("VAT"), None);
    }

    #[test]
    fn timestamps_accept_epoch_seconds_and_millis() {
        let expected = DateTime::from_timestamp(1_704_067_200, 0).unwrap();
        assert_eq!(parse_timestamp(&json!(1_704_067_200)), Some(expected));
        assert_eq!(parse_timestamp(&json!(1_704_067_200_000i64)), Some(expected));
        assert_eq!(parse_timestamp(&json!("2024-01-01T00:00:00")), Some(expected));
    }
}
