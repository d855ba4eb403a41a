//! Clover connector implementation
//!
//! Clover v3 REST API scoped by merchant id. A merchant is a single location.
//! Webhooks are configured in the Clover developer dashboard rather than through
//! the API, and deliveries carry object ids only, never the payment itself.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connectors::http::{ProviderHttpClient, RequestTemplate};
use crate::connectors::trait_::{
    Connector, MAX_TRANSACTIONS_PER_CALL, TransactionQuery, WebhookRegistration,
    WebhookSetupParams, WebhookValidation,
};
use crate::connectors::{Registry, provider_metadata};
use crate::error::{ErrorCode, IntegrationError};
use crate::models::{AuthCredentials, LocationInfo, ProviderType, StandardizedTaxData};
use crate::normalization::path::resolve_string;
use crate::webhook_verification::verify_shared_token;

const PAGE_LIMIT: usize = 100;

pub struct CloverConnector {
    http: ProviderHttpClient,
    api_base: String,
    client_id: Option<String>,
}

impl CloverConnector {
    pub fn new(http: ProviderHttpClient, api_base: String, client_id: Option<String>) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            client_id,
        }
    }

    fn merchant_url(&self, credentials: &AuthCredentials, path: &str) -> Result<String, IntegrationError> {
        let merchant_id = merchant_id(credentials)?;
        Ok(format!("{}/v3/merchants/{}{}", self.api_base, merchant_id, path))
    }

    async fn fetch_merchant(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &AuthCredentials,
        operation: &str,
    ) -> Result<Value, IntegrationError> {
        require_token(credentials)?;
        let template = RequestTemplate::get(self.merchant_url(credentials, "")?)
            .bearer(credentials.access_token.clone())
            .query("expand", "address,properties");
        self.http.json(tenant_id, operation, template).await
    }
}

fn require_token(credentials: &AuthCredentials) -> Result<(), IntegrationError> {
    if credentials.access_token.trim().is_empty() {
        return Err(IntegrationError::new(
            ErrorCode::AuthError,
            ProviderType::Clover,
            "missing Clover access token",
        ));
    }
    Ok(())
}

fn merchant_id(credentials: &AuthCredentials) -> Result<&str, IntegrationError> {
    credentials
        .merchant_id
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            IntegrationError::new(
                ErrorCode::ValidationError,
                ProviderType::Clover,
                "Clover credentials carry no merchant id",
            )
        })
}

/// `P:` payments, `O:` orders, `R:` refunds; anything else keeps the raw prefix.
fn object_kind(object_id: &str) -> &str {
    match object_id.split_once(':').map(|(prefix, _)| prefix) {
        Some("P") => "payments",
        Some("O") => "orders",
        Some("R") => "refunds",
        Some("I") => "inventory",
        Some("C") => "customers",
        Some(other) => other,
        None => "unknown",
    }
}

fn first_update(payload: &Value) -> Option<(&String, &Value)> {
    let (merchant, updates) = payload.get("merchants")?.as_object()?.iter().next()?;
    let update = updates.as_array()?.first()?;
    Some((merchant, update))
}

#[async_trait]
impl Connector for CloverConnector {
    fn provider(&self) -> ProviderType {
        ProviderType::Clover
    }

    async fn test_connection(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &AuthCredentials,
    ) -> Result<(), IntegrationError> {
        self.fetch_merchant(tenant_id, credentials, "test_connection")
            .await?;
        Ok(())
    }

    async fn authenticate(
        &self,
        tenant_id: Option<Uuid>,
        credentials: AuthCredentials,
    ) -> Result<AuthCredentials, IntegrationError> {
        let body = self
            .fetch_merchant(tenant_id, &credentials, "authenticate")
            .await?;

        let mut enriched = credentials;
        if let Some(name) = resolve_string(&body, "name") {
            enriched.extra.insert("merchant_name".into(), Value::String(name));
        }
        if let Some(timezone) = resolve_string(&body, "properties.timezone") {
            enriched.extra.insert("timezone".into(), Value::String(timezone));
        }
        Ok(enriched)
    }

    async fn refresh_credentials(
        &self,
        tenant_id: Option<Uuid>,
        credentials: AuthCredentials,
    ) -> Result<AuthCredentials, IntegrationError> {
        let Some(client_id) = &self.client_id else {
            return Err(IntegrationError::new(
                ErrorCode::ValidationError,
                ProviderType::Clover,
                "Clover client id is not configured",
            ));
        };
        let Some(refresh_token) = credentials.refresh_token.clone() else {
            return Err(IntegrationError::new(
                ErrorCode::AuthError,
                ProviderType::Clover,
                "no refresh token on file",
            ));
        };

        let template = RequestTemplate::post(format!("{}/oauth/v2/refresh", self.api_base)).json(
            serde_json::json!({
                "client_id": client_id,
                "refresh_token": refresh_token,
            }),
        );
        let body = self.http.json(tenant_id, "refresh_credentials", template).await?;

        let access_token = resolve_string(&body, "access_token").ok_or_else(|| {
            IntegrationError::new(
                ErrorCode::AuthError,
                ProviderType::Clover,
                "token response carried no access_token",
            )
        })?;

        let mut refreshed = credentials;
        refreshed.access_token = access_token;
        if let Some(token) = resolve_string(&body, "refresh_token") {
            refreshed.refresh_token = Some(token);
        }
        refreshed.expires_at = body
            .get("access_token_expiration")
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        info!(tenant_id = ?tenant_id, "Refreshed Clover credentials");
        Ok(refreshed)
    }

    async fn get_locations(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &AuthCredentials,
    ) -> Result<Vec<LocationInfo>, IntegrationError> {
        let body = self
            .fetch_merchant(tenant_id, credentials, "get_locations")
            .await?;
        Ok(vec![LocationInfo {
            id: resolve_string(&body, "id").or_else(|| credentials.merchant_id.clone()),
            name: resolve_string(&body, "name"),
            address: resolve_string(&body, "address.address1"),
            timezone: resolve_string(&body, "properties.timezone"),
        }])
    }

    async fn get_transactions(
        &self,
        query: TransactionQuery,
    ) -> Result<Vec<StandardizedTaxData>, IntegrationError> {
        require_token(&query.credentials)?;
        let url = self.merchant_url(&query.credentials, "/payments")?;
        let mut records = Vec::new();
        let mut offset = 0usize;

        loop {
            let template = RequestTemplate::get(url.clone())
                .bearer(query.credentials.access_token.clone())
                .query("filter", format!("createdTime>={}", query.start.timestamp_millis()))
                .query("filter", format!("createdTime<{}", query.end.timestamp_millis()))
                .query("expand", "taxRates,lineItems,device")
                .query("limit", PAGE_LIMIT.to_string())
                .query("offset", offset.to_string());

            let page = self
                .http
                .send(query.tenant_id, "get_transactions", query.priority, template)
                .await?
                .body;
            let elements = page
                .get("elements")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            for payment in elements {
                if records.len() >= MAX_TRANSACTIONS_PER_CALL {
                    break;
                }
                match self.transform_raw_data(payment) {
                    Ok(record) => records.push(record),
                    Err(err) => warn!(error = %err, "Skipping untransformable Clover payment"),
                }
            }

            if elements.len() < PAGE_LIMIT || records.len() >= MAX_TRANSACTIONS_PER_CALL {
                break;
            }
            offset += elements.len();
        }

        Ok(records)
    }

    async fn setup_webhooks(
        &self,
        params: WebhookSetupParams,
    ) -> Result<WebhookRegistration, IntegrationError> {
        // Registration lives in the app settings; prove the credentials and record the merchant.
        self.test_connection(Some(params.tenant_id), &params.credentials)
            .await?;
        info!(
            tenant_id = %params.tenant_id,
            notification_url = %params.notification_url,
            "Clover webhooks are configured in the developer dashboard"
        );
        Ok(WebhookRegistration {
            webhook_id: None,
            events: vec!["payments".to_string(), "orders".to_string()],
            signing_secret: None,
            account_id: params.credentials.merchant_id.clone(),
        })
    }

    fn validate_webhook(&self, validation: &WebhookValidation<'_>) -> bool {
        verify_shared_token(validation.signature, validation.secret).is_ok()
    }

    fn signature_header(&self) -> &'static str {
        provider_metadata(ProviderType::Clover).signature_header
    }

    fn event_name(&self, _headers: &HeaderMap, payload: &Value) -> Option<String> {
        let (_, update) = first_update(payload)?;
        let object_id = update.get("objectId")?.as_str()?;
        let action = update
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("UPDATE")
            .to_ascii_lowercase();
        Some(format!("{}.{}", object_kind(object_id), action))
    }

    fn webhook_account_id(&self, _headers: &HeaderMap, payload: &Value) -> Option<String> {
        first_update(payload).map(|(merchant, _)| merchant.clone())
    }

    fn is_transaction_event(&self, event_name: &str) -> bool {
        event_name.starts_with("payments.") || event_name.starts_with("refunds.")
    }

    fn webhook_transaction_payload<'a>(&self, payload: &'a Value) -> Option<&'a Value> {
        first_update(payload).and_then(|(_, update)| update.get("object"))
    }
}

/// Register the Clover connector
pub fn register_clover_connector(registry: &mut Registry, connector: Arc<CloverConnector>) {
    registry.register(connector, provider_metadata(ProviderType::Clover));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_prefixes_map_to_kinds() {
        assert_eq!(object_kind("P:ABC123"), "payments");
        assert_eq!(object_kind("O:XYZ"), "orders");
        assert_eq!(object_kind("no-prefix"), "unknown");
    }

    #[test]
    fn first_update_reads_the_merchant_envelope() {
        let payload = json!({
            "appId": "APP1",
            "merchants": {
                "MID123": [{ "objectId": "P:PAY1", "type": "CREATE", "ts": 1700000000000u64 }]
            }
        });
        let (merchant, update) = first_update(&payload).unwrap();
        assert_eq!(merchant, "MID123");
        assert_eq!(update["objectId"], "P:PAY1");
        assert!(first_update(&json!({"merchants": {}})).is_none());
    }
}
