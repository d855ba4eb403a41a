//! Square connector implementation
//!
//! Speaks the Square Connect v2 REST API: payments listing with cursor pagination,
//! the locations and merchant endpoints, OAuth token refresh and webhook
//! subscriptions signed over notification URL and body.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
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
use crate::webhook_verification::verify_square_signature;

const SQUARE_VERSION: &str = "2024-01-18";
const PAGE_LIMIT: &str = "100";

pub const SQUARE_WEBHOOK_EVENTS: [&str; 4] = [
    "payment.created",
    "payment.updated",
    "refund.created",
    "refund.updated",
];

pub struct SquareConnector {
    http: ProviderHttpClient,
    api_base: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl SquareConnector {
    pub fn new(
        http: ProviderHttpClient,
        api_base: String,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
        }
    }

    fn request(&self, template: RequestTemplate, credentials: &AuthCredentials) -> RequestTemplate {
        template
            .bearer(credentials.access_token.clone())
            .header("Square-Version", SQUARE_VERSION)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

fn require_token(credentials: &AuthCredentials) -> Result<(), IntegrationError> {
    if credentials.access_token.trim().is_empty() {
        return Err(IntegrationError::new(
            ErrorCode::AuthError,
            ProviderType::Square,
            "missing Square access token",
        ));
    }
    Ok(())
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn location_from(value: &Value) -> LocationInfo {
    LocationInfo {
        id: resolve_string(value, "id"),
        name: resolve_string(value, "name"),
        address: resolve_string(value, "address.address_line_1"),
        timezone: resolve_string(value, "timezone"),
    }
}

#[async_trait]
impl Connector for SquareConnector {
    fn provider(&self) -> ProviderType {
        ProviderType::Square
    }

    async fn test_connection(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &AuthCredentials,
    ) -> Result<(), IntegrationError> {
        require_token(credentials)?;
        let template = self.request(RequestTemplate::get(self.url("/v2/locations")), credentials);
        self.http.json(tenant_id, "test_connection", template).await?;
        Ok(())
    }

    async fn authenticate(
        &self,
        tenant_id: Option<Uuid>,
        credentials: AuthCredentials,
    ) -> Result<AuthCredentials, IntegrationError> {
        require_token(&credentials)?;
        let template =
            self.request(RequestTemplate::get(self.url("/v2/merchants/me")), &credentials);
        let body = self.http.json(tenant_id, "authenticate", template).await?;

        let mut enriched = credentials;
        if let Some(merchant_id) = resolve_string(&body, "merchant.id") {
            enriched.merchant_id = Some(merchant_id);
        }
        if let Some(name) = resolve_string(&body, "merchant.business_name") {
            enriched.extra.insert("business_name".into(), Value::String(name));
        }
        Ok(enriched)
    }

    async fn refresh_credentials(
        &self,
        tenant_id: Option<Uuid>,
        credentials: AuthCredentials,
    ) -> Result<AuthCredentials, IntegrationError> {
        let (Some(client_id), Some(client_secret)) = (&self.client_id, &self.client_secret) else {
            return Err(IntegrationError::new(
                ErrorCode::ValidationError,
                ProviderType::Square,
                "Square client credentials are not configured",
            ));
        };
        let Some(refresh_token) = credentials.refresh_token.clone() else {
            return Err(IntegrationError::new(
                ErrorCode::AuthError,
                ProviderType::Square,
                "no refresh token on file",
            ));
        };

        let template = RequestTemplate::post(self.url("/oauth2/token"))
            .header("Square-Version", SQUARE_VERSION)
            .json(json!({
                "client_id": client_id,
                "client_secret": client_secret,
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }));
        let body = self.http.json(tenant_id, "refresh_credentials", template).await?;

        let access_token = resolve_string(&body, "access_token").ok_or_else(|| {
            IntegrationError::new(
                ErrorCode::AuthError,
                ProviderType::Square,
                "token response carried no access_token",
            )
        })?;

        let mut refreshed = credentials;
        refreshed.access_token = access_token;
        if let Some(token) = resolve_string(&body, "refresh_token") {
            refreshed.refresh_token = Some(token);
        }
        refreshed.expires_at = resolve_string(&body, "expires_at")
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc));
        if let Some(merchant_id) = resolve_string(&body, "merchant_id") {
            refreshed.merchant_id = Some(merchant_id);
        }
        info!(tenant_id = ?tenant_id, "Refreshed Square credentials");
        Ok(refreshed)
    }

    async fn get_locations(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &AuthCredentials,
    ) -> Result<Vec<LocationInfo>, IntegrationError> {
        require_token(credentials)?;
        let template = self.request(RequestTemplate::get(self.url("/v2/locations")), credentials);
        let body = self.http.json(tenant_id, "get_locations", template).await?;
        Ok(body
            .get("locations")
            .and_then(Value::as_array)
            .map(|locations| locations.iter().map(location_from).collect())
            .unwrap_or_default())
    }

    async fn get_transactions(
        &self,
        query: TransactionQuery,
    ) -> Result<Vec<StandardizedTaxData>, IntegrationError> {
        require_token(&query.credentials)?;
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut template = self
                .request(RequestTemplate::get(self.url("/v2/payments")), &query.credentials)
                .query("begin_time", rfc3339(query.start))
                .query("end_time", rfc3339(query.end))
                .query("sort_order", "ASC")
                .query("limit", PAGE_LIMIT);
            if let Some(location_id) = &query.location_id {
                template = template.query("location_id", location_id.clone());
            }
            if let Some(cursor) = &cursor {
                template = template.query("cursor", cursor.clone());
            }

            let page = self
                .http
                .send(query.tenant_id, "get_transactions", query.priority, template)
                .await?
                .body;

            for payment in page
                .get("payments")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if records.len() >= MAX_TRANSACTIONS_PER_CALL {
                    break;
                }
                match self.transform_raw_data(payment) {
                    Ok(record) => records.push(record),
                    Err(err) => warn!(error = %err, "Skipping untransformable Square payment"),
                }
            }

            cursor = resolve_string(&page, "cursor");
            if cursor.is_none() || records.len() >= MAX_TRANSACTIONS_PER_CALL {
                break;
            }
        }

        Ok(records)
    }

    async fn setup_webhooks(
        &self,
        params: WebhookSetupParams,
    ) -> Result<WebhookRegistration, IntegrationError> {
        require_token(&params.credentials)?;
        let template = self
            .request(
                RequestTemplate::post(self.url("/v2/webhooks/subscriptions")),
                &params.credentials,
            )
            .json(json!({
                "idempotency_key": Uuid::new_v4().to_string(),
                "subscription": {
                    "name": format!("pos-connectors-{}", params.tenant_id),
                    "event_types": SQUARE_WEBHOOK_EVENTS,
                    "notification_url": params.notification_url,
                    "api_version": SQUARE_VERSION,
                },
            }));
        let body = self
            .http
            .json(Some(params.tenant_id), "setup_webhooks", template)
            .await?;

        Ok(WebhookRegistration {
            webhook_id: resolve_string(&body, "subscription.id"),
            events: SQUARE_WEBHOOK_EVENTS.iter().map(|e| e.to_string()).collect(),
            signing_secret: resolve_string(&body, "subscription.signature_key"),
            account_id: params.credentials.merchant_id.clone(),
        })
    }

    fn validate_webhook(&self, validation: &WebhookValidation<'_>) -> bool {
        verify_square_signature(
            validation.body,
            validation.signature,
            validation.secret,
            validation.notification_url,
        )
        .is_ok()
    }

    fn signature_header(&self) -> &'static str {
        provider_metadata(ProviderType::Square).signature_header
    }

    fn event_name(&self, _headers: &HeaderMap, payload: &Value) -> Option<String> {
        resolve_string(payload, "type")
    }

    fn webhook_account_id(&self, _headers: &HeaderMap, payload: &Value) -> Option<String> {
        resolve_string(payload, "merchant_id")
    }

    fn is_transaction_event(&self, event_name: &str) -> bool {
        ["payment.", "order.", "refund."]
            .iter()
            .any(|prefix| event_name.starts_with(prefix))
    }

    fn webhook_transaction_payload<'a>(&self, payload: &'a Value) -> Option<&'a Value> {
        let object = payload.get("data")?.get("object")?;
        ["payment", "order", "refund"]
            .iter()
            .find_map(|kind| object.get(*kind))
    }
}

/// Register the Square connector
pub fn register_square_connector(registry: &mut Registry, connector: Arc<SquareConnector>) {
    registry.register(connector, provider_metadata(ProviderType::Square));
}
