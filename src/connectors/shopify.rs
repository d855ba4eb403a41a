//! Shopify connector implementation
//!
//! Admin REST API against `https://{shop}/admin/api/{version}` with `Link` header
//! pagination. Shopify offline tokens do not expire, so refreshing only re-validates
//! the token. Webhooks are signed with the app's API secret.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connectors::http::{ProviderHttpClient, RequestTemplate, next_link};
use crate::connectors::trait_::{
    Connector, MAX_TRANSACTIONS_PER_CALL, TransactionQuery, WebhookRegistration,
    WebhookSetupParams, WebhookValidation, header_str,
};
use crate::connectors::{Registry, provider_metadata};
use crate::error::{ErrorCode, IntegrationError};
use crate::models::{AuthCredentials, LocationInfo, ProviderType, StandardizedTaxData};
use crate::normalization::path::resolve_string;
use crate::webhook_verification::verify_shopify_signature;

const PAGE_LIMIT: &str = "250";
const TOPIC_HEADER: &str = "x-shopify-topic";
const SHOP_HEADER: &str = "x-shopify-shop-domain";

pub const SHOPIFY_WEBHOOK_TOPICS: [&str; 3] = ["orders/create", "orders/updated", "refunds/create"];

pub struct ShopifyConnector {
    http: ProviderHttpClient,
    api_version: String,
    /// Replaces `https://{shop}` when set
    api_base: Option<String>,
    api_secret: Option<String>,
}

impl ShopifyConnector {
    pub fn new(
        http: ProviderHttpClient,
        api_version: String,
        api_base: Option<String>,
        api_secret: Option<String>,
    ) -> Self {
        Self {
            http,
            api_version,
            api_base: api_base.map(|base| base.trim_end_matches('/').to_string()),
            api_secret,
        }
    }

    fn admin_url(&self, credentials: &AuthCredentials, path: &str) -> Result<String, IntegrationError> {
        let root = match &self.api_base {
            Some(base) => base.clone(),
            None => {
                let shop = credentials
                    .shop_domain
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        IntegrationError::new(
                            ErrorCode::ValidationError,
                            ProviderType::Shopify,
                            "Shopify credentials carry no shop domain",
                        )
                    })?;
                format!("https://{}", shop.trim_end_matches('/'))
            }
        };
        Ok(format!("{}/admin/api/{}{}", root, self.api_version, path))
    }

    fn request(&self, template: RequestTemplate, credentials: &AuthCredentials) -> RequestTemplate {
        template.header("X-Shopify-Access-Token", credentials.access_token.clone())
    }

    async fn fetch_shop(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &AuthCredentials,
        operation: &str,
    ) -> Result<Value, IntegrationError> {
        require_token(credentials)?;
        let url = self.admin_url(credentials, "/shop.json")?;
        let template = self.request(RequestTemplate::get(url), credentials);
        self.http.json(tenant_id, operation, template).await
    }
}

fn require_token(credentials: &AuthCredentials) -> Result<(), IntegrationError> {
    if credentials.access_token.trim().is_empty() {
        return Err(IntegrationError::new(
            ErrorCode::AuthError,
            ProviderType::Shopify,
            "missing Shopify access token",
        ));
    }
    Ok(())
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl Connector for ShopifyConnector {
    fn provider(&self) -> ProviderType {
        ProviderType::Shopify
    }

    async fn test_connection(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &AuthCredentials,
    ) -> Result<(), IntegrationError> {
        self.fetch_shop(tenant_id, credentials, "test_connection").await?;
        Ok(())
    }

    async fn authenticate(
        &self,
        tenant_id: Option<Uuid>,
        credentials: AuthCredentials,
    ) -> Result<AuthCredentials, IntegrationError> {
        let body = self.fetch_shop(tenant_id, &credentials, "authenticate").await?;

        let mut enriched = credentials;
        if let Some(domain) = resolve_string(&body, "shop.myshopify_domain") {
            enriched.shop_domain = Some(domain);
        }
        if let Some(id) = resolve_string(&body, "shop.id") {
            enriched.extra.insert("shop_id".into(), Value::String(id));
        }
        if let Some(timezone) = resolve_string(&body, "shop.iana_timezone") {
            enriched.extra.insert("timezone".into(), Value::String(timezone));
        }
        Ok(enriched)
    }

    async fn refresh_credentials(
        &self,
        tenant_id: Option<Uuid>,
        credentials: AuthCredentials,
    ) -> Result<AuthCredentials, IntegrationError> {
        debug!(tenant_id = ?tenant_id, "Shopify tokens do not expire, re-validating instead");
        self.fetch_shop(tenant_id, &credentials, "refresh_credentials")
            .await?;
        Ok(credentials)
    }

    async fn get_locations(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &AuthCredentials,
    ) -> Result<Vec<LocationInfo>, IntegrationError> {
        require_token(credentials)?;
        let url = self.admin_url(credentials, "/locations.json")?;
        let template = self.request(RequestTemplate::get(url), credentials);
        let body = self.http.json(tenant_id, "get_locations", template).await?;

        Ok(body
            .get("locations")
            .and_then(Value::as_array)
            .map(|locations| {
                locations
                    .iter()
                    .map(|location| LocationInfo {
                        id: resolve_string(location, "id"),
                        name: resolve_string(location, "name"),
                        address: resolve_string(location, "address1"),
                        timezone: credentials
                            .extra
                            .get("timezone")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_transactions(
        &self,
        query: TransactionQuery,
    ) -> Result<Vec<StandardizedTaxData>, IntegrationError> {
        require_token(&query.credentials)?;
        let mut records = Vec::new();

        let first = self
            .request(
                RequestTemplate::get(self.admin_url(&query.credentials, "/orders.json")?),
                &query.credentials,
            )
            .query("status", "any")
            .query("created_at_min", rfc3339(query.start))
            .query("created_at_max", rfc3339(query.end))
            .query("limit", PAGE_LIMIT);
        let mut next = Some(first);

        while let Some(template) = next.take() {
            let page = self
                .http
                .send(query.tenant_id, "get_transactions", query.priority, template)
                .await?;

            for order in page
                .body
                .get("orders")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if records.len() >= MAX_TRANSACTIONS_PER_CALL {
                    break;
                }
                if let Some(location_id) = &query.location_id
                    && resolve_string(order, "location_id").as_ref() != Some(location_id)
                {
                    continue;
                }
                match self.transform_raw_data(order) {
                    Ok(record) => records.push(record),
                    Err(err) => warn!(error = %err, "Skipping untransformable Shopify order"),
                }
            }

            if records.len() >= MAX_TRANSACTIONS_PER_CALL {
                break;
            }
            // Page URLs already carry every query parameter.
            next = page
                .link
                .as_deref()
                .and_then(next_link)
                .map(|url| self.request(RequestTemplate::get(url), &query.credentials));
        }

        Ok(records)
    }

    async fn setup_webhooks(
        &self,
        params: WebhookSetupParams,
    ) -> Result<WebhookRegistration, IntegrationError> {
        require_token(&params.credentials)?;
        let url = self.admin_url(&params.credentials, "/webhooks.json")?;
        let mut webhook_id = None;

        for topic in SHOPIFY_WEBHOOK_TOPICS {
            let template = self
                .request(RequestTemplate::post(url.clone()), &params.credentials)
                .json(json!({
                    "webhook": {
                        "topic": topic,
                        "address": params.notification_url,
                        "format": "json",
                    }
                }));
            let body = self
                .http
                .json(Some(params.tenant_id), "setup_webhooks", template)
                .await?;
            if webhook_id.is_none() {
                webhook_id = resolve_string(&body, "webhook.id");
            }
        }

        Ok(WebhookRegistration {
            webhook_id,
            events: SHOPIFY_WEBHOOK_TOPICS.iter().map(|t| t.to_string()).collect(),
            signing_secret: self.api_secret.clone(),
            account_id: params.credentials.shop_domain.clone(),
        })
    }

    fn validate_webhook(&self, validation: &WebhookValidation<'_>) -> bool {
        verify_shopify_signature(validation.body, validation.signature, validation.secret).is_ok()
    }

    fn signature_header(&self) -> &'static str {
        provider_metadata(ProviderType::Shopify).signature_header
    }

    fn event_name(&self, headers: &HeaderMap, _payload: &Value) -> Option<String> {
        header_str(headers, TOPIC_HEADER)
    }

    fn webhook_account_id(&self, headers: &HeaderMap, _payload: &Value) -> Option<String> {
        header_str(headers, SHOP_HEADER)
    }

    fn is_transaction_event(&self, event_name: &str) -> bool {
        event_name.starts_with("orders/") || event_name.starts_with("refunds/")
    }

    fn webhook_transaction_payload<'a>(&self, payload: &'a Value) -> Option<&'a Value> {
        payload.is_object().then_some(payload)
    }
}

/// Register the Shopify connector
pub fn register_shopify_connector(registry: &mut Registry, connector: Arc<ShopifyConnector>) {
    registry.register(connector, provider_metadata(ProviderType::Shopify));
}
