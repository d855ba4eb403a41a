//! # Integration Handlers
//!
//! Connect a tenant's POS account and register its webhooks.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, ErrorCode, IntegrationError};
use crate::models::{AuthCredentials, ProviderType, UnknownProvider};
use crate::repositories::IntegrationRepository;
use crate::server::AppState;

/// Credentials obtained by the caller's OAuth flow
#[derive(Debug, Deserialize, ToSchema)]
pub struct ConnectIntegrationRequest {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Shopify shop domain (`example.myshopify.com`)
    pub shop_domain: Option<String>,
    /// Square or Clover merchant id
    pub merchant_id: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub extra: BTreeMap<String, Value>,
}

impl From<ConnectIntegrationRequest> for AuthCredentials {
    fn from(request: ConnectIntegrationRequest) -> Self {
        AuthCredentials {
            access_token: request.access_token,
            refresh_token: request.refresh_token,
            shop_domain: request.shop_domain,
            merchant_id: request.merchant_id,
            expires_at: None,
            extra: request.extra,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IntegrationSummary {
    #[schema(value_type = String)]
    pub tenant_id: Uuid,
    pub provider: ProviderType,
    pub status: String,
    pub merchant_id: Option<String>,
    pub shop_domain: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookSubscriptionSummary {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub provider: ProviderType,
    pub webhook_url: String,
    pub events: Vec<String>,
    pub is_active: bool,
}

fn parse_provider(provider: &str) -> Result<ProviderType, ApiError> {
    provider
        .parse()
        .map_err(|e: UnknownProvider| ApiError::not_found(e.to_string()))
}

/// Validate credentials with the provider and store them encrypted
#[utoipa::path(
    put,
    path = "/integrations/{tenant_id}/{provider}",
    params(
        ("tenant_id" = String, Path, description = "Tenant UUID"),
        ("provider" = String, Path, description = "Provider slug", example = "square")
    ),
    request_body = ConnectIntegrationRequest,
    responses(
        (status = 200, description = "Integration connected", body = IntegrationSummary),
        (status = 401, description = "Provider rejected the credentials", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn connect_integration(
    State(state): State<AppState>,
    Path((tenant_id, provider)): Path<(Uuid, String)>,
    Json(request): Json<ConnectIntegrationRequest>,
) -> Result<Json<IntegrationSummary>, ApiError> {
    let provider = parse_provider(&provider)?;
    let connector = state
        .registry
        .get(provider)
        .map_err(|e| ApiError::not_found(e.to_string()))?;

    let credentials = connector
        .authenticate(Some(tenant_id), request.into())
        .await?;
    let model = integrations(&state)
        .upsert_credentials(tenant_id, provider, &credentials)
        .await?;

    info!(tenant_id = %tenant_id, provider = %provider, "Integration connected");
    Ok(Json(IntegrationSummary {
        tenant_id,
        provider,
        status: model.status,
        merchant_id: credentials.merchant_id,
        shop_domain: credentials.shop_domain,
    }))
}

/// Register provider-side webhooks for a connected integration
#[utoipa::path(
    post,
    path = "/integrations/{tenant_id}/{provider}/webhooks",
    params(
        ("tenant_id" = String, Path, description = "Tenant UUID"),
        ("provider" = String, Path, description = "Provider slug", example = "shopify")
    ),
    responses(
        (status = 201, description = "Webhooks registered", body = WebhookSubscriptionSummary),
        (status = 404, description = "Integration not connected", body = ApiError),
        (status = 422, description = "Webhook base URL is not configured", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn setup_integration_webhooks(
    State(state): State<AppState>,
    Path((tenant_id, provider)): Path<(Uuid, String)>,
) -> Result<(StatusCode, Json<WebhookSubscriptionSummary>), ApiError> {
    let provider = parse_provider(&provider)?;
    let notification_url = state
        .config
        .webhook_notification_url(provider, tenant_id)
        .ok_or_else(|| {
            IntegrationError::new(
                ErrorCode::ValidationError,
                provider,
                "POS_WEBHOOK_BASE_URL is not configured",
            )
        })?;

    let repo = integrations(&state);
    let model = repo
        .find(tenant_id, provider)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no {} integration for tenant", provider)))?;
    let credentials = repo.credentials(&model)?;

    let subscription = state
        .webhooks
        .setup_webhooks(tenant_id, provider, &notification_url, credentials)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(WebhookSubscriptionSummary {
            id: subscription.id,
            provider,
            events: subscription.event_names(),
            webhook_url: subscription.webhook_url,
            is_active: subscription.is_active,
        }),
    ))
}

fn integrations(state: &AppState) -> IntegrationRepository {
    IntegrationRepository::new(state.db.clone(), state.crypto_key.clone())
}
