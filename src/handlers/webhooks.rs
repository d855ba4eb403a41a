//! # Webhook Handlers
//!
//! Public ingestion endpoint for provider webhooks. Deliveries are acknowledged as soon as
//! they are queued; verification and dispatch happen on the webhook consumer.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::connectors::trait_::header_str;
use crate::error::ApiError;
use crate::models::ProviderType;
use crate::server::AppState;
use crate::telemetry;
use crate::webhooks::InboundWebhook;

/// Path parameter for provider slug
#[derive(Debug, Deserialize, IntoParams)]
pub struct ProviderPathParam {
    /// Provider slug (`square`, `shopify`, `clover`)
    #[param(min_length = 1, example = "square")]
    pub provider: String,
}

/// Optional tenant scoping for the delivery
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct WebhookQuery {
    /// Tenant UUID; when absent the tenant is resolved from the provider account id
    #[param(value_type = Option<String>, example = "550e8400-e29b-41d4-a716-446655440000")]
    pub tenant_id: Option<Uuid>,
}

/// Webhook accept response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAcceptResponse {
    /// Acceptance status
    pub status: String,
    /// Provider event name the delivery was queued under
    pub event: String,
}

/// Queue a provider webhook for verification and dispatch
#[utoipa::path(
    post,
    path = "/webhooks/{provider}",
    params(ProviderPathParam, WebhookQuery),
    request_body(content = Object, description = "Provider webhook payload", content_type = "application/json"),
    responses(
        (status = 202, description = "Delivery queued", body = WebhookAcceptResponse),
        (status = 400, description = "Malformed payload or missing event name", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError),
        (status = 503, description = "Webhook intake is shutting down", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAcceptResponse>), ApiError> {
    let provider: ProviderType = provider
        .parse()
        .map_err(|e: crate::models::UnknownProvider| ApiError::not_found(e.to_string()))?;
    let connector = state
        .registry
        .get(provider)
        .map_err(|e| ApiError::not_found(e.to_string()))?;

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(provider = %provider, error = %e, "Rejecting webhook with invalid JSON");
        ApiError::bad_request(format!("webhook body is not valid JSON: {}", e))
    })?;

    let event_name = connector
        .event_name(&headers, &payload)
        .ok_or_else(|| ApiError::bad_request("webhook event name could not be determined"))?;
    let signature = header_str(&headers, connector.signature_header());
    let account_id = connector.webhook_account_id(&headers, &payload);

    debug!(
        provider = %provider,
        event = %event_name,
        tenant_id = ?query.tenant_id,
        has_signature = signature.is_some(),
        "Queueing webhook delivery"
    );

    state.webhooks.process_webhook(InboundWebhook {
        provider,
        event_name: event_name.clone(),
        payload,
        raw_body: body.to_vec(),
        signature,
        tenant_id: query.tenant_id,
        account_id,
        correlation_id: telemetry::current_trace_id(),
        attempts: 0,
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAcceptResponse {
            status: "accepted".to_string(),
            event: event_name,
        }),
    ))
}
