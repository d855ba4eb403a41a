//! # Health Handlers
//!
//! Service liveness and per-integration health snapshots.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db;
use crate::error::ApiError;
use crate::models::{HealthMetrics, ProviderType, UnknownProvider};
use crate::server::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LivenessResponse {
    pub status: String,
    pub database: String,
}

/// Liveness probe including a database round trip
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service and database reachable", body = LivenessResponse),
        (status = 503, description = "Database unavailable", body = ApiError)
    ),
    tag = "health"
)]
pub async fn liveness(State(state): State<AppState>) -> Result<Json<LivenessResponse>, ApiError> {
    db::health_check(&state.db).await.map_err(|err| {
        tracing::error!(error = ?err, "Database health check failed");
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "Database service unavailable",
        )
    })?;

    Ok(Json(LivenessResponse {
        status: "ok".to_string(),
        database: "ok".to_string(),
    }))
}

/// Rolling one-hour health snapshot for a tenant's integration
#[utoipa::path(
    get,
    path = "/integrations/{tenant_id}/{provider}/health",
    params(
        ("tenant_id" = String, Path, description = "Tenant UUID"),
        ("provider" = String, Path, description = "Provider slug", example = "square")
    ),
    responses(
        (status = 200, description = "Health snapshot", body = HealthMetrics),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "health"
)]
pub async fn integration_health(
    State(state): State<AppState>,
    Path((tenant_id, provider)): Path<(Uuid, String)>,
) -> Result<Json<HealthMetrics>, ApiError> {
    let provider: ProviderType = provider
        .parse()
        .map_err(|e: UnknownProvider| ApiError::not_found(e.to_string()))?;

    Ok(Json(state.errors.health(tenant_id, provider).await))
}
