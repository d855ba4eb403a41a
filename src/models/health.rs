//! Rolling health snapshot for one tenant's integration with one provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::provider_type::ProviderType;
use crate::error::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
    Disconnected,
}

impl HealthStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Disconnected => "disconnected",
        }
    }

    /// Numeric form for the `integration_health_status` gauge.
    pub const fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
            HealthStatus::Disconnected => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HealthMetrics {
    pub tenant_id: Uuid,
    pub provider: ProviderType,
    pub success_count: u64,
    pub error_count: u64,
    /// Errors over total requests in the rolling window, 0.0 when idle
    pub error_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<ErrorCode>,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
}

impl HealthMetrics {
    pub fn empty(tenant_id: Uuid, provider: ProviderType) -> Self {
        Self {
            tenant_id,
            provider,
            success_count: 0,
            error_count: 0,
            error_rate: 0.0,
            last_error: None,
            last_error_code: None,
            status: HealthStatus::Healthy,
            last_check: Utc::now(),
        }
    }
}
