//! # Error Handling
//!
//! Two layers of errors live here. [`IntegrationError`] is the classified failure every
//! component of the integration layer speaks, tagged with a closed [`ErrorCode`] and a
//! retryable flag that drives retry and recovery decisions. [`ApiError`] is the
//! problem+json response rendered at the HTTP edge, with trace id propagation.

use std::fmt;
use std::time::Duration;

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use utoipa::ToSchema;

use crate::connectors::ConnectorError;
use crate::models::ProviderType;
use crate::telemetry;

/// Closed set of classified failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimited,
    AuthError,
    Forbidden,
    NotFound,
    ValidationError,
    ServerError,
    ConnectionError,
    TransformationFailed,
    /// Raised only by the webhook pipeline when a delivery fails verification
    WebhookInvalidSignature,
    UnknownError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::ConnectionError => "CONNECTION_ERROR",
            ErrorCode::TransformationFailed => "TRANSFORMATION_FAILED",
            ErrorCode::WebhookInvalidSignature => "WEBHOOK_INVALID_SIGNATURE",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Retryability assigned at classification time.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::ServerError | ErrorCode::ConnectionError
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(Value::String(value.to_string())).ok()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure normalized into `{code, provider, status_code?, retryable, details}`.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[error("{code} from {provider}: {message}")]
pub struct IntegrationError {
    pub code: ErrorCode,
    pub provider: ProviderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub retryable: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Provider supplied `Retry-After`, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl IntegrationError {
    pub fn new<S: Into<String>>(code: ErrorCode, provider: ProviderType, message: S) -> Self {
        Self {
            code,
            provider,
            status_code: None,
            retryable: code.is_retryable(),
            message: message.into(),
            details: None,
            retry_after_ms: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }

    /// Missing transaction id or timestamp; carries the payload for diagnosis.
    pub fn transformation_failed<S: Into<String>>(
        provider: ProviderType,
        message: S,
        payload: &Value,
    ) -> Self {
        Self::new(ErrorCode::TransformationFailed, provider, message)
            .with_details(json!({ "original_payload": payload }))
    }

    pub fn invalid_signature(provider: ProviderType) -> Self {
        Self::new(
            ErrorCode::WebhookInvalidSignature,
            provider,
            "webhook signature verification failed",
        )
    }

    /// Classify an HTTP status returned by a provider.
    pub fn from_status(
        provider: ProviderType,
        status: u16,
        body: Option<&str>,
        retry_after: Option<Duration>,
    ) -> Self {
        let code = match status {
            429 => ErrorCode::RateLimited,
            401 => ErrorCode::AuthError,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            400 | 422 => ErrorCode::ValidationError,
            500..=599 => ErrorCode::ServerError,
            _ => ErrorCode::UnknownError,
        };

        let mut error = Self::new(
            code,
            provider,
            format!("{} returned HTTP {}", provider, status),
        )
        .with_status(status);

        if let Some(body) = body.filter(|b| !b.is_empty()) {
            error = error.with_details(json!({ "body": truncate(body, 500) }));
        }
        if let Some(retry_after) = retry_after {
            error = error.with_retry_after(retry_after);
        }
        error
    }

    /// Classify a raw adapter failure.
    pub fn classify(provider: ProviderType, error: &ConnectorError) -> Self {
        match error {
            ConnectorError::HttpError {
                status,
                body,
                retry_after,
            } => Self::from_status(
                provider,
                *status,
                body.as_deref(),
                retry_after.map(Duration::from_secs),
            ),
            ConnectorError::NetworkError { details, timeout } => {
                Self::new(ErrorCode::ConnectionError, provider, details.clone())
                    .with_details(json!({ "timeout": timeout }))
            }
            ConnectorError::AuthenticationError { details } => {
                Self::new(ErrorCode::AuthError, provider, details.clone())
            }
            ConnectorError::ConfigurationError { details } => {
                Self::new(ErrorCode::ValidationError, provider, details.clone())
            }
            ConnectorError::MalformedResponse { details } => Self::new(
                ErrorCode::UnknownError,
                provider,
                format!("malformed response: {}", details),
            ),
            ConnectorError::Classified(inner) => inner.clone(),
            ConnectorError::Unknown { details } => {
                Self::new(classify_message(details), provider, details.clone())
            }
        }
    }
}

/// Substring classification for failures that only carry a message.
fn classify_message(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection refused")
        || lower.contains("econnrefused")
        || lower.contains("connection reset")
    {
        ErrorCode::ConnectionError
    } else if lower.contains("rate limit") || lower.contains("too many requests") {
        ErrorCode::RateLimited
    } else if lower.contains("unauthorized") || lower.contains("invalid_grant") {
        ErrorCode::AuthError
    } else {
        ErrorCode::UnknownError
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    if body.chars().count() > max_chars {
        let truncated: String = body.chars().take(max_chars).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<IntegrationError> for ApiError {
    fn from(error: IntegrationError) -> Self {
        let status = match error.code {
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::AuthError | ErrorCode::WebhookInvalidSignature => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ValidationError | ErrorCode::TransformationFailed => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorCode::ConnectionError => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ServerError | ErrorCode::UnknownError => StatusCode::BAD_GATEWAY,
        };

        let mut api_error = Self::new(status, error.code.as_str(), error.message.clone())
            .with_details(json!({
                "provider": error.provider,
                "status_code": error.status_code,
                "retryable": error.retryable,
            }));
        if let Some(retry_after) = error.retry_after() {
            api_error = api_error.with_retry_after(retry_after.as_secs().max(1));
        }
        api_error
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::bad_request(message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        match error {
            sea_orm::DbErr::RecordNotFound(record) => {
                Self::not_found(format!("Record not found: {}", record))
            }
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}
