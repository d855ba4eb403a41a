//! Connector trait definition
//!
//! Defines the capability contract every POS adapter implements, the raw error type
//! adapters surface before classification, and the parameter/result types passed
//! across the contract.

use std::fmt;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::IntegrationError;
use crate::models::{AuthCredentials, LocationInfo, ProviderType, StandardizedTaxData};
use crate::normalization;
use crate::rate_limit::RequestPriority;

/// Upper bound on records returned by one `get_transactions` call.
pub const MAX_TRANSACTIONS_PER_CALL: usize = 10_000;

/// Raw adapter failure, classified into an [`IntegrationError`] by the rate limit manager.
#[derive(Debug, Clone)]
pub enum ConnectorError {
    /// HTTP error from upstream provider
    HttpError {
        status: u16,
        body: Option<String>,
        /// `Retry-After` in seconds
        retry_after: Option<u64>,
    },
    /// Malformed response from provider
    MalformedResponse { details: String },
    /// Network or connectivity error
    NetworkError { details: String, timeout: bool },
    /// Credentials rejected or missing
    AuthenticationError { details: String },
    /// Configuration or setup error
    ConfigurationError { details: String },
    /// Already classified upstream
    Classified(IntegrationError),
    /// Unknown error
    Unknown { details: String },
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorError::HttpError { status, body, .. } => {
                write!(
                    f,
                    "HTTP error {}: {}",
                    status,
                    body.as_deref().unwrap_or("No body")
                )
            }
            ConnectorError::MalformedResponse { details } => {
                write!(f, "Malformed response: {}", details)
            }
            ConnectorError::NetworkError { details, .. } => {
                write!(f, "Network error: {}", details)
            }
            ConnectorError::AuthenticationError { details } => {
                write!(f, "Authentication error: {}", details)
            }
            ConnectorError::ConfigurationError { details } => {
                write!(f, "Configuration error: {}", details)
            }
            ConnectorError::Classified(error) => write!(f, "{}", error),
            ConnectorError::Unknown { details } => {
                write!(f, "Unknown error: {}", details)
            }
        }
    }
}

impl std::error::Error for ConnectorError {}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ConnectorError::NetworkError {
                details: err.to_string(),
                timeout: true,
            }
        } else if err.is_connect() || err.is_request() {
            ConnectorError::NetworkError {
                details: err.to_string(),
                timeout: false,
            }
        } else if err.is_decode() || err.is_body() {
            ConnectorError::MalformedResponse {
                details: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            ConnectorError::HttpError {
                status: status.as_u16(),
                body: None,
                retry_after: None,
            }
        } else {
            ConnectorError::Unknown {
                details: err.to_string(),
            }
        }
    }
}

impl From<IntegrationError> for ConnectorError {
    fn from(err: IntegrationError) -> Self {
        ConnectorError::Classified(err)
    }
}

/// Bounded-range transaction listing request.
#[derive(Debug, Clone)]
pub struct TransactionQuery {
    pub tenant_id: Option<Uuid>,
    pub credentials: AuthCredentials,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub location_id: Option<String>,
    pub priority: RequestPriority,
}

impl TransactionQuery {
    pub fn new(credentials: AuthCredentials, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            tenant_id: None,
            credentials,
            start,
            end,
            location_id: None,
            priority: RequestPriority::Normal,
        }
    }

    pub fn tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn location<S: Into<String>>(mut self, location_id: S) -> Self {
        self.location_id = Some(location_id.into());
        self
    }
}

/// Parameters for provider-side webhook registration
#[derive(Debug, Clone)]
pub struct WebhookSetupParams {
    pub tenant_id: Uuid,
    pub notification_url: String,
    pub credentials: AuthCredentials,
}

/// What the provider registered for us
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookRegistration {
    pub webhook_id: Option<String>,
    pub events: Vec<String>,
    /// Set when the provider issues (or fixes) the signing key itself
    pub signing_secret: Option<String>,
    /// Merchant id or shop domain found on inbound deliveries
    pub account_id: Option<String>,
}

/// Inputs to webhook signature verification
#[derive(Debug, Clone, Copy)]
pub struct WebhookValidation<'a> {
    pub body: &'a [u8],
    pub signature: &'a str,
    pub secret: &'a str,
    /// Square signs the registered URL together with the body
    pub notification_url: &'a str,
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn provider(&self) -> ProviderType;

    /// Cheap authenticated call proving the credentials still work.
    async fn test_connection(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &AuthCredentials,
    ) -> Result<(), IntegrationError>;

    /// Validate credentials and return a copy enriched with account identifiers.
    async fn authenticate(
        &self,
        tenant_id: Option<Uuid>,
        credentials: AuthCredentials,
    ) -> Result<AuthCredentials, IntegrationError>;

    /// Exchange the refresh token for fresh credentials.
    async fn refresh_credentials(
        &self,
        tenant_id: Option<Uuid>,
        credentials: AuthCredentials,
    ) -> Result<AuthCredentials, IntegrationError>;

    async fn get_locations(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &AuthCredentials,
    ) -> Result<Vec<LocationInfo>, IntegrationError>;

    /// Transactions in `[start, end)`, paginated internally and capped at
    /// [`MAX_TRANSACTIONS_PER_CALL`]. Records that fail transformation are skipped.
    async fn get_transactions(
        &self,
        query: TransactionQuery,
    ) -> Result<Vec<StandardizedTaxData>, IntegrationError>;

    async fn setup_webhooks(
        &self,
        params: WebhookSetupParams,
    ) -> Result<WebhookRegistration, IntegrationError>;

    /// Constant-time signature check; any malformed input is a failed check.
    fn validate_webhook(&self, validation: &WebhookValidation<'_>) -> bool;

    fn transform_raw_data(&self, payload: &Value) -> Result<StandardizedTaxData, IntegrationError> {
        normalization::transform_payload(self.provider(), payload)
    }

    /// Header carrying the delivery signature.
    fn signature_header(&self) -> &'static str;

    /// Provider event name from headers or payload.
    fn event_name(&self, headers: &HeaderMap, payload: &Value) -> Option<String>;

    /// Provider account (merchant id, shop domain) the delivery belongs to.
    fn webhook_account_id(&self, headers: &HeaderMap, payload: &Value) -> Option<String>;

    fn is_transaction_event(&self, event_name: &str) -> bool;

    /// Transaction object inside a delivery envelope, if the delivery carries one.
    fn webhook_transaction_payload<'a>(&self, payload: &'a Value) -> Option<&'a Value>;
}

pub(crate) fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
