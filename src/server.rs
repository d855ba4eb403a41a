//! # Server Configuration
//!
//! Wires the integration services together and exposes them over HTTP. Every service is
//! constructed here once and shares one cache, one signal bus and one shutdown token.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
};
use sea_orm::DatabaseConnection;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::cache::{LocalCache, SharedCacheRef};
use crate::config::AppConfig;
use crate::connectors::Registry;
use crate::crypto::CryptoKey;
use crate::events::SignalBus;
use crate::handlers;
use crate::rate_limit::{RateLimitManager, RequestOutcome};
use crate::recovery::{ErrorHandler, RecoverySettings};
use crate::telemetry::{TraceContext, with_trace_context};
use crate::webhooks::{WebhookManager, WebhookSettings};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub crypto_key: CryptoKey,
    pub cache: SharedCacheRef,
    pub signals: SignalBus,
    pub registry: Registry,
    pub rate_limits: RateLimitManager,
    pub errors: ErrorHandler,
    pub webhooks: WebhookManager,
}

/// Services plus the receiving end of the rate limiter's outcome channel.
pub struct Services {
    pub state: AppState,
    pub outcomes: mpsc::UnboundedReceiver<RequestOutcome>,
}

impl AppState {
    /// Build every service; the rate limiter reports outcomes on the returned channel.
    pub fn build(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        shutdown: CancellationToken,
    ) -> Result<Services> {
        let raw_key = config
            .crypto_key
            .clone()
            .context("crypto key is missing; set POS_CRYPTO_KEY")?;
        let crypto_key = CryptoKey::new(raw_key).context("crypto key must be 32 bytes")?;

        let cache = LocalCache::shared(config.cache_capacity);
        let signals = SignalBus::new();
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();

        let rate_limits = RateLimitManager::from_config(&config, cache.clone())
            .outcomes(outcome_tx)
            .shutdown_token(shutdown)
            .build();
        let registry = Registry::from_config(&config, &rate_limits)
            .context("failed to build provider HTTP clients")?;

        let errors = ErrorHandler::new(
            registry.clone(),
            db.clone(),
            crypto_key.clone(),
            cache.clone(),
            signals.clone(),
            RecoverySettings::from_config(&config),
        );
        let webhooks = WebhookManager::new(
            registry.clone(),
            db.clone(),
            crypto_key.clone(),
            cache.clone(),
            signals.clone(),
            errors.clone(),
            WebhookSettings::from_config(&config),
        );

        Ok(Services {
            state: AppState {
                config,
                db,
                crypto_key,
                cache,
                signals,
                registry,
                rate_limits,
                errors,
                webhooks,
            },
            outcomes,
        })
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::health::liveness))
        .route(
            "/webhooks/{provider}",
            post(handlers::webhooks::receive_webhook),
        )
        .route(
            "/integrations/{tenant_id}/{provider}",
            put(handlers::integrations::connect_integration),
        )
        .route(
            "/integrations/{tenant_id}/{provider}/webhooks",
            post(handlers::integrations::setup_integration_webhooks),
        )
        .route(
            "/integrations/{tenant_id}/{provider}/health",
            get(handlers::health::integration_health),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context))
        .layer(TraceLayer::new_for_http())
}

/// Scope each request with the caller's `x-request-id` or a fresh correlation id.
async fn trace_context(request: Request, next: Next) -> Response {
    let context = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(TraceContext::new)
        .unwrap_or_else(TraceContext::generate);
    let trace_id = context.trace_id.clone();

    let mut response = with_trace_context(context, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Starts the background services and the HTTP server, then drains on Ctrl-C.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> Result<()> {
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();
    let Services { state, outcomes } =
        AppState::build(config.clone(), Arc::new(db), shutdown.clone())?;

    let mut tasks = tokio::task::JoinSet::new();
    {
        let errors = state.errors.clone();
        let token = shutdown.clone();
        tasks.spawn(async move { errors.run(token).await });
    }
    {
        let errors = state.errors.clone();
        let token = shutdown.clone();
        tasks.spawn(async move { errors.consume_outcomes(outcomes, token).await });
    }
    {
        let webhooks = state.webhooks.clone();
        let token = shutdown.clone();
        tasks.spawn(async move { webhooks.run(token).await });
    }

    let rate_limits = state.rate_limits.clone();
    let app = create_app(state);

    let addr = config.bind_addr().context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, "Server listening");

    let signal_token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            signal_token.cancel();
        })
        .await;

    shutdown.cancel();
    rate_limits.shutdown().await;
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(error = ?err, "Background task failed during shutdown");
        }
    }
    info!("Server stopped");

    served.context("HTTP server failed")
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health::liveness,
        crate::handlers::health::integration_health,
        crate::handlers::webhooks::receive_webhook,
        crate::handlers::integrations::connect_integration,
        crate::handlers::integrations::setup_integration_webhooks,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::HealthMetrics,
            crate::models::HealthStatus,
            crate::models::ProviderType,
            crate::error::ErrorCode,
            crate::error::ApiError,
            crate::handlers::health::LivenessResponse,
            crate::handlers::webhooks::WebhookAcceptResponse,
            crate::handlers::integrations::ConnectIntegrationRequest,
            crate::handlers::integrations::IntegrationSummary,
            crate::handlers::integrations::WebhookSubscriptionSummary,
        )
    ),
    tags(
        (name = "root", description = "Service information"),
        (name = "webhooks", description = "Inbound provider webhooks"),
        (name = "health", description = "Service and integration health"),
        (name = "integrations", description = "Tenant POS connections"),
    ),
    info(
        title = "POS Connectors API",
        description = "Resilience layer for Square, Shopify and Clover integrations",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
