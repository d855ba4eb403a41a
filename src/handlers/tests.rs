//! # Tests for Handlers
//!
//! Router-level tests against an in-memory SQLite database.

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::Database;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::AppConfig;
use crate::handlers::root;
use crate::models::{ProviderType, ServiceInfo};
use crate::repositories::IntegrationRepository;
use crate::server::{AppState, REQUEST_ID_HEADER, Services, create_app};

fn test_config() -> AppConfig {
    AppConfig {
        crypto_key: Some(vec![0u8; 32]),
        ..AppConfig::default()
    }
}

/// Square adapter pointed at a wiremock server.
fn config_for(server: &MockServer) -> AppConfig {
    let mut config = test_config();
    config.providers.square_api_base = server.uri();
    config
}

async fn test_state() -> AppState {
    test_state_with(test_config()).await
}

async fn test_state_with(config: AppConfig) -> AppState {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("Failed to connect to test database");
    Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    let Services { state, .. } =
        AppState::build(Arc::new(config), Arc::new(db), CancellationToken::new())
            .expect("state");
    state
}

async fn test_app() -> Router {
    create_app(test_state().await)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_root_handler_returns_expected_service_info() {
    let axum::Json(service_info) = root().await;
    let expected = ServiceInfo::default();
    assert_eq!(service_info.service, "pos-connectors");
    assert_eq!(service_info.version, expected.version);
}

#[tokio::test]
async fn test_build_requires_crypto_key() {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    let result = AppState::build(
        Arc::new(AppConfig::default()),
        Arc::new(db),
        CancellationToken::new(),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn test_webhook_for_unknown_provider_is_not_found() {
    let response = test_app()
        .await
        .oneshot(
            Request::post("/webhooks/toast")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
}

#[tokio::test]
async fn test_webhook_with_invalid_json_is_rejected() {
    let response = test_app()
        .await
        .oneshot(
            Request::post("/webhooks/square")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_webhook_without_event_name_is_rejected() {
    let response = test_app()
        .await
        .oneshot(
            Request::post("/webhooks/shopify")
                .body(Body::from(json!({"id": 1}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_is_accepted_before_processing() {
    let tenant_id = Uuid::new_v4();
    let response = test_app()
        .await
        .oneshot(
            Request::post(format!("/webhooks/shopify?tenant_id={}", tenant_id))
                .header("x-shopify-topic", "orders/create")
                .header("x-shopify-hmac-sha256", "bogus")
                .header(REQUEST_ID_HEADER, "corr-handler-test")
                .body(Body::from(json!({"id": 450789469}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        response.headers().get(REQUEST_ID_HEADER).unwrap(),
        "corr-handler-test"
    );
    let body = body_json(response).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["event"], "orders/create");
}

#[tokio::test]
async fn test_integration_health_defaults_to_healthy() {
    let tenant_id = Uuid::new_v4();
    let response = test_app()
        .await
        .oneshot(
            Request::get(format!("/integrations/{}/clover/health", tenant_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["provider"], "clover");
    assert_eq!(body["error_rate"], 0.0);
}

#[tokio::test]
async fn test_integration_health_for_unknown_provider_is_not_found() {
    let response = test_app()
        .await
        .oneshot(
            Request::get(format!("/integrations/{}/toast/health", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_liveness_checks_database() {
    let response = test_app()
        .await
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["database"], "ok");
}

fn connect_request(tenant_id: Uuid, body: Value) -> Request<Body> {
    Request::put(format!("/integrations/{}/square", tenant_id))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_connect_integration_stores_enriched_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/merchants/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "merchant": { "id": "MLB1", "business_name": "Corner Cafe" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let state = test_state_with(config_for(&server)).await;
    let tenant_id = Uuid::new_v4();
    let response = create_app(state.clone())
        .oneshot(connect_request(
            tenant_id,
            json!({ "access_token": "sq-access", "refresh_token": "sq-refresh" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "active");
    assert_eq!(body["merchant_id"], "MLB1");

    let repo = IntegrationRepository::new(state.db.clone(), state.crypto_key.clone());
    let model = repo
        .find(tenant_id, ProviderType::Square)
        .await
        .unwrap()
        .expect("integration stored");
    let credentials = repo.credentials(&model).unwrap();
    assert_eq!(credentials.access_token, "sq-access");
    assert_eq!(credentials.refresh_token.as_deref(), Some("sq-refresh"));
    assert_eq!(credentials.merchant_id.as_deref(), Some("MLB1"));
}

#[tokio::test]
async fn test_connect_integration_surfaces_provider_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/merchants/me"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let state = test_state_with(config_for(&server)).await;
    let tenant_id = Uuid::new_v4();
    let response = create_app(state.clone())
        .oneshot(connect_request(tenant_id, json!({ "access_token": "revoked" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "AUTH_ERROR");

    let repo = IntegrationRepository::new(state.db.clone(), state.crypto_key.clone());
    assert!(repo.find(tenant_id, ProviderType::Square).await.unwrap().is_none());
}

#[tokio::test]
async fn test_webhook_setup_requires_a_base_url() {
    let response = test_app()
        .await
        .oneshot(
            Request::post(format!("/integrations/{}/shopify/webhooks", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
