//! Error handler and recovery engine behaviour against an in-memory database and a
//! wiremock provider.

mod test_utils;

use std::time::Duration;

use pos_connectors::error::{ErrorCode, IntegrationError};
use pos_connectors::events::IntegrationSignal;
use pos_connectors::models::integration::{STATUS_ACTIVE, STATUS_DISABLED};
use pos_connectors::models::{
    AuthCredentials, HealthStatus, ProviderType, RecoveryActionType,
};
use pos_connectors::rate_limit::RequestOutcome;
use pos_connectors::recovery::{ErrorContext, RecoverySettings, RecoveryStrategy};
use pos_connectors::repositories::{IntegrationErrorRepository, IntegrationRepository};
use pos_connectors::webhooks::WebhookSettings;
use serde_json::json;
use test_utils::{TestServices, mock_registry, test_crypto_key, test_rate_limiter};
use tokio::sync::broadcast;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn services(server: &MockServer, pattern_threshold: u32) -> TestServices {
    let registry = mock_registry(&server.uri(), &test_rate_limiter());
    TestServices::with_settings(
        registry,
        WebhookSettings::default(),
        RecoverySettings {
            pattern_threshold,
            ..RecoverySettings::default()
        },
    )
    .await
    .expect("test services")
}

fn integrations(services: &TestServices) -> IntegrationRepository {
    IntegrationRepository::new(services.db.clone(), test_crypto_key())
}

async fn store_square_integration(services: &TestServices, tenant_id: Uuid) {
    let credentials = AuthCredentials::bearer("sq-access")
        .with_refresh_token("sq-refresh")
        .with_merchant_id("MERCHANT1");
    integrations(services)
        .upsert_credentials(tenant_id, ProviderType::Square, &credentials)
        .await
        .expect("store integration");
}

fn drain(rx: &mut broadcast::Receiver<IntegrationSignal>) -> Vec<IntegrationSignal> {
    let mut signals = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        signals.push(signal);
    }
    signals
}

fn square_error(code: ErrorCode) -> IntegrationError {
    IntegrationError::new(code, ProviderType::Square, format!("square said {}", code))
}

/// Retry actions are first due one second after scheduling.
async fn wait_for_retry_rung() {
    tokio::time::sleep(Duration::from_millis(1100)).await;
}

#[tokio::test]
async fn auth_errors_schedule_a_token_refresh() {
    let server = MockServer::start().await;
    let services = services(&server, 10).await;
    let tenant_id = Uuid::new_v4();
    let mut rx = services.signals.subscribe();

    services
        .errors
        .handle_error(
            square_error(ErrorCode::AuthError),
            ErrorContext::for_tenant(tenant_id).operation("get_transactions"),
        )
        .await;

    let pending = services.errors.pending_actions().await;
    assert_eq!(pending.len(), 1);
    let action = &pending[0];
    assert_eq!(action.action_type, RecoveryActionType::RefreshToken);
    assert_eq!(action.tenant_id, tenant_id);
    assert_eq!(action.attempts, 0);
    assert_eq!(action.max_attempts, 3);
    assert_eq!(action.last_error.as_deref(), Some("square said AUTH_ERROR"));
    assert!(action.scheduled_at > chrono::Utc::now() + chrono::Duration::seconds(50));

    let signals = drain(&mut rx);
    assert!(signals.iter().any(|signal| matches!(
        signal,
        IntegrationSignal::RecoveryScheduled {
            action: RecoveryActionType::RefreshToken,
            ..
        }
    )));

    let audit = IntegrationErrorRepository::new(services.db.clone())
        .recent(
            tenant_id,
            ProviderType::Square,
            chrono::Utc::now() - chrono::Duration::minutes(1),
        )
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].code, "AUTH_ERROR");
    assert_eq!(audit[0].operation.as_deref(), Some("get_transactions"));
}

#[tokio::test]
async fn repeated_errors_fold_into_one_action() {
    let server = MockServer::start().await;
    let services = services(&server, 10).await;
    let tenant_id = Uuid::new_v4();

    for _ in 0..3 {
        services
            .errors
            .handle_error(
                square_error(ErrorCode::ConnectionError),
                ErrorContext::for_tenant(tenant_id),
            )
            .await;
    }

    let pending = services.errors.pending_actions().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action_type, RecoveryActionType::Retry);
    assert_eq!(pending[0].attempts, 2);
    assert_eq!(pending[0].max_attempts, 5);
}

#[tokio::test]
async fn errors_without_a_strategy_only_affect_health() {
    let server = MockServer::start().await;
    let services = services(&server, 10).await;
    let tenant_id = Uuid::new_v4();

    services
        .errors
        .handle_error(
            square_error(ErrorCode::ValidationError),
            ErrorContext::for_tenant(tenant_id),
        )
        .await;

    assert!(services.errors.pending_actions().await.is_empty());
    let health = services.errors.health(tenant_id, ProviderType::Square).await;
    assert_eq!(health.error_count, 1);
    assert_eq!(health.last_error_code, Some(ErrorCode::ValidationError));
}

#[tokio::test]
async fn health_moves_through_the_error_rate_thresholds() {
    let server = MockServer::start().await;
    let services = services(&server, 10).await;
    let tenant_id = Uuid::new_v4();
    let mut rx = services.signals.subscribe();

    let idle = services.errors.health(tenant_id, ProviderType::Square).await;
    assert_eq!(idle.status, HealthStatus::Healthy);
    assert_eq!(idle.error_rate, 0.0);

    services
        .errors
        .handle_error(
            square_error(ErrorCode::NotFound),
            ErrorContext::for_tenant(tenant_id),
        )
        .await;
    assert_eq!(
        services.errors.health(tenant_id, ProviderType::Square).await.status,
        HealthStatus::Unhealthy
    );

    for _ in 0..3 {
        services
            .errors
            .record_success(tenant_id, ProviderType::Square)
            .await;
    }
    let health = services.errors.health(tenant_id, ProviderType::Square).await;
    assert_eq!(health.success_count, 3);
    assert_eq!(health.error_count, 1);
    assert_eq!(health.status, HealthStatus::Degraded);

    let transitions: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|signal| match signal {
            IntegrationSignal::HealthChanged {
                previous, current, ..
            } => Some((previous, current)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (HealthStatus::Healthy, HealthStatus::Unhealthy),
            (HealthStatus::Unhealthy, HealthStatus::Degraded),
        ]
    );

    // Other tenants are unaffected.
    assert_eq!(
        services
            .errors
            .health(Uuid::new_v4(), ProviderType::Square)
            .await
            .status,
        HealthStatus::Healthy
    );
}

#[tokio::test]
async fn patterns_are_reported_once_at_the_threshold() {
    let server = MockServer::start().await;
    let services = services(&server, 3).await;
    let mut rx = services.signals.subscribe();

    for _ in 0..4 {
        services
            .errors
            .handle_error(square_error(ErrorCode::ServerError), ErrorContext::default())
            .await;
    }

    let patterns: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|signal| match signal {
            IntegrationSignal::PatternDetected {
                provider,
                code,
                occurrences,
                suggested_resolution,
                ..
            } => Some((provider, code, occurrences, suggested_resolution)),
            _ => None,
        })
        .collect();
    assert_eq!(patterns.len(), 1);
    let (provider, code, occurrences, resolution) = &patterns[0];
    assert_eq!(*provider, ProviderType::Square);
    assert_eq!(*code, ErrorCode::ServerError);
    assert_eq!(*occurrences, 3);
    assert!(!resolution.is_empty());
}

#[tokio::test]
async fn tenantless_errors_are_audited_but_not_recovered() {
    let server = MockServer::start().await;
    let services = services(&server, 10).await;
    let mut rx = services.signals.subscribe();

    services
        .errors
        .handle_error(
            square_error(ErrorCode::AuthError),
            ErrorContext::default().operation("webhook_setup"),
        )
        .await;

    assert!(services.errors.pending_actions().await.is_empty());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn due_retry_probes_the_provider_and_completes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/locations"))
        .and(header("authorization", "Bearer sq-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "locations": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let services = services(&server, 10).await;
    let tenant_id = Uuid::new_v4();
    store_square_integration(&services, tenant_id).await;

    services
        .errors
        .handle_error(
            square_error(ErrorCode::RateLimited),
            ErrorContext::for_tenant(tenant_id),
        )
        .await;
    let mut rx = services.signals.subscribe();

    assert_eq!(services.errors.process_due_actions().await, 0);
    wait_for_retry_rung().await;
    assert_eq!(services.errors.process_due_actions().await, 1);

    assert!(services.errors.pending_actions().await.is_empty());
    let signals = drain(&mut rx);
    assert!(signals.iter().any(|signal| matches!(
        signal,
        IntegrationSignal::RecoveryCompleted {
            action: RecoveryActionType::Retry,
            ..
        }
    )));
    assert_eq!(
        services.errors.health(tenant_id, ProviderType::Square).await.success_count,
        1
    );
}

#[tokio::test]
async fn failed_retry_is_rescheduled_on_the_next_rung() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/locations"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let services = services(&server, 10).await;
    let tenant_id = Uuid::new_v4();
    store_square_integration(&services, tenant_id).await;

    services
        .errors
        .handle_error(
            square_error(ErrorCode::ConnectionError),
            ErrorContext::for_tenant(tenant_id),
        )
        .await;
    wait_for_retry_rung().await;
    assert_eq!(services.errors.process_due_actions().await, 1);

    let pending = services.errors.pending_actions().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].scheduled_at > chrono::Utc::now() + chrono::Duration::seconds(3));
    assert!(pending[0].last_error.is_some());

    // Not due again yet.
    assert_eq!(services.errors.process_due_actions().await, 0);
}

#[tokio::test]
async fn retry_without_a_stored_integration_fails_the_attempt() {
    let server = MockServer::start().await;
    let services = services(&server, 10).await;
    let tenant_id = Uuid::new_v4();

    services
        .errors
        .handle_error(
            square_error(ErrorCode::ConnectionError),
            ErrorContext::for_tenant(tenant_id),
        )
        .await;
    wait_for_retry_rung().await;
    services.errors.process_due_actions().await;

    let pending = services.errors.pending_actions().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(
        pending[0]
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("no square integration"))
    );
}

#[tokio::test]
async fn disabling_an_integration_marks_it_disconnected() {
    let server = MockServer::start().await;
    let services = services(&server, 10).await;
    let tenant_id = Uuid::new_v4();
    store_square_integration(&services, tenant_id).await;
    let mut rx = services.signals.subscribe();

    services
        .errors
        .schedule(
            tenant_id,
            ProviderType::Square,
            RecoveryStrategy::for_action(RecoveryActionType::DisableIntegration),
            Some("refresh token revoked".to_string()),
        )
        .await;
    assert_eq!(services.errors.process_due_actions().await, 1);

    let stored = integrations(&services)
        .find(tenant_id, ProviderType::Square)
        .await
        .unwrap()
        .expect("integration row");
    assert_eq!(stored.status, STATUS_DISABLED);
    assert_eq!(
        services.errors.health(tenant_id, ProviderType::Square).await.status,
        HealthStatus::Disconnected
    );
    assert!(services.errors.pending_actions().await.is_empty());

    let signals = drain(&mut rx);
    assert!(signals.iter().any(|signal| matches!(
        signal,
        IntegrationSignal::IntegrationDisabled { reason, .. } if reason == "refresh token revoked"
    )));
    assert!(integrations(&services).list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn health_checks_probe_active_integrations() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/locations"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "errors": [{ "category": "AUTHENTICATION_ERROR", "code": "UNAUTHORIZED" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let services = services(&server, 10).await;
    let tenant_id = Uuid::new_v4();
    store_square_integration(&services, tenant_id).await;

    assert_eq!(services.errors.run_health_checks().await, 1);

    let pending = services.errors.pending_actions().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action_type, RecoveryActionType::RefreshToken);
    let health = services.errors.health(tenant_id, ProviderType::Square).await;
    assert_eq!(health.last_error_code, Some(ErrorCode::AuthError));
    assert_eq!(health.status, HealthStatus::Unhealthy);

    let stored = integrations(&services)
        .find(tenant_id, ProviderType::Square)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, STATUS_ACTIVE);
}

#[tokio::test]
async fn refresh_exchange_stores_rotated_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_partial_json(json!({
            "grant_type": "refresh_token",
            "refresh_token": "sq-refresh",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "sq-access-2",
            "refresh_token": "sq-refresh-2",
            "merchant_id": "MERCHANT1",
            "expires_at": "2030-01-01T00:00:00Z",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/locations"))
        .and(header("authorization", "Bearer sq-access-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "locations": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let services = services(&server, 10).await;
    let tenant_id = Uuid::new_v4();
    store_square_integration(&services, tenant_id).await;

    let connector = mock_registry(&server.uri(), &test_rate_limiter())
        .get(ProviderType::Square)
        .unwrap();
    let model = integrations(&services)
        .find(tenant_id, ProviderType::Square)
        .await
        .unwrap()
        .unwrap();
    let credentials = integrations(&services).credentials(&model).unwrap();
    let refreshed = connector
        .refresh_credentials(Some(tenant_id), credentials)
        .await
        .expect("refresh succeeds");
    integrations(&services)
        .upsert_credentials(tenant_id, ProviderType::Square, &refreshed)
        .await
        .unwrap();

    // The health probe now uses the rotated access token.
    assert_eq!(services.errors.run_health_checks().await, 1);
    assert!(services.errors.pending_actions().await.is_empty());
}

#[tokio::test]
async fn request_outcomes_feed_health_and_recovery() {
    let server = MockServer::start().await;
    let services = services(&server, 10).await;
    let tenant_id = Uuid::new_v4();

    services
        .errors
        .apply_outcome(RequestOutcome::Succeeded {
            provider: ProviderType::Shopify,
            tenant_id: Some(tenant_id),
            operation: "get_locations".to_string(),
        })
        .await;
    services
        .errors
        .apply_outcome(RequestOutcome::Failed {
            tenant_id: Some(tenant_id),
            operation: "get_transactions".to_string(),
            error: IntegrationError::new(
                ErrorCode::ServerError,
                ProviderType::Shopify,
                "bad gateway",
            ),
        })
        .await;

    let health = services.errors.health(tenant_id, ProviderType::Shopify).await;
    assert_eq!(health.success_count, 1);
    assert_eq!(health.error_count, 1);
    assert_eq!(health.status, HealthStatus::Unhealthy);

    let pending = services.errors.pending_actions().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action_type, RecoveryActionType::ResetConnection);
    assert_eq!(pending[0].max_attempts, 2);
}
