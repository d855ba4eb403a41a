//! # Error Handler & Recovery Engine
//!
//! Central sink for every classified failure. Each error is audited, folded into the
//! rolling health window for its (tenant, provider), counted towards repeating-failure
//! patterns and, when the code has a strategy, turned into a queued [`RecoveryAction`].
//!
//! Two loops drive the engine: the recovery poller executes due actions and the health
//! checker probes every active integration. Both run inside [`ErrorHandler::run`].
//! Probes run under [`as_recovery_probe`] so their own failures are not reported back
//! through the rate limiter's outcome channel.

pub mod health;
pub mod patterns;
pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use sea_orm::DatabaseConnection;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{SharedCacheRef, health_key};
use crate::config::AppConfig;
use crate::connectors::Registry;
use crate::crypto::CryptoKey;
use crate::error::{ErrorCode, IntegrationError};
use crate::events::{IntegrationSignal, SignalBus};
use crate::models::integration::STATUS_DISABLED;
use crate::models::{HealthMetrics, ProviderType, RecoveryActionStatus, RecoveryActionType};
use crate::rate_limit::{RequestOutcome, as_recovery_probe};
use crate::repositories::{
    IntegrationErrorRepository, IntegrationRepository, RecoveryActionRepository,
};

pub use health::{HEALTH_WINDOW, HealthTracker, status_for};
pub use patterns::{PatternDetector, suggested_resolution};
pub use strategy::{ActionKey, RecoveryAction, RecoveryStrategy, strategy_for};

/// Where a failure happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub tenant_id: Option<Uuid>,
    pub operation: Option<String>,
}

impl ErrorContext {
    pub fn for_tenant(tenant_id: Uuid) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            operation: None,
        }
    }

    pub fn operation<S: Into<String>>(mut self, operation: S) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub poll_interval: Duration,
    pub health_check_interval: Duration,
    /// Audit row retention; also the lifetime of a failure pattern
    pub error_retention: Duration,
    pub pattern_threshold: u32,
}

impl RecoverySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.recovery_poll_interval_seconds.max(1)),
            health_check_interval: Duration::from_secs(
                config.health_check_interval_seconds.max(1),
            ),
            error_retention: Duration::from_secs(config.error_retention_seconds),
            pattern_threshold: config.pattern_threshold,
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(300),
            error_retention: Duration::from_secs(3600),
            pattern_threshold: 10,
        }
    }
}

struct Inner {
    registry: Registry,
    integrations: IntegrationRepository,
    action_log: RecoveryActionRepository,
    error_log: IntegrationErrorRepository,
    cache: SharedCacheRef,
    signals: SignalBus,
    settings: RecoverySettings,
    health: Mutex<HashMap<(Uuid, ProviderType), HealthTracker>>,
    patterns: Mutex<PatternDetector>,
    actions: Mutex<HashMap<ActionKey, RecoveryAction>>,
}

#[derive(Clone)]
pub struct ErrorHandler {
    inner: Arc<Inner>,
}

impl ErrorHandler {
    pub fn new(
        registry: Registry,
        db: Arc<DatabaseConnection>,
        crypto_key: CryptoKey,
        cache: SharedCacheRef,
        signals: SignalBus,
        settings: RecoverySettings,
    ) -> Self {
        let patterns = PatternDetector::new(settings.pattern_threshold, settings.error_retention);
        Self {
            inner: Arc::new(Inner {
                registry,
                integrations: IntegrationRepository::new(db.clone(), crypto_key),
                action_log: RecoveryActionRepository::new(db.clone()),
                error_log: IntegrationErrorRepository::new(db),
                cache,
                signals,
                settings,
                health: Mutex::new(HashMap::new()),
                patterns: Mutex::new(patterns),
                actions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn signals(&self) -> &SignalBus {
        &self.inner.signals
    }

    /// Audit, account and, when a strategy exists, schedule recovery for `error`.
    #[instrument(skip_all, fields(provider = %error.provider, code = %error.code))]
    pub async fn handle_error(&self, error: IntegrationError, context: ErrorContext) {
        counter!(
            "integration_errors_total",
            "provider" => error.provider.as_str(),
            "code" => error.code.as_str()
        )
        .increment(1);

        if let Err(err) = self
            .inner
            .error_log
            .record(context.tenant_id, context.operation.as_deref(), &error)
            .await
        {
            warn!(error = ?err, "Failed to persist integration error audit row");
        }

        let now = Utc::now();
        if let Some(signal) = self
            .inner
            .patterns
            .lock()
            .await
            .observe(error.code, error.provider, now)
        {
            warn!(
                provider = %error.provider,
                code = %error.code,
                "Repeating failure pattern detected"
            );
            self.inner.signals.publish(signal);
        }

        let Some(tenant_id) = context.tenant_id else {
            debug!("Error has no tenant; health and recovery skipped");
            return;
        };

        self.update_health(tenant_id, error.provider, |tracker| {
            tracker.record_failure(&error, now)
        })
        .await;

        if let Some(strategy) = strategy_for(error.code) {
            self.schedule(tenant_id, error.provider, strategy, Some(error.message.clone()))
                .await;
        }
    }

    pub async fn record_success(&self, tenant_id: Uuid, provider: ProviderType) {
        let now = Utc::now();
        self.update_health(tenant_id, provider, |tracker| tracker.record_success(now))
            .await;
    }

    /// Current snapshot, falling back to the cached copy and then to an idle snapshot.
    pub async fn health(&self, tenant_id: Uuid, provider: ProviderType) -> HealthMetrics {
        if let Some(tracker) = self.inner.health.lock().await.get_mut(&(tenant_id, provider)) {
            return tracker.snapshot(tenant_id, provider, Utc::now());
        }
        self.inner
            .cache
            .get_json::<HealthMetrics>(&health_key(tenant_id, provider))
            .await
            .unwrap_or_else(|| HealthMetrics::empty(tenant_id, provider))
    }

    async fn update_health<F>(&self, tenant_id: Uuid, provider: ProviderType, update: F)
    where
        F: FnOnce(&mut HealthTracker),
    {
        let now = Utc::now();
        let (previous, current) = {
            let mut trackers = self.inner.health.lock().await;
            let tracker = trackers.entry((tenant_id, provider)).or_default();
            let previous = tracker.snapshot(tenant_id, provider, now).status;
            update(tracker);
            (previous, tracker.snapshot(tenant_id, provider, now))
        };

        gauge!(
            "integration_health_status",
            "provider" => provider.as_str(),
            "tenant_id" => tenant_id.to_string()
        )
        .set(f64::from(current.status.severity()));

        self.inner
            .cache
            .set_json(&health_key(tenant_id, provider), &current, HEALTH_WINDOW)
            .await;

        if previous != current.status {
            info!(
                tenant_id = %tenant_id,
                provider = %provider,
                previous = previous.as_str(),
                current = current.status.as_str(),
                error_rate = current.error_rate,
                "Integration health changed"
            );
            self.inner.signals.publish(IntegrationSignal::HealthChanged {
                tenant_id,
                provider,
                previous,
                current: current.status,
            });
        }
    }

    /// Queue `strategy` for (tenant, provider); a duplicate folds into the existing action.
    pub async fn schedule(
        &self,
        tenant_id: Uuid,
        provider: ProviderType,
        strategy: RecoveryStrategy,
        last_error: Option<String>,
    ) -> RecoveryAction {
        let now = Utc::now();
        let action = {
            let mut actions = self.inner.actions.lock().await;
            let key = (tenant_id, provider, strategy.action);
            match actions.get_mut(&key) {
                Some(existing) => {
                    existing.attempts += 1;
                    if last_error.is_some() {
                        existing.last_error = last_error;
                    }
                    existing.clone()
                }
                None => {
                    let action = RecoveryAction::new(tenant_id, provider, strategy, now, last_error);
                    actions.insert(key, action.clone());
                    action
                }
            }
        };

        debug!(
            tenant_id = %tenant_id,
            provider = %provider,
            action = %action.action_type,
            attempts = action.attempts,
            "Recovery action scheduled"
        );
        self.persist(&action).await;
        self.inner.signals.publish(IntegrationSignal::RecoveryScheduled {
            tenant_id,
            provider,
            action: action.action_type,
            attempts: action.attempts,
            scheduled_at: action.scheduled_at,
        });
        action
    }

    /// Outstanding actions ordered by due time.
    pub async fn pending_actions(&self) -> Vec<RecoveryAction> {
        let mut actions: Vec<_> = self.inner.actions.lock().await.values().cloned().collect();
        actions.sort_by_key(|action| action.scheduled_at);
        actions
    }

    /// Execute every action whose time has come; returns how many ran.
    #[instrument(skip_all)]
    pub async fn process_due_actions(&self) -> usize {
        let now = Utc::now();
        let due: Vec<RecoveryAction> = {
            let actions = self.inner.actions.lock().await;
            let mut due: Vec<_> = actions
                .values()
                .filter(|action| action.is_due(now))
                .cloned()
                .collect();
            due.sort_by_key(|action| action.scheduled_at);
            due
        };

        let count = due.len();
        for action in due {
            self.execute(action).await;
        }
        count
    }

    async fn execute(&self, action: RecoveryAction) {
        if action.is_exhausted() {
            self.exhaust(action).await;
            return;
        }

        let result = as_recovery_probe(self.perform(&action)).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        counter!(
            "recovery_actions_executed_total",
            "provider" => action.provider.as_str(),
            "action" => action.action_type.as_str(),
            "outcome" => outcome
        )
        .increment(1);

        match result {
            Ok(()) => {
                let removed = self.inner.actions.lock().await.remove(&action.key());
                let mut completed = removed.unwrap_or(action);
                completed.status = RecoveryActionStatus::Completed;
                info!(
                    tenant_id = %completed.tenant_id,
                    provider = %completed.provider,
                    action = %completed.action_type,
                    "Recovery action succeeded"
                );
                self.persist(&completed).await;
                if completed.action_type != RecoveryActionType::DisableIntegration {
                    self.record_success(completed.tenant_id, completed.provider).await;
                }
                self.inner.signals.publish(IntegrationSignal::RecoveryCompleted {
                    tenant_id: completed.tenant_id,
                    provider: completed.provider,
                    action: completed.action_type,
                });
            }
            Err(err) => {
                warn!(
                    tenant_id = %action.tenant_id,
                    provider = %action.provider,
                    action = %action.action_type,
                    error = %err,
                    "Recovery action failed"
                );
                let strategy = RecoveryStrategy::for_action(action.action_type);
                let updated = {
                    let mut actions = self.inner.actions.lock().await;
                    let Some(entry) = actions.get_mut(&action.key()) else {
                        return;
                    };
                    entry.attempts += 1;
                    entry.last_error = Some(err.message.clone());
                    if !entry.is_exhausted() {
                        entry.scheduled_at = Utc::now() + strategy.delay_for(entry.attempts + 1);
                    }
                    entry.clone()
                };

                if updated.is_exhausted() {
                    self.exhaust(updated).await;
                } else {
                    self.persist(&updated).await;
                }
            }
        }
    }

    async fn exhaust(&self, action: RecoveryAction) {
        let removed = self.inner.actions.lock().await.remove(&action.key());
        let mut exhausted = removed.unwrap_or(action);
        exhausted.status = RecoveryActionStatus::Exhausted;

        error!(
            tenant_id = %exhausted.tenant_id,
            provider = %exhausted.provider,
            action = %exhausted.action_type,
            attempts = exhausted.attempts,
            "Recovery action exhausted"
        );
        self.persist(&exhausted).await;
        self.inner.signals.publish(IntegrationSignal::RecoveryExhausted {
            tenant_id: exhausted.tenant_id,
            provider: exhausted.provider,
            action: exhausted.action_type,
            last_error: exhausted.last_error.clone(),
        });

        if exhausted.action_type == RecoveryActionType::RefreshToken {
            self.schedule(
                exhausted.tenant_id,
                exhausted.provider,
                RecoveryStrategy::for_action(RecoveryActionType::DisableIntegration),
                exhausted.last_error,
            )
            .await;
        }
    }

    async fn perform(&self, action: &RecoveryAction) -> Result<(), IntegrationError> {
        let tenant_id = action.tenant_id;
        let provider = action.provider;

        if action.action_type == RecoveryActionType::DisableIntegration {
            let reason = action
                .last_error
                .clone()
                .unwrap_or_else(|| "credential refresh exhausted".to_string());
            return self.disable_integration(tenant_id, provider, reason).await;
        }

        let connector = self
            .inner
            .registry
            .get(provider)
            .map_err(|e| IntegrationError::new(ErrorCode::ValidationError, provider, e.to_string()))?;
        let integrations = &self.inner.integrations;
        let model = integrations
            .find(tenant_id, provider)
            .await
            .map_err(|e| storage_error(provider, e))?
            .ok_or_else(|| {
                IntegrationError::new(
                    ErrorCode::NotFound,
                    provider,
                    format!("no {} integration for tenant {}", provider, tenant_id),
                )
            })?;
        let credentials = integrations
            .credentials(&model)
            .map_err(|e| storage_error(provider, e))?;

        match action.action_type {
            RecoveryActionType::Retry => {
                connector.test_connection(Some(tenant_id), &credentials).await
            }
            RecoveryActionType::RefreshToken => {
                let refreshed = connector
                    .refresh_credentials(Some(tenant_id), credentials)
                    .await?;
                integrations
                    .upsert_credentials(tenant_id, provider, &refreshed)
                    .await
                    .map_err(|e| storage_error(provider, e))?;
                Ok(())
            }
            RecoveryActionType::ResetConnection => {
                let authenticated = connector.authenticate(Some(tenant_id), credentials).await?;
                integrations
                    .upsert_credentials(tenant_id, provider, &authenticated)
                    .await
                    .map_err(|e| storage_error(provider, e))?;
                Ok(())
            }
            RecoveryActionType::DisableIntegration => Ok(()),
        }
    }

    async fn disable_integration(
        &self,
        tenant_id: Uuid,
        provider: ProviderType,
        reason: String,
    ) -> Result<(), IntegrationError> {
        self.inner
            .integrations
            .set_status(tenant_id, provider, STATUS_DISABLED)
            .await
            .map_err(|e| storage_error(provider, e))?;

        warn!(tenant_id = %tenant_id, provider = %provider, reason = %reason, "Integration disabled");
        self.update_health(tenant_id, provider, HealthTracker::mark_disconnected)
            .await;
        self.inner.signals.publish(IntegrationSignal::IntegrationDisabled {
            tenant_id,
            provider,
            reason,
        });
        Ok(())
    }

    /// Probe every active integration and purge expired audit rows; returns how many were probed.
    #[instrument(skip_all)]
    pub async fn run_health_checks(&self) -> usize {
        let now = Utc::now();
        if let Ok(removed) = self
            .inner
            .error_log
            .purge_before(now - self.inner.settings.error_retention)
            .await
            .inspect_err(|err| warn!(error = ?err, "Failed to purge integration error audit rows"))
            && removed > 0
        {
            debug!(removed, "Purged expired integration error rows");
        }
        self.inner.patterns.lock().await.prune(now);

        let integrations = match self.inner.integrations.list_active().await {
            Ok(integrations) => integrations,
            Err(err) => {
                error!(error = ?err, "Failed to list active integrations");
                return 0;
            }
        };

        let mut probed = 0;
        for model in integrations {
            let Ok(provider) = model.provider.parse::<ProviderType>() else {
                warn!(provider = %model.provider, "Skipping integration with unknown provider");
                continue;
            };
            let Ok(connector) = self.inner.registry.get(provider) else {
                continue;
            };
            let credentials = match self.inner.integrations.credentials(&model) {
                Ok(credentials) => credentials,
                Err(err) => {
                    self.handle_error(
                        storage_error(provider, err),
                        ErrorContext::for_tenant(model.tenant_id).operation("health_check"),
                    )
                    .await;
                    continue;
                }
            };

            probed += 1;
            let probe = connector.test_connection(Some(model.tenant_id), &credentials);
            match as_recovery_probe(probe).await {
                Ok(()) => self.record_success(model.tenant_id, provider).await,
                Err(err) => {
                    self.handle_error(
                        err,
                        ErrorContext::for_tenant(model.tenant_id).operation("health_check"),
                    )
                    .await
                }
            }
        }
        probed
    }

    /// Feed request outcomes from the rate limiter into health and recovery.
    pub async fn consume_outcomes(
        &self,
        mut outcomes: mpsc::UnboundedReceiver<RequestOutcome>,
        shutdown: CancellationToken,
    ) {
        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = outcomes.recv() => match outcome {
                    Some(outcome) => outcome,
                    None => break,
                },
            };
            self.apply_outcome(outcome).await;
        }
        debug!("Outcome consumer stopped");
    }

    pub async fn apply_outcome(&self, outcome: RequestOutcome) {
        match outcome {
            RequestOutcome::Succeeded {
                provider,
                tenant_id: Some(tenant_id),
                ..
            } => self.record_success(tenant_id, provider).await,
            RequestOutcome::Succeeded { tenant_id: None, .. } => {}
            RequestOutcome::Failed {
                tenant_id,
                operation,
                error,
            } => {
                let context = ErrorContext {
                    tenant_id,
                    operation: Some(operation),
                };
                self.handle_error(error, context).await
            }
        }
    }

    /// Run the recovery poller and health checker until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval_secs = self.inner.settings.poll_interval.as_secs(),
            health_interval_secs = self.inner.settings.health_check_interval.as_secs(),
            "Starting recovery engine"
        );
        let mut poll = interval(self.inner.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = interval(self.inner.settings.health_check_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First health tick fires immediately; skip it so startup is quiet.
        health.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Recovery engine shutdown requested");
                    break;
                }
                _ = poll.tick() => {
                    let executed = self.process_due_actions().await;
                    if executed > 0 {
                        debug!(executed, "Recovery poll executed actions");
                    }
                }
                _ = health.tick() => {
                    let probed = self.run_health_checks().await;
                    debug!(probed, "Health check pass completed");
                }
            }
        }
        info!("Recovery engine stopped");
    }

    async fn persist(&self, action: &RecoveryAction) {
        if let Err(err) = self.inner.action_log.save(action).await {
            warn!(action_id = %action.id, error = ?err, "Failed to mirror recovery action");
        }
    }
}

fn storage_error(provider: ProviderType, err: anyhow::Error) -> IntegrationError {
    IntegrationError::new(
        ErrorCode::UnknownError,
        provider,
        format!("integration store failure: {}", err),
    )
}

