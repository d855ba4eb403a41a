//! # Webhook Manager
//!
//! Registers provider-side webhooks and ingests their deliveries. `process_webhook` only
//! enqueues; a single consumer started by [`WebhookManager::run`] verifies, transforms and
//! dispatches deliveries strictly in arrival order. Failures are counted per subscription,
//! retried with a short ladder when retryable and escalated to the [`ErrorHandler`].

pub mod handler;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use sea_orm::DatabaseConnection;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::cache::{SharedCacheRef, webhook_subscription_key};
use crate::config::AppConfig;
use crate::connectors::{Connector, Registry, WebhookSetupParams, WebhookValidation};
use crate::crypto::CryptoKey;
use crate::error::{ErrorCode, IntegrationError};
use crate::events::{IntegrationSignal, SignalBus};
use crate::models::webhook_subscription;
use crate::models::{AuthCredentials, ProviderType};
use crate::recovery::{ErrorContext, ErrorHandler};
use crate::repositories::{NewSubscription, WebhookSubscriptionRepository};
use crate::webhook_verification::generate_webhook_secret;

pub use handler::{DomainEvent, DomainEventKind, WebhookEventHandler};

/// Consecutive failures after which a subscription is disabled.
pub const DEFAULT_MAX_FAILURES: u32 = 10;

/// Re-queue delays indexed by the subscription's failure count.
pub const RETRY_DELAYS: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(60),
];

const SUBSCRIPTION_CACHE_TTL: Duration = Duration::from_secs(300);

pub fn retry_delay(failure_count: u32) -> Duration {
    let index = (failure_count.max(1) as usize - 1).min(RETRY_DELAYS.len() - 1);
    RETRY_DELAYS[index]
}

/// Delay before re-trying a delivery whose subscription lookup failed, or `None` once
/// every rung of the ladder has been used.
pub fn lookup_retry_delay(attempts: u32) -> Option<Duration> {
    RETRY_DELAYS.get(attempts as usize).copied()
}

/// One inbound delivery as received at the HTTP edge.
#[derive(Debug, Clone)]
pub struct InboundWebhook {
    pub provider: ProviderType,
    pub event_name: String,
    pub payload: Value,
    /// Exact bytes the provider signed
    pub raw_body: Vec<u8>,
    pub signature: Option<String>,
    pub tenant_id: Option<Uuid>,
    /// Merchant id or shop domain, used when no tenant is supplied
    pub account_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Re-queues after a failed subscription lookup
    pub attempts: u32,
}

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Dispatched {
        kind: DomainEventKind,
        handlers: usize,
    },
    /// Subscription exists but is disabled
    Skipped,
    Failed(IntegrationError),
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub max_failures: u32,
}

impl WebhookSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_failures: config.webhook_max_failures.max(1),
        }
    }
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }
}

struct Inner {
    registry: Registry,
    subscriptions: WebhookSubscriptionRepository,
    cache: SharedCacheRef,
    signals: SignalBus,
    errors: ErrorHandler,
    settings: WebhookSettings,
    handlers: std::sync::RwLock<Vec<Arc<dyn WebhookEventHandler>>>,
    sender: mpsc::UnboundedSender<InboundWebhook>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<InboundWebhook>>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct WebhookManager {
    inner: Arc<Inner>,
}

impl WebhookManager {
    pub fn new(
        registry: Registry,
        db: Arc<DatabaseConnection>,
        crypto_key: CryptoKey,
        cache: SharedCacheRef,
        signals: SignalBus,
        errors: ErrorHandler,
        settings: WebhookSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                registry,
                subscriptions: WebhookSubscriptionRepository::new(db, crypto_key),
                cache,
                signals,
                errors,
                settings,
                handlers: std::sync::RwLock::new(Vec::new()),
                sender,
                receiver: Mutex::new(Some(receiver)),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn WebhookEventHandler>) {
        match self.inner.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    fn handlers(&self) -> Vec<Arc<dyn WebhookEventHandler>> {
        match self.inner.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn subscriptions(&self) -> &WebhookSubscriptionRepository {
        &self.inner.subscriptions
    }

    /// Register provider-side webhooks and upsert the local subscription.
    #[instrument(skip(self, credentials), fields(tenant_id = %tenant_id, provider = %provider))]
    pub async fn setup_webhooks(
        &self,
        tenant_id: Uuid,
        provider: ProviderType,
        notification_url: &str,
        credentials: AuthCredentials,
    ) -> Result<webhook_subscription::Model, IntegrationError> {
        let result = self
            .register(tenant_id, provider, notification_url, credentials)
            .await;
        if let Err(err) = &result {
            self.inner
                .errors
                .handle_error(
                    err.clone(),
                    ErrorContext::for_tenant(tenant_id).operation("setup_webhooks"),
                )
                .await;
        }
        result
    }

    async fn register(
        &self,
        tenant_id: Uuid,
        provider: ProviderType,
        notification_url: &str,
        credentials: AuthCredentials,
    ) -> Result<webhook_subscription::Model, IntegrationError> {
        let connector = self.connector(provider)?;
        let url = Url::parse(notification_url)
            .ok()
            .filter(|url| matches!(url.scheme(), "https" | "http") && url.has_host())
            .ok_or_else(|| {
                IntegrationError::new(
                    ErrorCode::ValidationError,
                    provider,
                    format!(
                        "notification url '{}' is not an absolute http(s) url",
                        notification_url
                    ),
                )
            })?;
        let notification_url = url.as_str();
        let registration = connector
            .setup_webhooks(WebhookSetupParams {
                tenant_id,
                notification_url: notification_url.to_string(),
                credentials,
            })
            .await?;

        let secret = registration
            .signing_secret
            .unwrap_or_else(generate_webhook_secret);
        let subscription = self
            .inner
            .subscriptions
            .upsert(NewSubscription {
                tenant_id,
                provider,
                webhook_url: notification_url.to_string(),
                events: registration.events,
                secret,
                external_account_id: registration.account_id,
                provider_webhook_id: registration.webhook_id,
            })
            .await
            .map_err(|e| store_error(provider, e))?;

        self.cache_subscription(&subscription).await;
        info!(
            subscription_id = %subscription.id,
            events = ?subscription.event_names(),
            "Webhook subscription registered"
        );
        Ok(subscription)
    }

    /// Enqueue a delivery for the consumer; never waits on processing.
    pub fn process_webhook(&self, delivery: InboundWebhook) -> Result<(), IntegrationError> {
        counter!(
            "webhook_events_received_total",
            "provider" => delivery.provider.as_str()
        )
        .increment(1);

        let provider = delivery.provider;
        if self.inner.shutdown.is_cancelled() {
            return Err(intake_closed(provider));
        }
        self.inner
            .sender
            .send(delivery)
            .map_err(|_| intake_closed(provider))
    }

    /// Drain the delivery queue until `shutdown` fires, then finish what is already queued.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        let Some(mut receiver) = self.inner.receiver.lock().await.take() else {
            warn!("Webhook consumer already running");
            return;
        };
        info!("Starting webhook consumer");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = receiver.recv() => match delivery {
                    Some(delivery) => self.consume(delivery).await,
                    None => break,
                },
            }
        }

        self.inner.shutdown.cancel();
        receiver.close();
        let mut drained = 0usize;
        while let Ok(delivery) = receiver.try_recv() {
            self.consume(delivery).await;
            drained += 1;
        }
        info!(drained, "Webhook consumer stopped");
    }

    /// Handle one delivery on its own task so a panic cannot stop the consumer.
    async fn consume(&self, delivery: InboundWebhook) {
        let provider = delivery.provider;
        let manager = self.clone();
        let handled = tokio::spawn(async move { manager.handle_delivery(delivery).await });
        if let Err(err) = handled.await {
            counter!(
                "webhook_failures_total",
                "provider" => provider.as_str(),
                "code" => "PANIC"
            )
            .increment(1);
            error!(provider = %provider, error = ?err, "Webhook delivery task panicked");
        }
    }

    /// Process one delivery inline: the consumer's per-event step.
    #[instrument(
        skip_all,
        fields(provider = %delivery.provider, event = %delivery.event_name)
    )]
    pub async fn handle_delivery(&self, delivery: InboundWebhook) -> DeliveryOutcome {
        let provider = delivery.provider;
        let subscription = match self.resolve_subscription(&delivery).await {
            Ok(Some(subscription)) => subscription,
            Ok(None) => {
                let err = IntegrationError::new(
                    ErrorCode::NotFound,
                    provider,
                    "no webhook subscription matches the delivery",
                )
                .with_details(json!({
                    "tenant_id": delivery.tenant_id,
                    "account_id": delivery.account_id,
                }));
                warn!("Dropping webhook without subscription");
                counter!(
                    "webhook_failures_total",
                    "provider" => provider.as_str(),
                    "code" => err.code.as_str()
                )
                .increment(1);
                self.escalate(&delivery, delivery.tenant_id, err.clone()).await;
                return DeliveryOutcome::Failed(err);
            }
            Err(err) => {
                error!(error = %err, attempts = delivery.attempts, "Subscription lookup failed");
                self.escalate(&delivery, delivery.tenant_id, err.clone()).await;
                match lookup_retry_delay(delivery.attempts).filter(|_| err.retryable) {
                    Some(delay) => {
                        let mut retry = delivery;
                        retry.attempts += 1;
                        self.requeue(retry, delay);
                    }
                    None => {
                        warn!(attempts = delivery.attempts, "Dropping webhook after lookup retries");
                    }
                }
                return DeliveryOutcome::Failed(err);
            }
        };

        if !subscription.is_active {
            debug!(subscription_id = %subscription.id, "Skipping delivery for disabled subscription");
            return DeliveryOutcome::Skipped;
        }

        match self.process(&delivery, &subscription).await {
            Ok((kind, handlers)) => {
                match self.inner.subscriptions.record_success(subscription.id).await {
                    Ok(Some(updated)) => self.cache_subscription(&updated).await,
                    Ok(None) => {}
                    Err(err) => warn!(error = ?err, "Failed to record webhook success"),
                }
                DeliveryOutcome::Dispatched { kind, handlers }
            }
            Err(err) => {
                self.fail(delivery, subscription, err.clone()).await;
                DeliveryOutcome::Failed(err)
            }
        }
    }

    async fn process(
        &self,
        delivery: &InboundWebhook,
        subscription: &webhook_subscription::Model,
    ) -> Result<(DomainEventKind, usize), IntegrationError> {
        let provider = delivery.provider;
        let connector = self.connector(provider)?;

        let secret = self
            .inner
            .subscriptions
            .decrypt_secret(subscription)
            .map_err(|err| {
                warn!(error = ?err, "Webhook secret unavailable");
                IntegrationError::invalid_signature(provider)
                    .with_details(json!({ "reason": "secret unavailable" }))
            })?;
        let signature = delivery
            .signature
            .as_deref()
            .ok_or_else(|| {
                IntegrationError::invalid_signature(provider)
                    .with_details(json!({ "reason": "missing signature" }))
            })?;

        let verified = connector.validate_webhook(&WebhookValidation {
            body: &delivery.raw_body,
            signature,
            secret: &secret,
            notification_url: &subscription.webhook_url,
        });
        if !verified {
            return Err(IntegrationError::invalid_signature(provider));
        }

        let transaction = if connector.is_transaction_event(&delivery.event_name) {
            connector
                .webhook_transaction_payload(&delivery.payload)
                .map(|payload| connector.transform_raw_data(payload))
                .transpose()?
        } else {
            None
        };

        let kind = DomainEventKind::from_event_name(&delivery.event_name);
        let event = DomainEvent {
            kind,
            provider,
            tenant_id: subscription.tenant_id,
            event_name: delivery.event_name.clone(),
            transaction,
            payload: delivery.payload.clone(),
            received_at: Utc::now(),
            correlation_id: delivery.correlation_id.clone(),
        };
        let handlers = self.dispatch(event).await;
        Ok((kind, handlers))
    }

    /// Run every handler concurrently; individual failures are logged and swallowed.
    async fn dispatch(&self, event: DomainEvent) -> usize {
        let handlers = self.handlers();
        let count = handlers.len();
        let event = Arc::new(event);
        let mut tasks = JoinSet::new();

        for handler in handlers {
            let event = event.clone();
            tasks.spawn(async move {
                let result = handler.handle(&event).await;
                (handler.name().to_string(), result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    counter!(
                        "webhook_events_dispatched_total",
                        "provider" => event.provider.as_str(),
                        "kind" => event.kind.as_str(),
                        "handler" => name
                    )
                    .increment(1);
                }
                Ok((name, Err(err))) => {
                    warn!(handler = %name, kind = %event.kind, error = ?err, "Webhook handler failed");
                }
                Err(err) => {
                    error!(error = ?err, "Webhook handler task panicked");
                }
            }
        }
        count
    }

    async fn fail(
        &self,
        delivery: InboundWebhook,
        subscription: webhook_subscription::Model,
        err: IntegrationError,
    ) {
        let provider = delivery.provider;
        counter!(
            "webhook_failures_total",
            "provider" => provider.as_str(),
            "code" => err.code.as_str()
        )
        .increment(1);
        warn!(
            subscription_id = %subscription.id,
            code = %err.code,
            error = %err,
            "Webhook processing failed"
        );

        let failure_count = match self.inner.subscriptions.record_failure(subscription.id).await {
            Ok(Some(updated)) => {
                self.cache_subscription(&updated).await;
                updated.failure_count.max(0) as u32
            }
            Ok(None) => subscription.failure_count.max(0) as u32 + 1,
            Err(store_err) => {
                warn!(error = ?store_err, "Failed to record webhook failure");
                subscription.failure_count.max(0) as u32 + 1
            }
        };

        self.escalate(&delivery, Some(subscription.tenant_id), err.clone())
            .await;

        if failure_count >= self.inner.settings.max_failures {
            self.disable(&subscription, failure_count).await;
        } else if err.retryable {
            self.requeue(delivery, retry_delay(failure_count));
        }
    }

    async fn disable(&self, subscription: &webhook_subscription::Model, failure_count: u32) {
        let Some(provider) = subscription.provider_type() else {
            return;
        };
        match self.inner.subscriptions.deactivate(subscription.id).await {
            Ok(Some(updated)) => self.cache_subscription(&updated).await,
            Ok(None) => {}
            Err(err) => warn!(error = ?err, "Failed to deactivate webhook subscription"),
        }
        error!(
            subscription_id = %subscription.id,
            tenant_id = %subscription.tenant_id,
            provider = %provider,
            failure_count,
            "Webhook subscription disabled after repeated failures"
        );
        self.inner
            .signals
            .publish(IntegrationSignal::SubscriptionDisabled {
                tenant_id: subscription.tenant_id,
                provider,
                failure_count: failure_count as i32,
            });
    }

    fn requeue(&self, delivery: InboundWebhook, delay: Duration) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        debug!(delay_ms = delay.as_millis() as u64, "Re-queueing webhook delivery");
        let sender = self.inner.sender.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // Consumer gone; nothing left to retry against.
                    let _ = sender.send(delivery);
                }
            }
        });
    }

    async fn escalate(
        &self,
        delivery: &InboundWebhook,
        tenant_id: Option<Uuid>,
        err: IntegrationError,
    ) {
        let context = ErrorContext {
            tenant_id,
            operation: Some(format!("webhook:{}", delivery.event_name)),
        };
        self.inner.errors.handle_error(err, context).await;
    }

    /// Cache, then store by tenant, then store by provider account.
    async fn resolve_subscription(
        &self,
        delivery: &InboundWebhook,
    ) -> Result<Option<webhook_subscription::Model>, IntegrationError> {
        let provider = delivery.provider;
        let store = &self.inner.subscriptions;

        if let Some(tenant_id) = delivery.tenant_id {
            let key = webhook_subscription_key(tenant_id, provider);
            if let Some(cached) = self
                .inner
                .cache
                .get_json::<webhook_subscription::Model>(&key)
                .await
            {
                return Ok(Some(cached));
            }
            let found = store
                .find(tenant_id, provider)
                .await
                .map_err(|e| store_error(provider, e))?;
            if let Some(subscription) = &found {
                self.cache_subscription(subscription).await;
            }
            return Ok(found);
        }

        let Some(account_id) = delivery.account_id.as_deref() else {
            return Ok(None);
        };
        let found = store
            .find_by_account(provider, account_id)
            .await
            .map_err(|e| store_error(provider, e))?;
        if let Some(subscription) = &found {
            self.cache_subscription(subscription).await;
        }
        Ok(found)
    }

    async fn cache_subscription(&self, subscription: &webhook_subscription::Model) {
        let Some(provider) = subscription.provider_type() else {
            return;
        };
        self.inner
            .cache
            .set_json(
                &webhook_subscription_key(subscription.tenant_id, provider),
                subscription,
                SUBSCRIPTION_CACHE_TTL,
            )
            .await;
    }

    fn connector(&self, provider: ProviderType) -> Result<Arc<dyn Connector>, IntegrationError> {
        self.inner
            .registry
            .get(provider)
            .map_err(|e| IntegrationError::new(ErrorCode::ValidationError, provider, e.to_string()))
    }
}

fn store_error(provider: ProviderType, err: anyhow::Error) -> IntegrationError {
    IntegrationError::new(
        ErrorCode::ConnectionError,
        provider,
        format!("webhook subscription store unavailable: {}", err),
    )
}

fn intake_closed(provider: ProviderType) -> IntegrationError {
    IntegrationError::new(
        ErrorCode::ConnectionError,
        provider,
        "webhook intake is shut down",
    )
}
