//! # Rate Limit Manager
//!
//! Every outbound provider call is funnelled through [`RateLimitManager::execute`]. Each
//! provider gets one priority queue drained by a single worker task: highest priority
//! first, then oldest. Before a request runs the worker checks the fixed windows and the
//! consecutive-error backoff held in the shared cache, sleeping until the nearest reset
//! when blocked. Failed attempts are classified; retryable ones are re-enqueued after a
//! backoff delay, everything else is rejected back to the caller. Outcomes are forwarded
//! to the error handler through an unbounded channel.

pub mod policy;
pub mod window;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::task_local;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::cache::{SharedCacheRef, rate_limit_key};
use crate::config::AppConfig;
use crate::connectors::ConnectorError;
use crate::connectors::metadata::provider_metadata;
use crate::error::{ErrorCode, IntegrationError};
use crate::models::ProviderType;

pub use policy::{BackoffKind, RateLimitConfig, RetryPolicy};
pub use window::{RateLimitDecision, RateLimitMetrics};

const METRICS_TTL: Duration = Duration::from_secs(3600);
const MAX_ADMISSION_WAIT: Duration = Duration::from_secs(5);

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Routing and retry parameters for one outbound call.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub provider: ProviderType,
    pub tenant_id: Option<Uuid>,
    pub priority: RequestPriority,
    pub operation: String,
    /// Falls back to the manager's default policy
    pub policy: Option<RetryPolicy>,
}

impl RequestSpec {
    pub fn new<S: Into<String>>(provider: ProviderType, operation: S) -> Self {
        Self {
            provider,
            tenant_id: None,
            priority: RequestPriority::Normal,
            operation: operation.into(),
            policy: None,
        }
    }

    pub fn tenant(mut self, tenant_id: Option<Uuid>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Terminal result of a request, as seen by the error handler.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Succeeded {
        provider: ProviderType,
        tenant_id: Option<Uuid>,
        operation: String,
    },
    Failed {
        tenant_id: Option<Uuid>,
        operation: String,
        error: IntegrationError,
    },
}

task_local! {
    static RECOVERY_PROBE: ();
}

/// Run `future` such that requests it issues are not reported back as outcomes.
///
/// The recovery engine probes failing integrations through the same adapters; its
/// own failures must not feed the health metrics that scheduled the probe.
pub async fn as_recovery_probe<F: Future>(future: F) -> F::Output {
    RECOVERY_PROBE.scope((), future).await
}

fn in_recovery_probe() -> bool {
    RECOVERY_PROBE.try_with(|_| ()).is_ok()
}

fn shutdown_error(provider: ProviderType) -> IntegrationError {
    let mut error = IntegrationError::new(
        ErrorCode::ConnectionError,
        provider,
        "rate limit manager is shutting down",
    );
    error.retryable = false;
    error
}

type AttemptFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ConnectorError>> + Send + 'a>>;

/// Type-erased queued callable with its completion channel.
trait RequestTask: Send {
    fn attempt(&mut self) -> AttemptFuture<'_>;
    fn complete(self: Box<Self>);
    fn reject(self: Box<Self>, error: IntegrationError);
}

struct TypedTask<T, F> {
    work: F,
    output: Option<T>,
    reply: oneshot::Sender<Result<T, IntegrationError>>,
}

impl<T, F, Fut> RequestTask for TypedTask<T, F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ConnectorError>> + Send + 'static,
{
    fn attempt(&mut self) -> AttemptFuture<'_> {
        let call = (self.work)();
        Box::pin(async move {
            let value = call.await?;
            self.output = Some(value);
            Ok(())
        })
    }

    fn complete(self: Box<Self>) {
        let this = *self;
        if let Some(value) = this.output {
            // Caller may have gone away; the work still ran.
            let _ = this.reply.send(Ok(value));
        }
    }

    fn reject(self: Box<Self>, error: IntegrationError) {
        let _ = self.reply.send(Err(error));
    }
}

struct QueuedRequest {
    id: Uuid,
    tenant_id: Option<Uuid>,
    priority: RequestPriority,
    seq: u64,
    enqueued_at: Instant,
    attempts: u32,
    operation: String,
    policy: RetryPolicy,
    forward_outcome: bool,
    task: Box<dyn RequestTask>,
}

impl QueuedRequest {
    fn reject(self, error: IntegrationError) {
        self.task.reject(error);
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // Max-heap: higher priority first, then lower sequence (older) first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct ProviderQueue {
    heap: Mutex<BinaryHeap<QueuedRequest>>,
    notify: Notify,
}

impl ProviderQueue {
    async fn push(&self, request: QueuedRequest) {
        self.heap.lock().await.push(request);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<QueuedRequest> {
        self.heap.lock().await.pop()
    }

    async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }
}

/// Epoch milliseconds derived from the tokio clock so paused-time tests stay consistent.
#[derive(Debug, Clone, Copy)]
struct Clock {
    anchor_ms: i64,
    anchor: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            anchor_ms: Utc::now().timestamp_millis(),
            anchor: Instant::now(),
        }
    }

    fn now_ms(&self) -> i64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as i64
    }
}

struct Inner {
    cache: SharedCacheRef,
    limits: HashMap<ProviderType, RateLimitConfig>,
    default_policy: RetryPolicy,
    outcomes: Option<mpsc::UnboundedSender<RequestOutcome>>,
    queues: Mutex<HashMap<ProviderType, Arc<ProviderQueue>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    // Serializes read-modify-write of cached window state within this process.
    state_lock: Mutex<()>,
    shutdown: CancellationToken,
    seq: AtomicU64,
    clock: Clock,
}

pub struct RateLimitManagerBuilder {
    cache: SharedCacheRef,
    limits: HashMap<ProviderType, RateLimitConfig>,
    default_policy: RetryPolicy,
    outcomes: Option<mpsc::UnboundedSender<RequestOutcome>>,
    shutdown: CancellationToken,
}

impl RateLimitManagerBuilder {
    pub fn limits(mut self, provider: ProviderType, limits: RateLimitConfig) -> Self {
        self.limits.insert(provider, limits);
        self
    }

    pub fn default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn outcomes(mut self, sender: mpsc::UnboundedSender<RequestOutcome>) -> Self {
        self.outcomes = Some(sender);
        self
    }

    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn build(self) -> RateLimitManager {
        RateLimitManager {
            inner: Arc::new(Inner {
                cache: self.cache,
                limits: self.limits,
                default_policy: self.default_policy,
                outcomes: self.outcomes,
                queues: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                state_lock: Mutex::new(()),
                shutdown: self.shutdown,
                seq: AtomicU64::new(0),
                clock: Clock::new(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitManager {
    inner: Arc<Inner>,
}

impl RateLimitManager {
    /// Builder with no ceilings and the default retry policy.
    pub fn builder(cache: SharedCacheRef) -> RateLimitManagerBuilder {
        RateLimitManagerBuilder {
            cache,
            limits: HashMap::new(),
            default_policy: RetryPolicy::default(),
            outcomes: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Builder seeded with each provider's published ceilings plus configured overrides.
    pub fn from_config(config: &AppConfig, cache: SharedCacheRef) -> RateLimitManagerBuilder {
        let mut builder =
            Self::builder(cache).default_policy(RetryPolicy::from(&config.retry));
        for provider in ProviderType::ALL {
            let mut limits = provider_metadata(provider).default_limits;
            if let Some(overrides) = config.rate_limit_override(provider) {
                limits = limits.with_override(overrides);
            }
            builder = builder.limits(provider, limits);
        }
        builder
    }

    pub fn limits_for(&self, provider: ProviderType) -> RateLimitConfig {
        self.inner.limits_for(provider)
    }

    /// Queue `work` behind the provider's ceilings and resolve with its final result.
    ///
    /// `work` is invoked once per attempt; it must not retry internally.
    pub async fn execute<T, F, Fut>(&self, spec: RequestSpec, work: F) -> Result<T, IntegrationError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ConnectorError>> + Send + 'static,
    {
        let provider = spec.provider;
        if self.inner.shutdown.is_cancelled() {
            return Err(shutdown_error(provider));
        }

        let (reply, receiver) = oneshot::channel();
        let request = QueuedRequest {
            id: Uuid::new_v4(),
            tenant_id: spec.tenant_id,
            priority: spec.priority,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            enqueued_at: Instant::now(),
            attempts: 0,
            operation: spec.operation,
            policy: spec
                .policy
                .unwrap_or_else(|| self.inner.default_policy.clone()),
            forward_outcome: !in_recovery_probe(),
            task: Box::new(TypedTask {
                work,
                output: None,
                reply,
            }),
        };

        debug!(
            provider = %provider,
            request_id = %request.id,
            priority = ?request.priority,
            operation = %request.operation,
            "Enqueuing provider request"
        );

        let queue = self.inner.queue_for(provider).await;
        queue.push(request).await;

        receiver
            .await
            .unwrap_or_else(|_| Err(shutdown_error(provider)))
    }

    /// Whether a request for `(provider, tenant)` could run right now, without admitting it.
    pub async fn can_proceed(
        &self,
        provider: ProviderType,
        tenant_id: Option<Uuid>,
    ) -> RateLimitDecision {
        let metrics = self.metrics(provider, tenant_id).await;
        metrics.can_proceed(
            &self.inner.limits_for(provider),
            self.inner.default_policy.base_delay,
            self.inner.clock.now_ms(),
        )
    }

    pub async fn metrics(&self, provider: ProviderType, tenant_id: Option<Uuid>) -> RateLimitMetrics {
        self.inner
            .cache
            .get_json(&rate_limit_key(provider, tenant_id))
            .await
            .unwrap_or_default()
    }

    pub async fn record_success(&self, provider: ProviderType, tenant_id: Option<Uuid>) {
        self.inner.record_success(provider, tenant_id).await;
    }

    pub async fn record_failure(
        &self,
        provider: ProviderType,
        tenant_id: Option<Uuid>,
        error: &IntegrationError,
    ) {
        self.inner.record_failure(provider, tenant_id, error).await;
    }

    pub async fn queue_depth(&self, provider: ProviderType) -> usize {
        let queue = self.inner.queues.lock().await.get(&provider).cloned();
        match queue {
            Some(queue) => queue.len().await,
            None => 0,
        }
    }

    /// Stop intake, reject queued requests and wait for the workers to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = std::mem::take(&mut *self.inner.workers.lock().await);
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "Rate limit worker ended abnormally");
            }
        }
        info!("Rate limit manager stopped");
    }
}

impl Inner {
    fn limits_for(&self, provider: ProviderType) -> RateLimitConfig {
        self.limits.get(&provider).copied().unwrap_or_default()
    }

    async fn queue_for(self: &Arc<Self>, provider: ProviderType) -> Arc<ProviderQueue> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(&provider) {
            return Arc::clone(queue);
        }

        let queue = Arc::new(ProviderQueue::default());
        queues.insert(provider, Arc::clone(&queue));
        let handle = tokio::spawn(run_worker(Arc::clone(self), provider, Arc::clone(&queue)));
        self.workers.lock().await.push(handle);
        queue
    }

    async fn try_admit(
        &self,
        provider: ProviderType,
        tenant_id: Option<Uuid>,
    ) -> RateLimitDecision {
        let _guard = self.state_lock.lock().await;
        let key = rate_limit_key(provider, tenant_id);
        let mut metrics: RateLimitMetrics = self.cache.get_json(&key).await.unwrap_or_default();

        let limits = self.limits_for(provider);
        let now = self.clock.now_ms();
        let decision = metrics.can_proceed(&limits, self.default_policy.base_delay, now);
        if decision.allowed {
            metrics.admit(now);
            self.cache.set_json(&key, &metrics, METRICS_TTL).await;
        }
        decision
    }

    async fn record_success(&self, provider: ProviderType, tenant_id: Option<Uuid>) {
        let _guard = self.state_lock.lock().await;
        let key = rate_limit_key(provider, tenant_id);
        let mut metrics: RateLimitMetrics = self.cache.get_json(&key).await.unwrap_or_default();
        if metrics.consecutive_errors > 0 || metrics.last_error_at_ms.is_some() {
            metrics.record_success();
            self.cache.set_json(&key, &metrics, METRICS_TTL).await;
        }
    }

    async fn record_failure(
        &self,
        provider: ProviderType,
        tenant_id: Option<Uuid>,
        error: &IntegrationError,
    ) {
        // Client-side failures say nothing about provider capacity.
        if !error.retryable {
            return;
        }
        let _guard = self.state_lock.lock().await;
        let key = rate_limit_key(provider, tenant_id);
        let mut metrics: RateLimitMetrics = self.cache.get_json(&key).await.unwrap_or_default();
        metrics.record_failure(self.clock.now_ms(), error.retry_after());
        self.cache.set_json(&key, &metrics, METRICS_TTL).await;
    }

    fn forward(&self, outcome: RequestOutcome) {
        if let Some(sender) = &self.outcomes
            && sender.send(outcome).is_err()
        {
            debug!("Outcome receiver dropped");
        }
    }

    /// Block until the request is admitted; `None` if shutdown rejected it meanwhile.
    async fn wait_for_admission(
        &self,
        provider: ProviderType,
        request: QueuedRequest,
    ) -> Option<QueuedRequest> {
        loop {
            let decision = self.try_admit(provider, request.tenant_id).await;
            if decision.allowed {
                return Some(request);
            }

            counter!("rate_limit_blocked_total", "provider" => provider.as_str()).increment(1);
            let wait = Duration::from_millis(decision.retry_after_ms.unwrap_or(1))
                .min(MAX_ADMISSION_WAIT);
            debug!(
                provider = %provider,
                request_id = %request.id,
                wait_ms = wait.as_millis() as u64,
                "Provider ceiling reached, waiting for window reset"
            );

            let cancelled = tokio::select! {
                _ = self.shutdown.cancelled() => true,
                _ = sleep(wait) => false,
            };
            if cancelled {
                request.reject(shutdown_error(provider));
                return None;
            }
        }
    }

    async fn run_request(self: &Arc<Self>, provider: ProviderType, mut request: QueuedRequest) {
        counter!("rate_limit_requests_total", "provider" => provider.as_str()).increment(1);
        if request.attempts == 0 {
            histogram!("rate_limit_queue_wait_ms", "provider" => provider.as_str())
                .record(request.enqueued_at.elapsed().as_secs_f64() * 1_000.0);
        }

        let started = Instant::now();
        let result = request.task.attempt().await;
        request.attempts += 1;
        histogram!("rate_limit_request_duration_ms", "provider" => provider.as_str())
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        match result {
            Ok(()) => {
                self.record_success(provider, request.tenant_id).await;
                if request.forward_outcome {
                    self.forward(RequestOutcome::Succeeded {
                        provider,
                        tenant_id: request.tenant_id,
                        operation: request.operation.clone(),
                    });
                }
                request.task.complete();
            }
            Err(raw) => {
                let error = IntegrationError::classify(provider, &raw);
                self.record_failure(provider, request.tenant_id, &error).await;

                if request.policy.should_retry(&error, request.attempts)
                    && !self.shutdown.is_cancelled()
                {
                    let delay = request.policy.delay_for(request.attempts, error.retry_after());
                    counter!(
                        "rate_limit_retries_total",
                        "provider" => provider.as_str(),
                        "code" => error.code.as_str()
                    )
                    .increment(1);
                    warn!(
                        provider = %provider,
                        request_id = %request.id,
                        code = %error.code,
                        attempt = request.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Provider request failed, scheduling retry"
                    );
                    self.schedule_retry(provider, request, delay);
                } else {
                    warn!(
                        provider = %provider,
                        request_id = %request.id,
                        code = %error.code,
                        attempts = request.attempts,
                        "Provider request rejected"
                    );
                    if request.forward_outcome {
                        self.forward(RequestOutcome::Failed {
                            tenant_id: request.tenant_id,
                            operation: request.operation.clone(),
                            error: error.clone(),
                        });
                    }
                    request.reject(error);
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, provider: ProviderType, request: QueuedRequest, delay: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let cancelled = tokio::select! {
                _ = inner.shutdown.cancelled() => true,
                _ = sleep(delay) => false,
            };
            if cancelled {
                request.reject(shutdown_error(provider));
                return;
            }
            inner.queue_for(provider).await.push(request).await;
        });
    }
}

/// Token bucket of requests allowed to skip the per-request spacing.
///
/// Holds at most `burst_limit` credits and refills at the per-second rate. The
/// windows still apply to every request; a credit only removes the gap.
#[derive(Debug)]
struct BurstCredits {
    capacity: f64,
    refill_per_sec: f64,
    available: f64,
    refilled_at: Instant,
}

impl BurstCredits {
    fn new(limits: &RateLimitConfig, now: Instant) -> Self {
        let capacity = f64::from(limits.burst_limit.unwrap_or(0));
        Self {
            capacity,
            refill_per_sec: f64::from(limits.requests_per_second.unwrap_or(0)),
            available: capacity,
            refilled_at: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.available = (self.available + elapsed * self.refill_per_sec).min(self.capacity);
        self.refilled_at = now;
        if self.available >= 1.0 {
            self.available -= 1.0;
            true
        } else {
            false
        }
    }
}

async fn run_worker(inner: Arc<Inner>, provider: ProviderType, queue: Arc<ProviderQueue>) {
    let limits = inner.limits_for(provider);
    let spacing = limits.spacing();
    let mut burst = BurstCredits::new(&limits, Instant::now());
    info!(provider = %provider, ?limits, "Rate limit worker started");

    loop {
        let Some(request) = queue.pop().await else {
            if inner.shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = inner.shutdown.cancelled() => {}
                _ = queue.notify.notified() => {}
            }
            continue;
        };

        if inner.shutdown.is_cancelled() {
            request.reject(shutdown_error(provider));
            continue;
        }

        gauge!("rate_limit_queue_depth", "provider" => provider.as_str())
            .set(queue.len().await as f64);

        let Some(request) = inner.wait_for_admission(provider, request).await else {
            continue;
        };

        inner.run_request(provider, request).await;

        if !spacing.is_zero() && !burst.try_take(Instant::now()) {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {}
                _ = sleep(spacing) => {}
            }
        }
    }

    info!(provider = %provider, "Rate limit worker stopped");
}
