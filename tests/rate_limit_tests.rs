//! Scheduling behaviour of the rate limit manager under paused tokio time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pos_connectors::cache::LocalCache;
use pos_connectors::connectors::ConnectorError;
use pos_connectors::error::ErrorCode;
use pos_connectors::models::ProviderType;
use pos_connectors::rate_limit::{
    RateLimitConfig, RateLimitManager, RequestPriority, RequestSpec, RetryPolicy,
};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
        jitter_factor: 0.0,
        ..RetryPolicy::default()
    }
}

fn manager(limits: RateLimitConfig, policy: RetryPolicy) -> RateLimitManager {
    RateLimitManager::builder(LocalCache::shared(64))
        .limits(ProviderType::Square, limits)
        .default_policy(policy)
        .build()
}

fn http_error(status: u16, retry_after: Option<u64>) -> ConnectorError {
    ConnectorError::HttpError {
        status,
        body: None,
        retry_after,
    }
}

#[tokio::test(start_paused = true)]
async fn requests_are_spaced_by_requests_per_second() {
    let manager = manager(RateLimitConfig::per_second(1), policy(1));
    let start = Instant::now();

    let mut tasks = JoinSet::new();
    for i in 0..3 {
        let manager = manager.clone();
        tasks.spawn(async move {
            manager
                .execute(RequestSpec::new(ProviderType::Square, "list_payments"), move || async move {
                    Ok::<_, ConnectorError>(i)
                })
                .await
        });
    }

    let mut completed = 0;
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
        completed += 1;
    }

    assert_eq!(completed, 3);
    assert!(
        start.elapsed() >= Duration::from_secs(2),
        "three requests at 1 rps finished in {:?}",
        start.elapsed()
    );
}

/// Runs `count` requests and returns when each one executed, relative to the start.
async fn execution_times(
    manager: &RateLimitManager,
    count: usize,
    sequential: bool,
) -> Vec<Duration> {
    let start = Instant::now();
    let finished = Arc::new(Mutex::new(Vec::new()));
    let call = move |manager: RateLimitManager, finished: Arc<Mutex<Vec<Duration>>>| async move {
        manager
            .execute(RequestSpec::new(ProviderType::Shopify, "list_orders"), move || {
                let finished = Arc::clone(&finished);
                async move {
                    finished.lock().unwrap().push(start.elapsed());
                    Ok::<_, ConnectorError>(())
                }
            })
            .await
    };

    if sequential {
        for _ in 0..count {
            call(manager.clone(), Arc::clone(&finished)).await.unwrap();
        }
    } else {
        let mut tasks = JoinSet::new();
        for _ in 0..count {
            tasks.spawn(call(manager.clone(), Arc::clone(&finished)));
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
    }

    let mut times = finished.lock().unwrap().clone();
    times.sort();
    times
}

fn shopify_manager(limits: RateLimitConfig) -> RateLimitManager {
    RateLimitManager::builder(LocalCache::shared(64))
        .limits(ProviderType::Shopify, limits)
        .default_policy(policy(1))
        .build()
}

fn within(times: &[Duration], bound: Duration) -> usize {
    times.iter().filter(|t| **t < bound).count()
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_over_the_ceiling_are_deferred() {
    let manager = shopify_manager(RateLimitConfig::per_second(2));

    let times = execution_times(&manager, 5, false).await;

    assert_eq!(times.len(), 5);
    assert_eq!(within(&times, Duration::from_secs(1)), 2, "{:?}", times);
    assert_eq!(within(&times, Duration::from_secs(2)), 4, "{:?}", times);
}

#[tokio::test(start_paused = true)]
async fn burst_allowance_never_lifts_the_per_second_window() {
    let limits = RateLimitConfig {
        burst_limit: Some(40),
        ..RateLimitConfig::per_second(2)
    };
    let manager = shopify_manager(limits);

    // One caller awaiting each page before asking for the next.
    let times = execution_times(&manager, 6, true).await;

    assert_eq!(times.len(), 6);
    assert_eq!(within(&times, Duration::from_secs(1)), 2, "{:?}", times);
    assert_eq!(within(&times, Duration::from_secs(2)), 4, "{:?}", times);
    assert!(times[1] < Duration::from_millis(500), "burst was spaced: {:?}", times);
}

#[tokio::test(start_paused = true)]
async fn without_burst_requests_keep_their_spacing() {
    let manager = shopify_manager(RateLimitConfig::per_second(2));

    let times = execution_times(&manager, 2, true).await;

    assert!(times[1] >= Duration::from_millis(500), "{:?}", times);
}

#[tokio::test(start_paused = true)]
async fn higher_priority_requests_jump_the_queue() {
    let manager = manager(RateLimitConfig::per_second(1), policy(1));
    let order = Arc::new(Mutex::new(Vec::new()));

    let record = |name: &'static str| {
        let order = Arc::clone(&order);
        move || {
            let order = Arc::clone(&order);
            async move {
                order.lock().unwrap().push(name);
                Ok::<_, ConnectorError>(())
            }
        }
    };

    // Occupies the worker so the rest queue up behind the spacing delay.
    manager
        .execute(RequestSpec::new(ProviderType::Square, "first"), record("first"))
        .await
        .unwrap();

    let mut tasks = JoinSet::new();
    for (name, priority) in [
        ("low-a", RequestPriority::Low),
        ("low-b", RequestPriority::Low),
        ("critical", RequestPriority::Critical),
    ] {
        let manager = manager.clone();
        let work = record(name);
        tasks.spawn(async move {
            manager
                .execute(
                    RequestSpec::new(ProviderType::Square, name).priority(priority),
                    work,
                )
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    let order = order.lock().unwrap().clone();
    assert_eq!(order[0], "first");
    assert_eq!(order[1], "critical");
    assert_eq!(order.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_errors_run_exactly_once() {
    let manager = manager(RateLimitConfig::default(), policy(5));
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let err = manager
        .execute(RequestSpec::new(ProviderType::Square, "create_webhook"), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(http_error(400, None))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::ValidationError);
    assert!(!err.retryable);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.metrics(ProviderType::Square, None).await.consecutive_errors,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn retries_stop_at_max_attempts() {
    let manager = manager(RateLimitConfig::default(), policy(3));
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let err = manager
        .execute(RequestSpec::new(ProviderType::Square, "list_payments"), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(http_error(503, None))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::ServerError);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        manager.metrics(ProviderType::Square, None).await.consecutive_errors,
        3
    );
}

#[tokio::test(start_paused = true)]
async fn provider_retry_after_delays_the_next_attempt() {
    let manager = manager(RateLimitConfig::default(), policy(2));
    let calls = Arc::new(AtomicU32::new(0));
    let start = Instant::now();

    let counter = Arc::clone(&calls);
    let value = manager
        .execute(RequestSpec::new(ProviderType::Square, "list_payments"), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(http_error(429, Some(3)))
                } else {
                    Ok("page")
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "page");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(start.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn error_streaks_are_tracked_per_tenant() {
    let manager = manager(RateLimitConfig::default(), policy(1));
    let noisy = Uuid::new_v4();
    let quiet = Uuid::new_v4();

    let _ = manager
        .execute(
            RequestSpec::new(ProviderType::Square, "list_payments").tenant(Some(noisy)),
            || async { Err::<(), _>(http_error(502, None)) },
        )
        .await;

    assert_eq!(
        manager.metrics(ProviderType::Square, Some(noisy)).await.consecutive_errors,
        1
    );
    assert_eq!(
        manager.metrics(ProviderType::Square, Some(quiet)).await.consecutive_errors,
        0
    );
    assert!(!manager.can_proceed(ProviderType::Square, Some(noisy)).await.allowed);
    assert!(manager.can_proceed(ProviderType::Square, Some(quiet)).await.allowed);
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_queued_work() {
    let manager = manager(RateLimitConfig::per_second(1), policy(1));

    manager
        .execute(RequestSpec::new(ProviderType::Square, "first"), || async {
            Ok::<_, ConnectorError>(())
        })
        .await
        .unwrap();

    let queued = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .execute(RequestSpec::new(ProviderType::Square, "second"), || async {
                    Ok::<_, ConnectorError>(())
                })
                .await
        })
    };
    tokio::task::yield_now().await;

    manager.shutdown().await;
    let result = queued.await.unwrap();
    assert!(result.is_err());
    assert_eq!(manager.queue_depth(ProviderType::Square).await, 0);
}
