//! Stress tests for shared state under concurrent routing.
//!
//! Many `route` calls run on a multi-threaded runtime against the same
//! providers; the ledger totals must equal the sum of the individual
//! outcomes, and concurrent failures must never be lost by the breaker.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use airoute::config::{HealthConfig, RoutingConfig};
use airoute::provider::{Provider, ProviderError, ProviderResponse};
use airoute::router::health::PermitType;
use airoute::router::{CircuitState, HealthMonitor, ProviderDescriptor, RegisteredProvider, Router};
use airoute::task::{TaskKind, TaskRequest};

const REQUESTS: u32 = 200;

/// Fails every `fail_every`-th call (0 = never), counted across all callers.
struct Flaky {
    id: String,
    fail_every: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(id: &str, fail_every: u32) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            fail_every,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Provider for Flaky {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, kind: TaskKind) -> bool {
        kind == TaskKind::Embedding
    }

    async fn invoke(
        &self,
        _kind: TaskKind,
        _payload: Bytes,
        _timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(ProviderError::Status {
                code: 500,
                message: "flaky".to_string(),
            });
        }
        Ok(ProviderResponse::new(r#"{"ok":true}"#))
    }

    async fn probe(&self) -> bool {
        true
    }
}

fn register(fake: &Arc<Flaky>, cost: f64) -> RegisteredProvider {
    RegisteredProvider::new(
        ProviderDescriptor {
            id: fake.id.clone(),
            supported_tasks: BTreeSet::from([TaskKind::Embedding]),
            cost_per_unit: BTreeMap::from([(TaskKind::Embedding, cost)]),
            rate_limit_per_minute: None,
            priority_hint: 0,
            local: false,
        },
        fake.clone(),
    )
}

/// A threshold no test reaches, so every request sees both providers.
fn lenient_health() -> HealthConfig {
    HealthConfig {
        failure_threshold: 10_000,
        ..HealthConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_routes_keep_ledger_consistent() {
    let flaky = Flaky::new("flaky", 3);
    let steady = Flaky::new("steady", 0);
    let router = Arc::new(Router::new(
        vec![register(&flaky, 1.0), register(&steady, 5.0)],
        &lenient_health(),
        RoutingConfig::default(),
    ));

    let handles: Vec<_> = (0..REQUESTS)
        .map(|_| {
            let router = router.clone();
            tokio::spawn(async move {
                let request =
                    TaskRequest::new(TaskKind::Embedding, "{}", Duration::from_secs(10));
                router.route(request).await
            })
        })
        .collect();

    let mut successes = 0;
    let mut attempts = 0;
    let mut cost = 0.0;
    for handle in futures::future::join_all(handles).await {
        let success = handle.expect("task panicked").expect("route failed");
        successes += 1;
        attempts += success.attempts.len() as u64;
        cost += success.cost;
    }
    assert_eq!(successes, REQUESTS);

    // indices 0, 3, ..., 198 fail
    let expected_failures = (REQUESTS + 2) / 3;
    assert_eq!(flaky.calls.load(Ordering::SeqCst), REQUESTS);
    assert_eq!(steady.calls.load(Ordering::SeqCst), expected_failures);

    let a = router.ledger().counters("flaky", TaskKind::Embedding).unwrap();
    let b = router.ledger().counters("steady", TaskKind::Embedding).unwrap();
    assert_eq!(a.total_calls, REQUESTS as u64);
    assert_eq!(a.total_failures, expected_failures as u64);
    assert_eq!(a.total_successes, (REQUESTS - expected_failures) as u64);
    assert_eq!(b.total_calls, expected_failures as u64);
    assert_eq!(b.total_successes, expected_failures as u64);
    assert_eq!(a.total_calls + b.total_calls, attempts);

    let snapshot = router.snapshot();
    assert_eq!(snapshot.totals.total_calls, attempts);
    assert_eq!(snapshot.totals.total_successes, REQUESTS as u64);
    assert_eq!(snapshot.totals.total_cost, cost);
    assert_eq!(
        cost,
        (REQUESTS - expected_failures) as f64 * 1.0 + expected_failures as f64 * 5.0
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_are_not_lost() {
    let monitor = Arc::new(HealthMonitor::new(
        &["shared".to_string()],
        &lenient_health(),
    ));

    let handles: Vec<_> = (0..REQUESTS)
        .map(|_| {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor.record_failure("shared", PermitType::Normal, "5xx", "boom");
            })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        handle.expect("task panicked");
    }

    assert_eq!(monitor.consecutive_failures("shared"), REQUESTS);
    assert_eq!(monitor.state("shared"), Some(CircuitState::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_trip_circuit_once() {
    let config = HealthConfig {
        failure_threshold: 3,
        ..HealthConfig::default()
    };
    let monitor = Arc::new(HealthMonitor::new(&["shared".to_string()], &config));

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor.record_failure("shared", PermitType::Normal, "timeout", "slow");
            })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        handle.expect("task panicked");
    }

    let snap = monitor.snapshot("shared").unwrap();
    assert_eq!(snap.state, CircuitState::Open);
    assert_eq!(snap.trip_count, 1);
    assert!(monitor.acquire_permit("shared").is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reload_under_traffic_tracks_every_new_provider_failure() {
    let steady = Flaky::new("steady", 0);
    let broken = Flaky::new("broken", 1);
    let router = Arc::new(Router::new(
        vec![register(&steady, 5.0)],
        &lenient_health(),
        RoutingConfig::default(),
    ));

    let handles: Vec<_> = (0..REQUESTS)
        .map(|_| {
            let router = router.clone();
            tokio::spawn(async move {
                let request =
                    TaskRequest::new(TaskKind::Embedding, "{}", Duration::from_secs(10));
                router.route(request).await
            })
        })
        .collect();

    // cheaper and always failing, so every route after the swap tries it first
    router.reload(vec![register(&steady, 5.0), register(&broken, 1.0)]);

    for handle in futures::future::join_all(handles).await {
        let success = handle.expect("task panicked").expect("route failed");
        assert_eq!(success.provider_id, "steady");
    }

    let failures = router
        .ledger()
        .counters("broken", TaskKind::Embedding)
        .map(|c| c.total_failures)
        .unwrap_or(0);
    assert_eq!(failures, broken.calls.load(Ordering::SeqCst) as u64);
    assert_eq!(
        router.health().consecutive_failures("broken") as u64,
        failures
    );
}
