//! Integration tests for end-to-end routing behavior.
//!
//! Verifies that:
//! - The cheaper healthy provider is tried first and a timeout falls through
//!   to the next candidate, with cost attributed to the provider that answered
//! - Providers with open circuits are skipped without a call
//! - A request fails fast when every capable circuit is open
//! - A short deadline stops the fallback chain
//! - Half-open allows exactly one trial, and the prober recovers an idle provider
//! - Race mode returns the fastest success and cancels the loser
//!
//! Providers are scripted in-process fakes behind the `Provider` trait.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use airoute::config::{HealthConfig, RoutingConfig};
use airoute::error::{FailureReason, RouterError};
use airoute::provider::{Provider, ProviderError, ProviderResponse};
use airoute::router::{CircuitState, ProviderDescriptor, RegisteredProvider, Router};
use airoute::task::{AttemptOutcome, Constraints, TaskKind, TaskRequest};

/// Number of failures needed to trip a circuit in these tests.
const FAILURE_THRESHOLD: u32 = 3;

/// What a scripted provider does on every call.
#[derive(Clone)]
enum Script {
    Answer { delay_ms: u64, body: &'static str },
    Fail { delay_ms: u64, error: ProviderError },
}

struct FakeProvider {
    id: String,
    script: std::sync::Mutex<Script>,
    alive: AtomicBool,
    calls: AtomicU32,
    probes: AtomicU32,
}

impl FakeProvider {
    fn new(id: &str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            script: std::sync::Mutex::new(script),
            alive: AtomicBool::new(true),
            calls: AtomicU32::new(0),
            probes: AtomicU32::new(0),
        })
    }

    fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, _kind: TaskKind) -> bool {
        true
    }

    async fn invoke(
        &self,
        _kind: TaskKind,
        _payload: Bytes,
        _timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap().clone();
        match script {
            Script::Answer { delay_ms, body } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(ProviderResponse::new(body))
            }
            Script::Fail { delay_ms, error } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Err(error)
            }
        }
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.alive.load(Ordering::SeqCst)
    }
}

fn answer(body: &'static str) -> Script {
    Script::Answer { delay_ms: 5, body }
}

fn server_error() -> Script {
    Script::Fail {
        delay_ms: 5,
        error: ProviderError::Status {
            code: 503,
            message: "overloaded".to_string(),
        },
    }
}

fn register(fake: &Arc<FakeProvider>, cost: f64) -> RegisteredProvider {
    RegisteredProvider::new(
        ProviderDescriptor {
            id: fake.id.clone(),
            supported_tasks: BTreeSet::from([TaskKind::Embedding, TaskKind::TextGeneration]),
            cost_per_unit: BTreeMap::from([(TaskKind::Embedding, cost), (TaskKind::TextGeneration, cost)]),
            rate_limit_per_minute: None,
            priority_hint: 0,
            local: false,
        },
        fake.clone(),
    )
}

fn health_config() -> HealthConfig {
    HealthConfig {
        failure_threshold: FAILURE_THRESHOLD,
        cooldown_secs: 30,
        max_cooldown_secs: 120,
        probe_interval_secs: 10,
    }
}

fn setup_router(providers: Vec<RegisteredProvider>, routing: RoutingConfig) -> Router {
    Router::new(providers, &health_config(), routing)
}

fn embed(deadline: Duration) -> TaskRequest {
    TaskRequest::new(TaskKind::Embedding, r#"{"input":"hello"}"#, deadline)
}

// ============================================================================
// Cheapest first, timeout falls through to the next candidate
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_on_cheapest_falls_back_with_correct_attribution() {
    let a = FakeProvider::new(
        "provider-a",
        Script::Fail {
            delay_ms: 200,
            error: ProviderError::Timeout,
        },
    );
    let b = FakeProvider::new("provider-b", answer("from-b"));
    let router = setup_router(
        vec![register(&b, 5.0), register(&a, 1.0)],
        RoutingConfig::default(),
    );

    let preview = router
        .preview(TaskKind::Embedding, &Constraints::default())
        .unwrap();
    assert_eq!(preview[0].id, "provider-a");

    let success = router.route(embed(Duration::from_secs(5))).await.unwrap();

    assert_eq!(success.provider_id, "provider-b");
    assert_eq!(success.cost, 5.0);
    assert_eq!(success.output, Bytes::from("from-b"));
    assert_eq!(success.attempts.len(), 2);
    assert_eq!(success.attempts[0].provider_id, "provider-a");
    assert_eq!(success.attempts[0].outcome, AttemptOutcome::Timeout);
    assert_eq!(success.attempts[1].outcome, AttemptOutcome::Success);
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
}

// ============================================================================
// Open circuits are skipped, all-open fails fast
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_open_circuit_skipped_until_cooldown() {
    let a = FakeProvider::new("provider-a", server_error());
    let b = FakeProvider::new("provider-b", answer("b"));
    let router = setup_router(
        vec![register(&a, 1.0), register(&b, 5.0)],
        RoutingConfig::default(),
    );

    for _ in 0..FAILURE_THRESHOLD {
        let success = router.route(embed(Duration::from_secs(5))).await.unwrap();
        assert_eq!(success.provider_id, "provider-b");
    }
    assert_eq!(router.health().state("provider-a"), Some(CircuitState::Open));
    assert_eq!(a.calls(), FAILURE_THRESHOLD);

    // Open: never called
    for _ in 0..5 {
        router.route(embed(Duration::from_secs(5))).await.unwrap();
    }
    assert_eq!(a.calls(), FAILURE_THRESHOLD);

    // After cooldown: exactly one trial, which succeeds and closes the circuit
    a.set_script(answer("a is back"));
    tokio::time::advance(Duration::from_secs(31)).await;
    let success = router.route(embed(Duration::from_secs(5))).await.unwrap();
    assert_eq!(success.provider_id, "provider-a");
    assert_eq!(router.health().state("provider-a"), Some(CircuitState::Closed));
    assert_eq!(router.health().consecutive_failures("provider-a"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_all_circuits_open_fails_without_calls() {
    let a = FakeProvider::new("provider-a", server_error());
    let b = FakeProvider::new("provider-b", server_error());
    let router = setup_router(
        vec![register(&a, 1.0), register(&b, 2.0)],
        RoutingConfig::default(),
    );

    for _ in 0..FAILURE_THRESHOLD {
        let err = router.route(embed(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, RouterError::AllProvidersFailed { .. }));
        assert_eq!(err.failures().len(), 2);
    }
    let calls_before = a.calls() + b.calls();

    let err = router.route(embed(Duration::from_secs(5))).await.unwrap_err();
    assert_eq!(a.calls() + b.calls(), calls_before);
    assert!(err
        .failures()
        .iter()
        .all(|f| f.reason == FailureReason::CircuitOpen));
    assert!(err.to_string().contains("provider-a (circuit open)"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_doubles_cooldown() {
    let a = FakeProvider::new("provider-a", server_error());
    let router = setup_router(vec![register(&a, 1.0)], RoutingConfig::default());

    for _ in 0..FAILURE_THRESHOLD {
        router.route(embed(Duration::from_secs(5))).await.unwrap_err();
    }

    tokio::time::advance(Duration::from_secs(31)).await;
    router.route(embed(Duration::from_secs(5))).await.unwrap_err();
    assert_eq!(a.calls(), FAILURE_THRESHOLD + 1);

    let snapshot = router.health().snapshot("provider-a").unwrap();
    assert_eq!(snapshot.state, CircuitState::Open);
    assert_eq!(snapshot.cooldown_secs, 60.0);

    // The original cooldown is no longer enough
    tokio::time::advance(Duration::from_secs(31)).await;
    router.route(embed(Duration::from_secs(5))).await.unwrap_err();
    assert_eq!(a.calls(), FAILURE_THRESHOLD + 1);
}

// ============================================================================
// Deadlines
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_deadline_short_circuits_remaining_candidates() {
    let slow = FakeProvider::new(
        "provider-a",
        Script::Answer {
            delay_ms: 60_000,
            body: "too late",
        },
    );
    let b = FakeProvider::new("provider-b", answer("b"));
    let router = setup_router(
        vec![register(&slow, 1.0), register(&b, 5.0)],
        RoutingConfig::default(),
    );

    let started = tokio::time::Instant::now();
    let err = router
        .route(embed(Duration::from_millis(500)))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(600));
    match &err {
        RouterError::DeadlineExceeded { kind, failures } => {
            assert_eq!(*kind, TaskKind::Embedding);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].reason, FailureReason::Timeout);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(b.calls(), 0);

    let usage = router
        .ledger()
        .counters("provider-a", TaskKind::Embedding)
        .unwrap();
    assert_eq!(usage.total_timeouts, 1);
    assert_eq!(router.health().consecutive_failures("provider-a"), 1);
}

// ============================================================================
// Background prober
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_prober_moves_live_open_provider_to_half_open() {
    let a = FakeProvider::new("provider-a", server_error());
    let router = setup_router(vec![register(&a, 1.0)], RoutingConfig::default());

    for _ in 0..FAILURE_THRESHOLD {
        router.route(embed(Duration::from_secs(5))).await.unwrap_err();
    }
    a.alive.store(false, Ordering::SeqCst);
    let prober = router.spawn_prober(Duration::from_secs(10));

    // Dead provider stays open
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(a.probes.load(Ordering::SeqCst), 1);
    assert_eq!(router.health().state("provider-a"), Some(CircuitState::Open));
    assert!(router
        .health()
        .snapshot("provider-a")
        .unwrap()
        .last_probe_at
        .is_some());

    // Alive again, but the 30s cooldown is still running
    a.alive.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(a.probes.load(Ordering::SeqCst), 2);
    assert_eq!(router.health().state("provider-a"), Some(CircuitState::Open));

    // First probe after the cooldown hands out the trial without any traffic
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(router.health().state("provider-a"), Some(CircuitState::HalfOpen));
    assert_eq!(a.calls(), FAILURE_THRESHOLD);

    a.set_script(answer("recovered"));
    let success = router.route(embed(Duration::from_secs(5))).await.unwrap();
    assert_eq!(success.provider_id, "provider-a");
    assert_eq!(router.health().state("provider-a"), Some(CircuitState::Closed));

    prober.shutdown().await;
}

// ============================================================================
// Race mode
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_race_mode_takes_fastest_and_cancels_loser() {
    let cheap_slow = FakeProvider::new(
        "provider-a",
        Script::Answer {
            delay_ms: 800,
            body: "slow",
        },
    );
    let pricey_fast = FakeProvider::new(
        "provider-b",
        Script::Answer {
            delay_ms: 20,
            body: "fast",
        },
    );
    let routing = RoutingConfig {
        race: vec![TaskKind::TextGeneration],
        ..Default::default()
    };
    let router = setup_router(
        vec![register(&cheap_slow, 1.0), register(&pricey_fast, 3.0)],
        routing,
    );

    let request = TaskRequest::new(TaskKind::TextGeneration, "prompt", Duration::from_secs(5));
    let success = router.route(request).await.unwrap();

    assert_eq!(success.provider_id, "provider-b");
    assert_eq!(success.output, Bytes::from("fast"));
    assert_eq!(cheap_slow.calls(), 1);
    let loser = success
        .attempts
        .iter()
        .find(|a| a.provider_id == "provider-a")
        .unwrap();
    assert_eq!(loser.outcome, AttemptOutcome::Cancelled);
    assert_eq!(router.health().consecutive_failures("provider-a"), 0);

    // Kinds not configured for racing stay sequential
    let success = router.route(embed(Duration::from_secs(5))).await.unwrap();
    assert_eq!(success.provider_id, "provider-a");
    assert_eq!(pricey_fast.calls(), 1);
}

// ============================================================================
// Usage ledger through the facade
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_snapshot_reports_usage_and_health() {
    let a = FakeProvider::new("provider-a", answer("a"));
    let b = FakeProvider::new("provider-b", server_error());
    let router = setup_router(
        vec![register(&b, 0.5), register(&a, 2.0)],
        RoutingConfig::default(),
    );

    for _ in 0..2 {
        router.route(embed(Duration::from_secs(5))).await.unwrap();
    }

    let snapshot = router.snapshot();
    assert_eq!(snapshot.providers.len(), 2);
    assert_eq!(snapshot.totals.total_calls, 4);
    assert_eq!(snapshot.totals.total_successes, 2);
    assert_eq!(snapshot.totals.total_failures, 2);
    assert_eq!(snapshot.totals.total_cost, 4.0);

    let b_status = &snapshot.providers[1];
    assert_eq!(b_status.id, "provider-b");
    assert_eq!(b_status.usage.total_failures, 2);
    assert_eq!(b_status.health.as_ref().unwrap().consecutive_failures, 2);
}
