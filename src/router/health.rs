//! Circuit breaker state machine for per-provider health tracking.
//!
//! Implements the Closed -> Open -> Half-Open -> Closed lifecycle:
//! - **Closed**: requests flow normally, consecutive failures are counted
//! - **Open**: the provider is excluded until its cooldown expires
//! - **Half-Open**: a single trial request is allowed to test recovery
//!
//! A failed trial reopens the circuit with the cooldown doubled (capped), so a
//! still-degraded provider is retried less and less often.
//!
//! This module contains:
//! - Core state machine (`CircuitBreakerInner`)
//! - Concurrent monitor (`HealthMonitor`) backed by DashMap, one mutex per provider
//! - Background liveness prober (`HealthProber`) for open circuits

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::registry::CapabilityRegistry;
use crate::config::HealthConfig;

/// The three states of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation. Requests flow through, failures are counted.
    Closed,
    /// Circuit tripped. The provider is skipped until the cooldown expires.
    Open,
    /// Recovery trial. One request is allowed through to test provider health.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase string representation for JSON serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Result of checking circuit breaker state for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckResult {
    /// Circuit is Closed -- request may proceed.
    Allowed,
    /// Caller has been granted the single trial permit.
    TrialPermit,
    /// Circuit is Open, or Half-Open with the trial already taken.
    Rejected,
}

/// Information about the last error recorded against a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    /// Category of the error (e.g., "5xx", "timeout").
    pub error_type: String,
    /// Human-readable error message.
    pub message: String,
}

/// Error returned when a provider's circuit is not accepting traffic.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Circuit breaker open for provider '{provider}': {reason}")]
pub struct CircuitOpenError {
    pub provider: String,
    pub reason: String,
    pub trip_count: u32,
}

/// Type of permit returned by [`HealthMonitor::acquire_permit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitType {
    /// Normal request through a closed circuit.
    Normal,
    /// The single trial through a half-open circuit.
    Trial,
}

/// Breaker tuning, derived from [`HealthConfig`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

impl From<&HealthConfig> for BreakerSettings {
    fn from(config: &HealthConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown(),
            max_cooldown: config.max_cooldown(),
        }
    }
}

/// Core circuit breaker state machine (not thread-safe on its own).
pub(crate) struct CircuitBreakerInner {
    pub(crate) state: CircuitState,
    /// Consecutive failure count (resets on success).
    pub(crate) consecutive_failures: u32,
    /// When the circuit transitioned to Open (for cooldown calculation).
    pub(crate) opened_at: Option<Instant>,
    pub(crate) opened_at_wall: Option<DateTime<Utc>>,
    /// Current Open duration; doubles on every failed trial.
    pub(crate) cooldown: Duration,
    pub(crate) last_probe_at: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<LastError>,
    /// Total number of times this circuit has tripped open from Closed.
    pub(crate) trip_count: u32,
    /// Whether the Half-Open trial permit is currently held.
    pub(crate) trial_in_flight: bool,
    settings: BreakerSettings,
}

impl CircuitBreakerInner {
    /// Create a new circuit breaker in the Closed state.
    pub(crate) fn new(settings: BreakerSettings) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            opened_at_wall: None,
            cooldown: settings.cooldown,
            last_probe_at: None,
            last_error: None,
            trip_count: 0,
            trial_in_flight: false,
            settings,
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        self.opened_at
            .map(|opened_at| Instant::now().duration_since(opened_at) >= self.cooldown)
            .unwrap_or(true)
    }

    /// Whether a request could currently be let through, without mutating.
    pub(crate) fn is_eligible(&self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_elapsed(),
            CircuitState::HalfOpen => !self.trial_in_flight,
        }
    }

    /// Check whether a request should be allowed through.
    ///
    /// Implements lazy Open -> Half-Open transition when the cooldown expires.
    pub(crate) fn check_state(&mut self, provider_id: &str) -> CheckResult {
        match self.state {
            CircuitState::Closed => CheckResult::Allowed,
            CircuitState::Open => {
                if self.cooldown_elapsed() {
                    self.enter_half_open(provider_id, "cooldown expired");
                    self.try_acquire_trial()
                } else {
                    CheckResult::Rejected
                }
            }
            CircuitState::HalfOpen => self.try_acquire_trial(),
        }
    }

    fn enter_half_open(&mut self, provider_id: &str, why: &str) {
        self.state = CircuitState::HalfOpen;
        self.trial_in_flight = false;
        tracing::info!(provider = %provider_id, "circuit entering Half-Open: {}", why);
    }

    fn try_acquire_trial(&mut self) -> CheckResult {
        if self.trial_in_flight {
            CheckResult::Rejected
        } else {
            self.trial_in_flight = true;
            CheckResult::TrialPermit
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
        self.trial_in_flight = false;
    }

    /// Record a failed normal request.
    ///
    /// Increments the consecutive failure counter. Reaching the threshold while
    /// Closed trips the circuit; failures that land after the circuit already
    /// left Closed are counted without restarting the cooldown.
    pub(crate) fn record_failure(&mut self, provider_id: &str, error_type: &str, message: &str) {
        self.consecutive_failures += 1;
        self.last_error = Some(LastError {
            error_type: error_type.to_string(),
            message: message.to_string(),
        });

        if self.state == CircuitState::Closed
            && self.consecutive_failures >= self.settings.failure_threshold
        {
            self.cooldown = self.settings.cooldown;
            self.open();
            self.trip_count += 1;

            tracing::warn!(
                provider = %provider_id,
                consecutive_failures = self.consecutive_failures,
                last_error = ?self.last_error,
                trip_count = self.trip_count,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit OPENED: {} consecutive failures",
                self.consecutive_failures,
            );
        }
    }

    /// Record a successful normal request. Resets the failure counter while Closed.
    pub(crate) fn record_success(&mut self, provider_id: &str) {
        if self.state == CircuitState::Closed {
            self.consecutive_failures = 0;
            tracing::trace!(provider = %provider_id, "circuit breaker: success recorded");
        }
    }

    /// The Half-Open trial succeeded: Half-Open -> Closed.
    pub(crate) fn record_trial_success(&mut self, provider_id: &str) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        self.cooldown = self.settings.cooldown;
        self.opened_at = None;
        self.opened_at_wall = None;

        tracing::info!(
            provider = %provider_id,
            trip_count = self.trip_count,
            "circuit CLOSED: trial succeeded",
        );
    }

    /// The Half-Open trial failed: Half-Open -> Open with a doubled cooldown.
    pub(crate) fn record_trial_failure(&mut self, provider_id: &str, error_type: &str, message: &str) {
        self.consecutive_failures += 1;
        self.cooldown = (self.cooldown * 2).min(self.settings.max_cooldown);
        self.open();
        self.last_error = Some(LastError {
            error_type: error_type.to_string(),
            message: message.to_string(),
        });

        tracing::warn!(
            provider = %provider_id,
            trip_count = self.trip_count,
            cooldown_secs = self.cooldown.as_secs(),
            "circuit REOPENED: trial failed",
        );
    }

    /// Give the trial permit back without a verdict.
    pub(crate) fn release_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    /// Apply a background liveness probe result.
    ///
    /// A live Open provider whose cooldown has run out moves to Half-Open so the
    /// next request becomes its trial. Inside the cooldown, or when the probe
    /// fails, the circuit stays Open.
    pub(crate) fn record_liveness(&mut self, provider_id: &str, alive: bool) {
        self.last_probe_at = Some(Utc::now());
        if self.state != CircuitState::Open {
            return;
        }
        if alive {
            if self.cooldown_elapsed() {
                self.enter_half_open(provider_id, "liveness probe succeeded");
            } else {
                tracing::trace!(provider = %provider_id, "provider alive, cooldown still running");
            }
        } else {
            self.last_error = Some(LastError {
                error_type: "probe".to_string(),
                message: "liveness probe failed".to_string(),
            });
            tracing::debug!(provider = %provider_id, "liveness probe failed, circuit stays Open");
        }
    }

    fn snapshot(&self, id: &str) -> HealthSnapshot {
        HealthSnapshot {
            id: id.to_string(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            trip_count: self.trip_count,
            cooldown_secs: self.cooldown.as_secs_f64(),
            opened_at: self.opened_at_wall,
            last_probe_at: self.last_probe_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Snapshot of a single provider's health, safe to hand to readers.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trip_count: u32,
    pub cooldown_secs: f64,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
}

/// Concurrent health store with one breaker per provider.
///
/// Backed by [`DashMap`] for per-shard locking; each breaker has its own mutex,
/// so concurrent outcomes for one provider are serialized and never lost while
/// different providers never contend.
pub struct HealthMonitor {
    breakers: DashMap<String, Mutex<CircuitBreakerInner>>,
    settings: BreakerSettings,
}

fn lock(m: &Mutex<CircuitBreakerInner>) -> MutexGuard<'_, CircuitBreakerInner> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl HealthMonitor {
    /// Create a monitor with one Closed breaker per provider id.
    pub fn new(provider_ids: &[String], config: &HealthConfig) -> Self {
        let settings = BreakerSettings::from(config);
        let breakers = DashMap::with_capacity(provider_ids.len());
        for id in provider_ids {
            breakers.insert(id.clone(), Mutex::new(CircuitBreakerInner::new(settings)));
        }
        Self { breakers, settings }
    }

    /// Create Closed breakers for ids not tracked yet. Existing breakers keep
    /// their state.
    pub fn add_providers(&self, provider_ids: &[String]) {
        for id in provider_ids {
            self.breakers
                .entry(id.clone())
                .or_insert_with(|| Mutex::new(CircuitBreakerInner::new(self.settings)));
        }
    }

    /// Drop breakers for ids not in `provider_ids`.
    pub fn retain_providers(&self, provider_ids: &[String]) {
        self.breakers.retain(|id, _| provider_ids.contains(id));
    }

    /// Non-mutating eligibility check used to filter candidates before scoring.
    ///
    /// Unknown providers are eligible (circuit breaking is opt-in per id).
    pub fn is_eligible(&self, provider_id: &str) -> bool {
        self.breakers
            .get(provider_id)
            .map(|entry| lock(entry.value()).is_eligible())
            .unwrap_or(true)
    }

    /// Check whether a request to `provider_id` may proceed right now.
    ///
    /// Returns `Ok(PermitType::Normal)` for closed circuits,
    /// `Ok(PermitType::Trial)` for the single half-open trial permit,
    /// or `Err(CircuitOpenError)` otherwise. Never waits.
    pub fn acquire_permit(&self, provider_id: &str) -> Result<PermitType, CircuitOpenError> {
        let Some(entry) = self.breakers.get(provider_id) else {
            return Ok(PermitType::Normal);
        };
        let mut inner = lock(entry.value());
        match inner.check_state(provider_id) {
            CheckResult::Allowed => Ok(PermitType::Normal),
            CheckResult::TrialPermit => Ok(PermitType::Trial),
            CheckResult::Rejected => Err(CircuitOpenError {
                provider: provider_id.to_string(),
                reason: inner
                    .last_error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.error_type, e.message))
                    .unwrap_or_else(|| "trial in flight".to_string()),
                trip_count: inner.trip_count,
            }),
        }
    }

    /// Record a successful attempt made under `permit`.
    pub fn record_success(&self, provider_id: &str, permit: PermitType) {
        if let Some(entry) = self.breakers.get(provider_id) {
            let mut inner = lock(entry.value());
            match permit {
                PermitType::Normal => inner.record_success(provider_id),
                PermitType::Trial => inner.record_trial_success(provider_id),
            }
        }
    }

    /// Record a failed attempt made under `permit`.
    pub fn record_failure(&self, provider_id: &str, permit: PermitType, error_type: &str, message: &str) {
        if let Some(entry) = self.breakers.get(provider_id) {
            let mut inner = lock(entry.value());
            match permit {
                PermitType::Normal => inner.record_failure(provider_id, error_type, message),
                PermitType::Trial => inner.record_trial_failure(provider_id, error_type, message),
            }
        }
    }

    /// Return an unused trial permit (e.g. the attempt was cancelled after losing a race).
    pub fn release_permit(&self, provider_id: &str, permit: PermitType) {
        if permit == PermitType::Trial {
            if let Some(entry) = self.breakers.get(provider_id) {
                lock(entry.value()).release_trial();
            }
        }
    }

    /// Apply a background liveness probe result.
    pub fn record_liveness(&self, provider_id: &str, alive: bool) {
        if let Some(entry) = self.breakers.get(provider_id) {
            lock(entry.value()).record_liveness(provider_id, alive);
        }
    }

    /// Ids of providers currently in the Open state.
    pub fn open_providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| lock(entry.value()).state == CircuitState::Open)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self, provider_id: &str) -> Option<HealthSnapshot> {
        self.breakers
            .get(provider_id)
            .map(|entry| lock(entry.value()).snapshot(provider_id))
    }

    /// Snapshot of every provider, ordered by id.
    pub fn all_snapshots(&self) -> Vec<HealthSnapshot> {
        let mut snapshots: Vec<HealthSnapshot> = self
            .breakers
            .iter()
            .map(|entry| lock(entry.value()).snapshot(entry.key()))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub fn state(&self, provider_id: &str) -> Option<CircuitState> {
        self.breakers
            .get(provider_id)
            .map(|entry| lock(entry.value()).state)
    }

    pub fn consecutive_failures(&self, provider_id: &str) -> u32 {
        self.breakers
            .get(provider_id)
            .map(|entry| lock(entry.value()).consecutive_failures)
            .unwrap_or(0)
    }

    /// Admin action: put a provider back into a fresh Closed state.
    /// Returns false for unknown ids.
    pub fn reset(&self, provider_id: &str) -> bool {
        match self.breakers.get(provider_id) {
            Some(entry) => {
                *lock(entry.value()) = CircuitBreakerInner::new(self.settings);
                tracing::info!(provider = %provider_id, "circuit reset by admin");
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            *lock(entry.value()) = CircuitBreakerInner::new(self.settings);
        }
        tracing::info!("all circuits reset by admin");
    }
}

// ── Background prober ────────────────────────────────────────────────

/// Periodic liveness checks for open providers, independent of traffic.
///
/// Communicates only through the [`HealthMonitor`]; cancelled via
/// `CancellationToken`.
pub struct HealthProber {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthProber {
    /// Start probing every `interval`. The first round runs one interval after start.
    pub fn spawn(
        monitor: Arc<HealthMonitor>,
        registry: Arc<CapabilityRegistry>,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = interval.as_secs(), "health prober started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        probe_open_providers(&monitor, &registry).await;
                    }
                }
            }

            tracing::info!("health prober stopped");
        });

        Self { cancel, handle }
    }

    /// Stop the prober and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "health prober task ended abnormally");
        }
    }
}

/// Probe every currently-open provider once. Returns how many were probed.
pub async fn probe_open_providers(monitor: &HealthMonitor, registry: &CapabilityRegistry) -> usize {
    let targets: Vec<_> = monitor
        .open_providers()
        .into_iter()
        .filter_map(|id| registry.get(&id))
        .collect();

    let results = futures::future::join_all(targets.iter().map(|entry| async move {
        (entry.id().to_string(), entry.provider.probe().await)
    }))
    .await;

    for (id, alive) in &results {
        monitor.record_liveness(id, *alive);
    }
    results.len()
}
