//! Usage ledger: per-provider, per-task-kind call, cost and latency counters.
//!
//! Each (provider, kind) cell is guarded by its own mutex and a whole attempt is
//! applied under one lock acquisition, so a reader can never observe cost
//! updated without the matching call count. Recording never fails and never
//! does I/O.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use dashmap::DashMap;
use serde::Serialize;

use crate::task::{AttemptOutcome, RouteAttempt, TaskKind};

/// Counters for one (provider, kind) cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageCounters {
    /// Every recorded attempt, including cancelled race losers.
    pub total_calls: u64,
    pub total_successes: u64,
    /// Failures and timeouts.
    pub total_failures: u64,
    pub total_timeouts: u64,
    pub total_cancelled: u64,
    pub total_cost: f64,
    pub total_units: f64,
    pub total_latency_ms: f64,
    /// Exponentially weighted moving average of observed latency.
    pub rolling_latency_ms: Option<f64>,
}

impl UsageCounters {
    fn apply(&mut self, attempt: &RouteAttempt, alpha: f64) {
        let latency_ms = attempt.latency.as_micros() as f64 / 1000.0;

        self.total_calls += 1;
        self.total_cost += attempt.cost_incurred;
        self.total_units += attempt.units;

        match attempt.outcome {
            AttemptOutcome::Success => self.total_successes += 1,
            AttemptOutcome::Failure(_) => self.total_failures += 1,
            AttemptOutcome::Timeout => {
                self.total_failures += 1;
                self.total_timeouts += 1;
            }
            AttemptOutcome::Cancelled => self.total_cancelled += 1,
        }

        // Cancelled attempts were cut short by us, so their latency says nothing
        // about the provider.
        if attempt.outcome != AttemptOutcome::Cancelled {
            self.total_latency_ms += latency_ms;
            self.rolling_latency_ms = Some(match self.rolling_latency_ms {
                Some(prev) => prev * (1.0 - alpha) + latency_ms * alpha,
                None => latency_ms,
            });
        }
    }

    /// Fold another cell in. Rolling latencies combine weighted by timed calls.
    fn merge(&mut self, other: &UsageCounters) {
        let (mine, theirs) = (self.timed_calls() as f64, other.timed_calls() as f64);
        self.rolling_latency_ms = match (self.rolling_latency_ms, other.rolling_latency_ms) {
            (Some(a), Some(b)) => Some((a * mine + b * theirs) / (mine + theirs)),
            (a, b) => a.or(b),
        };

        self.total_calls += other.total_calls;
        self.total_successes += other.total_successes;
        self.total_failures += other.total_failures;
        self.total_timeouts += other.total_timeouts;
        self.total_cancelled += other.total_cancelled;
        self.total_cost += other.total_cost;
        self.total_units += other.total_units;
        self.total_latency_ms += other.total_latency_ms;
    }

    /// Calls whose latency was measured.
    fn timed_calls(&self) -> u64 {
        self.total_calls - self.total_cancelled
    }

    /// Mean latency over all measured attempts.
    pub fn avg_latency_ms(&self) -> f64 {
        match self.timed_calls() {
            0 => 0.0,
            n => self.total_latency_ms / n as f64,
        }
    }

    /// Fraction of non-cancelled attempts that failed.
    pub fn error_rate(&self) -> f64 {
        match self.timed_calls() {
            0 => 0.0,
            n => self.total_failures as f64 / n as f64,
        }
    }
}

/// Aggregated usage for one provider across task kinds.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderUsage {
    pub provider: String,
    pub totals: UsageCounters,
    pub avg_latency_ms: f64,
    pub by_kind: BTreeMap<TaskKind, UsageCounters>,
}

/// Concurrent usage ledger.
pub struct UsageLedger {
    cells: DashMap<(String, TaskKind), Mutex<UsageCounters>>,
    latency_alpha: f64,
}

fn lock(m: &Mutex<UsageCounters>) -> MutexGuard<'_, UsageCounters> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl UsageLedger {
    /// `latency_alpha` is the weight of the newest sample in the rolling latency.
    pub fn new(latency_alpha: f64) -> Self {
        Self {
            cells: DashMap::new(),
            latency_alpha,
        }
    }

    /// Apply one attempt to its (provider, kind) cell.
    pub fn record(&self, provider_id: &str, kind: TaskKind, attempt: &RouteAttempt) {
        let cell = self
            .cells
            .entry((provider_id.to_string(), kind))
            .or_default()
            .downgrade();
        lock(cell.value()).apply(attempt, self.latency_alpha);
    }

    /// Counters for a single cell.
    pub fn counters(&self, provider_id: &str, kind: TaskKind) -> Option<UsageCounters> {
        self.cells
            .get(&(provider_id.to_string(), kind))
            .map(|cell| lock(cell.value()).clone())
    }

    /// Rolling latency for a provider on one task kind, if any attempt was timed.
    pub fn rolling_latency_ms(&self, provider_id: &str, kind: TaskKind) -> Option<f64> {
        self.counters(provider_id, kind)
            .and_then(|c| c.rolling_latency_ms)
    }

    /// Total calls for a provider on one task kind.
    pub fn calls(&self, provider_id: &str, kind: TaskKind) -> u64 {
        self.counters(provider_id, kind)
            .map(|c| c.total_calls)
            .unwrap_or(0)
    }

    /// Per-provider report, ordered by provider id.
    pub fn snapshot(&self) -> Vec<ProviderUsage> {
        let mut by_provider: BTreeMap<String, BTreeMap<TaskKind, UsageCounters>> = BTreeMap::new();
        for cell in self.cells.iter() {
            let (provider, kind) = cell.key();
            let counters = lock(cell.value()).clone();
            by_provider
                .entry(provider.clone())
                .or_default()
                .insert(*kind, counters);
        }

        by_provider
            .into_iter()
            .map(|(provider, by_kind)| {
                let mut totals = UsageCounters::default();
                for counters in by_kind.values() {
                    totals.merge(counters);
                }
                ProviderUsage {
                    provider,
                    avg_latency_ms: totals.avg_latency_ms(),
                    totals,
                    by_kind,
                }
            })
            .collect()
    }

    /// Admin action: drop every counter for one provider.
    pub fn reset(&self, provider_id: &str) {
        self.cells.retain(|(provider, _), _| provider != provider_id);
    }

    pub fn reset_all(&self) {
        self.cells.clear();
    }
}
