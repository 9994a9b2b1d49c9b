//! Observability snapshot: health and usage per provider, aggregate totals and
//! cost/reliability recommendations.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::task::TaskKind;

use super::health::{CircuitState, HealthSnapshot};
use super::ledger::{ProviderUsage, UsageCounters};
use super::registry::ProviderDescriptor;

/// Share of all calls above which a single provider is flagged.
const DOMINANT_SHARE: f64 = 0.8;
/// Error rate above which a provider is flagged.
const ERROR_RATE_ALERT: f64 = 0.1;
/// Calls needed before an error rate is considered meaningful.
const ERROR_RATE_MIN_CALLS: u64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub id: String,
    pub local: bool,
    pub tasks: Vec<TaskKind>,
    pub cost_per_unit: BTreeMap<TaskKind, f64>,
    /// `None` only for providers the health monitor does not track.
    pub health: Option<HealthSnapshot>,
    pub usage: UsageCounters,
    pub avg_latency_ms: f64,
    pub by_kind: BTreeMap<TaskKind, UsageCounters>,
}

impl ProviderStatus {
    fn is_open(&self) -> bool {
        self.health
            .as_ref()
            .is_some_and(|h| h.state == CircuitState::Open)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Totals {
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_cost: f64,
    pub total_units: f64,
    pub open_circuits: usize,
}

/// Point-in-time view of the whole router.
#[derive(Debug, Clone, Serialize)]
pub struct RouterSnapshot {
    pub generated_at: DateTime<Utc>,
    pub providers: Vec<ProviderStatus>,
    pub totals: Totals,
    pub recommendations: Vec<String>,
}

impl RouterSnapshot {
    /// Join registry, health and ledger views by provider id.
    ///
    /// Only currently registered providers are listed; usage recorded for a
    /// provider that has since been removed still counts toward the totals.
    pub fn build(
        descriptors: &[Arc<ProviderDescriptor>],
        health: Vec<HealthSnapshot>,
        usage: Vec<ProviderUsage>,
    ) -> Self {
        let mut health: BTreeMap<String, HealthSnapshot> =
            health.into_iter().map(|h| (h.id.clone(), h)).collect();
        let mut usage: BTreeMap<String, ProviderUsage> =
            usage.into_iter().map(|u| (u.provider.clone(), u)).collect();

        let mut totals = Totals::default();
        for u in usage.values() {
            totals.total_calls += u.totals.total_calls;
            totals.total_successes += u.totals.total_successes;
            totals.total_failures += u.totals.total_failures;
            totals.total_cost += u.totals.total_cost;
            totals.total_units += u.totals.total_units;
        }

        let providers: Vec<ProviderStatus> = descriptors
            .iter()
            .map(|d| {
                let (usage, avg_latency_ms, by_kind) = match usage.remove(&d.id) {
                    Some(u) => (u.totals, u.avg_latency_ms, u.by_kind),
                    None => (UsageCounters::default(), 0.0, BTreeMap::new()),
                };
                ProviderStatus {
                    id: d.id.clone(),
                    local: d.local,
                    tasks: d.supported_tasks.iter().copied().collect(),
                    cost_per_unit: d.cost_per_unit.clone(),
                    health: health.remove(&d.id),
                    usage,
                    avg_latency_ms,
                    by_kind,
                }
            })
            .collect();
        totals.open_circuits = providers.iter().filter(|p| p.is_open()).count();

        let mut snapshot = Self {
            generated_at: Utc::now(),
            providers,
            totals,
            recommendations: Vec::new(),
        };
        snapshot.recommendations = recommendations(&snapshot);
        snapshot
    }
}

/// Human-readable hints derived from a snapshot.
pub fn recommendations(snapshot: &RouterSnapshot) -> Vec<String> {
    let mut hints = Vec::new();
    let total_calls = snapshot.totals.total_calls;

    for p in &snapshot.providers {
        let calls = p.usage.total_calls;

        if total_calls > 0 {
            let share = calls as f64 / total_calls as f64;
            if share > DOMINANT_SHARE {
                if let Some(cheaper) = cheaper_alternative(snapshot, p) {
                    hints.push(format!(
                        "{} handles {:.0}% of calls while {} is cheaper for the same tasks; consider caching or shifting traffic",
                        p.id,
                        share * 100.0,
                        cheaper
                    ));
                }
            }
        }

        if calls > ERROR_RATE_MIN_CALLS && p.usage.error_rate() > ERROR_RATE_ALERT {
            hints.push(format!(
                "{} has a {:.0}% error rate over {} calls; check configuration",
                p.id,
                p.usage.error_rate() * 100.0,
                calls
            ));
        }

        if p.is_open() {
            hints.push(format!(
                "{} circuit is open; it is excluded from routing until it recovers",
                p.id
            ));
        }
    }

    hints
}

/// Another provider serving one of `p`'s busiest task kinds at a lower unit cost.
fn cheaper_alternative<'s>(snapshot: &'s RouterSnapshot, p: &ProviderStatus) -> Option<&'s str> {
    p.by_kind
        .iter()
        .filter(|(_, c)| c.total_calls > 0)
        .find_map(|(kind, _)| {
            let own = p.cost_per_unit.get(kind).copied().unwrap_or(0.0);
            snapshot
                .providers
                .iter()
                .filter(|other| other.id != p.id && other.tasks.contains(kind))
                .filter(|other| other.cost_per_unit.get(kind).copied().unwrap_or(0.0) < own)
                .min_by(|a, b| {
                    let ca = a.cost_per_unit.get(kind).copied().unwrap_or(0.0);
                    let cb = b.cost_per_unit.get(kind).copied().unwrap_or(0.0);
                    ca.total_cmp(&cb).then_with(|| a.id.cmp(&b.id))
                })
                .map(|other| other.id.as_str())
        })
}
