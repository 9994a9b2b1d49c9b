//! Candidate ranking by declared cost, observed latency and declared preference.
//!
//! Pure: the scorer never reads shared state. The facade gathers a
//! [`ScoringInput`] per candidate and gets back a deterministic total order.
//!
//! Each term is normalized against the candidate set so weights are comparable:
//!
//! | Term             | Value                                     | Effect     |
//! |------------------|-------------------------------------------|------------|
//! | cost             | `cost / max_cost`                         | penalty    |
//! | latency          | `rolling_latency / max_rolling_latency`   | penalty    |
//! | load balance     | `calls / total_calls`                     | penalty    |
//! | priority         | `(hint - min_hint) / (max_hint - min_hint)` | bonus    |
//! | local preference | `1` for local providers when preferred    | bonus      |
//!
//! Providers without latency history get the candidate-set average, so a new
//! provider is neither favoured nor punished for being unknown.

use std::cmp::Ordering;

use serde::Serialize;

use crate::config::ScoringWeights;
use crate::task::{Constraints, TaskKind};

use super::registry::ProviderDescriptor;

/// Everything the scorer needs to know about one candidate.
#[derive(Debug, Clone)]
pub struct ScoringInput<'a> {
    pub descriptor: &'a ProviderDescriptor,
    pub consecutive_failures: u32,
    pub rolling_latency_ms: Option<f64>,
    pub recent_calls: u64,
}

/// A ranked candidate with its score (lower is better).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub id: String,
    pub score: f64,
    pub cost_per_unit: f64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Scorer {
    weights: ScoringWeights,
}

fn ratio(value: f64, max: f64) -> f64 {
    if max > 0.0 {
        value / max
    } else {
        0.0
    }
}

impl Scorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> ScoringWeights {
        self.weights
    }

    /// Rank `inputs` for a request of `kind`.
    ///
    /// Ties on score are broken by fewer consecutive failures, then by id.
    pub fn rank(
        &self,
        kind: TaskKind,
        constraints: &Constraints,
        inputs: &[ScoringInput<'_>],
    ) -> Vec<RankedCandidate> {
        if inputs.is_empty() {
            return Vec::new();
        }

        let costs: Vec<f64> = inputs.iter().map(|i| i.descriptor.cost_for(kind)).collect();
        let max_cost = costs.iter().copied().fold(0.0, f64::max);

        let known: Vec<f64> = inputs.iter().filter_map(|i| i.rolling_latency_ms).collect();
        let mean_latency = if known.is_empty() {
            0.0
        } else {
            known.iter().sum::<f64>() / known.len() as f64
        };
        let latencies: Vec<f64> = inputs
            .iter()
            .map(|i| i.rolling_latency_ms.unwrap_or(mean_latency))
            .collect();
        let max_latency = latencies.iter().copied().fold(0.0, f64::max);

        let total_calls: u64 = inputs.iter().map(|i| i.recent_calls).sum();

        let hints = inputs.iter().map(|i| i.descriptor.priority_hint);
        let min_hint = hints.clone().min().unwrap_or(0);
        let max_hint = hints.max().unwrap_or(0);
        let hint_span = f64::from(max_hint) - f64::from(min_hint);

        let mut ranked: Vec<RankedCandidate> = inputs
            .iter()
            .enumerate()
            .map(|(idx, input)| {
                let d = input.descriptor;
                let priority = ratio(f64::from(d.priority_hint) - f64::from(min_hint), hint_span);
                let local = if constraints.prefer_local && d.local {
                    1.0
                } else {
                    0.0
                };
                let load = ratio(input.recent_calls as f64, total_calls as f64);

                let score = self.weights.cost * ratio(costs[idx], max_cost)
                    + self.weights.latency * ratio(latencies[idx], max_latency)
                    + self.weights.load_balance * load
                    - self.weights.priority * priority
                    - self.weights.local_preference * local;

                RankedCandidate {
                    id: d.id.clone(),
                    score,
                    cost_per_unit: costs[idx],
                    consecutive_failures: input.consecutive_failures,
                }
            })
            .collect();

        ranked.sort_by(compare);
        ranked
    }
}

fn compare(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then(a.consecutive_failures.cmp(&b.consecutive_failures))
        .then_with(|| a.id.cmp(&b.id))
}
