//! Fallback executor.
//!
//! Walks the ranked candidate list and returns the first success:
//! - Sequential by default: one provider at a time, strictly in ranked order
//! - Race mode: the top `race_width` admitted candidates run concurrently, the
//!   first success wins and the rest are cancelled; if every racer fails the
//!   remaining candidates are tried sequentially
//!
//! Every attempt is wrapped in an [`AttemptGuard`] that records exactly one
//! outcome to the health monitor and the usage ledger. A guard dropped before
//! it settles (the caller stopped waiting) records a timeout, so neither store
//! is ever left half-updated.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{AttemptFailure, FailureReason, RouterError};
use crate::provider::{Provider, ProviderError, ProviderResponse};
use crate::task::{AttemptOutcome, RouteAttempt, TaskKind, TaskRequest};

use super::health::{HealthMonitor, PermitType};
use super::ledger::UsageLedger;
use super::rate_limit::RateLimiter;
use super::registry::RegisteredProvider;

/// Successful routing result with provider attribution.
#[derive(Debug, Clone, Serialize)]
pub struct RouteSuccess {
    #[serde(skip)]
    pub output: Bytes,
    pub provider_id: String,
    pub cost: f64,
    pub units: f64,
    #[serde(rename = "latency_ms", serialize_with = "ser_millis")]
    pub latency: Duration,
    /// Every attempt made for this request, including failures and cancelled racers.
    pub attempts: Vec<RouteAttempt>,
}

fn ser_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Records one attempt's outcome exactly once.
struct AttemptGuard<'a> {
    health: &'a HealthMonitor,
    ledger: &'a UsageLedger,
    provider_id: String,
    kind: TaskKind,
    permit: PermitType,
    cost_per_unit: f64,
    started: Instant,
    started_at: DateTime<Utc>,
    settled: bool,
}

impl<'a> AttemptGuard<'a> {
    fn settle(&mut self, outcome: AttemptOutcome, units: f64) -> RouteAttempt {
        self.settled = true;
        let attempt = RouteAttempt {
            provider_id: self.provider_id.clone(),
            started_at: self.started_at,
            outcome,
            cost_incurred: self.cost_per_unit * units,
            units,
            latency: self.started.elapsed(),
        };
        self.ledger.record(&self.provider_id, self.kind, &attempt);
        attempt
    }

    fn succeed(mut self, units: f64) -> RouteAttempt {
        self.health.record_success(&self.provider_id, self.permit);
        self.settle(AttemptOutcome::Success, units)
    }

    fn fail(mut self, err: &ProviderError) -> RouteAttempt {
        let message = err.to_string();
        self.health
            .record_failure(&self.provider_id, self.permit, err.category(), &message);
        let outcome = match err {
            ProviderError::Timeout => AttemptOutcome::Timeout,
            _ => AttemptOutcome::Failure(message),
        };
        self.settle(outcome, 0.0)
    }

    /// Lost a race: no health verdict, the trial permit (if any) goes back.
    fn cancel(mut self) -> RouteAttempt {
        self.health.release_permit(&self.provider_id, self.permit);
        self.settle(AttemptOutcome::Cancelled, 0.0)
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(
            provider = %self.provider_id,
            kind = %self.kind,
            "attempt abandoned in flight, recording timeout"
        );
        self.health.record_failure(
            &self.provider_id,
            self.permit,
            "timeout",
            "attempt abandoned before completion",
        );
        self.settle(AttemptOutcome::Timeout, 0.0);
    }
}

/// A candidate that passed admission and is about to be called.
struct Launch<'a> {
    guard: AttemptGuard<'a>,
    provider: Arc<dyn Provider>,
    timeout: Duration,
}

/// Attempts and failures accumulated over one request.
#[derive(Default)]
struct Trail {
    attempts: Vec<RouteAttempt>,
    failures: Vec<AttemptFailure>,
}

impl Trail {
    fn skip(&mut self, provider: &str, reason: FailureReason) {
        self.failures.push(AttemptFailure {
            provider: provider.to_string(),
            reason,
        });
    }
}

fn failure_reason(err: &ProviderError) -> FailureReason {
    match err {
        ProviderError::Timeout => FailureReason::Timeout,
        other => FailureReason::Provider {
            category: other.category().to_string(),
            message: other.to_string(),
        },
    }
}

async fn call(
    provider: Arc<dyn Provider>,
    kind: TaskKind,
    payload: Bytes,
    timeout: Duration,
) -> Result<ProviderResponse, ProviderError> {
    match tokio::time::timeout(timeout, provider.invoke(kind, payload, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout),
    }
}

/// Runs one request against shared health, ledger and rate-limit state.
pub(crate) struct Executor<'a> {
    pub(crate) health: &'a HealthMonitor,
    pub(crate) ledger: &'a UsageLedger,
    pub(crate) limiter: &'a RateLimiter,
    /// Smallest per-attempt budget worth starting a call for.
    pub(crate) min_attempt: Duration,
}

impl<'a> Executor<'a> {
    /// Try `candidates` (already ranked) until one succeeds.
    ///
    /// `race_width` of 0 or 1 means pure sequential fallback.
    pub(crate) async fn execute(
        &self,
        request: &TaskRequest,
        candidates: Vec<RegisteredProvider>,
        race_width: usize,
    ) -> Result<RouteSuccess, RouterError> {
        let kind = request.kind;
        let deadline = Instant::now() + request.deadline;
        let mut trail = Trail::default();
        let mut queue = candidates.into_iter();

        if race_width > 1 {
            let budget = self.budget(request, deadline, &mut trail)?;
            let mut group = Vec::with_capacity(race_width);
            while group.len() < race_width {
                let Some(candidate) = queue.next() else {
                    break;
                };
                if let Some(launch) = self.admit(&candidate, kind, budget, &mut trail) {
                    group.push(launch);
                }
            }
            if !group.is_empty() {
                if let Some(body) = self.race(kind, &request.payload, group, &mut trail).await {
                    return Ok(finish(body, trail));
                }
            }
        }

        for candidate in queue {
            let budget = self.budget(request, deadline, &mut trail)?;
            let Some(launch) = self.admit(&candidate, kind, budget, &mut trail) else {
                continue;
            };
            let result = call(launch.provider, kind, request.payload.clone(), launch.timeout).await;
            if let Some(body) = settle(launch.guard, result, &mut trail) {
                return Ok(finish(body, trail));
            }
        }

        Err(RouterError::AllProvidersFailed {
            kind,
            failures: trail.failures,
        })
    }

    /// Per-attempt timeout, or `DeadlineExceeded` when not even a minimal
    /// attempt fits in what is left.
    fn budget(
        &self,
        request: &TaskRequest,
        deadline: Instant,
        trail: &mut Trail,
    ) -> Result<Duration, RouterError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining < self.min_attempt {
            tracing::warn!(
                kind = %request.kind,
                remaining_ms = remaining.as_millis() as u64,
                "deadline exhausted, abandoning fallback chain"
            );
            return Err(RouterError::DeadlineExceeded {
                kind: request.kind,
                failures: std::mem::take(&mut trail.failures),
            });
        }
        Ok(match request.constraints.max_latency {
            Some(max) => remaining.min(max),
            None => remaining,
        })
    }

    /// Circuit and rate-limit gate. Skipped candidates land in the trail.
    fn admit(
        &self,
        candidate: &RegisteredProvider,
        kind: TaskKind,
        timeout: Duration,
        trail: &mut Trail,
    ) -> Option<Launch<'a>> {
        let id = candidate.id();
        let permit = match self.health.acquire_permit(id) {
            Ok(permit) => permit,
            Err(err) => {
                tracing::debug!(provider = %id, reason = %err.reason, "skipping provider: circuit open");
                trail.skip(id, FailureReason::CircuitOpen);
                return None;
            }
        };

        if !self
            .limiter
            .try_acquire(id, candidate.descriptor.rate_limit_per_minute)
        {
            self.health.release_permit(id, permit);
            tracing::debug!(provider = %id, "skipping provider: rate limited");
            trail.skip(id, FailureReason::RateLimited);
            return None;
        }

        tracing::debug!(
            provider = %id,
            kind = %kind,
            trial = permit == PermitType::Trial,
            timeout_ms = timeout.as_millis() as u64,
            "attempting provider"
        );

        Some(Launch {
            guard: AttemptGuard {
                health: self.health,
                ledger: self.ledger,
                provider_id: id.to_string(),
                kind,
                permit,
                cost_per_unit: candidate.descriptor.cost_for(kind),
                started: Instant::now(),
                started_at: Utc::now(),
                settled: false,
            },
            provider: candidate.provider.clone(),
            timeout,
        })
    }

    /// Run `group` concurrently; first success wins, losers are cancelled.
    async fn race(
        &self,
        kind: TaskKind,
        payload: &Bytes,
        group: Vec<Launch<'a>>,
        trail: &mut Trail,
    ) -> Option<Bytes> {
        let mut guards = Vec::with_capacity(group.len());
        let mut in_flight = FuturesUnordered::new();
        for (idx, launch) in group.into_iter().enumerate() {
            let Launch {
                guard,
                provider,
                timeout,
            } = launch;
            let payload = payload.clone();
            in_flight.push(async move { (idx, call(provider, kind, payload, timeout).await) });
            guards.push(Some(guard));
        }

        while let Some((idx, result)) = in_flight.next().await {
            let Some(guard) = guards[idx].take() else {
                continue;
            };
            if let Some(body) = settle(guard, result, trail) {
                for loser in guards.iter_mut().filter_map(Option::take) {
                    tracing::debug!(provider = %loser.provider_id, "race lost, cancelling");
                    trail.attempts.push(loser.cancel());
                }
                return Some(body);
            }
        }
        None
    }
}

fn settle(
    guard: AttemptGuard<'_>,
    result: Result<ProviderResponse, ProviderError>,
    trail: &mut Trail,
) -> Option<Bytes> {
    match result {
        Ok(response) => {
            trail.attempts.push(guard.succeed(response.units.unwrap_or(1.0)));
            Some(response.body)
        }
        Err(err) => {
            tracing::warn!(
                provider = %guard.provider_id,
                kind = %guard.kind,
                error = %err,
                "provider attempt failed"
            );
            trail.skip(&guard.provider_id, failure_reason(&err));
            trail.attempts.push(guard.fail(&err));
            None
        }
    }
}

fn finish(output: Bytes, trail: Trail) -> RouteSuccess {
    let winner = trail
        .attempts
        .iter()
        .rev()
        .find(|a| a.outcome.is_success())
        .cloned();
    let (provider_id, cost, units, latency) = match winner {
        Some(a) => (a.provider_id, a.cost_incurred, a.units, a.latency),
        None => (String::new(), 0.0, 0.0, Duration::ZERO),
    };
    RouteSuccess {
        output,
        provider_id,
        cost,
        units,
        latency,
        attempts: trail.attempts,
    }
}
