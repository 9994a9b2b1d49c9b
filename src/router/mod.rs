//! Router facade.
//!
//! `Router::route` is the single entry point the rest of the application uses:
//! 1. Capability registry lookup (kind + constraints)
//! 2. Health filter: eligible providers are scored, non-eligible ones go last
//!    so they show up as `circuit open` in the failure chain without a call
//! 3. Fallback execution (sequential, or race-top-N for configured kinds)
//!
//! Ledger and health updates happen inside the executor as each attempt settles.

mod executor;
pub mod health;
pub mod ledger;
pub mod rate_limit;
pub mod registry;
pub mod report;
pub mod scorer;

pub use executor::RouteSuccess;
pub use health::{CircuitState, HealthMonitor, HealthProber, HealthSnapshot};
pub use ledger::{ProviderUsage, UsageCounters, UsageLedger};
pub use rate_limit::RateLimiter;
pub use registry::{CapabilityRegistry, ProviderDescriptor, RegisteredProvider};
pub use report::RouterSnapshot;
pub use scorer::{RankedCandidate, Scorer, ScoringInput};

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, HealthConfig, RoutingConfig};
use crate::error::RouterError;
use crate::provider::HttpProvider;
use crate::task::{Constraints, TaskKind, TaskRequest};

use executor::Executor;

/// Routes task requests to the best available provider.
pub struct Router {
    registry: Arc<CapabilityRegistry>,
    health: Arc<HealthMonitor>,
    ledger: UsageLedger,
    limiter: RateLimiter,
    scorer: Scorer,
    routing: RoutingConfig,
}

impl Router {
    pub fn new(providers: Vec<RegisteredProvider>, health: &HealthConfig, routing: RoutingConfig) -> Self {
        let registry = CapabilityRegistry::new(providers);
        let monitor = HealthMonitor::new(&registry.ids(), health);
        Self {
            registry: Arc::new(registry),
            health: Arc::new(monitor),
            ledger: UsageLedger::new(routing.latency_alpha),
            limiter: RateLimiter::new(),
            scorer: Scorer::new(routing.weights),
            routing,
        }
    }

    /// Build a router whose providers are all OpenAI-compatible HTTP backends.
    pub fn from_config(config: &Config, client: reqwest::Client) -> Self {
        Self::new(
            http_providers(config, &client),
            &config.health,
            config.routing.clone(),
        )
    }

    /// Route one task. Never returns a success without a provider attribution;
    /// every failure carries the full chain of what was tried.
    pub async fn route(&self, request: TaskRequest) -> Result<RouteSuccess, RouterError> {
        let kind = request.kind;
        let (ranked, ordered) = self.plan(kind, &request.constraints)?;

        tracing::debug!(
            kind = %kind,
            candidates = ?ranked.iter().map(|r| (r.id.as_str(), r.score)).collect::<Vec<_>>(),
            "ranked candidates"
        );

        let race_width = if self.routing.race.contains(&kind) {
            self.routing.race_width
        } else {
            1
        };

        let executor = Executor {
            health: &self.health,
            ledger: &self.ledger,
            limiter: &self.limiter,
            min_attempt: self.routing.min_attempt(),
        };

        match executor.execute(&request, ordered, race_width).await {
            Ok(success) => {
                tracing::info!(
                    kind = %kind,
                    provider = %success.provider_id,
                    cost = success.cost,
                    latency_ms = success.latency.as_millis() as u64,
                    attempts = success.attempts.len(),
                    "route succeeded"
                );
                Ok(success)
            }
            Err(err) => {
                tracing::warn!(kind = %kind, error = %err, "route failed");
                Err(err)
            }
        }
    }

    /// Dry run: the ranked list `route` would try, without calling anyone.
    ///
    /// Providers whose circuit is not accepting traffic are left out.
    pub fn preview(&self, kind: TaskKind, constraints: &Constraints) -> Result<Vec<RankedCandidate>, RouterError> {
        let (ranked, _) = self.plan(kind, constraints)?;
        Ok(ranked)
    }

    /// Score the eligible candidates; return the ranking and the full attempt
    /// order (ranked eligible providers, then non-eligible ones by id).
    fn plan(
        &self,
        kind: TaskKind,
        constraints: &Constraints,
    ) -> Result<(Vec<RankedCandidate>, Vec<RegisteredProvider>), RouterError> {
        let capable = self.registry.candidates_for(kind, constraints);
        if capable.is_empty() {
            return Err(RouterError::CapabilityNotSupported { kind });
        }

        let (eligible, blocked): (Vec<_>, Vec<_>) = capable
            .into_iter()
            .partition(|entry| self.health.is_eligible(entry.id()));

        let inputs: Vec<ScoringInput<'_>> = eligible
            .iter()
            .map(|entry| ScoringInput {
                descriptor: &entry.descriptor,
                consecutive_failures: self.health.consecutive_failures(entry.id()),
                rolling_latency_ms: self.ledger.rolling_latency_ms(entry.id(), kind),
                recent_calls: self.ledger.calls(entry.id(), kind),
            })
            .collect();
        let ranked = self.scorer.rank(kind, constraints, &inputs);

        let mut ordered = Vec::with_capacity(eligible.len() + blocked.len());
        for candidate in &ranked {
            if let Some(entry) = eligible.iter().find(|e| e.id() == candidate.id) {
                ordered.push(entry.clone());
            }
        }
        ordered.extend(blocked);

        Ok((ranked, ordered))
    }

    /// Health, usage and recommendations for every registered provider.
    pub fn snapshot(&self) -> RouterSnapshot {
        RouterSnapshot::build(
            &self.registry.descriptors(),
            self.health.all_snapshots(),
            self.ledger.snapshot(),
        )
    }

    /// Swap the provider set. Health state survives for ids that remain;
    /// usage history is kept for all of them.
    ///
    /// New breakers exist before the registry exposes their providers, and
    /// removed ones go only after the swap, so no outcome lands on a missing
    /// breaker.
    pub fn reload(&self, providers: Vec<RegisteredProvider>) {
        let ids: Vec<String> = providers.iter().map(|p| p.id().to_string()).collect();
        self.health.add_providers(&ids);
        let ids = self.registry.replace(providers);
        self.health.retain_providers(&ids);
        tracing::info!(providers = ?ids, "provider registry reloaded");
    }

    /// Admin reset of health, usage and rate-limit state.
    ///
    /// `None` resets everything. Returns false when `provider` is not registered.
    pub fn reset(&self, provider: Option<&str>) -> bool {
        match provider {
            Some(id) => {
                if self.registry.get(id).is_none() {
                    return false;
                }
                self.health.reset(id);
                self.ledger.reset(id);
                self.limiter.reset(id);
                tracing::info!(provider = %id, "provider state reset");
                true
            }
            None => {
                self.health.reset_all();
                self.ledger.reset_all();
                self.limiter.reset_all();
                tracing::info!("router state reset");
                true
            }
        }
    }

    /// Start the background prober for open circuits.
    pub fn spawn_prober(&self, interval: Duration) -> HealthProber {
        HealthProber::spawn(self.health.clone(), self.registry.clone(), interval)
    }

    /// Deadline applied when a request does not carry one.
    pub fn default_deadline(&self) -> Duration {
        self.routing.default_deadline()
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }
}

/// One HTTP provider per configured entry, sharing a connection pool.
pub fn http_providers(config: &Config, client: &reqwest::Client) -> Vec<RegisteredProvider> {
    config
        .providers
        .iter()
        .map(|pc| {
            RegisteredProvider::new(
                ProviderDescriptor::from(pc),
                Arc::new(HttpProvider::from_config(pc, client.clone())),
            )
        })
        .collect()
}
