//! Capability registry: which providers can serve which task kinds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::config::ProviderConfig;
use crate::provider::Provider;
use crate::task::{Constraints, TaskKind};

/// Static description of a provider, created at configuration load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub supported_tasks: BTreeSet<TaskKind>,
    pub cost_per_unit: BTreeMap<TaskKind, f64>,
    pub rate_limit_per_minute: Option<u32>,
    pub priority_hint: i32,
    pub local: bool,
}

impl ProviderDescriptor {
    /// Declared cost per unit for `kind`. Missing entries are free.
    pub fn cost_for(&self, kind: TaskKind) -> f64 {
        self.cost_per_unit.get(&kind).copied().unwrap_or(0.0)
    }

    fn admits(&self, kind: TaskKind, constraints: &Constraints) -> bool {
        if !self.supported_tasks.contains(&kind) {
            return false;
        }
        if constraints.local_only && !self.local {
            return false;
        }
        match constraints.max_cost_per_unit {
            Some(max) => self.cost_for(kind) <= max,
            None => true,
        }
    }
}

impl From<&ProviderConfig> for ProviderDescriptor {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            id: config.id.clone(),
            supported_tasks: config.tasks.iter().copied().collect(),
            cost_per_unit: config.cost.clone(),
            rate_limit_per_minute: config.rate_limit_per_minute,
            priority_hint: config.priority,
            local: config.local,
        }
    }
}

/// A descriptor paired with the implementation that serves it.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub descriptor: Arc<ProviderDescriptor>,
    pub provider: Arc<dyn Provider>,
}

impl RegisteredProvider {
    pub fn new(descriptor: ProviderDescriptor, provider: Arc<dyn Provider>) -> Self {
        if descriptor.id != provider.id() {
            tracing::warn!(
                descriptor = %descriptor.id,
                provider = %provider.id(),
                "Provider implementation id differs from its descriptor"
            );
        }
        Self {
            descriptor: Arc::new(descriptor),
            provider,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Read-mostly provider table. Lookups clone an `Arc` snapshot, so a reload
/// never blocks in-flight requests for longer than the pointer swap.
pub struct CapabilityRegistry {
    entries: RwLock<Arc<Vec<RegisteredProvider>>>,
}

impl CapabilityRegistry {
    pub fn new(entries: Vec<RegisteredProvider>) -> Self {
        Self {
            entries: RwLock::new(Arc::new(sorted(entries))),
        }
    }

    fn snapshot(&self) -> Arc<Vec<RegisteredProvider>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Providers able to serve `kind` under `constraints`, ordered by id.
    ///
    /// Returns an empty list when nothing qualifies; the caller decides how to
    /// surface that.
    pub fn candidates_for(&self, kind: TaskKind, constraints: &Constraints) -> Vec<RegisteredProvider> {
        self.snapshot()
            .iter()
            .filter(|entry| entry.descriptor.admits(kind, constraints))
            .filter(|entry| entry.provider.supports(kind))
            .cloned()
            .collect()
    }

    /// Swap in a new provider set. Returns the new ids.
    pub fn replace(&self, entries: Vec<RegisteredProvider>) -> Vec<String> {
        let entries = sorted(entries);
        let ids = entries.iter().map(|e| e.id().to_string()).collect();
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(entries);
        ids
    }

    pub fn get(&self, id: &str) -> Option<RegisteredProvider> {
        self.snapshot().iter().find(|e| e.id() == id).cloned()
    }

    pub fn descriptors(&self) -> Vec<Arc<ProviderDescriptor>> {
        self.snapshot()
            .iter()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.snapshot().iter().map(|e| e.id().to_string()).collect()
    }

    pub fn providers(&self) -> Vec<RegisteredProvider> {
        self.snapshot().as_ref().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sorted(mut entries: Vec<RegisteredProvider>) -> Vec<RegisteredProvider> {
    entries.sort_by(|a, b| a.id().cmp(b.id()));
    entries
}
