//! Wire types for the HTTP API.

use serde::{Deserialize, Serialize};

use crate::router::{RankedCandidate, RouteSuccess};
use crate::task::{Constraints, RouteAttempt, TaskKind};

/// Body of `POST /v1/route`.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRequest {
    pub kind: TaskKind,
    /// Forwarded to the provider as JSON.
    pub payload: serde_json::Value,
    #[serde(default)]
    pub constraints: Constraints,
    /// Falls back to `routing.default_deadline_ms` when absent.
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteResponse {
    pub provider: String,
    pub cost: f64,
    pub units: f64,
    pub latency_ms: u64,
    pub attempts: Vec<RouteAttempt>,
    /// Provider output: JSON when it parses, otherwise a UTF-8 string.
    pub result: serde_json::Value,
}

impl From<RouteSuccess> for RouteResponse {
    fn from(success: RouteSuccess) -> Self {
        let result = serde_json::from_slice(&success.output).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&success.output).into_owned())
        });
        Self {
            provider: success.provider_id,
            cost: success.cost,
            units: success.units,
            latency_ms: success.latency.as_millis() as u64,
            attempts: success.attempts,
            result,
        }
    }
}

/// Body of `POST /v1/route/preview`.
#[derive(Debug, Clone, Deserialize)]
pub struct PreviewRequest {
    pub kind: TaskKind,
    #[serde(default)]
    pub constraints: Constraints,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewResponse {
    pub kind: TaskKind,
    pub candidates: Vec<RankedCandidate>,
}

/// Query of `POST /admin/reset`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResetQuery {
    pub provider: Option<String>,
}
