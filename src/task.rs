//! Task request types shared by every routing component.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Category of AI capability a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    TextGeneration,
    Embedding,
    Transcription,
    Vision,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::TextGeneration,
        TaskKind::Embedding,
        TaskKind::Transcription,
        TaskKind::Vision,
    ];

    /// Lowercase string representation used in config and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::TextGeneration => "text_generation",
            TaskKind::Embedding => "embedding",
            TaskKind::Transcription => "transcription",
            TaskKind::Vision => "vision",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown task kind name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task kind '{0}'")]
pub struct UnknownTaskKind(pub String);

impl FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text_generation" => Ok(TaskKind::TextGeneration),
            "embedding" => Ok(TaskKind::Embedding),
            "transcription" => Ok(TaskKind::Transcription),
            "vision" => Ok(TaskKind::Vision),
            other => Err(UnknownTaskKind(other.to_string())),
        }
    }
}

/// Per-request routing constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Privacy flag: only providers declared `local` may serve the request.
    #[serde(default)]
    pub local_only: bool,
    /// Soft privacy preference: local providers get a scoring bonus.
    #[serde(default)]
    pub prefer_local: bool,
    /// Upper bound for a single attempt, independent of the overall deadline.
    #[serde(default, with = "opt_millis", rename = "max_latency_ms")]
    pub max_latency: Option<Duration>,
    /// Providers whose declared cost for the kind exceeds this are excluded.
    #[serde(default)]
    pub max_cost_per_unit: Option<f64>,
}

/// An abstract AI task submitted to the router.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub kind: TaskKind,
    pub payload: Bytes,
    pub constraints: Constraints,
    /// Total time budget for the request, measured from submission.
    pub deadline: Duration,
}

impl TaskRequest {
    pub fn new(kind: TaskKind, payload: impl Into<Bytes>, deadline: Duration) -> Self {
        Self {
            kind,
            payload: payload.into(),
            constraints: Constraints::default(),
            deadline,
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Outcome of one provider try.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure(String),
    Timeout,
    /// Lost a race to another candidate and was dropped before completing.
    Cancelled,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

/// Ephemeral record of a single provider try.
#[derive(Debug, Clone, Serialize)]
pub struct RouteAttempt {
    pub provider_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub outcome: AttemptOutcome,
    pub cost_incurred: f64,
    pub units: f64,
    #[serde(rename = "latency_ms", serialize_with = "ser_millis")]
    pub latency: Duration,
}

fn ser_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
