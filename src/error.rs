//! Error types for airoute.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::task::TaskKind;

/// Result type alias for airoute operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a single candidate did not produce a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    /// The attempt exceeded its time budget.
    Timeout,
    /// The provider answered with an error.
    Provider { category: String, message: String },
    /// Skipped: the provider's circuit was not accepting traffic.
    CircuitOpen,
    /// Skipped: the provider's declared rate limit was exhausted.
    RateLimited,
    /// Lost a race or was dropped before completing.
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Provider { category, message } => write!(f, "{}: {}", category, message),
            FailureReason::CircuitOpen => write!(f, "circuit open"),
            FailureReason::RateLimited => write!(f, "rate limited"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One entry of the failure chain reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptFailure {
    pub provider: String,
    pub reason: FailureReason,
}

fn format_chain(failures: &[AttemptFailure]) -> String {
    if failures.is_empty() {
        return "no candidates attempted".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{} ({})", f.provider, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Request-level routing failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouterError {
    #[error("No provider supports task kind '{kind}'")]
    CapabilityNotSupported { kind: TaskKind },

    #[error("All providers failed for '{kind}': {}", format_chain(.failures))]
    AllProvidersFailed {
        kind: TaskKind,
        failures: Vec<AttemptFailure>,
    },

    #[error("Deadline exceeded for '{kind}' after: {}", format_chain(.failures))]
    DeadlineExceeded {
        kind: TaskKind,
        failures: Vec<AttemptFailure>,
    },
}

impl RouterError {
    /// Every candidate tried (or skipped) and why.
    pub fn failures(&self) -> &[AttemptFailure] {
        match self {
            RouterError::CapabilityNotSupported { .. } => &[],
            RouterError::AllProvidersFailed { failures, .. }
            | RouterError::DeadlineExceeded { failures, .. } => failures,
        }
    }
}

/// Main error type for airoute.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Route(#[from] RouterError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Route(RouterError::CapabilityNotSupported { .. }) => StatusCode::BAD_REQUEST,
            Error::Route(RouterError::AllProvidersFailed { .. }) => StatusCode::BAD_GATEWAY,
            Error::Route(RouterError::DeadlineExceeded { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let attempts = match &self {
            Error::Route(err) => err.failures().to_vec(),
            _ => Vec::new(),
        };

        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "airoute_error",
                "code": status.as_u16(),
                "attempts": attempts,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
