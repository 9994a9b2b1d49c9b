//! Provider plugin interface.
//!
//! Every integrated backend implements [`Provider`]. The router only ever talks
//! to providers through this trait, so adding a backend means registering a new
//! implementer rather than touching routing logic.

mod http;

pub use http::HttpProvider;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::task::TaskKind;

/// Successful provider output.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub body: Bytes,
    /// Billable units consumed, when the provider reports them.
    pub units: Option<f64>,
}

impl ProviderResponse {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            units: None,
        }
    }

    pub fn with_units(mut self, units: f64) -> Self {
        self.units = Some(units);
        self
    }
}

/// Per-attempt provider failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider timed out")]
    Timeout,

    #[error("provider returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("task kind '{0}' not supported")]
    Unsupported(TaskKind),
}

impl ProviderError {
    /// Short category label used in health and ledger records.
    pub fn category(&self) -> &'static str {
        match self {
            ProviderError::Timeout => "timeout",
            ProviderError::Status { code, .. } if *code >= 500 => "5xx",
            ProviderError::Status { .. } => "4xx",
            ProviderError::Transport(_) => "transport",
            ProviderError::InvalidResponse(_) => "invalid_response",
            ProviderError::Unsupported(_) => "unsupported",
        }
    }
}

/// A backend capable of serving one or more task kinds.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier, matching the registry descriptor id.
    fn id(&self) -> &str;

    /// Whether this backend can serve `kind` at all.
    fn supports(&self, kind: TaskKind) -> bool;

    /// Execute one call. Implementations should respect `timeout`; the executor
    /// enforces it independently as well.
    async fn invoke(
        &self,
        kind: TaskKind,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Cheap liveness check used by the background prober.
    async fn probe(&self) -> bool;
}
