//! OpenAI-compatible HTTP provider.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client};

use super::{Provider, ProviderError, ProviderResponse};
use crate::config::{ApiKey, ProviderConfig};
use crate::task::TaskKind;

/// Probe requests never wait longer than this.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider speaking the OpenAI REST dialect (`/chat/completions`,
/// `/embeddings`, `/audio/transcriptions`, `/models`).
pub struct HttpProvider {
    id: String,
    url: String,
    api_key: Option<ApiKey>,
    tasks: BTreeSet<TaskKind>,
    client: Client,
}

impl HttpProvider {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        tasks: impl IntoIterator<Item = TaskKind>,
        client: Client,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            api_key: None,
            tasks: tasks.into_iter().collect(),
            client,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<ApiKey>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Build a provider from its configuration entry.
    pub fn from_config(config: &ProviderConfig, client: Client) -> Self {
        Self::new(
            config.id.clone(),
            config.url.clone(),
            config.tasks.iter().copied(),
            client,
        )
        .with_api_key(config.api_key.clone())
    }

    fn endpoint(&self, kind: TaskKind) -> String {
        let path = match kind {
            TaskKind::TextGeneration | TaskKind::Vision => "chat/completions",
            TaskKind::Embedding => "embeddings",
            TaskKind::Transcription => "audio/transcriptions",
        };
        format!("{}/{}", self.url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", key.expose_secret()),
            ),
            None => request,
        }
    }
}

/// Extract billable units (thousands of tokens) from an OpenAI-style `usage` object.
fn extract_units(body: &serde_json::Value) -> Option<f64> {
    let usage = body.get("usage").filter(|u| !u.is_null())?;
    let tokens = match usage.get("total_tokens").and_then(|v| v.as_u64()) {
        Some(total) => total,
        None => {
            let prompt = usage.get("prompt_tokens")?.as_u64()?;
            let completion = usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            prompt + completion
        }
    };
    Some(tokens as f64 / 1000.0)
}

fn map_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(e.to_string())
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, kind: TaskKind) -> bool {
        self.tasks.contains(&kind)
    }

    async fn invoke(
        &self,
        kind: TaskKind,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        if !self.supports(kind) {
            return Err(ProviderError::Unsupported(kind));
        }

        let request = self
            .client
            .post(self.endpoint(kind))
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(payload);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                code: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await.map_err(map_transport)?;
        let units = serde_json::from_slice::<serde_json::Value>(&body)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
            .map(|json| extract_units(&json))?;

        Ok(ProviderResponse { body, units })
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/models", self.url.trim_end_matches('/'));
        let request = self.client.get(url).timeout(PROBE_TIMEOUT);
        match self.authorize(request).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(provider = %self.id, error = %e, "Liveness probe failed");
                false
            }
        }
    }
}
