//! Configuration parsing and validation for airoute.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::task::TaskKind;

/// Root configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub health: HealthConfig,
    pub routing: RoutingConfig,
    pub providers: Vec<ProviderConfig>,
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Circuit breaker and prober settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures that trip a provider's circuit.
    pub failure_threshold: u32,
    /// Initial Open duration before a trial request is allowed.
    pub cooldown_secs: u64,
    /// Upper bound for the doubled cooldown after failed trials.
    pub max_cooldown_secs: u64,
    /// Interval between background liveness probes of open providers.
    pub probe_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 30,
            max_cooldown_secs: 300,
            probe_interval_secs: 15,
        }
    }
}

impl HealthConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

/// Weights of the candidate scoring function. Lower scores rank first.
///
/// `score = cost * cost_norm + latency * latency_norm + load_balance * load_share
///          - priority * priority_norm - local_preference * [local && prefer_local]`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub cost: f64,
    pub latency: f64,
    pub priority: f64,
    pub local_preference: f64,
    /// Zero disables load distribution.
    pub load_balance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            cost: 1.0,
            latency: 0.5,
            priority: 0.25,
            local_preference: 0.5,
            load_balance: 0.0,
        }
    }
}

/// Routing and fallback settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Deadline applied when a request does not carry one.
    pub default_deadline_ms: u64,
    /// Smallest remaining budget worth starting an attempt with.
    pub min_attempt_ms: u64,
    /// Task kinds that race the top candidates instead of pure fallback.
    pub race: Vec<TaskKind>,
    /// Number of candidates raced concurrently in race mode.
    pub race_width: usize,
    /// Weight of the newest latency sample in the moving average.
    pub latency_alpha: f64,
    pub weights: ScoringWeights,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 30_000,
            min_attempt_ms: 50,
            race: Vec::new(),
            race_width: 2,
            latency_alpha: 0.1,
            weights: ScoringWeights::default(),
        }
    }
}

impl RoutingConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn min_attempt(&self) -> Duration {
        Duration::from_millis(self.min_attempt_ms)
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// The inner `SecretString` ensures the key value is:
/// - Zeroized in memory when dropped
/// - Never exposed via Debug or Display
/// - Only accessible via `.expose_secret()` (grep-auditable)
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a provider's API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Provider descriptor as configured.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderConfig {
    /// Unique provider id
    pub id: String,
    /// Base URL for the provider's API (e.g., "http://localhost:11434/v1")
    pub url: String,
    /// Optional API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<ApiKey>,
    /// Task kinds this provider serves
    pub tasks: Vec<TaskKind>,
    /// Cost per unit for each task kind
    pub cost: BTreeMap<TaskKind, f64>,
    /// Declared requests-per-minute ceiling
    pub rate_limit_per_minute: Option<u32>,
    /// Declared preference, higher is preferred
    pub priority: i32,
    /// Privacy-preserving provider (runs locally)
    pub local: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for provider '{provider}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

/// Raw provider config deserialized directly from TOML.
/// `url` and `api_key` may contain `${VAR}` references not yet expanded, and
/// cost keys are validated against known task kinds during conversion.
#[derive(Deserialize)]
pub struct RawProviderConfig {
    id: String,
    url: String,
    api_key: Option<String>,
    #[serde(default)]
    tasks: Vec<TaskKind>,
    #[serde(default)]
    cost: BTreeMap<String, f64>,
    rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    local: bool,
}

/// Raw configuration deserialized directly from TOML.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    health: HealthConfig,
    #[serde(default)]
    routing: RoutingConfig,
    #[serde(default)]
    providers: Vec<RawProviderConfig>,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// The closure-based design makes this testable without touching global env state.
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, provider_id: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            provider: provider_id.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                provider: provider_id.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            provider: provider_id.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in provider '{}')",
                var_name, provider_id
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Expand all `${VAR}` references in a string using real environment variables.
fn expand_env_vars(input: &str, provider_id: &str) -> Result<String, ConfigError> {
    expand_env_vars_with(input, provider_id, |name| std::env::var(name).ok())
}

/// Derive the convention-based env var name for a provider.
///
/// Transforms provider id to `AIROUTE_<UPPER_SNAKE_ID>_API_KEY`:
/// - "openai" -> "AIROUTE_OPENAI_API_KEY"
/// - "azure-openai" -> "AIROUTE_AZURE_OPENAI_API_KEY"
pub fn convention_env_var_name(provider_id: &str) -> String {
    let upper_snake = provider_id.to_uppercase().replace(['-', ' '], "_");
    format!("AIROUTE_{}_API_KEY", upper_snake)
}

/// Try convention-based env var lookup for a provider's API key.
fn convention_key_lookup(provider_id: &str) -> Option<(String, String)> {
    let var_name = convention_env_var_name(provider_id);
    std::env::var(&var_name).ok().map(|value| (var_name, value))
}

impl Config {
    /// Parse configuration from a TOML string (with env var expansion).
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        let (config, _) = Self::from_raw(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file with environment variable expansion.
    ///
    /// Returns the config and per-provider key source information.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let raw: RawConfig = toml::from_str(&content)?;
        let (config, key_sources) = Self::from_raw(raw)?;
        config.validate()?;

        Ok((config, key_sources))
    }

    /// Convert raw (deserialized) config to final config.
    ///
    /// For each provider:
    /// - `url` and `api_key` containing `${VAR}` are expanded from the environment
    /// - a literal `api_key` is wrapped directly
    /// - an absent `api_key` falls back to `AIROUTE_<ID>_API_KEY`
    /// - cost table keys are parsed into task kinds
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let mut providers = Vec::with_capacity(raw.providers.len());
        let mut key_sources = Vec::with_capacity(raw.providers.len());

        for rp in raw.providers {
            let url = expand_env_vars(&rp.url, &rp.id)?;

            let (api_key, source) = match rp.api_key {
                Some(ref raw_key) if raw_key.contains("${") => {
                    let expanded = expand_env_vars(raw_key, &rp.id)?;
                    (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
                }
                Some(ref raw_key) => (Some(ApiKey::from(raw_key.as_str())), KeySource::Literal),
                None => match convention_key_lookup(&rp.id) {
                    Some((var_name, value)) => {
                        (Some(ApiKey::from(value)), KeySource::Convention(var_name))
                    }
                    None => (None, KeySource::None),
                },
            };

            let mut cost = BTreeMap::new();
            for (kind, rate) in rp.cost {
                let kind = kind.parse::<TaskKind>().map_err(|e| {
                    ConfigError::Validation(format!("Provider '{}' cost table: {}", rp.id, e))
                })?;
                cost.insert(kind, rate);
            }

            key_sources.push((rp.id.clone(), source));

            providers.push(ProviderConfig {
                id: rp.id,
                url,
                api_key,
                tasks: rp.tasks,
                cost,
                rate_limit_per_minute: rp.rate_limit_per_minute,
                priority: rp.priority,
                local: rp.local,
            });
        }

        let config = Config {
            server: raw.server,
            health: raw.health,
            routing: raw.routing,
            providers,
            logging: raw.logging,
        };

        Ok((config, key_sources))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            tracing::warn!("No providers configured - every route will fail");
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.is_empty() {
                return Err(ConfigError::Validation(
                    "Provider with empty id".to_string(),
                ));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate provider id '{}'",
                    provider.id
                )));
            }
            if provider.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty URL",
                    provider.id
                )));
            }
            if provider.tasks.is_empty() {
                tracing::warn!(provider = %provider.id, "Provider declares no task kinds");
            }
            if let Some((kind, rate)) = provider
                .cost
                .iter()
                .find(|(_, rate)| !rate.is_finite() || **rate < 0.0)
            {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has invalid cost {} for '{}'",
                    provider.id, rate, kind
                )));
            }
            if provider.rate_limit_per_minute == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has a zero rate limit",
                    provider.id
                )));
            }
        }

        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.health.max_cooldown_secs < self.health.cooldown_secs {
            return Err(ConfigError::Validation(
                "health.max_cooldown_secs must not be below health.cooldown_secs".to_string(),
            ));
        }
        if self.health.probe_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "health.probe_interval_secs must be positive".to_string(),
            ));
        }

        let weights = self.routing.weights;
        let all_weights = [
            weights.cost,
            weights.latency,
            weights.priority,
            weights.local_preference,
            weights.load_balance,
        ];
        if all_weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Validation(
                "routing.weights must be finite and non-negative".to_string(),
            ));
        }
        if !(self.routing.latency_alpha > 0.0 && self.routing.latency_alpha <= 1.0) {
            return Err(ConfigError::Validation(
                "routing.latency_alpha must be in (0, 1]".to_string(),
            ));
        }
        if self.routing.race_width < 2 {
            return Err(ConfigError::Validation(
                "routing.race_width must be at least 2".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"
        "#;

        let config = Config::parse_str(toml).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert!(config.providers.is_empty());
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.routing.weights, ScoringWeights::default());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            listen = "0.0.0.0:8080"

            [health]
            failure_threshold = 5
            cooldown_secs = 10
            max_cooldown_secs = 120
            probe_interval_secs = 5

            [routing]
            default_deadline_ms = 10000
            race = ["embedding"]

            [routing.weights]
            cost = 2.0
            load_balance = 0.1

            [[providers]]
            id = "azure-openai"
            url = "https://example.openai.azure.com/v1"
            tasks = ["text_generation", "embedding", "vision"]
            priority = 2
            rate_limit_per_minute = 600

            [providers.cost]
            text_generation = 0.03
            embedding = 0.0001

            [[providers]]
            id = "ollama"
            url = "http://localhost:11434/v1"
            tasks = ["text_generation", "embedding"]
            local = true

            [logging]
            level = "debug"
        "#;

        let config = Config::parse_str(toml).unwrap();
        assert_eq!(config.providers.len(), 2);
        let azure = &config.providers[0];
        assert_eq!(azure.id, "azure-openai");
        assert_eq!(azure.tasks.len(), 3);
        assert_eq!(azure.cost.get(&TaskKind::TextGeneration), Some(&0.03));
        assert_eq!(azure.rate_limit_per_minute, Some(600));
        assert!(!azure.local);
        assert!(config.providers[1].local);
        assert_eq!(config.health.cooldown(), Duration::from_secs(10));
        assert_eq!(config.routing.race, vec![TaskKind::Embedding]);
        assert_eq!(config.routing.weights.cost, 2.0);
        // Unset weights keep their defaults
        assert_eq!(config.routing.weights.latency, 0.5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_cost_kind_rejected() {
        let toml = r#"
            [[providers]]
            id = "p"
            url = "https://example.com/v1"
            tasks = ["embedding"]
            [providers.cost]
            telepathy = 1.0
        "#;
        let err = Config::parse_str(toml).unwrap_err().to_string();
        assert!(err.contains("telepathy"), "{}", err);
    }

    #[test]
    fn test_unknown_task_kind_rejected() {
        let toml = r#"
            [[providers]]
            id = "p"
            url = "https://example.com/v1"
            tasks = ["telepathy"]
        "#;
        assert!(matches!(
            Config::parse_str(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_duplicate_provider_ids_rejected() {
        let toml = r#"
            [[providers]]
            id = "p"
            url = "https://a.example.com/v1"
            [[providers]]
            id = "p"
            url = "https://b.example.com/v1"
        "#;
        let err = Config::parse_str(toml).unwrap_err().to_string();
        assert!(err.contains("Duplicate provider id 'p'"), "{}", err);
    }

    #[test]
    fn test_negative_cost_rejected() {
        let toml = r#"
            [[providers]]
            id = "p"
            url = "https://a.example.com/v1"
            tasks = ["embedding"]
            [providers.cost]
            embedding = -1.0
        "#;
        assert!(matches!(
            Config::parse_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_health_settings_rejected() {
        let toml = r#"
            [health]
            cooldown_secs = 60
            max_cooldown_secs = 30
        "#;
        assert!(matches!(
            Config::parse_str(toml),
            Err(ConfigError::Validation(_))
        ));

        let toml = r#"
            [health]
            failure_threshold = 0
        "#;
        assert!(matches!(
            Config::parse_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_routing_settings_rejected() {
        let toml = r#"
            [routing.weights]
            latency = -0.5
        "#;
        assert!(matches!(
            Config::parse_str(toml),
            Err(ConfigError::Validation(_))
        ));

        let toml = r#"
            [routing]
            race_width = 1
        "#;
        assert!(matches!(
            Config::parse_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_api_key_redaction() {
        let key = ApiKey::from("super-secret-token");
        assert_eq!(format!("{:?}", key), "[REDACTED]");
        assert_eq!(format!("{}", key), "[REDACTED]");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"[REDACTED]\"");
        assert_eq!(key.expose_secret(), "super-secret-token");
    }

    #[test]
    fn test_provider_config_serialize_redacts_key() {
        let toml = r#"
            [[providers]]
            id = "p"
            url = "https://example.com/v1"
            api_key = "sk-live-secret"
            tasks = ["embedding"]
            [providers.cost]
            embedding = 1.5
        "#;
        let config = Config::parse_str(toml).unwrap();
        let json = serde_json::to_value(&config.providers[0]).unwrap();
        assert_eq!(json["api_key"], "[REDACTED]");
        assert_eq!(json["cost"]["embedding"], 1.5);
        assert!(!format!("{:?}", config.providers[0]).contains("sk-live-secret"));
    }

    // ── Expansion tests (using expand_env_vars_with, no global env state) ──

    #[test]
    fn test_expand_multiple_vars() {
        let lookup = |name: &str| match name {
            "SCHEME" => Some("https".to_string()),
            "HOST" => Some("example.com".to_string()),
            _ => None,
        };
        let result = expand_env_vars_with("${SCHEME}://${HOST}/v1", "test", lookup).unwrap();
        assert_eq!(result, "https://example.com/v1");
    }

    #[test]
    fn test_expand_no_vars_passthrough() {
        let lookup = |_: &str| -> Option<String> { panic!("should not be called") };
        let result = expand_env_vars_with("$NOT_A_VAR", "test", lookup).unwrap();
        assert_eq!(result, "$NOT_A_VAR");
    }

    #[test]
    fn test_expand_missing_var_fails() {
        let lookup = |_: &str| None;
        let err = expand_env_vars_with("${MISSING}", "provider-alpha", lookup)
            .unwrap_err()
            .to_string();
        assert!(err.contains("MISSING"), "Error should name the variable");
        assert!(err.contains("provider-alpha"), "Error should name the provider");
    }

    #[test]
    fn test_expand_unclosed_and_empty_fail() {
        let lookup = |_: &str| -> Option<String> { panic!("should not be called") };
        let err = expand_env_vars_with("${UNCLOSED", "test", lookup)
            .unwrap_err()
            .to_string()
            .to_lowercase();
        assert!(err.contains("unclosed"));

        let err = expand_env_vars_with("${}", "test", lookup)
            .unwrap_err()
            .to_string()
            .to_lowercase();
        assert!(err.contains("empty"));
    }

    #[test]
    fn test_convention_env_var_name() {
        assert_eq!(convention_env_var_name("openai"), "AIROUTE_OPENAI_API_KEY");
        assert_eq!(
            convention_env_var_name("azure-openai"),
            "AIROUTE_AZURE_OPENAI_API_KEY"
        );
    }

    #[test]
    fn test_from_file_expands_url_and_convention_key() {
        let provider_id = "test-conv-file-0901";
        let key_var = convention_env_var_name(provider_id);
        unsafe {
            std::env::set_var(&key_var, "conv-key-value");
            std::env::set_var("TEST_0901_HOST", "models.internal");
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("airoute.toml");
        std::fs::write(
            &path,
            format!(
                r#"
                [[providers]]
                id = "{}"
                url = "https://${{TEST_0901_HOST}}/v1"
                tasks = ["embedding"]
                "#,
                provider_id
            ),
        )
        .unwrap();

        let (config, sources) = Config::from_file_with_env(&path).unwrap();
        assert_eq!(config.providers[0].url, "https://models.internal/v1");
        assert_eq!(sources[0].1, KeySource::Convention(key_var.clone()));
        assert_eq!(
            config.providers[0].api_key.as_ref().unwrap().expose_secret(),
            "conv-key-value"
        );

        unsafe {
            std::env::remove_var(&key_var);
            std::env::remove_var("TEST_0901_HOST");
        }
    }

    #[test]
    fn test_from_file_missing_file() {
        let err = Config::from_file_with_env("/nonexistent/airoute.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
