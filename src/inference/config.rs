//! Model configuration and validation.
//!
//! The `models` section of `careergraph.yaml` is the single source of truth for
//! model endpoints, the fallback chain, and the retry policy.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use super::errors::InferenceError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// A single model's runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub display_name: String,
    /// OpenAI-compatible base URL, e.g. `https://api.groq.com/openai/v1`.
    pub base_url: String,
    /// Provider-side model name. Defaults to the config key.
    #[serde(default)]
    pub model_name: Option<String>,
    /// Bearer token. Usually injected with `${GROQ_API_KEY}`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}

/// Bounded exponential backoff for transient model failures.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryPolicy {
    /// Retries per model after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    8_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Clamp a provider-supplied `Retry-After` hint to the policy maximum.
    pub fn clamp_hint(&self, retry_after_secs: u64) -> Duration {
        Duration::from_millis(
            retry_after_secs
                .saturating_mul(1000)
                .min(self.retry_max_delay_ms),
        )
    }
}

/// Top-level model registry (the `models` section of the config file).
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub active_model: String,
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// Resolve the active model configuration, respecting the fallback chain.
///
/// Returns `(model_key, ModelConfig)` for the first model present in the
/// config. Connectivity is checked at request time by the client.
pub fn resolve_active_model(config: &ModelsConfig) -> Result<(String, ModelConfig), InferenceError> {
    model_chain(config)
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::ConfigError {
            reason: format!(
                "active model '{}' not found in config and no fallback available",
                config.active_model
            ),
        })
}

/// The ordered list of models to try: the active model, then the fallback
/// chain, skipping unknown keys and duplicates.
pub fn model_chain(config: &ModelsConfig) -> Vec<(String, ModelConfig)> {
    let mut chain: Vec<(String, ModelConfig)> = Vec::new();
    let keys = std::iter::once(&config.active_model).chain(config.fallback_chain.iter());
    for key in keys {
        if chain.iter().any(|(k, _)| k == key) {
            continue;
        }
        if let Some(model) = config.models.get(key) {
            chain.push((key.clone(), model.clone()));
        }
    }
    chain
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            let resolved = resolve_var_expr(&var_expr);
            result.push_str(&resolved);
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str) -> ModelConfig {
        ModelConfig {
            display_name: name.to_string(),
            base_url: "http://localhost:1/v1".to_string(),
            model_name: None,
            api_key: None,
            temperature: 0.7,
            max_tokens: 256,
        }
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__CG_TEST_NONEXISTENT_VAR__");
        let input = "${__CG_TEST_NONEXISTENT_VAR__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__CG_TEST_INFERENCE_VAR__", "secret");
        let input = "key: ${__CG_TEST_INFERENCE_VAR__:-none}";
        assert_eq!(interpolate_env_vars(input), "key: secret");
        std::env::remove_var("__CG_TEST_INFERENCE_VAR__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_model_chain_order_and_dedup() {
        let mut models = HashMap::new();
        models.insert("a".to_string(), model("A"));
        models.insert("b".to_string(), model("B"));
        let config = ModelsConfig {
            active_model: "a".into(),
            models,
            fallback_chain: vec!["a".into(), "missing".into(), "b".into()],
            retry: RetryPolicy::default(),
        };
        let keys: Vec<String> = model_chain(&config).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_resolve_active_model_falls_back() {
        let mut models = HashMap::new();
        models.insert("b".to_string(), model("B"));
        let config = ModelsConfig {
            active_model: "gone".into(),
            models,
            fallback_chain: vec!["b".into()],
            retry: RetryPolicy::default(),
        };
        let (key, m) = resolve_active_model(&config).unwrap();
        assert_eq!(key, "b");
        assert_eq!(m.display_name, "B");
    }

    #[test]
    fn test_resolve_active_model_not_found() {
        let config = ModelsConfig {
            active_model: "nonexistent".into(),
            models: HashMap::new(),
            fallback_chain: vec![],
            retry: RetryPolicy::default(),
        };
        assert!(resolve_active_model(&config).is_err());
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 500,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
        assert_eq!(policy.clamp_hint(30), Duration::from_millis(500));
    }

    #[test]
    fn test_models_yaml_defaults() {
        let yaml = r#"
            active_model: groq
            models:
              groq:
                display_name: "Llama 3.1 70B"
                base_url: "https://api.groq.com/openai/v1"
                model_name: "llama-3.1-70b-versatile"
        "#;
        let config: ModelsConfig = serde_yaml::from_str(yaml).unwrap();
        let m = config.models.get("groq").unwrap();
        assert_eq!(m.max_tokens, 2048);
        assert!(m.api_key.is_none());
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.fallback_chain.is_empty());
    }
}
