//! Application configuration: `careergraph.yaml`.
//!
//! One file holds every section: the model table, the graph connection, the
//! workflow limits, the safety layer, and where sessions are stored. Values
//! may reference the environment as `${VAR}` or `${VAR:-default}`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::agent_core::{AgentError, SafetyConfig, WorkflowConfig};
use crate::graph::GraphConfig;
use crate::inference::config::interpolate_env_vars;
use crate::inference::ModelsConfig;

/// File name searched for upward from the working directory.
pub const CONFIG_FILE_NAME: &str = "careergraph.yaml";

/// Environment variable holding an explicit config path.
pub const CONFIG_ENV_VAR: &str = "CAREERGRAPH_CONFIG";

/// Keeps sessions in memory only.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub models: ModelsConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    /// SQLite file for sessions; `:memory:` disables persistence.
    #[serde(default)]
    pub database_path: Option<String>,
}

impl AppConfig {
    /// The session database location, defaulting to `<data_dir>/sessions.db`.
    pub fn database_path(&self, data_dir: &Path) -> String {
        match self.database_path.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => data_dir.join("sessions.db").display().to_string(),
        }
    }
}

// ─── Loading ────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `CAREERGRAPH_CONFIG` wins when set; otherwise searches upward from
/// `start` for `careergraph.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, AgentError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(&explicit);
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(AgentError::ConfigError {
            reason: format!("{CONFIG_ENV_VAR} points to a missing file: {explicit}"),
        });
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(AgentError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Read, interpolate, and parse the config file.
pub fn load_config(path: &Path) -> Result<AppConfig, AgentError> {
    let raw = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse config text after environment interpolation.
pub fn parse_config(raw: &str) -> Result<AppConfig, AgentError> {
    let interpolated = interpolate_env_vars(raw);
    let config: AppConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    if config.models.models.is_empty() {
        return Err(AgentError::ConfigError {
            reason: "no models configured".into(),
        });
    }
    if config.workflow.max_tool_rounds == 0 {
        tracing::warn!("workflow.max_tool_rounds is 0, using 1");
    }
    Ok(config)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
