pub mod agent_core;
pub mod commands;
pub mod config;
pub mod graph;
pub mod inference;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_core::{
    AgentError, EquivalenceOracle, EquivalenceStrategy, ExactMatchOracle, ModelEquivalenceOracle,
    SafetyLayer, SessionStore, WorkflowEngine,
};
use config::{AppConfig, IN_MEMORY_DATABASE};
use graph::{GraphBackend, Neo4jHttpBackend, QueryGraphTool, ToolRegistry};
use inference::{InferenceClient, ModelBackend};

/// Shared state handed to every command.
pub struct AppState {
    pub engine: WorkflowEngine,
}

impl AppState {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self { engine }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        self.engine.store()
    }
}

/// Return the platform-standard data directory for CareerGraph.
///
/// - macOS: `~/Library/Application Support/com.careergraph.app/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.careergraph.app\`
/// - Linux: `$XDG_DATA_HOME/com.careergraph.app/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.careergraph/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.careergraph.app");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".careergraph")
}

// ─── Logging ────────────────────────────────────────────────────────────────

/// Initialize the tracing subscriber; writes structured logs to `log_dir`.
///
/// On each startup:
/// 1. Rotates existing logs (agent.log → agent.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh agent.log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the data directory path for discoverability.
///
/// Returns the path of the active log file.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("agent.log");

    // Rotate: agent.log.2 → .3, .1 → .2, agent.log → .1
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("careergraph=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| std::io::Error::other(format!("tracing already initialized: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== CareerGraph starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `agent.log` → `agent.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// `tracing-subscriber` buffers log output internally. Without explicit
/// flushing, log entries may sit in OS buffers and be lost on crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Wiring ─────────────────────────────────────────────────────────────────

fn config_err(what: &str, e: impl std::fmt::Display) -> AgentError {
    AgentError::ConfigError {
        reason: format!("{what}: {e}"),
    }
}

/// Open the session store named by the config.
pub fn open_store(config: &AppConfig, data_dir: &Path) -> Result<SessionStore, AgentError> {
    let path = config.database_path(data_dir);
    if path == IN_MEMORY_DATABASE {
        tracing::info!("sessions kept in memory only");
        return Ok(SessionStore::in_memory());
    }
    if let Some(parent) = Path::new(&path).parent() {
        std::fs::create_dir_all(parent).map_err(|e| config_err("cannot create database dir", e))?;
    }
    SessionStore::open(&path)
}

/// Build the model client, graph tool, oracle, safety layer, and session
/// store from the config, and assemble them into the workflow engine.
///
/// The graph schema is fetched here. If the graph is unreachable the engine
/// starts with an empty schema; queries fail and are recorded as such until
/// the graph comes back, and the first successful query fetches the schema.
pub async fn build_state(config: &AppConfig, data_dir: &Path) -> Result<AppState, AgentError> {
    let client = InferenceClient::from_config(&config.models)
        .map_err(|e| config_err("model configuration", e))?;
    tracing::info!(model = client.current_model_name(), "inference client ready");
    let model: Arc<dyn ModelBackend> = Arc::new(client);

    let backend: Arc<dyn GraphBackend> = Arc::new(
        Neo4jHttpBackend::from_config(&config.graph)
            .map_err(|e| config_err("graph configuration", e))?,
    );
    let schema = match backend.schema().await {
        Ok(schema) => {
            tracing::info!(bytes = schema.len(), "graph schema loaded");
            schema
        }
        Err(e) => {
            tracing::warn!(uri = %config.graph.uri, error = %e, "graph schema unavailable");
            String::new()
        }
    };

    let mut registry =
        ToolRegistry::new().with_call_timeout(Duration::from_secs(config.graph.timeout_secs));
    registry.register(Arc::new(QueryGraphTool::new(backend.clone())));

    let workflow = &config.workflow;
    let oracle: Arc<dyn EquivalenceOracle> = match workflow.equivalence_strategy {
        EquivalenceStrategy::Model => Arc::new(ModelEquivalenceOracle::new(
            model.clone(),
            workflow.oracle_max_attempts,
            Duration::from_millis(workflow.oracle_base_delay_ms),
        )),
        EquivalenceStrategy::Exact => Arc::new(ExactMatchOracle),
    };
    tracing::info!(oracle = oracle.name(), "equivalence oracle selected");

    let safety = SafetyLayer::from_config(&config.safety)?;
    let store = open_store(config, data_dir)?;

    let engine = WorkflowEngine::new(model, Arc::new(registry), oracle, Arc::new(store))
        .with_safety(Arc::new(safety))
        .with_config(workflow.clone())
        .with_schema(schema)
        .with_schema_source(backend);
    Ok(AppState::new(engine))
}
