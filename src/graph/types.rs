//! Graph connection settings (the `graph` section of `careergraph.yaml`).

use serde::Deserialize;

/// How to reach the Neo4j HTTP API.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    /// Base URL of the HTTP API, e.g. `http://localhost:7474`.
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Reject queries containing write or admin clauses before sending them.
    #[serde(default = "default_read_only")]
    pub read_only: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_uri() -> String {
    "http://localhost:7474".to_string()
}
fn default_database() -> String {
    "neo4j".to_string()
}
fn default_username() -> String {
    "neo4j".to_string()
}
fn default_read_only() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            database: default_database(),
            username: default_username(),
            password: String::new(),
            read_only: default_read_only(),
            timeout_secs: default_timeout_secs(),
        }
    }
}
