//! Graph tools: the callable external queries the model can request.
//!
//! - `registry`: tool name → [`GraphTool`] mapping, validation, dedup keys
//! - `neo4j`: the Neo4j HTTP backend, read-only guard, and `query_graph` tool
//! - `types`: connection settings

pub mod errors;
pub mod neo4j;
pub mod registry;
pub mod types;

pub use errors::ToolError;
pub use neo4j::{GraphBackend, Neo4jHttpBackend, QueryGraphTool, QUERY_GRAPH_TOOL};
pub use registry::{GraphTool, ToolRegistry};
pub use types::GraphConfig;
