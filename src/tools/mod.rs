//! Tools module - external capabilities the model can invoke
//!
//! Tools live on a server (an MCP server, the built-in set, ...) and are
//! addressed by `(server_id, name)`. The session engine only talks to them
//! through [`ToolExecutor`].

mod builtin;
mod runner;
pub mod schema;

pub use builtin::CurrentTimeTool;
pub use runner::{ToolDefinition, ToolRunner};

use async_trait::async_trait;
use serde_json::Value;
use crate::Result;

/// Tool trait - interface for all tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name used in tool calls
    fn name(&self) -> &str;

    /// Description of what the tool does
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters(&self) -> Value;

    /// Execute the tool with given parameters
    async fn execute(&self, params: Value) -> Result<String>;

    /// Convert to tool definition for the model
    fn to_definition(&self, server_id: &str) -> ToolDefinition {
        ToolDefinition {
            server_id: server_id.to_string(),
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Executes tools on behalf of the session engine.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run a tool. An empty `server_id` means "whichever server has it".
    async fn execute(&self, server_id: &str, tool_name: &str, params: Value) -> Result<String>;

    /// Declared parameter schema, or `None` if the tool is unknown.
    fn parameter_schema(&self, server_id: &str, tool_name: &str) -> Option<Value>;

    /// Everything the model may call.
    fn definitions(&self) -> Vec<ToolDefinition>;
}
