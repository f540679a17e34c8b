//! Tool runner - registry of tools keyed by server and name

use std::collections::BTreeMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use crate::Result;
use crate::error::Error;
use super::{Tool, ToolExecutor};

/// Tool definition for the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Tool runner manages registered tools and executes them
pub struct ToolRunner {
    tools: BTreeMap<(String, String), Box<dyn Tool>>,
}

impl ToolRunner {
    /// Create an empty tool runner
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Create a tool runner with the built-in tools
    pub fn new_with_builtins() -> Self {
        let mut runner = Self::new();
        runner.register("builtin", super::CurrentTimeTool);
        runner
    }

    /// Register a tool under a server
    pub fn register<T: Tool + 'static>(&mut self, server_id: &str, tool: T) {
        let key = (server_id.to_string(), tool.name().to_string());
        self.tools.insert(key, Box::new(tool));
    }

    /// Find a tool; without a server id the name must be unambiguous.
    fn lookup(&self, server_id: &str, name: &str) -> Option<&dyn Tool> {
        if !server_id.is_empty() {
            return self
                .tools
                .get(&(server_id.to_string(), name.to_string()))
                .map(|t| t.as_ref());
        }

        let mut matches = self.tools.iter().filter(|((_, n), _)| n == name);
        match (matches.next(), matches.next()) {
            (Some((_, tool)), None) => Some(tool.as_ref()),
            _ => None,
        }
    }

    /// Check if a tool exists
    pub fn has(&self, server_id: &str, name: &str) -> bool {
        self.lookup(server_id, name).is_some()
    }

    /// List registered tools as `server/name`
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().map(|(s, n)| format!("{s}/{n}")).collect()
    }
}

impl Default for ToolRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRunner {
    async fn execute(&self, server_id: &str, tool_name: &str, params: Value) -> Result<String> {
        let tool = self
            .lookup(server_id, tool_name)
            .ok_or_else(|| Error::ToolExecution(format!("Unknown tool: {server_id}/{tool_name}")))?;

        debug!("Running tool {}/{}", server_id, tool_name);
        tool.execute(params).await
    }

    fn parameter_schema(&self, server_id: &str, tool_name: &str) -> Option<Value> {
        self.lookup(server_id, tool_name).map(|t| t.parameters())
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|((server_id, _), t)| t.to_definition(server_id))
            .collect()
    }
}
