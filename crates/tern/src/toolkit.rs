pub mod developer;
pub mod remote;
mod resource;

pub use resource::Resource;

use async_trait::async_trait;

use crate::errors::{ToolError, ToolResult};
use crate::models::content::Content;
use crate::models::tool::{Tool, ToolCall};

/// Core trait for a source of tools the agent can operate.
///
/// Implementations are either in-process (see [`developer`]) or a session to
/// an external tool server (see [`remote`]). Failures inside `call` must be
/// reported through the error channel; they are converted into error results
/// the model can read, never into crashes.
#[async_trait]
pub trait Toolkit: Send + Sync {
    /// Get the name of the toolkit
    fn name(&self) -> &str;

    /// Get the toolkit description
    fn description(&self) -> &str;

    /// Instructions injected into the system prompt
    fn instructions(&self) -> String;

    /// The tools this toolkit currently exposes
    fn tools(&self) -> Vec<Tool>;

    /// Call a tool with the given arguments
    async fn call(&self, tool_call: ToolCall) -> ToolResult<Vec<Content>>;

    /// Readable resources usable to prime the conversation, read once at
    /// startup. Most toolkits expose none.
    async fn resources(&self) -> anyhow::Result<Vec<Resource>> {
        Ok(Vec::new())
    }

    /// Read a resource by URI
    async fn read_resource(&self, uri: &str) -> ToolResult<String> {
        Err(ToolError::NotFound(format!("resource not found: {uri}")))
    }
}
