use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::models::tool::Tool;
use crate::toolkit::Toolkit;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Duplicate tool name '{name}' (already provided by toolkit '{toolkit}')")]
    DuplicateToolName { name: String, toolkit: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// The per-run catalog of every tool available to the agent.
///
/// Built once from the toolkits registered before the loop starts; tool names
/// are globally unique and a collision is a configuration error, not
/// something resolved by renaming. Read-only once the run begins.
#[derive(Default)]
pub struct ToolRegistry {
    toolkits: Vec<Arc<dyn Toolkit>>,
    tools: HashMap<String, (Tool, Arc<dyn Toolkit>)>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest every tool the toolkit currently exposes.
    ///
    /// Fails on the first colliding name and registers nothing from the
    /// offending toolkit, so a failed registration leaves the catalog as it
    /// was.
    pub fn register(&mut self, toolkit: Arc<dyn Toolkit>) -> Result<(), RegistryError> {
        let tools = toolkit.tools();

        let mut incoming = HashSet::new();
        for tool in &tools {
            if let Some((_, owner)) = self.tools.get(&tool.name) {
                return Err(RegistryError::DuplicateToolName {
                    name: tool.name.clone(),
                    toolkit: owner.name().to_string(),
                });
            }
            if !incoming.insert(tool.name.as_str()) {
                return Err(RegistryError::DuplicateToolName {
                    name: tool.name.clone(),
                    toolkit: toolkit.name().to_string(),
                });
            }
        }

        for tool in tools {
            self.order.push(tool.name.clone());
            self.tools
                .insert(tool.name.clone(), (tool, toolkit.clone()));
        }
        self.toolkits.push(toolkit);
        Ok(())
    }

    /// Look up a tool and the toolkit that owns it
    pub fn resolve(&self, name: &str) -> Result<(&Tool, &Arc<dyn Toolkit>), RegistryError> {
        self.tools
            .get(name)
            .map(|(tool, toolkit)| (tool, toolkit))
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    /// The full tool catalog in registration order, in the shape providers
    /// advertise to the model
    pub fn tools(&self) -> Vec<Tool> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name).map(|(tool, _)| tool.clone()))
            .collect()
    }

    /// The registered toolkits in registration order
    pub fn toolkits(&self) -> &[Arc<dyn Toolkit>] {
        &self.toolkits
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ToolError, ToolResult};
    use crate::models::content::Content;
    use crate::models::tool::ToolCall;
    use async_trait::async_trait;
    use serde_json::json;

    struct StaticToolkit {
        name: String,
        tools: Vec<Tool>,
    }

    impl StaticToolkit {
        fn new(name: &str, tool_names: &[&str]) -> Self {
            Self {
                name: name.to_string(),
                tools: tool_names
                    .iter()
                    .map(|tool| {
                        Tool::new(
                            *tool,
                            "a test tool",
                            json!({"type": "object", "properties": {}}),
                        )
                    })
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl Toolkit for StaticToolkit {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "static tools for registry tests"
        }

        fn instructions(&self) -> String {
            String::new()
        }

        fn tools(&self) -> Vec<Tool> {
            self.tools.clone()
        }

        async fn call(&self, tool_call: ToolCall) -> ToolResult<Vec<Content>> {
            Err(ToolError::NotFound(tool_call.name))
        }
    }

    #[test]
    fn test_resolve_registered_names() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(StaticToolkit::new("files", &["read_file", "write_file"])))
            .unwrap();
        registry
            .register(Arc::new(StaticToolkit::new("shell", &["execute_command"])))
            .unwrap();

        for name in ["read_file", "write_file", "execute_command"] {
            let (tool, _) = registry.resolve(name).unwrap();
            assert_eq!(tool.name, name);
        }
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_resolve_unknown_name() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(StaticToolkit::new("files", &["read_file"])))
            .unwrap();

        let err = registry.resolve("launch_missiles").err().unwrap();
        assert!(matches!(err, RegistryError::UnknownTool(_)));
    }

    #[test]
    fn test_duplicate_across_toolkits_rejected() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(StaticToolkit::new("files", &["read_file"])))
            .unwrap();

        let err = registry
            .register(Arc::new(StaticToolkit::new("other", &["read_file", "extra"])))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateToolName { .. }));

        // The failed toolkit contributed nothing, the original stands.
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("extra").is_err());
        assert!(registry.resolve("read_file").is_ok());
    }

    #[test]
    fn test_duplicate_within_one_toolkit_rejected() {
        let mut registry = ToolRegistry::new();
        let err = registry
            .register(Arc::new(StaticToolkit::new("echo", &["echo", "echo"])))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateToolName { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_tools_in_registration_order() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(StaticToolkit::new("files", &["read_file", "write_file"])))
            .unwrap();
        registry
            .register(Arc::new(StaticToolkit::new("shell", &["execute_command"])))
            .unwrap();

        let names: Vec<String> = registry.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["read_file", "write_file", "execute_command"]);
    }
}
