use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::errors::{ToolError, ToolResult};
use crate::models::content::Content;
use crate::models::tool::{Tool, ToolCall};
use crate::toolkit::Toolkit;

/// In-process toolkit with file and shell capabilities.
pub struct DeveloperToolkit {
    tools: Vec<Tool>,
    cwd: Mutex<PathBuf>,
}

impl Default for DeveloperToolkit {
    fn default() -> Self {
        Self::new()
    }
}

impl DeveloperToolkit {
    pub fn new() -> Self {
        let read_file_tool = Tool::new(
            "read_file",
            "Read the contents of the file at the given path.",
            json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Absolute or relative path of the file to read."
                    }
                }
            }),
        );

        let write_file_tool = Tool::new(
            "write_file",
            "Write content to the file at the given path, creating parent directories as needed.",
            json!({
                "type": "object",
                "required": ["path", "content"],
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Absolute or relative path of the file to write."
                    },
                    "content": {
                        "type": "string",
                        "description": "The content to write."
                    }
                }
            }),
        );

        let list_directory_tool = Tool::new(
            "list_directory",
            "List the files and subdirectories in the given directory.",
            json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Absolute or relative path of the directory to list."
                    }
                }
            }),
        );

        let execute_command_tool = Tool::new(
            "execute_command",
            "Run a shell command, optionally in a specific working directory. \
            Output is captured and returned once the command finishes.",
            json!({
                "type": "object",
                "required": ["command"],
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to run."
                    },
                    "working_dir": {
                        "type": "string",
                        "description": "The directory to run the command in. Defaults to the current working directory."
                    }
                }
            }),
        );

        Self {
            tools: vec![
                read_file_tool,
                write_file_tool,
                list_directory_tool,
                execute_command_tool,
            ],
            cwd: Mutex::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
        }
    }

    // Helper method to resolve a path relative to cwd
    fn resolve_path(&self, path_str: &str) -> PathBuf {
        let cwd = self.cwd.lock().unwrap();
        let path = Path::new(path_str);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        }
    }

    async fn read_file(&self, params: Value) -> ToolResult<Vec<Content>> {
        let path_str = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let path = self.resolve_path(path_str);

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("Failed to read '{}': {}", path.display(), e))
        })?;

        Ok(vec![Content::text(content)])
    }

    async fn write_file(&self, params: Value) -> ToolResult<Vec<Content>> {
        let path_str = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;
        let path = self.resolve_path(path_str);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionFailed(format!(
                    "Failed to create directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        tokio::fs::write(&path, content).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("Failed to write '{}': {}", path.display(), e))
        })?;

        Ok(vec![Content::text(format!(
            "Wrote {} bytes to {}",
            content.len(),
            path.display()
        ))])
    }

    async fn list_directory(&self, params: Value) -> ToolResult<Vec<Content>> {
        let path_str = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let path = self.resolve_path(path_str);

        let mut entries = tokio::fs::read_dir(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!(
                "Failed to read directory '{}': {}",
                path.display(),
                e
            ))
        })?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            ToolError::ExecutionFailed(format!("Failed to read directory entry: {}", e))
        })? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        Ok(vec![Content::text(names.join("\n"))])
    }

    async fn execute_command(&self, params: Value) -> ToolResult<Vec<Content>> {
        let command = params
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;
        let working_dir = params.get("working_dir").and_then(|v| v.as_str());

        let cwd = match working_dir {
            Some(dir) => {
                let resolved = self.resolve_path(dir);
                if !resolved.is_dir() {
                    return Err(ToolError::InvalidArguments(format!(
                        "The directory '{}' does not exist",
                        resolved.display()
                    )));
                }
                resolved
            }
            None => self.cwd.lock().unwrap().clone(),
        };

        // Redirect stderr to stdout to interleave outputs
        let cmd_with_redirect = format!("{} 2>&1", command);

        let output = Command::new("bash")
            .arg("-c")
            .arg(&cmd_with_redirect)
            .current_dir(&cwd)
            .output()
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let output_str = String::from_utf8_lossy(&output.stdout).to_string();

        if !output.status.success() {
            return Err(ToolError::ExecutionFailed(format!(
                "Command exited with {}:\n{}",
                output.status, output_str
            )));
        }

        Ok(vec![Content::text(output_str)])
    }
}

#[async_trait]
impl Toolkit for DeveloperToolkit {
    fn name(&self) -> &str {
        "developer"
    }

    fn description(&self) -> &str {
        "A toolkit that provides file and shell capabilities"
    }

    fn instructions(&self) -> String {
        "Use the provided tools to read, write and list files and to run shell commands. \
        When execute_command is given a working_dir, the command already runs in that \
        directory; do not prefix it with cd."
            .to_string()
    }

    fn tools(&self) -> Vec<Tool> {
        self.tools.clone()
    }

    async fn call(&self, tool_call: ToolCall) -> ToolResult<Vec<Content>> {
        match tool_call.name.as_str() {
            "read_file" => self.read_file(tool_call.arguments).await,
            "write_file" => self.write_file(tool_call.arguments).await,
            "list_directory" => self.list_directory(tool_call.arguments).await,
            "execute_command" => self.execute_command(tool_call.arguments).await,
            _ => Err(ToolError::NotFound(tool_call.name)),
        }
    }
}
