use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::errors::{ToolError, ToolResult};
use crate::models::content::Content;
use crate::models::tool::{Tool, ToolCall};
use crate::toolkit::{Resource, Toolkit};

const PROTOCOL_VERSION: &str = "2025-06-18";

/// Launch configuration for an external tool server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Error)]
pub enum RemoteToolkitError {
    #[error("failed to spawn tool server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tool server '{server}' transport error: {message}")]
    Transport { server: String, message: String },

    #[error("tool server '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("tool server '{server}' terminated unexpectedly")]
    Terminated { server: String },
}

/// A session to an external tool server speaking JSON-RPC 2.0 over the
/// server process's stdio.
///
/// `open` spawns the process, performs the initialize handshake and fetches
/// the tool and resource catalogs; the catalogs stay fixed for the run.
/// `close` is safe to call at any point, including after a partially failed
/// `open`, and the child is killed on drop as a backstop so the process never
/// outlives the session.
pub struct RemoteToolkit {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    open_lock: AsyncMutex<()>,
    child: StdMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value, RemoteToolkitError>>>>,
    id_counter: AtomicU64,
    instructions: StdMutex<Option<String>>,
    tools: StdMutex<Vec<Tool>>,
    resources: StdMutex<Vec<Resource>>,
}

impl RemoteToolkit {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                open_lock: AsyncMutex::new(()),
                child: StdMutex::new(None),
                writer: AsyncMutex::new(None),
                pending: AsyncMutex::new(HashMap::new()),
                id_counter: AtomicU64::new(1),
                instructions: StdMutex::new(None),
                tools: StdMutex::new(Vec::new()),
                resources: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Establish the session. Idempotent: opening an already-open session is
    /// a no-op.
    pub async fn open(&self) -> Result<(), RemoteToolkitError> {
        let _guard = self.inner.open_lock.lock().await;
        if self.inner.child.lock().unwrap().is_some() {
            return Ok(());
        }

        let config = &self.inner.config;
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &config.workdir {
            command.current_dir(dir);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| RemoteToolkitError::Spawn {
            server: config.name.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.inner.transport_error("failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.inner.transport_error("failed to capture server stdout"))?;

        *self.inner.writer.lock().await = Some(BufWriter::new(stdin));
        *self.inner.child.lock().unwrap() = Some(child);

        let reader = Arc::clone(&self.inner);
        tokio::spawn(async move {
            reader.reader_loop(stdout).await;
        });

        match self.inner.handshake().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shutdown().await;
                Err(err)
            }
        }
    }

    /// Release the session. Safe to call more than once and after a failed
    /// `open`; pending requests fail with `Terminated`.
    pub async fn close(&self) {
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        self.inner.writer.lock().await.take();

        let child = self.inner.child.lock().unwrap().take();
        if let Some(mut child) = child {
            if let Err(err) = child.start_kill() {
                debug!(
                    server = %self.inner.config.name,
                    %err,
                    "failed to kill tool server process (may have already exited)"
                );
            }
            let _ = child.wait().await;
        }

        self.inner.fail_pending().await;
    }

    async fn invoke(&self, name: &str, arguments: Value) -> ToolResult<Vec<Content>> {
        let params = json!({
            "name": name,
            "arguments": match arguments {
                Value::Null => json!({}),
                other => other,
            }
        });

        let result = self
            .inner
            .request("tools/call", params)
            .await
            .map_err(|err| ToolError::ExecutionFailed(err.to_string()))?;

        parse_call_result(&result)
    }
}

#[async_trait]
impl Toolkit for RemoteToolkit {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn description(&self) -> &str {
        self.inner
            .config
            .description
            .as_deref()
            .unwrap_or("An external tool server")
    }

    fn instructions(&self) -> String {
        self.inner
            .instructions
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default()
    }

    fn tools(&self) -> Vec<Tool> {
        self.inner.tools.lock().unwrap().clone()
    }

    async fn call(&self, tool_call: ToolCall) -> ToolResult<Vec<Content>> {
        self.invoke(&tool_call.name, tool_call.arguments).await
    }

    async fn resources(&self) -> anyhow::Result<Vec<Resource>> {
        Ok(self.inner.resources.lock().unwrap().clone())
    }

    async fn read_resource(&self, uri: &str) -> ToolResult<String> {
        let result = self
            .inner
            .request("resources/read", json!({"uri": uri}))
            .await
            .map_err(|err| ToolError::ExecutionFailed(err.to_string()))?;

        parse_resource_text(&result)
            .ok_or_else(|| ToolError::NotFound(format!("resource not found: {uri}")))
    }
}

impl Inner {
    async fn handshake(&self) -> Result<(), RemoteToolkitError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        let init = self.request("initialize", params).await?;
        if let Some(text) = init.get("instructions").and_then(Value::as_str) {
            *self.instructions.lock().unwrap() = Some(text.to_string());
        }
        self.notify("notifications/initialized", json!({})).await?;

        let tools = self.request("tools/list", json!({})).await?;
        *self.tools.lock().unwrap() = parse_tool_catalog(&tools);

        // Servers without resource support answer with method-not-found.
        match self.request("resources/list", json!({})).await {
            Ok(result) => *self.resources.lock().unwrap() = parse_resource_catalog(&result),
            Err(RemoteToolkitError::Rpc { code: -32601, .. }) => {}
            Err(err) => return Err(err),
        }

        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RemoteToolkitError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RemoteToolkitError::Terminated {
                server: self.config.name.clone(),
            }),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), RemoteToolkitError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), RemoteToolkitError> {
        let encoded = message.to_string();

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| self.transport_error("session is not open"))?;
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(|err| self.transport_error(err.to_string()))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|err| self.transport_error(err.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|err| self.transport_error(err.to_string()))?;
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(raw)) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(value) => self.route_inbound(value).await,
                        Err(err) => warn!(
                            server = %self.config.name,
                            line = trimmed,
                            %err,
                            "received invalid JSON from tool server"
                        ),
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        self.fail_pending().await;
    }

    async fn route_inbound(&self, value: Value) {
        let id = value.get("id").cloned().filter(|id| !id.is_null());
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);

        match (id, method) {
            (Some(id), Some(method)) => self.answer_server_request(id, &method).await,
            (Some(id), None) => self.resolve_pending(id, value).await,
            (None, Some(method)) => {
                debug!(server = %self.config.name, method = %method, "ignoring server notification");
            }
            (None, None) => {}
        }
    }

    async fn resolve_pending(&self, id: Value, value: Value) {
        let Some(key) = id.as_u64() else {
            return;
        };
        let sender = self.pending.lock().await.remove(&key);
        let Some(sender) = sender else {
            debug!(server = %self.config.name, response_id = key, "received response for unknown request");
            return;
        };

        let outcome = if let Some(error) = value.get("error") {
            Err(RemoteToolkitError::Rpc {
                server: self.config.name.clone(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = sender.send(outcome);
    }

    async fn answer_server_request(&self, id: Value, method: &str) {
        let payload = if method == "ping" {
            json!({"jsonrpc": "2.0", "id": id, "result": {}})
        } else {
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": -32601,
                    "message": format!("client does not implement method '{method}'"),
                }
            })
        };
        if let Err(err) = self.write_message(&payload).await {
            warn!(server = %self.config.name, %err, "failed to answer server request");
        }
    }

    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(RemoteToolkitError::Terminated {
                server: self.config.name.clone(),
            }));
        }
    }

    fn transport_error(&self, message: impl Into<String>) -> RemoteToolkitError {
        RemoteToolkitError::Transport {
            server: self.config.name.clone(),
            message: message.into(),
        }
    }
}

/// Translate a `tools/list` result into the core tool shape.
fn parse_tool_catalog(result: &Value) -> Vec<Tool> {
    let Some(items) = result.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name").and_then(Value::as_str)?;
            let description = item
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let input_schema = item
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object"}));
            Some(Tool::new(name, description, input_schema))
        })
        .collect()
}

/// Translate a `resources/list` result into the core resource shape.
fn parse_resource_catalog(result: &Value) -> Vec<Resource> {
    let Some(items) = result.get("resources").and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let uri = item.get("uri").and_then(Value::as_str)?;
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string);
            let mut resource = match Resource::new(uri, name) {
                Ok(resource) => resource,
                Err(err) => {
                    debug!(uri, %err, "skipping resource with invalid uri");
                    return None;
                }
            };
            if let Some(description) = item.get("description").and_then(Value::as_str) {
                resource = resource.with_description(description);
            }
            if let Some(mime_type) = item.get("mimeType").and_then(Value::as_str) {
                resource = resource.with_mime_type(mime_type);
            }
            Some(resource)
        })
        .collect()
}

/// Translate a `tools/call` result. A result flagged `isError` becomes an
/// error with the content text as diagnostic.
fn parse_call_result(result: &Value) -> ToolResult<Vec<Content>> {
    let contents = parse_content_items(result.get("content"));

    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let diagnostic = contents
            .iter()
            .filter_map(Content::as_text)
            .collect::<Vec<_>>()
            .join("\n");
        let diagnostic = if diagnostic.is_empty() {
            "tool reported an error without diagnostic content".to_string()
        } else {
            diagnostic
        };
        return Err(ToolError::ExecutionFailed(diagnostic));
    }

    Ok(contents)
}

fn parse_content_items(value: Option<&Value>) -> Vec<Content> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item.get("type").and_then(Value::as_str) {
            Some("text") => item
                .get("text")
                .and_then(Value::as_str)
                .map(Content::text),
            Some("image") => {
                let data = item.get("data").and_then(Value::as_str)?;
                let mime_type = item
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                Some(Content::image(data, mime_type))
            }
            _ => None,
        })
        .collect()
}

fn parse_resource_text(result: &Value) -> Option<String> {
    let contents = result.get("contents")?.as_array()?;
    let texts: Vec<&str> = contents
        .iter()
        .filter_map(|content| content.get("text").and_then(Value::as_str))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            command: "a-tool-server".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            workdir: None,
            description: None,
        }
    }

    #[test]
    fn test_parse_tool_catalog() {
        let result = json!({
            "tools": [
                {
                    "name": "search_places",
                    "description": "Search for nearby places",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"query": {"type": "string"}},
                        "required": ["query"]
                    }
                },
                {"name": "bare_tool"},
                {"description": "nameless, skipped"}
            ]
        });

        let tools = parse_tool_catalog(&result);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "search_places");
        assert_eq!(tools[0].input_schema["required"][0], "query");
        assert_eq!(tools[1].name, "bare_tool");
        assert_eq!(tools[1].input_schema["type"], "object");
    }

    #[test]
    fn test_parse_resource_catalog() {
        let result = json!({
            "resources": [
                {
                    "uri": "file:///guide/usage.md",
                    "name": "usage",
                    "description": "How to use this server",
                    "mimeType": "text/markdown"
                },
                {"uri": "not a uri", "name": "bad"}
            ]
        });

        let resources = parse_resource_catalog(&result);
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, "usage");
        assert_eq!(resources[0].mime_type.as_deref(), Some("text/markdown"));
    }

    #[test]
    fn test_parse_call_result_success() {
        let result = json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"},
                {"type": "image", "data": "aGk=", "mimeType": "image/png"}
            ]
        });

        let contents = parse_call_result(&result).unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0].as_text(), Some("first"));
        assert_eq!(contents[2].as_image(), Some(("aGk=", "image/png")));
    }

    #[test]
    fn test_parse_call_result_error_flag() {
        let result = json!({
            "content": [{"type": "text", "text": "path is outside allowed roots"}],
            "isError": true
        });

        let err = parse_call_result(&result).unwrap_err();
        match err {
            ToolError::ExecutionFailed(message) => {
                assert!(message.contains("outside allowed roots"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_call_result_error_without_content() {
        let err = parse_call_result(&json!({"isError": true})).unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn test_parse_resource_text() {
        let result = json!({
            "contents": [
                {"uri": "str:///a", "text": "line one"},
                {"uri": "str:///b", "text": "line two"}
            ]
        });
        assert_eq!(
            parse_resource_text(&result),
            Some("line one\nline two".to_string())
        );
        assert_eq!(parse_resource_text(&json!({"contents": []})), None);
    }

    #[test]
    fn test_server_config_defaults() {
        let parsed: ServerConfig =
            serde_json::from_value(json!({"name": "maps", "command": "maps-server"})).unwrap();
        assert_eq!(parsed.name, "maps");
        assert!(parsed.args.is_empty());
        assert!(parsed.env.is_empty());
        assert!(parsed.workdir.is_none());
    }

    #[tokio::test]
    async fn test_close_without_open_is_safe() {
        let toolkit = RemoteToolkit::new(config("idle"));
        toolkit.close().await;
        toolkit.close().await;
    }

    #[tokio::test]
    async fn test_call_without_open_is_contained() {
        let toolkit = RemoteToolkit::new(config("closed"));
        let err = toolkit
            .call(ToolCall::new("anything", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
        assert!(err.to_string().contains("session is not open"));
    }

    #[tokio::test]
    async fn test_open_missing_binary_fails_with_context() {
        let toolkit = RemoteToolkit::new(ServerConfig {
            command: "/definitely/not/a/real/binary".to_string(),
            ..config("ghost")
        });

        let err = toolkit.open().await.unwrap_err();
        assert!(matches!(err, RemoteToolkitError::Spawn { .. }));
        assert!(err.to_string().contains("ghost"));

        // A failed open must still be safely closable.
        toolkit.close().await;
    }
}
