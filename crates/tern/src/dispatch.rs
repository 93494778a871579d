use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tracing::warn;

use crate::errors::{ToolError, ToolResult};
use crate::models::content::Content;
use crate::models::message::{ToolRequest, ToolResponse};
use crate::models::tool::Tool;
use crate::registry::ToolRegistry;

/// Execute every tool call requested in one assistant turn.
///
/// Calls run concurrently; the join blocks until all of them have produced a
/// result. The returned responses are positionally aligned with the requests
/// regardless of completion order, one response per request, with every
/// failure contained as an error result. Failed calls are never retried here.
pub async fn dispatch(
    registry: &ToolRegistry,
    requests: &[ToolRequest],
    timeout: Option<Duration>,
) -> Vec<ToolResponse> {
    let futures: Vec<_> = requests
        .iter()
        .map(|request| execute(registry, request, timeout))
        .collect();

    // join_all preserves input order, which gives the positional guarantee.
    join_all(futures).await
}

async fn execute(
    registry: &ToolRegistry,
    request: &ToolRequest,
    timeout: Option<Duration>,
) -> ToolResponse {
    let tool_result = run_call(registry, request, timeout).await;
    if let Err(err) = &tool_result {
        warn!(id = %request.id, %err, "tool call failed");
    }
    ToolResponse {
        id: request.id.clone(),
        tool_result,
    }
}

async fn run_call(
    registry: &ToolRegistry,
    request: &ToolRequest,
    timeout: Option<Duration>,
) -> ToolResult<Vec<Content>> {
    let call = request.tool_call.clone()?;
    let (tool, toolkit) = registry
        .resolve(&call.name)
        .map_err(|_| ToolError::NotFound(call.name.clone()))?;

    check_arguments(tool, &call.arguments)?;

    match timeout {
        Some(limit) => tokio::time::timeout(limit, toolkit.call(call.clone()))
            .await
            .map_err(|_| {
                ToolError::ExecutionFailed(format!(
                    "tool '{}' did not finish within {}s",
                    call.name,
                    limit.as_secs()
                ))
            })?,
        None => toolkit.call(call).await,
    }
}

/// Pre-flight check of arguments against the tool's declared schema: required
/// properties must be present and primitive types must match. Anything deeper
/// is the tool's own concern.
fn check_arguments(tool: &Tool, arguments: &Value) -> ToolResult<()> {
    let empty = serde_json::Map::new();
    let args = match arguments {
        Value::Null => &empty,
        Value::Object(map) => map,
        _ => {
            return Err(ToolError::InvalidArguments(format!(
                "arguments for tool '{}' must be an object",
                tool.name
            )))
        }
    };

    if let Some(required) = tool.input_schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(name) {
                return Err(ToolError::InvalidArguments(format!(
                    "missing required argument '{}' for tool '{}'",
                    name, tool.name
                )));
            }
        }
    }

    let Some(properties) = tool
        .input_schema
        .get("properties")
        .and_then(Value::as_object)
    else {
        return Ok(());
    };

    for (name, value) in args {
        if value.is_null() {
            continue;
        }
        let Some(expected) = properties
            .get(name)
            .and_then(|property| property.get("type"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        if !type_matches(expected, value) {
            return Err(ToolError::InvalidArguments(format!(
                "argument '{}' for tool '{}' must be of type {}",
                name, tool.name, expected
            )));
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolCall;
    use crate::toolkit::Toolkit;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct ScriptedToolkit;

    #[async_trait]
    impl Toolkit for ScriptedToolkit {
        fn name(&self) -> &str {
            "scripted"
        }

        fn description(&self) -> &str {
            "scripted outcomes for dispatcher tests"
        }

        fn instructions(&self) -> String {
            String::new()
        }

        fn tools(&self) -> Vec<Tool> {
            vec![
                Tool::new(
                    "echo",
                    "reply with the input",
                    json!({
                        "type": "object",
                        "properties": {
                            "message": {"type": "string"}
                        },
                        "required": ["message"]
                    }),
                ),
                Tool::new(
                    "explode",
                    "always fails",
                    json!({"type": "object", "properties": {}}),
                ),
                Tool::new(
                    "sleep",
                    "sleeps for a while",
                    json!({"type": "object", "properties": {}}),
                ),
            ]
        }

        async fn call(&self, tool_call: ToolCall) -> ToolResult<Vec<Content>> {
            match tool_call.name.as_str() {
                "echo" => Ok(vec![Content::text(
                    tool_call.arguments["message"].as_str().unwrap_or(""),
                )]),
                "explode" => Err(ToolError::ExecutionFailed("boom".into())),
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(vec![Content::text("woke up")])
                }
                _ => Err(ToolError::NotFound(tool_call.name)),
            }
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ScriptedToolkit)).unwrap();
        registry
    }

    fn request(id: &str, name: &str, arguments: Value) -> ToolRequest {
        ToolRequest {
            id: id.to_string(),
            tool_call: Ok(ToolCall::new(name, arguments)),
        }
    }

    #[tokio::test]
    async fn test_empty_turn() {
        let responses = dispatch(&registry(), &[], None).await;
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn test_responses_positionally_aligned() {
        let requests = vec![
            request("1", "echo", json!({"message": "first"})),
            request("2", "explode", json!({})),
            request("3", "echo", json!({"message": "third"})),
        ];

        let responses = dispatch(&registry(), &requests, None).await;

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].id, "1");
        assert_eq!(responses[1].id, "2");
        assert_eq!(responses[2].id, "3");
        assert!(responses[0].tool_result.is_ok());
        assert!(responses[1].tool_result.is_err());
        assert_eq!(
            responses[2].tool_result.as_ref().unwrap()[0].as_text(),
            Some("third")
        );
    }

    #[tokio::test]
    async fn test_failure_has_diagnostic_content() {
        let responses = dispatch(&registry(), &[request("1", "explode", json!({}))], None).await;

        let err = responses[0].tool_result.as_ref().unwrap_err();
        assert!(!err.to_string().is_empty());
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_contained() {
        let responses =
            dispatch(&registry(), &[request("1", "no_such_tool", json!({}))], None).await;

        assert!(matches!(
            responses[0].tool_result,
            Err(ToolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_request_passes_error_through() {
        let requests = vec![ToolRequest {
            id: "1".to_string(),
            tool_call: Err(ToolError::InvalidArguments("unparseable call".into())),
        }];

        let responses = dispatch(&registry(), &requests, None).await;
        assert!(matches!(
            responses[0].tool_result,
            Err(ToolError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_required_argument_rejected() {
        let responses = dispatch(&registry(), &[request("1", "echo", json!({}))], None).await;

        let err = responses[0].tool_result.as_ref().unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        assert!(err.to_string().contains("message"));
    }

    #[tokio::test]
    async fn test_wrong_argument_type_rejected() {
        let responses = dispatch(
            &registry(),
            &[request("1", "echo", json!({"message": 42}))],
            None,
        )
        .await;

        assert!(matches!(
            responses[0].tool_result,
            Err(ToolError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_contained_as_error() {
        let requests = vec![
            request("1", "sleep", json!({})),
            request("2", "echo", json!({"message": "fast"})),
        ];

        let responses =
            dispatch(&registry(), &requests, Some(Duration::from_millis(50))).await;

        assert!(matches!(
            responses[0].tool_result,
            Err(ToolError::ExecutionFailed(_))
        ));
        assert!(responses[1].tool_result.is_ok());
    }
}
