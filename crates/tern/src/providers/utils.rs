use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::{json, Value};

use crate::errors::{ToolError, ToolResult};
use crate::models::content::Content;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};

/// Convert internal Message format to OpenAI's API message specification.
///
/// System and user messages map one to one. Assistant messages carry their
/// tool requests as `tool_calls` entries; a request whose call failed to
/// parse has no wire form here and is answered by the error tool message that
/// follows it. Tool messages expand to one `role: "tool"` entry per carried
/// response, keyed by `tool_call_id`.
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        match message.role {
            Role::System => {
                messages_spec.push(json!({
                    "role": "system",
                    "content": message.text(),
                }));
            }
            Role::User => {
                messages_spec.push(user_to_openai_spec(message));
            }
            Role::Assistant => {
                messages_spec.push(assistant_to_openai_spec(message));
            }
            Role::Tool => {
                for response in message.tool_responses() {
                    messages_spec.push(json!({
                        "role": "tool",
                        "tool_call_id": response.id,
                        "content": tool_result_to_text(&response.tool_result),
                    }));
                }
            }
        }
    }

    messages_spec
}

fn user_to_openai_spec(message: &Message) -> Value {
    let has_images = message
        .content
        .iter()
        .any(|content| matches!(content, MessageContent::Image(_)));

    if !has_images {
        return json!({
            "role": "user",
            "content": message.text(),
        });
    }

    let parts: Vec<Value> = message
        .content
        .iter()
        .filter_map(|content| match content {
            MessageContent::Text(text) => Some(json!({
                "type": "text",
                "text": text.text,
            })),
            MessageContent::Image(image) => Some(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{};base64,{}", image.mime_type, image.data)
                }
            })),
            _ => None,
        })
        .collect();

    json!({
        "role": "user",
        "content": parts,
    })
}

fn assistant_to_openai_spec(message: &Message) -> Value {
    let mut converted = json!({
        "role": "assistant"
    });

    let text = message.text();
    if !text.is_empty() {
        converted["content"] = json!(text);
    }

    let mut tool_calls = Vec::new();
    for request in message.tool_requests() {
        if let Ok(tool_call) = &request.tool_call {
            tool_calls.push(json!({
                "id": request.id,
                "type": "function",
                "function": {
                    "name": sanitize_function_name(&tool_call.name),
                    "arguments": tool_call.arguments.to_string(),
                }
            }));
        }
    }
    if !tool_calls.is_empty() {
        converted["tool_calls"] = json!(tool_calls);
    }

    converted
}

/// Coerce a tool result into the text the model sees. Image payloads are
/// replaced by a placeholder; an error becomes explanatory text the model can
/// react to.
pub fn tool_result_to_text(tool_result: &ToolResult<Vec<Content>>) -> String {
    match tool_result {
        Ok(contents) => contents
            .iter()
            .map(|content| match content {
                Content::Text(text) => text.text.clone(),
                Content::Image(image) => {
                    format!("[{} image content omitted]", image.mime_type)
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Err(error) => format!("The tool call returned the following error:\n{}", error),
    }
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

/// Convert OpenAI's API response to internal Message format
pub fn openai_response_to_message(response: Value) -> Result<Message> {
    let original = response["choices"][0]["message"].clone();
    let mut message = Message::assistant();

    if let Some(text) = original.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            message = message.with_text(text);
        }
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(Value::as_array) {
        for tool_call in tool_calls {
            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
            let function_name = tool_call["function"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default()
                .to_string();

            if !is_valid_function_name(&function_name) {
                let error = ToolError::NotFound(format!(
                    "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
                    function_name
                ));
                message = message.with_tool_request(id, Err(error));
            } else {
                match serde_json::from_str::<Value>(&arguments) {
                    Ok(params) => {
                        message = message
                            .with_tool_request(id, Ok(ToolCall::new(&function_name, params)));
                    }
                    Err(e) => {
                        let error = ToolError::InvalidArguments(format!(
                            "Could not interpret tool use arguments for id {}: {}",
                            id, e
                        ));
                        message = message.with_tool_request(id, Err(error));
                    }
                }
            }
        }
    }

    Ok(message)
}

pub fn sanitize_function_name(name: &str) -> String {
    let re = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    re.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    let re = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
    re.is_match(name)
}
