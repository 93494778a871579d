use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::dispatch::dispatch;
use crate::models::message::{Message, MessageContent, ToolRequest};
use crate::providers::base::Provider;
use crate::registry::ToolRegistry;

/// Default iteration budget for a run.
pub const DEFAULT_MAX_ITERATIONS: usize = 30;

/// Terminal outcome of a run.
///
/// Hitting the iteration budget is a designed degraded completion, not an
/// error: the agent surfaces its best partial progress, and callers can tell
/// the two outcomes apart for logging or alerting.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The model produced a tool-call-free answer.
    Completed(String),
    /// The iteration budget ran out; carries the content of the last
    /// appended message as a partial answer.
    IterationLimitExceeded(String),
}

impl RunOutcome {
    pub fn content(&self) -> &str {
        match self {
            RunOutcome::Completed(content) => content,
            RunOutcome::IterationLimitExceeded(content) => content,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

/// Agent integrates a model with the toolkits it needs to pilot.
///
/// One agent drives one run at a time: turns are sequential, the tool calls
/// within a turn run concurrently, and the conversation is exclusively owned
/// by the run. Everything the loop needs is injected here; there is no
/// process-wide state.
pub struct Agent {
    provider: Box<dyn Provider>,
    registry: Arc<ToolRegistry>,
    max_iterations: usize,
    tool_timeout: Option<Duration>,
}

impl Agent {
    /// Create a new Agent with the specified provider and tool catalog
    pub fn new(provider: Box<dyn Provider>, registry: ToolRegistry) -> Self {
        Self {
            provider,
            registry: Arc::new(registry),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tool_timeout: None,
        }
    }

    /// Set the maximum number of model invocations per run
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Bound the execution time of each individual tool call
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }

    /// The system message priming a fresh conversation: toolkit descriptions
    /// and instructions, plus any resources the toolkits expose. Resources
    /// are read once here and never re-fetched during the loop.
    pub async fn system_message(&self) -> Message {
        let mut sections = vec![
            "You are an agent that completes the user's task by calling the tools available to you. \
            Keep replies brief and state only what was done."
                .to_string(),
        ];

        for toolkit in self.registry.toolkits() {
            let mut section = format!("## {}\n{}", toolkit.name(), toolkit.description());
            let instructions = toolkit.instructions();
            if !instructions.is_empty() {
                section.push('\n');
                section.push_str(&instructions);
            }
            sections.push(section);
        }

        let primed = self.primed_resources().await;
        if !primed.is_empty() {
            sections.push(primed);
        }

        Message::system().with_text(sections.join("\n\n"))
    }

    async fn primed_resources(&self) -> String {
        let mut sections = Vec::new();
        for toolkit in self.registry.toolkits() {
            let resources = match toolkit.resources().await {
                Ok(resources) => resources,
                Err(err) => {
                    warn!(toolkit = toolkit.name(), %err, "failed to list resources");
                    continue;
                }
            };
            for resource in resources {
                match toolkit.read_resource(&resource.uri).await {
                    Ok(content) => sections.push(format!("### {}\n{}", resource.name, content)),
                    Err(err) => {
                        warn!(
                            toolkit = toolkit.name(),
                            uri = %resource.uri,
                            %err,
                            "failed to read resource"
                        );
                    }
                }
            }
        }
        sections.join("\n\n")
    }

    /// Run a single query to completion and return the final (or best-effort
    /// partial) answer.
    pub async fn run(&self, query: &str) -> Result<RunOutcome> {
        let mut messages = vec![
            self.system_message().await,
            Message::user().with_text(query),
        ];
        self.reply(&mut messages).await
    }

    /// Drive the loop over a caller-seeded conversation, appending every
    /// exchanged message to it.
    ///
    /// Each iteration asks the provider for the next assistant message; a
    /// message without tool requests completes the run. Otherwise every
    /// requested call is dispatched concurrently and one tool message per
    /// result is appended, in call order, before the next iteration. Provider
    /// failures are fatal and propagate; tool failures are contained by the
    /// dispatcher and fed back to the model.
    pub async fn reply(&self, messages: &mut Vec<Message>) -> Result<RunOutcome> {
        let tools = self.registry.tools();

        for iteration in 0..self.max_iterations {
            debug!(iteration, "requesting completion");
            let (response, _usage) = self
                .provider
                .complete(messages, &tools)
                .await
                .context("model gateway request failed")?;
            messages.push(response.clone());

            let requests: Vec<ToolRequest> =
                response.tool_requests().into_iter().cloned().collect();
            if requests.is_empty() {
                return Ok(RunOutcome::Completed(response.text()));
            }

            debug!(count = requests.len(), "dispatching tool calls");
            let responses = dispatch(&self.registry, &requests, self.tool_timeout).await;
            for tool_response in responses {
                messages.push(
                    Message::tool()
                        .with_tool_response(tool_response.id, tool_response.tool_result),
                );
            }
        }

        warn!(
            limit = self.max_iterations,
            "iteration budget exhausted before a final answer"
        );
        let content = messages.last().map(message_text).unwrap_or_default();
        Ok(RunOutcome::IterationLimitExceeded(content))
    }
}

/// Best-effort text rendering of a message, used for the degraded answer when
/// the iteration budget runs out.
fn message_text(message: &Message) -> String {
    let mut parts = Vec::new();
    for content in &message.content {
        match content {
            MessageContent::Text(text) => parts.push(text.text.clone()),
            MessageContent::ToolResponse(response) => match &response.tool_result {
                Ok(contents) => parts.extend(
                    contents
                        .iter()
                        .filter_map(|content| content.as_text().map(String::from)),
                ),
                Err(err) => parts.push(err.to_string()),
            },
            _ => {}
        }
    }
    parts.join("\n")
}
