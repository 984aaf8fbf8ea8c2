//! The bounded, streaming tool-calling loop.
//!
//! [`StepExecutor::run`] drives the completion service for at most
//! `max_steps` hops. Each hop streams one completion; if the model asked for
//! tools, they run and their results are fed back for the next hop. Every
//! observable step is emitted as a [`StepEvent`], and the stream always ends
//! with exactly one terminal event: [`StepEvent::Finish`] or [`StepEvent::Fail`].

use futures::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use switchboard_llm::{
    BlockStart, CompletionRequest, ContentBlock, ContentDelta, Message, SharedBackend,
    StopReason, StreamEvent, ToolDefinition, ToolResultBlock, ToolUseBlock, Usage,
};

use crate::capability::ToolWhitelist;
use crate::research::ProgressSink;
use crate::tool::{ToolContext, ToolRegistry, ToolResult};

// ─────────────────────────────────────────────────────────────────────────────
// Step Events
// ─────────────────────────────────────────────────────────────────────────────

/// Totals reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepSummary {
    /// Tokens spent on the completion calls.
    pub usage: Usage,
    /// Tokens tools reported spending with outside providers.
    pub external_usage: Usage,
    /// Hops started.
    pub steps: u32,
    /// The step budget ran out while the model still wanted tools.
    pub truncated: bool,
}

/// Why the loop failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailReason {
    /// The model called a tool outside the whitelist.
    WhitelistViolation { tool: String },
    /// The completion service failed.
    Transport,
    /// The caller went away.
    Cancelled,
}

/// One observable step of the loop, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    TextDelta {
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        name: String,
        result: serde_json::Value,
        is_error: bool,
    },
    Status {
        phase: String,
    },
    Error {
        message: String,
    },
    /// Terminal: the loop stopped normally or ran out of steps.
    Finish(StepSummary),
    /// Terminal: the loop stopped on an error or cancellation.
    Fail {
        reason: FailReason,
        message: String,
        summary: StepSummary,
    },
}

impl StepEvent {
    pub fn status(phase: impl Into<String>) -> Self {
        Self::Status {
            phase: phase.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// True for `Finish` and `Fail`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish(_) | Self::Fail { .. })
    }
}

/// A boxed stream of step events.
pub type StepStream = Pin<Box<dyn Stream<Item = StepEvent> + Send + 'static>>;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Per-run settings for the loop.
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_steps: u32,
}

impl StepConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 4096,
            system_prompt: None,
            temperature: None,
            max_steps: 6,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────────────────

/// Runs the tool-calling loop for one request.
pub struct StepExecutor {
    backend: SharedBackend,
    tools: Arc<ToolRegistry>,
    whitelist: ToolWhitelist,
    config: StepConfig,
    context: ToolContext,
    cutoff: Option<CancellationToken>,
}

impl StepExecutor {
    /// Create an executor. Only whitelisted tools are offered to the model.
    pub fn new(
        backend: SharedBackend,
        tools: Arc<ToolRegistry>,
        whitelist: ToolWhitelist,
        config: StepConfig,
    ) -> Self {
        Self {
            backend,
            tools,
            whitelist,
            config,
            context: ToolContext::default(),
            cutoff: None,
        }
    }

    /// Base context cloned into every tool call.
    pub fn with_context(mut self, context: ToolContext) -> Self {
        self.context = context;
        self
    }

    /// Hand tools a research progress sink.
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.context = self.context.with_progress(sink);
        self
    }

    /// Once `cutoff` fires, later hops are sent without tools and the loop
    /// ends at the next model answer instead of running more calls.
    pub fn with_tool_cutoff(mut self, cutoff: CancellationToken) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    /// Start the loop over `messages`.
    ///
    /// After cancellation the only event emitted is the terminal
    /// `Fail { reason: Cancelled }`, which carries the usage spent so far.
    pub fn run(self, messages: Vec<Message>, cancellation: CancellationToken) -> StepStream {
        let StepExecutor {
            backend,
            tools,
            whitelist,
            config,
            context,
            cutoff,
        } = self;
        let tools_closed = move || cutoff.as_ref().is_some_and(|c| c.is_cancelled());
        let definitions = tools.filtered_by_names(&whitelist.names()).to_llm_definitions();

        Box::pin(async_stream::stream! {
            let (usage_tx, mut usage_rx) = tokio::sync::mpsc::unbounded_channel();
            let ctx = context
                .with_cancellation(cancellation.clone())
                .with_usage_sender(usage_tx);
            let mut messages = messages;
            let mut summary = StepSummary::default();

            yield StepEvent::status("initializing");

            for step in 1..=config.max_steps {
                if cancellation.is_cancelled() {
                    yield cancelled(summary);
                    return;
                }
                summary.steps = step;

                let closed = tools_closed();
                let offered: &[ToolDefinition] = if closed { &[] } else { &definitions };
                let request = build_request(&config, &messages, offered);
                let opened = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => None,
                    result = backend.complete_stream(request) => Some(result),
                };
                let mut llm_stream = match opened {
                    None => {
                        yield cancelled(summary);
                        return;
                    }
                    Some(Ok(s)) => s,
                    Some(Err(e)) => {
                        let message = e.to_string();
                        tracing::error!(step, error = %message, "Completion request failed");
                        yield StepEvent::error(message.clone());
                        yield StepEvent::Fail { reason: FailReason::Transport, message, summary };
                        return;
                    }
                };

                let mut hop = Hop::default();
                let mut failure = None;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => Next::Cancelled,
                        event = llm_stream.next() => match event {
                            None => Next::End,
                            Some(Ok(event)) => Next::Event(event),
                            Some(Err(e)) => Next::Failed(e.to_string()),
                        },
                    };

                    match next {
                        Next::Cancelled => {
                            summary.usage += hop.usage;
                            yield cancelled(summary);
                            return;
                        }
                        Next::End | Next::Event(StreamEvent::MessageStop) => break,
                        Next::Failed(message) | Next::Event(StreamEvent::Error { message }) => {
                            failure = Some(message);
                            break;
                        }
                        Next::Event(event) => {
                            if let Some(text) = hop.apply(event) {
                                yield StepEvent::TextDelta { text };
                            }
                        }
                    }
                }
                summary.usage += hop.usage;

                if let Some(message) = failure {
                    tracing::error!(step, error = %message, "Completion stream failed");
                    yield StepEvent::error(message.clone());
                    yield StepEvent::Fail { reason: FailReason::Transport, message, summary };
                    return;
                }

                let (blocks, tool_uses) = hop.finish();

                if tool_uses.is_empty() || closed {
                    if !tool_uses.is_empty() {
                        tracing::info!(step, calls = tool_uses.len(), "Tools closed, ignoring tool calls");
                    }
                    yield StepEvent::status("step-completed");
                    yield StepEvent::Finish(summary);
                    return;
                }

                if let Some(violation) = tool_uses.iter().find(|t| !whitelist.contains(&t.name)) {
                    tracing::warn!(tool = %violation.name, step, "Model called a tool outside the whitelist");
                    let message = format!("Tool '{}' is not available for this request", violation.name);
                    yield StepEvent::error(message.clone());
                    yield StepEvent::Fail {
                        reason: FailReason::WhitelistViolation { tool: violation.name.clone() },
                        message,
                        summary,
                    };
                    return;
                }

                let mut results = Vec::with_capacity(tool_uses.len());
                for tool_use in &tool_uses {
                    yield StepEvent::ToolCall {
                        call_id: tool_use.id.clone(),
                        name: tool_use.name.clone(),
                        args: tool_use.input.clone(),
                    };
                    yield StepEvent::status(format!("executing-{}", tool_use.name));

                    let call_ctx = ctx.for_call(&tool_use.id);
                    let result = match tools.execute(&tool_use.name, tool_use.input.clone(), &call_ctx).await {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(tool = %tool_use.name, error = %e, "Tool execution failed");
                            ToolResult::error(e.to_string())
                        }
                    };
                    while let Ok(reported) = usage_rx.try_recv() {
                        summary.external_usage += reported;
                    }

                    if cancellation.is_cancelled() {
                        tracing::info!(tool = %tool_use.name, "Turn cancelled during tool call, result discarded");
                        yield cancelled(summary);
                        return;
                    }

                    yield StepEvent::ToolResult {
                        call_id: tool_use.id.clone(),
                        name: tool_use.name.clone(),
                        result: result.to_payload(),
                        is_error: result.is_error(),
                    };

                    let content = result.to_llm_content();
                    results.push(if result.is_error() {
                        ToolResultBlock::error(&tool_use.id, content)
                    } else {
                        ToolResultBlock::success(&tool_use.id, content)
                    });
                }

                messages.push(Message::assistant_blocks(blocks));
                messages.push(Message::tool_results(results));
                yield StepEvent::status("step-completed");
            }

            summary.truncated = !tools_closed();
            tracing::info!(steps = summary.steps, truncated = summary.truncated, "Step budget exhausted");
            yield StepEvent::Finish(summary);
        })
    }
}

fn cancelled(summary: StepSummary) -> StepEvent {
    tracing::info!(steps = summary.steps, "Step loop cancelled");
    StepEvent::Fail {
        reason: FailReason::Cancelled,
        message: "Cancelled".to_string(),
        summary,
    }
}

fn build_request(
    config: &StepConfig,
    messages: &[Message],
    definitions: &[ToolDefinition],
) -> CompletionRequest {
    let mut request =
        CompletionRequest::new(&config.model, messages.to_vec(), config.max_tokens).with_streaming();

    if let Some(ref prompt) = config.system_prompt {
        request = request.with_system(prompt);
    }

    if let Some(temp) = config.temperature {
        request = request.with_temperature(temp);
    }

    if !definitions.is_empty() {
        request = request.with_tools(definitions.to_vec());
    }

    request
}

// ─────────────────────────────────────────────────────────────────────────────
// Hop accumulation
// ─────────────────────────────────────────────────────────────────────────────

enum Next {
    Event(StreamEvent),
    Failed(String),
    End,
    Cancelled,
}

enum OpenBlock {
    Text(String),
    Tool { id: String, name: String, json: String },
}

/// Assembles one streamed completion into content blocks.
#[derive(Default)]
struct Hop {
    open: BTreeMap<usize, OpenBlock>,
    blocks: Vec<ContentBlock>,
    tool_uses: Vec<ToolUseBlock>,
    usage: Usage,
    stop_reason: Option<StopReason>,
}

impl Hop {
    /// Apply one event; returns text to forward, if any.
    fn apply(&mut self, event: StreamEvent) -> Option<String> {
        match event {
            StreamEvent::ContentBlockStart { index, block } => {
                let open = match block {
                    BlockStart::Text => OpenBlock::Text(String::new()),
                    BlockStart::ToolUse { id, name } => OpenBlock::Tool {
                        id,
                        name,
                        json: String::new(),
                    },
                };
                self.open.insert(index, open);
                None
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta(text) => {
                    match self
                        .open
                        .entry(index)
                        .or_insert_with(|| OpenBlock::Text(String::new()))
                    {
                        OpenBlock::Text(buffer) => buffer.push_str(&text),
                        OpenBlock::Tool { .. } => return None,
                    }
                    Some(text)
                }
                ContentDelta::InputJsonDelta(json) => {
                    if let Some(OpenBlock::Tool { json: buffer, .. }) = self.open.get_mut(&index) {
                        buffer.push_str(&json);
                    }
                    None
                }
            },
            StreamEvent::ContentBlockStop { index } => {
                if let Some(open) = self.open.remove(&index) {
                    self.close(open);
                }
                None
            }
            StreamEvent::MessageDelta { stop_reason, usage } => {
                self.stop_reason = Some(stop_reason);
                self.usage += usage;
                None
            }
            StreamEvent::MessageStart { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Ping
            | StreamEvent::Error { .. } => None,
        }
    }

    fn close(&mut self, open: OpenBlock) {
        match open {
            OpenBlock::Text(text) => {
                if !text.is_empty() {
                    self.blocks.push(ContentBlock::text(text));
                }
            }
            OpenBlock::Tool { id, name, json } => {
                let input = if json.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&json).unwrap_or_else(|e| {
                        tracing::warn!(tool = %name, error = %e, "Unparsable tool input, using empty object");
                        serde_json::json!({})
                    })
                };
                self.blocks
                    .push(ContentBlock::tool_use(id.clone(), name.clone(), input.clone()));
                self.tool_uses.push(ToolUseBlock { id, name, input });
            }
        }
    }

    /// Close any blocks left open and return the assistant content.
    fn finish(mut self) -> (Vec<ContentBlock>, Vec<ToolUseBlock>) {
        let open = std::mem::take(&mut self.open);
        for (_, block) in open {
            self.close(block);
        }
        if self.stop_reason == Some(StopReason::MaxTokens) {
            tracing::debug!("Completion stopped at max_tokens");
        }
        (self.blocks, self.tool_uses)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
