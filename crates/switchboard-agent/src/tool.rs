//! Tool framework for agent capabilities.
//!
//! Tool internals (search, SQL, charting, research) live outside this crate.
//! This module defines the [`Tool`] trait they implement and the
//! [`ToolRegistry`] the step loop looks them up in.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchboard_agent::{Tool, ToolContext, ToolResult, ToolRegistry};
//!
//! struct ChartTool;
//!
//! #[async_trait]
//! impl Tool for ChartTool {
//!     fn name(&self) -> &str { "chart" }
//!     fn description(&self) -> &str { "Creates charts" }
//!     fn parameters(&self) -> Value { json!({"type": "object"}) }
//!
//!     async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult> {
//!         Ok(ToolResult::json(json!({"chart": "ok"})))
//!     }
//! }
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(ChartTool);
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use switchboard_llm::Usage;

use crate::error::{AgentError, Result};
use crate::research::{ProgressSink, ResearchUpdate};
use crate::types::{ChatId, SessionId};

// ─────────────────────────────────────────────────────────────────────────────
// Tool Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for agent tools.
///
/// Each tool defines its parameters as a JSON Schema and implements async
/// execution. The step loop treats all tools uniformly.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the unique name of this tool.
    fn name(&self) -> &str;

    /// Get a human-readable description of what this tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for this tool's parameters.
    fn parameters(&self) -> serde_json::Value;

    /// Execute the tool with the given parameters.
    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolResult>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Context
// ─────────────────────────────────────────────────────────────────────────────

/// Sender for usage a tool incurred with an outside provider.
pub type UsageSender = tokio::sync::mpsc::UnboundedSender<Usage>;

/// Context provided to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Chat the tool is running in.
    pub chat_id: ChatId,
    /// Session of the requesting user.
    pub session_id: SessionId,
    /// Token to check for cancellation.
    pub cancellation: CancellationToken,
    /// Tool call ID of the current invocation.
    pub tool_call_id: Option<String>,
    /// Side channel for research progress, set only in deep-research mode.
    pub progress: Option<ProgressSink>,
    /// Channel for reporting outside-provider token usage.
    pub usage_sender: Option<UsageSender>,
}

impl ToolContext {
    /// Create a new tool context.
    pub fn new(chat_id: ChatId, session_id: SessionId) -> Self {
        Self {
            chat_id,
            session_id,
            cancellation: CancellationToken::new(),
            tool_call_id: None,
            progress: None,
            usage_sender: None,
        }
    }

    /// Use the given cancellation token.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Attach the research progress sink.
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Attach the usage reporting channel.
    pub fn with_usage_sender(mut self, sender: UsageSender) -> Self {
        self.usage_sender = Some(sender);
        self
    }

    /// Scope the context to one tool call.
    pub fn for_call(&self, tool_call_id: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.tool_call_id = Some(tool_call_id.into());
        ctx
    }

    /// Check if execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Report a research phase. Returns false when no sink is attached.
    pub fn report_progress(&self, update: ResearchUpdate) -> bool {
        match self.progress {
            Some(ref sink) => sink.send(update),
            None => false,
        }
    }

    /// Report tokens consumed by an outside provider (e.g. a search API).
    pub fn report_usage(&self, usage: Usage) -> bool {
        match self.usage_sender {
            Some(ref sender) => sender.send(usage).is_ok(),
            None => false,
        }
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::new(ChatId::new(), SessionId::new())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Result
// ─────────────────────────────────────────────────────────────────────────────

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResult {
    /// Successful text output.
    Text { content: String },
    /// Successful JSON output.
    Json { content: serde_json::Value },
    /// Tool execution failed.
    Error {
        message: String,
        /// Whether the model can reasonably try again.
        recoverable: bool,
    },
}

impl ToolResult {
    /// Create a text result.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Create a JSON result.
    pub fn json(content: serde_json::Value) -> Self {
        Self::Json { content }
    }

    /// Create a recoverable error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            recoverable: true,
        }
    }

    /// Check if this result is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Check if this result is successful.
    pub fn is_success(&self) -> bool {
        !self.is_error()
    }

    /// Get the content as a string for model consumption.
    pub fn to_llm_content(&self) -> String {
        match self {
            Self::Text { content } => content.clone(),
            Self::Json { content } => {
                serde_json::to_string_pretty(content).unwrap_or_else(|_| content.to_string())
            }
            Self::Error { message, .. } => format!("Error: {}", message),
        }
    }

    /// The result as a JSON payload for clients and persisted parts.
    pub fn to_payload(&self) -> serde_json::Value {
        match self {
            Self::Text { content } => serde_json::Value::String(content.clone()),
            Self::Json { content } => content.clone(),
            Self::Error { message, .. } => serde_json::json!({ "error": message }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Registry for managing available tools.
///
/// Holds every tool the deployment knows about. Each request works on a
/// [`filtered_by_names`](Self::filtered_by_names) view restricted to its whitelist.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Register a tool from an Arc.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Check if a tool exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Get the number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for the completion request, sorted by name.
    pub fn to_llm_definitions(&self) -> Vec<switchboard_llm::ToolDefinition> {
        self.names()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                switchboard_llm::ToolDefinition::new(
                    tool.name(),
                    tool.description(),
                    tool.parameters(),
                )
            })
            .collect()
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        tool.execute(params, ctx).await
    }

    /// Create a registry containing only tools whose names are in the allowlist.
    ///
    /// Names not matching any registered tool are silently ignored.
    pub fn filtered_by_names(&self, names: &[&str]) -> ToolRegistry {
        let tools = names
            .iter()
            .filter_map(|&name| {
                self.tools
                    .get(name)
                    .map(|tool| (name.to_string(), Arc::clone(tool)))
            })
            .collect();
        ToolRegistry { tools }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stub Tool
// ─────────────────────────────────────────────────────────────────────────────

/// A stand-in tool that echoes its arguments.
///
/// Used for dry runs where the real tool backends are not reachable.
#[derive(Debug, Clone)]
pub struct StubTool {
    name: String,
    description: String,
}

impl StubTool {
    /// Create a stub named after a catalog tool.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let description = crate::capability::tool_description(&name)
            .unwrap_or("Stub tool")
            .to_string();
        Self { name, description }
    }
}

#[async_trait]
impl Tool for StubTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "additionalProperties": true
        })
    }

    async fn execute(&self, params: serde_json::Value, _ctx: &ToolContext) -> Result<ToolResult> {
        tracing::debug!(tool = %self.name, "Stub tool invoked");
        Ok(ToolResult::json(serde_json::json!({
            "tool": self.name,
            "args": params,
            "stub": true
        })))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock Tool (for testing)
// ─────────────────────────────────────────────────────────────────────────────

/// A mock tool for testing.
///
/// Returns a configurable response, records calls, and can replay a
/// progress script or report outside usage before answering.
#[cfg(test)]
#[derive(Debug)]
pub struct MockTool {
    name: String,
    description: String,
    response: parking_lot::Mutex<Option<std::result::Result<ToolResult, String>>>,
    progress: Vec<ResearchUpdate>,
    usage: Option<Usage>,
    calls: parking_lot::Mutex<Vec<serde_json::Value>>,
}

#[cfg(test)]
impl MockTool {
    /// Create a new mock tool.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: "A mock tool for testing".to_string(),
            response: parking_lot::Mutex::new(None),
            progress: Vec::new(),
            usage: None,
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the response to return.
    pub fn with_response(self, response: ToolResult) -> Self {
        *self.response.lock() = Some(Ok(response));
        self
    }

    /// Make the tool fail with `AgentError::Tool`.
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        *self.response.lock() = Some(Err(message.into()));
        self
    }

    /// Progress updates to send through the context before answering.
    pub fn with_progress(mut self, updates: Vec<ResearchUpdate>) -> Self {
        self.progress = updates;
        self
    }

    /// Outside usage to report through the context.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Get the calls that were made to this tool.
    pub fn calls(&self) -> Vec<serde_json::Value> {
        self.calls.lock().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[cfg(test)]
#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolResult> {
        self.calls.lock().push(params);

        for update in &self.progress {
            ctx.report_progress(update.clone());
        }
        if let Some(usage) = self.usage {
            ctx.report_usage(usage);
        }

        match self.response.lock().clone() {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(AgentError::tool(message)),
            None => Ok(ToolResult::text("mock response")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
