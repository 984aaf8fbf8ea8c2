//! Completion backend trait and the scripted mock backend.
//!
//! The completion service itself is an external collaborator; this module
//! only fixes the seam the agent pipeline talks to.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{CompletionRequest, StopReason, Usage};

#[cfg(any(test, feature = "testing"))]
use crate::{
    error::LlmError,
    types::{CompletionResponse, ContentBlock},
};

// ─────────────────────────────────────────────────────────────────────────────
// Streaming Types
// ─────────────────────────────────────────────────────────────────────────────

/// A streaming response from a completion backend.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send + 'static>>;

/// Events emitted during streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Message started.
    MessageStart { id: String, model: String },
    /// Content block started.
    ContentBlockStart { index: usize, block: BlockStart },
    /// Delta within a content block.
    ContentBlockDelta { index: usize, delta: ContentDelta },
    /// Content block finished.
    ContentBlockStop { index: usize },
    /// Message finished with final usage stats.
    MessageDelta {
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Message complete.
    MessageStop,
    /// Keep-alive.
    Ping,
    /// Error reported by the service mid-stream.
    Error { message: String },
}

/// The kind of content block being opened.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockStart {
    /// Assistant text follows as text deltas.
    Text,
    /// A tool call; its input follows as partial JSON deltas.
    ToolUse { id: String, name: String },
}

/// Delta content in a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentDelta {
    /// Text being streamed.
    TextDelta(String),
    /// Partial JSON for tool input.
    InputJsonDelta(String),
}

impl StreamEvent {
    /// Returns true if this is an error event.
    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error { .. })
    }

    /// Returns true if this is the final event in a message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::MessageStop | StreamEvent::Error { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for completion service providers.
///
/// The agent pipeline only ever streams.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Execute a completion request and return a stream of events.
    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream>;

    /// Get the name of this backend.
    fn name(&self) -> &str;
}

/// A backend that can be shared across tasks.
pub type SharedBackend = Arc<dyn LlmBackend>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Backend
// ─────────────────────────────────────────────────────────────────────────────

/// One scripted step of a [`MockBackend`].
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MockResponse {
    /// Answer with this response (streamed block by block).
    Response(CompletionResponse),
    /// Start streaming, then report an error event after the given text.
    StreamError { partial_text: String, message: String },
    /// Refuse the request outright.
    Failure { message: String },
}

#[cfg(any(test, feature = "testing"))]
impl From<CompletionResponse> for MockResponse {
    fn from(response: CompletionResponse) -> Self {
        MockResponse::Response(response)
    }
}

/// A mock backend for testing purposes.
///
/// Returns pre-configured responses in order, useful for deterministic testing
/// of the step loop and tool execution.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    responses: parking_lot::Mutex<Vec<MockResponse>>,
    request_log: parking_lot::Mutex<Vec<CompletionRequest>>,
}

#[cfg(any(test, feature = "testing"))]
impl MockBackend {
    /// Create a new mock backend with the given responses.
    ///
    /// Responses are returned in order. If more requests are made than
    /// responses available, an error is returned.
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self::scripted(responses.into_iter().map(MockResponse::from).collect())
    }

    /// Create a mock backend from a full script, including failures.
    pub fn scripted(script: Vec<MockResponse>) -> Self {
        Self {
            name: "mock".to_string(),
            responses: parking_lot::Mutex::new(script),
            request_log: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Create a mock backend with a single text response.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self::new(vec![Self::text_response(text)])
    }

    /// A finished text response, handy when building scripts.
    pub fn text_response(text: impl Into<String>) -> CompletionResponse {
        CompletionResponse::new(
            "mock_msg",
            "mock-model",
            vec![ContentBlock::text(text)],
            StopReason::EndTurn,
            Usage::new(10, 20),
        )
    }

    /// A response asking for one tool call.
    pub fn tool_call_response(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        input: serde_json::Value,
    ) -> CompletionResponse {
        CompletionResponse::new(
            "mock_msg",
            "mock-model",
            vec![ContentBlock::tool_use(call_id, tool, input)],
            StopReason::ToolUse,
            Usage::new(10, 5),
        )
    }

    /// Get all requests that were made to this backend.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.request_log.lock().clone()
    }

    /// Get the number of requests made.
    pub fn request_count(&self) -> usize {
        self.request_log.lock().len()
    }

    fn next(&self, request: CompletionRequest) -> Result<MockResponse> {
        self.request_log.lock().push(request);

        let mut responses = self.responses.lock();
        if responses.is_empty() {
            tracing::warn!("Mock backend script exhausted");
            return Err(LlmError::backend("MockBackend: no more responses available"));
        }
        tracing::trace!(remaining = responses.len() - 1, "Mock backend response");
        Ok(responses.remove(0))
    }
}

#[cfg(any(test, feature = "testing"))]
fn response_events(response: CompletionResponse) -> Vec<Result<StreamEvent>> {
    let mut events = vec![Ok(StreamEvent::MessageStart {
        id: response.id.clone(),
        model: response.model.clone(),
    })];

    for (index, block) in response.content.iter().enumerate() {
        match block {
            ContentBlock::Text { text } => {
                events.push(Ok(StreamEvent::ContentBlockStart {
                    index,
                    block: BlockStart::Text,
                }));
                events.push(Ok(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::TextDelta(text.clone()),
                }));
            }
            ContentBlock::ToolUse { id, name, input } => {
                events.push(Ok(StreamEvent::ContentBlockStart {
                    index,
                    block: BlockStart::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                    },
                }));
                events.push(Ok(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::InputJsonDelta(input.to_string()),
                }));
            }
            ContentBlock::ToolResult { .. } => continue,
        }
        events.push(Ok(StreamEvent::ContentBlockStop { index }));
    }

    let stop_reason = response.stop_reason.unwrap_or(if response.has_tool_use() {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    });
    events.push(Ok(StreamEvent::MessageDelta {
        stop_reason,
        usage: response.usage,
    }));
    events.push(Ok(StreamEvent::MessageStop));
    events
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl LlmBackend for MockBackend {
    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream> {
        let events = match self.next(request)? {
            MockResponse::Response(response) => response_events(response),
            MockResponse::StreamError {
                partial_text,
                message,
            } => vec![
                Ok(StreamEvent::MessageStart {
                    id: "mock_msg".to_string(),
                    model: "mock-model".to_string(),
                }),
                Ok(StreamEvent::ContentBlockStart {
                    index: 0,
                    block: BlockStart::Text,
                }),
                Ok(StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: ContentDelta::TextDelta(partial_text),
                }),
                Ok(StreamEvent::Error { message }),
            ],
            MockResponse::Failure { message } => return Err(LlmError::Network(message)),
        };

        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
