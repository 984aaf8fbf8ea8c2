//! Completion service boundary for Switchboard.
//!
//! The agent pipeline never talks to a provider directly. It drives an
//! [`LlmBackend`], which yields a stream of [`StreamEvent`]s: text deltas,
//! tool-use blocks with partial JSON input, and a final usage report.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  LlmBackend trait                       │
//! │  - complete() -> Response               │
//! │  - complete_stream() -> Stream<Event>   │
//! └─────────────────────────────────────────┘
//!                    │
//!            ┌───────┴────────┐
//!            ▼                ▼
//!      ┌───────────┐   ┌─────────────┐
//!      │ provider  │   │ MockBackend │
//!      │ (external)│   │ (scripted)  │
//!      └───────────┘   └─────────────┘
//! ```

pub mod backend;
pub mod error;
pub mod types;

pub use backend::{BlockStart, ContentDelta, LlmBackend, ResponseStream, SharedBackend, StreamEvent};
#[cfg(any(test, feature = "testing"))]
pub use backend::{MockBackend, MockResponse};
pub use error::{LlmError, Result};
pub use types::{
    CompletionRequest, CompletionResponse, Content, ContentBlock, Message, Role, StopReason,
    ToolDefinition, ToolResultBlock, ToolUseBlock, Usage,
};
