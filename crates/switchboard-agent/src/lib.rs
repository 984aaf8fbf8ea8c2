//! Agent pipeline for Switchboard.
//!
//! One chat turn enters as an [`AgentRequest`] and leaves as a stream of
//! [`AgentEvent`]s plus one persisted assistant message.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  AgentRouter                                                │
//! │  - resolves agent type + tool whitelist                     │
//! │  - one exhaustive match on AgentType                        │
//! │  - per-turn UsageLedger                                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        ▼                     ▼                     ▼
//!  ┌────────────┐     ┌─────────────────┐    ┌──────────────┐
//!  │StepExecutor│◄────│DeepResearch     │    │RetryingInvoker│
//!  │(tool loop) │     │Pipeline         │    │(legacy agent) │
//!  └────────────┘     └─────────────────┘    └──────────────┘
//!        │                     │                     │
//!        └─────────────────────┼─────────────────────┘
//!                              ▼
//!                    ┌──────────────────┐
//!                    │ PersistenceGate  │
//!                    └──────────────────┘
//! ```
//!
//! # Core Components
//!
//! - [`capability`]: `(model id, toggles)` to agent type, whitelist, budget
//! - [`constraint`] / [`prompt`]: system prompt assembly
//! - [`stream`]: the bounded tool-calling loop
//! - [`research`]: progress side channel and research log
//! - [`usage`]: token ledger and price table
//! - [`legacy`]: external agent with cold-start retry
//! - [`hydrate`]: selected-file inlining decision
//! - [`persist`]: message store and the persistence gate

pub mod capability;
pub mod constraint;
pub mod error;
pub mod hydrate;
pub mod legacy;
pub mod persist;
pub mod prompt;
pub mod research;
pub mod router;
pub mod stream;
pub mod tool;
pub mod types;
pub mod usage;

pub use error::{AgentError, Result};
pub use types::{
    AgentRequest, CapabilityToggles, ChatId, ChatMessage, ChatRole, Identity, MessageId,
    MessagePart, SelectedFile, SessionId,
};

pub use capability::{
    AgentType, Capability, REASON_SEARCH_TOOL, Resolution, StepBudgets, ToolWhitelist, resolve,
    resolve_with_budgets, tool_description,
};
pub use constraint::inject;
pub use prompt::SystemPromptBuilder;

pub use tool::{StubTool, Tool, ToolContext, ToolRegistry, ToolResult};
pub use stream::{FailReason, StepConfig, StepEvent, StepExecutor, StepStream, StepSummary};
pub use research::{
    DeepResearchPipeline, ProgressReceiver, ProgressSink, ResearchItem, ResearchLog,
    ResearchUpdate, UpdateStatus, UpdateType,
};
pub use usage::{Price, PricingTable, UsageLedger, UsageSource};

pub use hydrate::{
    HttpObjectStore, Hydration, HydrationConfig, InMemoryObjectStore, ObjectStore,
    estimate_tokens,
};
pub use legacy::{HttpLegacyAgent, LegacyAgent, LegacyReply, RetryPolicy, RetryingInvoker};
pub use persist::{
    Attachment, FileMessageStore, InMemoryMessageStore, MessageStore, PersistedMessage,
    PersistenceGate,
};

pub use router::{
    AgentEvent, AgentRouter, AgentStream, ChannelSink, CollectingSink, EventSink, FinishReason,
    RouterConfig, TurnReport,
};

pub use tokio_util::sync::CancellationToken;
