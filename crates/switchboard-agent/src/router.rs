//! Agent router: the entry point for one chat turn.
//!
//! Resolves the agent, picks its pipeline with one exhaustive match on
//! [`AgentType`], forwards pipeline events to the caller as [`AgentEvent`]s,
//! folds all usage into a per-turn [`UsageLedger`] and hands the result to
//! the [`PersistenceGate`].

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use switchboard_llm::{SharedBackend, Usage};

use crate::capability::{AgentType, Resolution, StepBudgets, resolve_with_budgets};
use crate::hydrate::{self, HydrationConfig, InMemoryObjectStore, ObjectStore};
use crate::legacy::{
    LegacyAgent, RetryPolicy, RetryingInvoker, build_legacy_input, line_chunks,
    prepare_response_text,
};
use crate::persist::{MessageStore, PartsBuilder, PersistenceGate, TurnOutcome};
use crate::prompt::{self, SystemPromptBuilder};
use crate::research::{DeepResearchPipeline, ProgressSink, ResearchItem, ResearchLog, ResearchUpdate};
use crate::stream::{FailReason, StepConfig, StepEvent, StepExecutor, StepSummary};
use crate::tool::{ToolContext, ToolRegistry};
use crate::types::{AgentRequest, MessageId};
use crate::usage::{PricingTable, UsageLedger, UsageSource};

/// Events buffered between the turn task and a slow reader.
const EVENT_BUFFER: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// UI Events
// ─────────────────────────────────────────────────────────────────────────────

/// Why the event stream finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Error,
}

/// Caller-facing event of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    UserMessageId {
        id: MessageId,
    },
    Status {
        status: String,
    },
    TextDelta {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        call_id: String,
        tool_name: String,
        result: serde_json::Value,
        is_error: bool,
    },
    ResearchUpdate {
        update: ResearchUpdate,
    },
    #[serde(rename_all = "camelCase")]
    CostUpdate {
        tool_name: String,
        model_id: String,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    },
    MessageSaved {
        id: MessageId,
    },
    Error {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Finish {
        finish_reason: FinishReason,
    },
}

impl AgentEvent {
    pub fn status(status: impl Into<String>) -> Self {
        Self::Status {
            status: status.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// A boxed stream of caller-facing events.
pub type AgentStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send + 'static>>;

// ─────────────────────────────────────────────────────────────────────────────
// Event Sinks
// ─────────────────────────────────────────────────────────────────────────────

/// Destination for a turn's events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event. Returns false once the caller is gone.
    async fn emit(&self, event: AgentEvent) -> bool;
}

/// Forwards events into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<AgentEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<AgentEvent>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: AgentEvent) -> bool {
        self.sender.send(event).await.is_ok()
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<AgentEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&self, event: AgentEvent) -> bool {
        self.events.lock().push(event);
        true
    }
}

/// Stops emitting after cancellation; a closed sink cancels the turn.
struct Emitter<'a> {
    sink: &'a dyn EventSink,
    cancellation: CancellationToken,
    open: bool,
}

impl<'a> Emitter<'a> {
    fn new(sink: &'a dyn EventSink, cancellation: CancellationToken) -> Self {
        Self {
            sink,
            cancellation,
            open: true,
        }
    }

    async fn emit(&mut self, event: AgentEvent) {
        if !self.open || self.cancellation.is_cancelled() {
            return;
        }
        if !self.sink.emit(event).await {
            tracing::info!("Event receiver dropped, cancelling turn");
            self.open = false;
            self.cancellation.cancel();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Router settings, usually derived from the config file.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    /// Completion model used when an agent has no override.
    pub model: String,
    pub max_tokens: u32,
    pub budgets: StepBudgets,
    /// Completion model per agent id.
    pub agent_models: BTreeMap<String, String>,
    pub hydration: HydrationConfig,
    /// Model reported for the legacy agent's usage.
    pub legacy_model: String,
    pub retry: RetryPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4".to_string(),
            max_tokens: 4096,
            budgets: StepBudgets::default(),
            agent_models: BTreeMap::new(),
            hydration: HydrationConfig::default(),
            legacy_model: "gemini-2.5-flash".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RouterConfig {
    /// Completion model for `agent`.
    pub fn model_for(&self, agent: AgentType) -> &str {
        match agent {
            AgentType::SharePoint => &self.legacy_model,
            _ => self
                .agent_models
                .get(agent.id())
                .map(String::as_str)
                .unwrap_or(&self.model),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Turn State
// ─────────────────────────────────────────────────────────────────────────────

/// What the caller learns about a turn after it ends.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    /// Id of the persisted message, if one was written.
    pub message_id: Option<MessageId>,
    pub agent_type: AgentType,
    pub model: String,
    /// The step budget ran out. Not surfaced to the UI.
    pub truncated: bool,
    pub steps: u32,
    pub ledger: UsageLedger,
    pub usage: Usage,
    pub cost: f64,
    pub persisted: bool,
    /// Terminal error shown to the caller, if the turn failed.
    pub error: Option<String>,
}

/// How a resolved request is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Legacy,
    Research,
    Steps {
        hydrate_files: bool,
        web_reminder: bool,
    },
}

/// Mutable state of one turn, owned by its task.
struct TurnState {
    parts: PartsBuilder,
    research: Option<ResearchLog>,
    summary: StepSummary,
    external: Usage,
    error: Option<String>,
}

impl TurnState {
    fn new() -> Self {
        Self {
            parts: PartsBuilder::new(),
            research: None,
            summary: StepSummary::default(),
            external: Usage::default(),
            error: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Routes a chat turn to its pipeline.
#[derive(Clone)]
pub struct AgentRouter {
    backend: SharedBackend,
    tools: Arc<ToolRegistry>,
    gate: PersistenceGate,
    object_store: Arc<dyn ObjectStore>,
    legacy: Option<RetryingInvoker>,
    pricing: PricingTable,
    config: RouterConfig,
}

impl AgentRouter {
    pub fn new(backend: SharedBackend, tools: ToolRegistry, store: Arc<dyn MessageStore>) -> Self {
        Self {
            backend,
            tools: Arc::new(tools),
            gate: PersistenceGate::new(store),
            object_store: Arc::new(InMemoryObjectStore::new()),
            legacy: None,
            pricing: PricingTable::default(),
            config: RouterConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        if let Some(ref mut legacy) = self.legacy {
            *legacy = legacy.clone().with_policy(config.retry);
        }
        self.config = config;
        self
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = store;
        self
    }

    pub fn with_legacy_agent(mut self, agent: Arc<dyn LegacyAgent>) -> Self {
        self.legacy = Some(RetryingInvoker::new(agent).with_policy(self.config.retry));
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Run a turn on its own task and stream its events.
    ///
    /// Dropping the stream cancels the turn; content generated so far is
    /// still persisted.
    pub fn handle(&self, request: AgentRequest, cancellation: CancellationToken) -> AgentStream {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let router = self.clone();

        tokio::spawn(async move {
            let sink = ChannelSink::new(tx);
            router.run(request, &sink, cancellation).await;
        });

        Box::pin(async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        })
    }

    /// Run a turn to completion, delivering events to `sink`.
    pub async fn run(
        &self,
        request: AgentRequest,
        sink: &dyn EventSink,
        cancellation: CancellationToken,
    ) -> TurnReport {
        let started = Instant::now();
        let resolution =
            resolve_with_budgets(&request.model_id, request.toggles, self.config.budgets);
        let agent = resolution.agent_type;
        let model = self.config.model_for(agent).to_string();

        tracing::info!(
            chat_id = %request.chat_id,
            agent = %agent,
            model = %model,
            tools = ?resolution.whitelist.names(),
            max_steps = resolution.max_steps,
            deep_research = resolution.is_deep_research(),
            "Resolved agent"
        );

        let plan = match agent {
            AgentType::SharePoint => Plan::Legacy,
            AgentType::General | AgentType::Web if resolution.is_deep_research() => Plan::Research,
            AgentType::General | AgentType::Web => Plan::Steps {
                hydrate_files: false,
                web_reminder: resolution.toggles.web_search,
            },
            AgentType::SharePointV2 => Plan::Steps {
                hydrate_files: true,
                web_reminder: false,
            },
            AgentType::Csv | AgentType::CsvV2 | AgentType::Text2Sql => Plan::Steps {
                hydrate_files: false,
                web_reminder: false,
            },
        };

        let mut emitter = Emitter::new(sink, cancellation.clone());
        let mut ledger = UsageLedger::new();
        ledger.record_usage(UsageSource::Title, request.title_usage);
        let mut state = TurnState::new();

        emitter
            .emit(AgentEvent::UserMessageId {
                id: request.user_message_id,
            })
            .await;

        match plan {
            Plan::Legacy => {
                self.run_legacy(&request, &mut state, &mut emitter, &cancellation)
                    .await
            }
            Plan::Research => {
                let executor = self.executor(&request, &resolution, &model, None);
                let (progress, receiver) = ProgressSink::channel();
                let items = DeepResearchPipeline::new(executor, progress, receiver)
                    .run(request.to_llm_messages(), cancellation.clone());
                state.research = Some(ResearchLog::new());
                self.drive_research(items, &mut state, &mut emitter).await;
            }
            Plan::Steps {
                hydrate_files,
                web_reminder,
            } => {
                let mut working = request.clone();
                if web_reminder && prompt::insert_web_reminder(&mut working.history) {
                    tracing::debug!("Inserted web tool reminder");
                }
                let attachments = if hydrate_files {
                    let hydration =
                        hydrate::hydrate(&request, self.object_store.as_ref(), self.config.hydration)
                            .await;
                    tracing::info!(
                        estimated_tokens = hydration.estimated_tokens,
                        should_use_reason = hydration.should_use_reason,
                        "Hydrated selected files"
                    );
                    hydration.prompt_block
                } else {
                    None
                };
                let executor = self.executor(&request, &resolution, &model, attachments);
                let events = executor.run(working.to_llm_messages(), cancellation.clone());
                self.drive_steps(events, &mut state, &mut emitter).await;
            }
        }

        ledger.record_usage(UsageSource::Main, state.summary.usage);
        ledger.record_usage(UsageSource::WebSearch, state.summary.external_usage);
        ledger.record_usage(UsageSource::External, state.external);
        let usage = ledger.totals();
        let cost = self.pricing.cost_of(&model, usage);

        let failed = state.error.is_some();
        let has_content = state.parts.has_content();
        let mut message_id = None;

        if !failed || has_content {
            emitter
                .emit(AgentEvent::CostUpdate {
                    tool_name: agent.id().to_string(),
                    model_id: model.clone(),
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cost,
                })
                .await;
            emitter.emit(AgentEvent::status("saving")).await;

            let outcome = TurnOutcome {
                message_id: MessageId::new(),
                chat_id: request.chat_id,
                agent_type: agent,
                model_id: request.model_id.clone(),
                parts: state.parts,
                research: state.research,
                selected_files: request.selected_files.clone(),
                usage,
                truncated: state.summary.truncated,
                failed,
            };

            match self.gate.finalize(outcome).await {
                Ok(Some(id)) => {
                    message_id = Some(id);
                    emitter.emit(AgentEvent::MessageSaved { id }).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(chat_id = %request.chat_id, error = %e, "Failed to persist message");
                    emitter
                        .emit(AgentEvent::error(format!("Failed to save message: {}", e)))
                        .await;
                }
            }
            emitter.emit(AgentEvent::status("completed")).await;
        }

        let finish_reason = if failed {
            FinishReason::Error
        } else {
            FinishReason::Stop
        };
        emitter.emit(AgentEvent::Finish { finish_reason }).await;

        tracing::info!(
            chat_id = %request.chat_id,
            agent = %agent,
            steps = state.summary.steps,
            truncated = state.summary.truncated,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost,
            persisted = message_id.is_some(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Turn finished"
        );

        TurnReport {
            message_id,
            agent_type: agent,
            model,
            truncated: state.summary.truncated,
            steps: state.summary.steps,
            ledger,
            usage,
            cost,
            persisted: message_id.is_some(),
            error: state.error,
        }
    }

    fn executor(
        &self,
        request: &AgentRequest,
        resolution: &Resolution,
        model: &str,
        attachments: Option<String>,
    ) -> StepExecutor {
        let system_prompt = SystemPromptBuilder::new(
            resolution.agent_type,
            resolution.toggles,
            resolution.whitelist.clone(),
        )
        .with_attachments(attachments)
        .build();

        let config = StepConfig::new(model)
            .with_system_prompt(system_prompt)
            .with_temperature(resolution.temperature)
            .with_max_steps(resolution.max_steps)
            .with_max_tokens(self.config.max_tokens);

        StepExecutor::new(
            self.backend.clone(),
            self.tools.clone(),
            resolution.whitelist.clone(),
            config,
        )
        .with_context(ToolContext::new(request.chat_id, request.identity.session_id))
    }

    async fn drive_steps(
        &self,
        mut events: impl Stream<Item = StepEvent> + Unpin,
        state: &mut TurnState,
        emitter: &mut Emitter<'_>,
    ) {
        while let Some(event) = events.next().await {
            forward_step(event, state, emitter).await;
        }
    }

    async fn drive_research(
        &self,
        mut items: impl Stream<Item = ResearchItem> + Unpin,
        state: &mut TurnState,
        emitter: &mut Emitter<'_>,
    ) {
        while let Some(item) = items.next().await {
            match item {
                ResearchItem::Update(update) => {
                    let accepted = match state.research {
                        Some(ref mut log) => log.push(update.clone()),
                        None => true,
                    };
                    if accepted {
                        emitter.emit(AgentEvent::ResearchUpdate { update }).await;
                    } else {
                        tracing::trace!(id = %update.id, "Dropped superseded research update");
                    }
                }
                ResearchItem::Step(event) => forward_step(event, state, emitter).await,
            }
        }

        let Some(ref log) = state.research else {
            return;
        };
        if !log.is_complete() {
            tracing::info!(
                updates = log.deduped().len(),
                "Research ended without completion, answer will be best effort"
            );
        }
        if state.error.is_none() && !state.parts.has_text() {
            let text = log.best_effort_answer();
            state.parts.push_text(&text);
            emitter.emit(AgentEvent::TextDelta { text }).await;
        }
    }

    async fn run_legacy(
        &self,
        request: &AgentRequest,
        state: &mut TurnState,
        emitter: &mut Emitter<'_>,
        cancellation: &CancellationToken,
    ) {
        emitter.emit(AgentEvent::status("initializing")).await;

        let Some(ref invoker) = self.legacy else {
            let message = "No legacy agent configured".to_string();
            tracing::error!("{}", message);
            emitter.emit(AgentEvent::error(message.clone())).await;
            state.error = Some(message);
            return;
        };

        let system_prompt = SystemPromptBuilder::new(
            AgentType::SharePoint,
            Default::default(),
            Default::default(),
        )
        .build_sections();
        let input = build_legacy_input(&system_prompt, &request.last_user_text());

        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => None,
            result = invoker.invoke(&input, &request.identity.session_id) => Some(result),
        };

        match result {
            None => {
                tracing::info!("Legacy agent call cancelled");
                state.error = Some("Cancelled".to_string());
            }
            Some(Ok(reply)) => {
                state.external = reply.usage;
                for chunk in line_chunks(&prepare_response_text(&reply.text)) {
                    state.parts.push_text(&chunk);
                    emitter.emit(AgentEvent::TextDelta { text: chunk }).await;
                }
                emitter.emit(AgentEvent::status("step-completed")).await;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Legacy agent failed");
                let message = e.to_string();
                emitter.emit(AgentEvent::error(message.clone())).await;
                state.error = Some(message);
            }
        }
    }
}

async fn forward_step(event: StepEvent, state: &mut TurnState, emitter: &mut Emitter<'_>) {
    state.parts.apply(&event);
    match event {
        StepEvent::TextDelta { text } => emitter.emit(AgentEvent::TextDelta { text }).await,
        StepEvent::ToolCall {
            call_id,
            name,
            args,
        } => {
            emitter
                .emit(AgentEvent::ToolCall {
                    call_id,
                    tool_name: name,
                    args,
                })
                .await
        }
        StepEvent::ToolResult {
            call_id,
            name,
            result,
            is_error,
        } => {
            emitter
                .emit(AgentEvent::ToolResult {
                    call_id,
                    tool_name: name,
                    result,
                    is_error,
                })
                .await
        }
        StepEvent::Status { phase } => emitter.emit(AgentEvent::status(phase)).await,
        StepEvent::Error { message } => emitter.emit(AgentEvent::error(message)).await,
        StepEvent::Finish(summary) => state.summary = summary,
        StepEvent::Fail {
            reason,
            message,
            summary,
        } => {
            if let FailReason::WhitelistViolation { ref tool } = reason {
                tracing::warn!(tool = %tool, "Turn ended on whitelist violation");
            }
            state.summary = summary;
            state.error = Some(message);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::capability::REASON_SEARCH_TOOL;
    use crate::error::{AgentError, Result};
    use crate::legacy::{COLD_START_SIGNATURE, LegacyReply};
    use crate::persist::{InMemoryMessageStore, PersistedMessage};
    use crate::research::{UpdateStatus, UpdateType};
    use crate::tool::{MockTool, Tool, ToolResult};
    use crate::types::{CapabilityToggles, ChatMessage, MessagePart, SelectedFile, SessionId};
    use switchboard_llm::{CompletionResponse, ContentBlock, MockBackend, MockResponse, StopReason};

    fn web_tools() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            MockTool::new("search")
                .with_usage(Usage::new(300, 0))
                .with_response(ToolResult::json(serde_json::json!({"results": ["rust-lang.org"]}))),
        );
        registry.register(MockTool::new("extract"));
        registry.register(MockTool::new("scrape"));
        registry.register(MockTool::new("chart"));
        registry.register(MockTool::new(REASON_SEARCH_TOOL));
        registry
    }

    fn router(backend: Arc<MockBackend>, tools: ToolRegistry) -> (AgentRouter, Arc<InMemoryMessageStore>) {
        let store = Arc::new(InMemoryMessageStore::new());
        (AgentRouter::new(backend, tools, store.clone()), store)
    }

    fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|e| match e {
                AgentEvent::UserMessageId { .. } => "user-message-id",
                AgentEvent::Status { .. } => "status",
                AgentEvent::TextDelta { .. } => "text-delta",
                AgentEvent::ToolCall { .. } => "tool-call",
                AgentEvent::ToolResult { .. } => "tool-result",
                AgentEvent::ResearchUpdate { .. } => "research-update",
                AgentEvent::CostUpdate { .. } => "cost-update",
                AgentEvent::MessageSaved { .. } => "message-saved",
                AgentEvent::Error { .. } => "error",
                AgentEvent::Finish { .. } => "finish",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_web_agent_turn() {
        let backend = Arc::new(MockBackend::new(vec![
            MockBackend::tool_call_response("call_1", "search", serde_json::json!({"query": "rust"})),
            MockBackend::text_response("Rust is a systems language."),
        ]));
        let (router, store) = router(backend.clone(), web_tools());

        let request = AgentRequest::new("web-agent", "what is rust?")
            .with_prior_messages(vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")])
            .with_toggles(CapabilityToggles::none().with_web_search())
            .with_title_usage(Usage::new(50, 10));
        let sink = CollectingSink::new();
        let report = router.run(request, &sink, CancellationToken::new()).await;

        assert_eq!(report.agent_type, AgentType::Web);
        assert!(report.steps <= 6);
        assert!(!report.truncated);
        assert!(report.error.is_none());

        let first = &backend.requests()[0];
        let offered: Vec<&str> = first.tools.iter().map(|t| t.name.as_str()).collect();
        assert!(offered.contains(&"search"));
        assert!(!offered.contains(&REASON_SEARCH_TOOL));
        // hi, hello, reminder, question
        assert_eq!(first.messages.len(), 4);
        assert!(first.system.as_deref().unwrap().contains("ALLOWED_TOOLS:"));

        // title + two main calls + provider usage from the search tool
        assert_eq!(report.ledger.by_source(UsageSource::Title), Usage::new(50, 10));
        assert_eq!(report.ledger.by_source(UsageSource::Main), Usage::new(20, 25));
        assert_eq!(report.ledger.by_source(UsageSource::WebSearch), Usage::new(300, 0));
        assert_eq!(report.usage, Usage::new(370, 35));

        let messages = store.messages();
        assert_eq!(messages.len(), 1);
        let saved = &messages[0];
        assert_eq!(saved.model_id, "web-agent");
        assert_eq!(saved.agent_type, AgentType::Web);
        assert_eq!((saved.input_tokens, saved.output_tokens), (370, 35));
        assert_eq!(Some(saved.id), report.message_id);
        assert!(saved.text().contains("systems language"));

        let events = sink.events();
        let kinds = kinds(&events);
        assert_eq!(kinds.first(), Some(&"user-message-id"));
        assert_eq!(
            &kinds[kinds.len() - 5..],
            &["cost-update", "status", "message-saved", "status", "finish"]
        );
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Finish { finish_reason: FinishReason::Stop })
        ));
    }

    #[tokio::test]
    async fn test_deep_research_turn() {
        let backend = Arc::new(MockBackend::new(vec![
            MockBackend::tool_call_response(
                "call_1",
                REASON_SEARCH_TOOL,
                serde_json::json!({"topic": "rust async"}),
            ),
            MockBackend::text_response("## Rust async\n\nFindings..."),
        ]));
        let mut tools = web_tools();
        tools.register(MockTool::new(REASON_SEARCH_TOOL).with_progress(vec![
            ResearchUpdate::running("plan", UpdateType::Plan),
            ResearchUpdate::running("search-0", UpdateType::Web),
            ResearchUpdate::completed("search-0", UpdateType::Web),
            ResearchUpdate::completed("plan", UpdateType::Plan),
            ResearchUpdate::finished(2),
        ]));
        let (router, store) = router(backend.clone(), tools);

        let request = AgentRequest::new("general-assistant", "how does rust async work?")
            .with_toggles(CapabilityToggles::none().with_web_search().with_deep_research());
        let sink = CollectingSink::new();
        let report = router.run(request, &sink, CancellationToken::new()).await;

        let first = &backend.requests()[0];
        let offered: Vec<&str> = first.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(offered, vec![REASON_SEARCH_TOOL]);
        assert_eq!(first.temperature, Some(0.0));
        assert!(report.steps <= 2);
        assert!(!report.truncated);
        assert!(backend.requests()[1].tools.is_empty());

        let saved = &store.messages()[0];
        let attachment = saved.research_attachment().unwrap();
        let ids: Vec<&str> = attachment["updates"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["id"].as_str().unwrap())
            .collect();
        let unique: HashSet<&&str> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
        assert_eq!(ids.len(), 3);

        let events = sink.events();
        let kinds = kinds(&events);
        let last_update = kinds.iter().rposition(|k| *k == "research-update").unwrap();
        let tool_result = kinds.iter().position(|k| *k == "tool-result").unwrap();
        assert!(last_update < tool_result);
    }

    #[tokio::test]
    async fn test_research_budget_exhaustion_persists_best_effort() {
        let backend = Arc::new(MockBackend::new(vec![
            MockBackend::tool_call_response("c1", REASON_SEARCH_TOOL, serde_json::json!({"topic": "x"})),
            MockBackend::tool_call_response("c2", REASON_SEARCH_TOOL, serde_json::json!({"topic": "x"})),
        ]));
        let mut tools = ToolRegistry::new();
        tools.register(MockTool::new(REASON_SEARCH_TOOL).with_progress(vec![
            ResearchUpdate::completed("analysis-0", UpdateType::Analysis)
                .with_payload(serde_json::json!({
                    "findings": [{"insight": "Tokio drives futures", "evidence": []}]
                })),
        ]));
        let (router, store) = router(backend, tools);

        let request = AgentRequest::new("web-agent", "x")
            .with_toggles(CapabilityToggles::none().with_deep_research());
        let sink = CollectingSink::new();
        let report = router.run(request, &sink, CancellationToken::new()).await;

        assert!(report.truncated);
        assert_eq!(report.steps, 2);
        assert!(report.persisted);
        let saved = &store.messages()[0];
        assert!(saved.truncated);
        assert!(saved.text().contains("Tokio drives futures"));

        let streamed: String = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { text } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, saved.text());
    }

    #[tokio::test]
    async fn test_research_updates_never_regress() {
        let backend = Arc::new(MockBackend::new(vec![
            MockBackend::tool_call_response("c1", REASON_SEARCH_TOOL, serde_json::json!({"topic": "x"})),
            MockBackend::text_response("Done"),
        ]));
        let mut tools = ToolRegistry::new();
        tools.register(MockTool::new(REASON_SEARCH_TOOL).with_progress(vec![
            ResearchUpdate::completed("search-0", UpdateType::Web),
            ResearchUpdate::running("search-0", UpdateType::Web),
            ResearchUpdate::finished(1),
        ]));
        let (router, store) = router(backend, tools);

        let request = AgentRequest::new("web-agent", "x")
            .with_toggles(CapabilityToggles::none().with_deep_research());
        let sink = CollectingSink::new();
        router.run(request, &sink, CancellationToken::new()).await;

        let search: Vec<UpdateStatus> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                AgentEvent::ResearchUpdate { update } if update.id == "search-0" => {
                    Some(update.status)
                }
                _ => None,
            })
            .collect();
        assert_eq!(search, vec![UpdateStatus::Completed]);

        let attachment = store.messages()[0].research_attachment().cloned().unwrap();
        assert_eq!(attachment["updates"][0]["status"], "completed");
    }

    #[tokio::test]
    async fn test_large_files_not_inlined() {
        let backend = Arc::new(MockBackend::with_text("See [1]."));
        let big = "y".repeat(650_000);
        let (router, _store) = router(backend.clone(), ToolRegistry::new());
        let router = router.with_object_store(Arc::new(
            InMemoryObjectStore::new().with_object("s3://kb/big.txt", big.clone()),
        ));

        let request = AgentRequest::new("sharepoint-agent-v2", "summarize")
            .with_toggles(CapabilityToggles::none().with_file_search())
            .with_selected_files(vec![SelectedFile {
                title: "big.txt".into(),
                url: "s3://kb/big.txt".into(),
                content: big.clone(),
            }]);
        router
            .run(request, &CollectingSink::new(), CancellationToken::new())
            .await;

        let system = backend.requests()[0].system.clone().unwrap();
        assert!(system.contains("Use the 'reason' tool"));
        assert!(system.contains("- big.txt (URL: s3://kb/big.txt)"));
        assert!(!system.contains(&big[..1000]));
    }

    #[tokio::test]
    async fn test_small_files_inlined() {
        let backend = Arc::new(MockBackend::with_text("Answer"));
        let (router, store) = router(backend.clone(), ToolRegistry::new());
        let router = router.with_object_store(Arc::new(
            InMemoryObjectStore::new().with_object("s3://kb/a.txt", "Quarterly revenue rose 12%"),
        ));

        let request = AgentRequest::new("sharepoint-agent-v2", "summarize")
            .with_selected_files(vec![SelectedFile {
                title: "a.txt".into(),
                url: "s3://kb/a.txt".into(),
                content: "excerpt".into(),
            }]);
        router
            .run(request, &CollectingSink::new(), CancellationToken::new())
            .await;

        let system = backend.requests()[0].system.clone().unwrap();
        assert!(system.contains("Quarterly revenue rose 12%"));
        assert_eq!(store.messages()[0].attachments.len(), 1);
    }

    #[tokio::test]
    async fn test_whitelist_violation_ends_turn() {
        let backend = Arc::new(MockBackend::new(vec![MockBackend::tool_call_response(
            "call_1",
            "search",
            serde_json::json!({}),
        )]));
        let (router, store) = router(backend, web_tools());

        let request = AgentRequest::new("csv-agent", "plot it");
        let sink = CollectingSink::new();
        let report = router.run(request, &sink, CancellationToken::new()).await;

        assert!(report.error.is_some());
        assert!(!report.persisted);
        assert!(store.is_empty());

        let kinds = kinds(&sink.events());
        assert!(kinds.contains(&"error"));
        assert!(!kinds.contains(&"tool-result"));
        assert!(!kinds.contains(&"cost-update"));
        assert_eq!(kinds.last(), Some(&"finish"));
    }

    #[tokio::test]
    async fn test_transport_failure_without_content_not_persisted() {
        let backend = Arc::new(MockBackend::scripted(vec![MockResponse::Failure {
            message: "connection reset".into(),
        }]));
        let (router, store) = router(backend, ToolRegistry::new());

        let sink = CollectingSink::new();
        let report = router
            .run(AgentRequest::new("general-assistant", "hi"), &sink, CancellationToken::new())
            .await;

        assert!(report.error.is_some());
        assert!(store.is_empty());
        assert!(matches!(
            sink.events().last(),
            Some(AgentEvent::Finish { finish_reason: FinishReason::Error })
        ));
    }

    #[tokio::test]
    async fn test_partial_text_persisted_after_stream_error() {
        let backend = Arc::new(MockBackend::scripted(vec![MockResponse::StreamError {
            partial_text: "Half an answer".into(),
            message: "overloaded".into(),
        }]));
        let (router, store) = router(backend, ToolRegistry::new());

        let report = router
            .run(
                AgentRequest::new("general-assistant", "hi"),
                &CollectingSink::new(),
                CancellationToken::new(),
            )
            .await;

        assert!(report.error.is_some());
        assert!(report.persisted);
        assert_eq!(store.messages()[0].text(), "Half an answer");
    }

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn save(&self, _message: &PersistedMessage) -> Result<()> {
            Err(AgentError::store("database unavailable"))
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_surfaces_error() {
        let backend = Arc::new(MockBackend::with_text("Streamed answer"));
        let router = AgentRouter::new(backend, ToolRegistry::new(), Arc::new(FailingStore));

        let sink = CollectingSink::new();
        let report = router
            .run(AgentRequest::new("general-assistant", "hi"), &sink, CancellationToken::new())
            .await;

        assert!(!report.persisted);
        assert!(report.error.is_none());

        let events = sink.events();
        assert!(events.contains(&AgentEvent::TextDelta {
            text: "Streamed answer".into()
        }));
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::Error { message } if message.contains("Failed to save message")
        )));
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Finish { finish_reason: FinishReason::Stop })
        ));
    }

    struct ColdAgent {
        cold_calls: Mutex<u32>,
    }

    #[async_trait]
    impl LegacyAgent for ColdAgent {
        async fn invoke(&self, input: &str, _session_id: &SessionId) -> Result<LegacyReply> {
            let mut cold = self.cold_calls.lock();
            if *cold > 0 {
                *cold -= 1;
                return Err(AgentError::legacy(format!("503: {}", COLD_START_SIGNATURE)));
            }
            assert!(input.ends_with("User Query: where is the handbook?"));
            Ok(LegacyReply::new("It is on the intranet [1].", Usage::new(120, 40)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_agent_turn() {
        let backend = Arc::new(MockBackend::new(vec![]));
        let (router, store) = router(backend.clone(), ToolRegistry::new());
        let router = router.with_legacy_agent(Arc::new(ColdAgent {
            cold_calls: Mutex::new(2),
        }));

        let request = AgentRequest::new("sharepoint-agent", "where is the handbook?")
            .with_title_usage(Usage::new(5, 5));
        let sink = CollectingSink::new();
        let report = router.run(request, &sink, CancellationToken::new()).await;

        assert_eq!(report.agent_type, AgentType::SharePoint);
        assert_eq!(report.model, "gemini-2.5-flash");
        assert_eq!(backend.request_count(), 0);
        assert_eq!(report.ledger.by_source(UsageSource::External), Usage::new(120, 40));
        assert_eq!(report.usage, Usage::new(125, 45));

        let saved = &store.messages()[0];
        assert!(saved.text().contains("**Sources**\nNo source information available"));

        let deltas: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { text } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(deltas.len(), 4);
        assert!(!deltas.last().unwrap().ends_with('\n'));
        assert_eq!(deltas.concat(), saved.text());
    }

    #[tokio::test]
    async fn test_legacy_without_agent_fails() {
        let (router, store) = router(Arc::new(MockBackend::new(vec![])), ToolRegistry::new());
        let report = router
            .run(
                AgentRequest::new("sharepoint-agent", "q"),
                &CollectingSink::new(),
                CancellationToken::new(),
            )
            .await;
        assert!(report.error.is_some());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_handle_streams_until_finish() {
        let backend = Arc::new(MockBackend::with_text("Hi there"));
        let (router, store) = router(backend, ToolRegistry::new());

        let events: Vec<AgentEvent> = router
            .handle(AgentRequest::new("general-assistant", "hello"), CancellationToken::new())
            .collect()
            .await;

        assert!(matches!(events.first(), Some(AgentEvent::UserMessageId { .. })));
        assert!(matches!(events.last(), Some(AgentEvent::Finish { .. })));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_turn_emits_nothing_more() {
        let backend = Arc::new(MockBackend::with_text("never seen"));
        let (router, store) = router(backend.clone(), ToolRegistry::new());

        let token = CancellationToken::new();
        token.cancel();
        let sink = CollectingSink::new();
        let report = router
            .run(AgentRequest::new("general-assistant", "hello"), &sink, token)
            .await;

        assert!(sink.events().is_empty());
        assert_eq!(backend.request_count(), 0);
        assert!(store.is_empty());
        assert!(report.error.is_some());
    }

    /// Cancels its own turn from inside the call, then answers anyway.
    struct CancellingTool;

    #[async_trait]
    impl Tool for CancellingTool {
        fn name(&self) -> &str {
            "run_sql"
        }

        fn description(&self) -> &str {
            "Runs SQL"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(&self, _params: serde_json::Value, ctx: &ToolContext) -> Result<ToolResult> {
            ctx.cancellation.cancel();
            Ok(ToolResult::text("42 rows"))
        }
    }

    /// Records each event with whether the turn was already cancelled.
    struct WatchingSink {
        token: CancellationToken,
        events: Mutex<Vec<(AgentEvent, bool)>>,
    }

    #[async_trait]
    impl EventSink for WatchingSink {
        async fn emit(&self, event: AgentEvent) -> bool {
            self.events.lock().push((event, self.token.is_cancelled()));
            true
        }
    }

    #[tokio::test]
    async fn test_cancel_during_tool_keeps_partial_message() {
        let backend = Arc::new(MockBackend::new(vec![
            CompletionResponse::new(
                "mock_msg",
                "mock-model",
                vec![
                    ContentBlock::text("Let me count the orders."),
                    ContentBlock::tool_use("call_1", "run_sql", serde_json::json!({"sql": "select"})),
                ],
                StopReason::ToolUse,
                Usage::new(10, 5),
            ),
            MockBackend::text_response("never requested"),
        ]));
        let mut tools = ToolRegistry::new();
        tools.register(CancellingTool);
        let (router, store) = router(backend.clone(), tools);

        let token = CancellationToken::new();
        let sink = WatchingSink {
            token: token.clone(),
            events: Mutex::new(Vec::new()),
        };
        let report = router
            .run(AgentRequest::new("text2sql-agent", "how many orders?"), &sink, token)
            .await;

        let events = sink.events.lock().clone();
        assert!(events.iter().all(|(_, late)| !late));
        let seen: Vec<AgentEvent> = events.into_iter().map(|(e, _)| e).collect();
        let kinds = kinds(&seen);
        assert!(kinds.contains(&"text-delta"));
        assert!(kinds.contains(&"tool-call"));
        assert!(!kinds.contains(&"tool-result"));
        assert!(!kinds.contains(&"finish"));
        assert_eq!(backend.request_count(), 1);

        assert_eq!(report.error.as_deref(), Some("Cancelled"));
        let messages = store.messages();
        assert_eq!(messages.len(), 1);
        let saved = &messages[0];
        assert_eq!(saved.text(), "Let me count the orders.");
        assert!(saved.parts.iter().any(|p| matches!(
            p,
            MessagePart::ToolInvocation { call_id, result: None, .. } if call_id == "call_1"
        )));
    }

    #[test]
    fn test_event_wire_format() {
        let event = AgentEvent::CostUpdate {
            tool_name: "web-agent".into(),
            model_id: "claude-sonnet-4".into(),
            input_tokens: 10,
            output_tokens: 5,
            cost: 0.000105,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cost-update");
        assert_eq!(json["toolName"], "web-agent");
        assert_eq!(json["inputTokens"], 10);

        let finish = serde_json::to_value(AgentEvent::Finish {
            finish_reason: FinishReason::Stop,
        })
        .unwrap();
        assert_eq!(finish, serde_json::json!({"type": "finish", "finishReason": "stop"}));
    }

    #[test]
    fn test_model_overrides() {
        let mut config = RouterConfig::default();
        config
            .agent_models
            .insert("csv-agent".to_string(), "gpt-4o".to_string());
        assert_eq!(config.model_for(AgentType::Csv), "gpt-4o");
        assert_eq!(config.model_for(AgentType::Web), "claude-sonnet-4");
        assert_eq!(config.model_for(AgentType::SharePoint), "gemini-2.5-flash");
    }
}
