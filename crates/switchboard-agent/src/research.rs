//! Deep-research mode: one long-running `reason_search` call with live progress.
//!
//! The research tool reports its phases (plan, web results, analysis,
//! synthesis) through a [`ProgressSink`] it finds on its [`ToolContext`].
//! [`DeepResearchPipeline`] merges that side channel with the step stream so
//! callers see progress before the tool call itself returns.
//!
//! [`ToolContext`]: crate::tool::ToolContext

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use switchboard_llm::Message;

use crate::stream::{StepEvent, StepExecutor};

/// Id of the research tool's final synthesis update.
pub const FINAL_SYNTHESIS_ID: &str = "final-synthesis";

const NO_FINDINGS_ANSWER: &str = "The research did not finish within its step budget and no findings \
were gathered. Please try again or narrow the question.";

// ─────────────────────────────────────────────────────────────────────────────
// Research Update
// ─────────────────────────────────────────────────────────────────────────────

/// Phase of a research update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Plan,
    Web,
    Analysis,
    Progress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Running,
    Completed,
}

/// One phase event from the research tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchUpdate {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: UpdateType,
    pub status: UpdateStatus,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Replace any earlier update with the same id, whatever its status.
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(default)]
    pub is_complete: bool,
    /// Queries, findings, result lists.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl ResearchUpdate {
    pub fn new(id: impl Into<String>, kind: UpdateType, status: UpdateStatus) -> Self {
        Self {
            id: id.into(),
            kind,
            status,
            timestamp: 0,
            title: None,
            message: None,
            overwrite: false,
            completed_steps: None,
            total_steps: None,
            is_complete: false,
            payload: serde_json::Value::Null,
        }
    }

    pub fn running(id: impl Into<String>, kind: UpdateType) -> Self {
        Self::new(id, kind, UpdateStatus::Running)
    }

    pub fn completed(id: impl Into<String>, kind: UpdateType) -> Self {
        Self::new(id, kind, UpdateStatus::Completed)
    }

    /// The terminal progress update of a finished research run.
    pub fn finished(total_steps: u32) -> Self {
        let mut update = Self::completed("research-progress", UpdateType::Progress)
            .with_message("Research complete")
            .with_steps(total_steps, total_steps)
            .with_overwrite();
        update.is_complete = true;
        update
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    pub fn with_steps(mut self, completed: u32, total: u32) -> Self {
        self.completed_steps = Some(completed);
        self.total_steps = Some(total);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Progress Channel
// ─────────────────────────────────────────────────────────────────────────────

/// Receiving half of the progress side channel.
pub type ProgressReceiver = mpsc::UnboundedReceiver<ResearchUpdate>;

/// Sending half of the progress side channel.
///
/// Stamps every update with a timestamp strictly greater than the previous
/// one, so the merged view orders by emission even within one millisecond.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    sender: mpsc::UnboundedSender<ResearchUpdate>,
    last_timestamp: Arc<AtomicI64>,
}

impl ProgressSink {
    /// Create a connected sink and receiver.
    pub fn channel() -> (ProgressSink, ProgressReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink = ProgressSink {
            sender,
            last_timestamp: Arc::new(AtomicI64::new(0)),
        };
        (sink, receiver)
    }

    /// Stamp and send an update. Returns false if the pipeline is gone.
    pub fn send(&self, mut update: ResearchUpdate) -> bool {
        update.timestamp = self.next_timestamp();
        self.sender.send(update).is_ok()
    }

    fn next_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut previous = self.last_timestamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(previous + 1);
            match self.last_timestamp.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Research Log
// ─────────────────────────────────────────────────────────────────────────────

/// Raw buffer of every update received during one turn.
#[derive(Debug, Clone, Default)]
pub struct ResearchLog {
    updates: Vec<ResearchUpdate>,
    /// Status of the currently kept update per id, in arrival order.
    kept: HashMap<String, UpdateStatus>,
}

impl ResearchLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an update; returns whether it changes the live view.
    ///
    /// Every update is kept in the raw buffer. The return value applies the
    /// same rule as [`deduped`](Self::deduped) in arrival order, so callers
    /// can forward only accepted updates and never show a stale `running`
    /// after `completed`.
    pub fn push(&mut self, update: ResearchUpdate) -> bool {
        let accepted = match self.kept.get(&update.id) {
            None => true,
            Some(&kept) => {
                update.overwrite
                    || (update.status == UpdateStatus::Completed
                        && kept != UpdateStatus::Completed)
            }
        };
        if accepted {
            self.kept.insert(update.id.clone(), update.status);
        }
        self.updates.push(update);
        accepted
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Whether the research tool reported completion.
    pub fn is_complete(&self) -> bool {
        self.updates.iter().any(|u| u.is_complete)
    }

    /// Stable view: one entry per id, ordered by first appearance in time.
    ///
    /// Updates are applied in timestamp order. A later update replaces the
    /// kept one when it has `overwrite`, or when it is `completed` and the
    /// kept one is not.
    pub fn deduped(&self) -> Vec<ResearchUpdate> {
        let mut sorted = self.updates.clone();
        sorted.sort_by_key(|u| u.timestamp);

        let mut view: Vec<ResearchUpdate> = Vec::with_capacity(sorted.len());
        let mut positions: HashMap<String, usize> = HashMap::new();

        for update in sorted {
            match positions.get(&update.id) {
                None => {
                    positions.insert(update.id.clone(), view.len());
                    view.push(update);
                }
                Some(&i) => {
                    let kept = &view[i];
                    let upgrades = update.status == UpdateStatus::Completed
                        && kept.status != UpdateStatus::Completed;
                    if update.overwrite || upgrades {
                        view[i] = update;
                    }
                }
            }
        }

        view
    }

    /// Attachment persisted on the final message.
    pub fn to_attachment(&self, timestamp: i64) -> serde_json::Value {
        serde_json::json!({
            "type": "research-progress",
            "updates": self.deduped(),
            "timestamp": timestamp,
        })
    }

    /// A readable answer built from whatever the research produced.
    ///
    /// Prefers the final synthesis, then the latest analysis. Never empty.
    pub fn best_effort_answer(&self) -> String {
        let view = self.deduped();
        let source = view
            .iter()
            .find(|u| u.id == FINAL_SYNTHESIS_ID)
            .or_else(|| {
                view.iter()
                    .filter(|u| u.kind == UpdateType::Analysis)
                    .max_by_key(|u| u.timestamp)
            });

        match source.and_then(render_findings) {
            Some(answer) => answer,
            None => NO_FINDINGS_ANSWER.to_string(),
        }
    }
}

fn render_findings(update: &ResearchUpdate) -> Option<String> {
    let findings = update
        .payload
        .get("findings")
        .and_then(|f| f.as_array())
        .filter(|f| !f.is_empty());

    let mut out = format!(
        "## {}\n\n",
        update.title.as_deref().unwrap_or("Research Summary")
    );

    match findings {
        Some(findings) => {
            for finding in findings {
                let Some(insight) = finding.get("insight").and_then(|i| i.as_str()) else {
                    continue;
                };
                out.push_str(&format!("- {}\n", insight));
                let evidence = finding
                    .get("evidence")
                    .and_then(|e| e.as_array())
                    .into_iter()
                    .flatten()
                    .filter_map(|e| e.as_str());
                for item in evidence {
                    out.push_str(&format!("  - {}\n", item));
                }
            }
        }
        None => {
            let message = update.message.as_deref().filter(|m| !m.is_empty())?;
            out.push_str(message);
            out.push('\n');
        }
    }

    Some(out.trim_end().to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// An item of the merged research stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ResearchItem {
    Step(StepEvent),
    Update(ResearchUpdate),
}

/// A boxed stream of research items.
pub type ResearchStream = Pin<Box<dyn Stream<Item = ResearchItem> + Send + 'static>>;

/// Runs the step loop with a progress side channel wired into tool calls.
pub struct DeepResearchPipeline {
    executor: StepExecutor,
    receiver: ProgressReceiver,
    cutoff: CancellationToken,
}

impl DeepResearchPipeline {
    /// Build a pipeline. `sink` is handed to every tool call of `executor`;
    /// `receiver` must be its other half.
    pub fn new(executor: StepExecutor, sink: ProgressSink, receiver: ProgressReceiver) -> Self {
        let cutoff = CancellationToken::new();
        Self {
            executor: executor
                .with_progress(sink)
                .with_tool_cutoff(cutoff.clone()),
            receiver,
            cutoff,
        }
    }

    /// Run the loop, interleaving progress updates ahead of step events.
    ///
    /// Updates already sent when a step event is ready are yielded first, so
    /// a tool's progress always precedes its result. Once an update reports
    /// `is_complete`, later hops are offered no tools. After the terminal
    /// step event the stream ends.
    pub fn run(self, messages: Vec<Message>, cancellation: CancellationToken) -> ResearchStream {
        let DeepResearchPipeline {
            executor,
            mut receiver,
            cutoff,
        } = self;

        Box::pin(async_stream::stream! {
            let mut steps = executor.run(messages, cancellation);
            let mut progress_open = true;

            loop {
                let next = tokio::select! {
                    biased;
                    update = receiver.recv(), if progress_open => Merged::Progress(update),
                    event = steps.next() => Merged::Step(event),
                };

                match next {
                    Merged::Progress(Some(update)) => {
                        close_tools_if_complete(&cutoff, &update);
                        yield ResearchItem::Update(update);
                    }
                    Merged::Progress(None) => progress_open = false,
                    Merged::Step(Some(event)) => {
                        while let Ok(update) = receiver.try_recv() {
                            close_tools_if_complete(&cutoff, &update);
                            yield ResearchItem::Update(update);
                        }
                        let terminal = event.is_terminal();
                        yield ResearchItem::Step(event);
                        if terminal {
                            return;
                        }
                    }
                    Merged::Step(None) => return,
                }
            }
        })
    }
}

fn close_tools_if_complete(cutoff: &CancellationToken, update: &ResearchUpdate) {
    if update.is_complete && !cutoff.is_cancelled() {
        tracing::debug!(id = %update.id, "Research complete, closing tools");
        cutoff.cancel();
    }
}

enum Merged {
    Progress(Option<ResearchUpdate>),
    Step(Option<StepEvent>),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::REASON_SEARCH_TOOL;
    use crate::stream::StepConfig;
    use crate::tool::{MockTool, ToolRegistry, ToolResult};
    use switchboard_llm::MockBackend;

    #[test]
    fn test_completed_wins_over_running() {
        let mut log = ResearchLog::new();
        log.push(ResearchUpdate::running("x", UpdateType::Web).at(1));
        log.push(ResearchUpdate::completed("x", UpdateType::Web).at(2));

        let view = log.deduped();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].status, UpdateStatus::Completed);
    }

    #[test]
    fn test_completed_wins_even_when_arriving_first() {
        let mut log = ResearchLog::new();
        log.push(ResearchUpdate::completed("x", UpdateType::Web).at(5));
        log.push(ResearchUpdate::running("x", UpdateType::Web).at(3));

        let view = log.deduped();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].status, UpdateStatus::Completed);
        assert_eq!(view[0].timestamp, 5);
    }

    #[test]
    fn test_stale_running_does_not_replace_completed() {
        let mut log = ResearchLog::new();
        log.push(ResearchUpdate::completed("x", UpdateType::Analysis).at(1));
        log.push(ResearchUpdate::running("x", UpdateType::Analysis).at(2));
        assert_eq!(log.deduped()[0].status, UpdateStatus::Completed);
    }

    #[test]
    fn test_overwrite_always_wins() {
        let mut log = ResearchLog::new();
        log.push(ResearchUpdate::completed("plan", UpdateType::Plan).with_message("old").at(1));
        log.push(
            ResearchUpdate::running("plan", UpdateType::Plan)
                .with_message("new")
                .with_overwrite()
                .at(2),
        );
        let view = log.deduped();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].message.as_deref(), Some("new"));
    }

    #[test]
    fn test_view_ordered_by_time() {
        let mut log = ResearchLog::new();
        log.push(ResearchUpdate::running("b", UpdateType::Web).at(20));
        log.push(ResearchUpdate::running("a", UpdateType::Plan).at(10));
        let ids: Vec<_> = log.deduped().into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_update_serializes_camel_case() {
        let update = ResearchUpdate::finished(4).at(99);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["isComplete"], true);
        assert_eq!(json["completedSteps"], 4);
        assert_eq!(json["timestamp"], 99);
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn test_attachment_shape() {
        let mut log = ResearchLog::new();
        log.push(ResearchUpdate::running("x", UpdateType::Web).at(1));
        log.push(ResearchUpdate::completed("x", UpdateType::Web).at(2));
        let attachment = log.to_attachment(1234);
        assert_eq!(attachment["type"], "research-progress");
        assert_eq!(attachment["updates"].as_array().unwrap().len(), 1);
        assert_eq!(attachment["timestamp"], 1234);
    }

    #[test]
    fn test_sink_timestamps_strictly_increase() {
        let (sink, mut receiver) = ProgressSink::channel();
        for _ in 0..50 {
            assert!(sink.send(ResearchUpdate::running("x", UpdateType::Web)));
        }
        let mut previous = 0;
        while let Ok(update) = receiver.try_recv() {
            assert!(update.timestamp > previous);
            previous = update.timestamp;
        }
    }

    #[test]
    fn test_best_effort_prefers_final_synthesis() {
        let mut log = ResearchLog::new();
        log.push(
            ResearchUpdate::completed("analysis-0", UpdateType::Analysis)
                .with_message("partial")
                .at(1),
        );
        log.push(
            ResearchUpdate::completed(FINAL_SYNTHESIS_ID, UpdateType::Analysis)
                .with_title("Final Research Synthesis")
                .with_payload(serde_json::json!({
                    "findings": [{"insight": "Rust is memory safe", "evidence": ["borrow checker"]}]
                }))
                .at(2),
        );
        let answer = log.best_effort_answer();
        assert!(answer.starts_with("## Final Research Synthesis"));
        assert!(answer.contains("- Rust is memory safe"));
        assert!(answer.contains("  - borrow checker"));
    }

    #[test]
    fn test_best_effort_falls_back_to_latest_analysis_message() {
        let mut log = ResearchLog::new();
        log.push(ResearchUpdate::running("plan", UpdateType::Plan).at(1));
        log.push(
            ResearchUpdate::running("analysis-1", UpdateType::Analysis)
                .with_message("Comparing three sources")
                .at(2),
        );
        assert!(log.best_effort_answer().contains("Comparing three sources"));
    }

    #[test]
    fn test_best_effort_never_empty() {
        assert_eq!(ResearchLog::new().best_effort_answer(), NO_FINDINGS_ANSWER);
    }

    #[tokio::test]
    async fn test_pipeline_progress_precedes_tool_result() {
        let backend = Arc::new(MockBackend::new(vec![
            MockBackend::tool_call_response(
                "call_1",
                REASON_SEARCH_TOOL,
                serde_json::json!({"topic": "rust"}),
            ),
            MockBackend::text_response("## Findings"),
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(
            MockTool::new(REASON_SEARCH_TOOL)
                .with_progress(vec![
                    ResearchUpdate::running("research-plan-initial", UpdateType::Plan),
                    ResearchUpdate::completed("research-plan-initial", UpdateType::Plan),
                    ResearchUpdate::finished(2),
                ])
                .with_response(ToolResult::json(serde_json::json!({"synthesis": {}}))),
        );

        let executor = StepExecutor::new(
            backend,
            Arc::new(registry),
            [REASON_SEARCH_TOOL].into_iter().collect(),
            StepConfig::new("test-model").with_max_steps(2),
        );
        let (sink, receiver) = ProgressSink::channel();
        let items: Vec<ResearchItem> = DeepResearchPipeline::new(executor, sink, receiver)
            .run(vec![Message::user("rust")], CancellationToken::new())
            .collect()
            .await;

        let last_update = items
            .iter()
            .rposition(|i| matches!(i, ResearchItem::Update(_)))
            .unwrap();
        let tool_result = items
            .iter()
            .position(|i| matches!(i, ResearchItem::Step(StepEvent::ToolResult { .. })))
            .unwrap();
        assert!(last_update < tool_result);
        assert!(matches!(items.last(), Some(ResearchItem::Step(StepEvent::Finish(_)))));

        let mut log = ResearchLog::new();
        for item in &items {
            if let ResearchItem::Update(u) = item {
                log.push(u.clone());
            }
        }
        assert!(log.is_complete());
        assert_eq!(log.deduped().len(), 2);
    }

    #[tokio::test]
    async fn test_completion_stops_further_research_calls() {
        let backend = Arc::new(MockBackend::new(vec![
            MockBackend::tool_call_response(
                "call_1",
                REASON_SEARCH_TOOL,
                serde_json::json!({"topic": "rust"}),
            ),
            MockBackend::tool_call_response(
                "call_2",
                REASON_SEARCH_TOOL,
                serde_json::json!({"topic": "rust again"}),
            ),
        ]));
        let research = Arc::new(
            MockTool::new(REASON_SEARCH_TOOL).with_progress(vec![ResearchUpdate::finished(3)]),
        );
        let mut registry = ToolRegistry::new();
        registry.register_arc(research.clone());

        let executor = StepExecutor::new(
            backend.clone(),
            Arc::new(registry),
            [REASON_SEARCH_TOOL].into_iter().collect(),
            StepConfig::new("test-model").with_max_steps(2),
        );
        let (sink, receiver) = ProgressSink::channel();
        let items: Vec<ResearchItem> = DeepResearchPipeline::new(executor, sink, receiver)
            .run(vec![Message::user("rust")], CancellationToken::new())
            .collect()
            .await;

        assert_eq!(research.call_count(), 1);
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].tools.is_empty());
        assert!(requests[1].tools.is_empty());
        assert!(matches!(
            items.last(),
            Some(ResearchItem::Step(StepEvent::Finish(summary))) if !summary.truncated
        ));
    }

    #[test]
    fn test_push_reports_view_changes() {
        let mut log = ResearchLog::new();
        assert!(log.push(ResearchUpdate::completed("search-0", UpdateType::Web)));
        assert!(!log.push(ResearchUpdate::running("search-0", UpdateType::Web)));
        assert!(log.push(ResearchUpdate::running("search-0", UpdateType::Web).with_overwrite()));
        assert!(log.push(ResearchUpdate::completed("search-0", UpdateType::Web)));
        assert!(!log.push(ResearchUpdate::completed("search-0", UpdateType::Web)));
    }
}
