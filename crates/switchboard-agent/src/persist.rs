//! Persistence of the assistant message for a finished turn.
//!
//! [`PersistenceGate::finalize`] runs once per turn, after streaming is
//! over. Stores must treat a write as idempotent by message id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use switchboard_llm::Usage;

use crate::capability::AgentType;
use crate::error::{AgentError, Result};
use crate::research::ResearchLog;
use crate::stream::StepEvent;
use crate::types::{ChatId, ChatRole, MessageId, MessagePart, SelectedFile};

const SHAREPOINT_V2_FALLBACK: &str = "SharePoint analysis completed.";
const EMPTY_TURN_FALLBACK: &str = "I wasn't able to produce an answer for this request. Please try again.";

// ─────────────────────────────────────────────────────────────────────────────
// Persisted Message
// ─────────────────────────────────────────────────────────────────────────────

/// Metadata of a knowledge-base file attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub excerpt: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A selected file recorded on the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    pub url: String,
    pub name: String,
    pub content_type: String,
    pub metadata: FileMetadata,
}

impl From<&SelectedFile> for FileAttachment {
    fn from(file: &SelectedFile) -> Self {
        Self {
            url: file.url.clone(),
            name: file.title.clone(),
            content_type: "application/octet-stream".to_string(),
            metadata: FileMetadata {
                excerpt: file.content.clone(),
                kind: "file_search".to_string(),
            },
        }
    }
}

/// Something attached to the persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attachment {
    File(FileAttachment),
    /// `{ "type": "research-progress", "updates": [...], "timestamp": ms }`
    ResearchProgress(serde_json::Value),
}

impl Attachment {
    pub fn is_research_progress(&self) -> bool {
        match self {
            Attachment::ResearchProgress(value) => value["type"] == "research-progress",
            Attachment::File(_) => false,
        }
    }
}

/// The durable assistant message of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub role: ChatRole,
    pub parts: Vec<MessagePart>,
    pub attachments: Vec<Attachment>,
    pub model_id: String,
    pub agent_type: AgentType,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// The step budget ran out before the model finished.
    #[serde(default)]
    pub truncated: bool,
    /// Flipped by downstream consumers; always written as false.
    #[serde(default)]
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl PersistedMessage {
    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn research_attachment(&self) -> Option<&serde_json::Value> {
        self.attachments.iter().find_map(|a| match a {
            Attachment::ResearchProgress(value) if a.is_research_progress() => Some(value),
            _ => None,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message Store
// ─────────────────────────────────────────────────────────────────────────────

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Save `message`. Saving an id that already exists must not duplicate it.
    async fn save(&self, message: &PersistedMessage) -> Result<()>;
}

/// In-memory store for tests and replay. The first write for an id wins.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<MessageId, PersistedMessage>>,
    order: RwLock<Vec<MessageId>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &MessageId) -> Option<PersistedMessage> {
        self.messages.read().get(id).cloned()
    }

    /// All messages in insertion order.
    pub fn messages(&self) -> Vec<PersistedMessage> {
        let messages = self.messages.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| messages.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save(&self, message: &PersistedMessage) -> Result<()> {
        let mut messages = self.messages.write();
        if messages.contains_key(&message.id) {
            tracing::debug!(message_id = %message.id, "Message already saved, skipping");
            return Ok(());
        }
        messages.insert(message.id, message.clone());
        self.order.write().push(message.id);
        Ok(())
    }
}

/// One JSON file per message under a directory.
#[derive(Debug, Clone)]
pub struct FileMessageStore {
    dir: PathBuf,
}

impl FileMessageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: &MessageId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn save(&self, message: &PersistedMessage) -> Result<()> {
        let path = self.path_for(&message.id);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| AgentError::store(e.to_string()))?
        {
            tracing::debug!(path = %path.display(), "Message file exists, skipping");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AgentError::store(format!("{}: {}", self.dir.display(), e)))?;
        let body = serde_json::to_vec_pretty(message)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| AgentError::store(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parts Reducer
// ─────────────────────────────────────────────────────────────────────────────

/// Folds step events into message parts.
///
/// Consecutive text deltas merge into one text part; a tool call becomes a
/// tool-invocation part that its result fills in.
#[derive(Debug, Clone, Default)]
pub struct PartsBuilder {
    parts: Vec<MessagePart>,
}

impl PartsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StepEvent) {
        match event {
            StepEvent::TextDelta { text } => self.push_text(text),
            StepEvent::ToolCall {
                call_id,
                name,
                args,
            } => self.parts.push(MessagePart::ToolInvocation {
                call_id: call_id.clone(),
                tool_name: name.clone(),
                args: args.clone(),
                result: None,
            }),
            StepEvent::ToolResult {
                call_id, result, ..
            } => self.set_result(call_id, result.clone()),
            StepEvent::Status { .. }
            | StepEvent::Error { .. }
            | StepEvent::Finish(_)
            | StepEvent::Fail { .. } => {}
        }
    }

    pub fn push_text(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        if let Some(MessagePart::Text { text }) = self.parts.last_mut() {
            text.push_str(delta);
        } else {
            self.parts.push(MessagePart::text(delta));
        }
    }

    fn set_result(&mut self, call_id: &str, value: serde_json::Value) {
        let slot = self.parts.iter_mut().rev().find_map(|part| match part {
            MessagePart::ToolInvocation {
                call_id: id,
                result,
                ..
            } if id == call_id => Some(result),
            _ => None,
        });
        if let Some(result) = slot {
            *result = Some(value);
        }
    }

    pub fn has_content(&self) -> bool {
        !self.parts.is_empty()
    }

    pub fn has_text(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, MessagePart::Text { text } if !text.trim().is_empty()))
    }

    pub fn parts(&self) -> &[MessagePart] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<MessagePart> {
        self.parts
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gate
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the gate needs from a finished turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Pre-generated id, also the idempotency key.
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub agent_type: AgentType,
    pub model_id: String,
    pub parts: PartsBuilder,
    /// Present in deep-research mode.
    pub research: Option<ResearchLog>,
    pub selected_files: Vec<SelectedFile>,
    /// Ledger totals.
    pub usage: Usage,
    pub truncated: bool,
    /// The turn ended in failure.
    pub failed: bool,
}

/// Builds and writes the persisted message.
#[derive(Clone)]
pub struct PersistenceGate {
    store: Arc<dyn MessageStore>,
}

impl PersistenceGate {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Build the message for `outcome`. `None` when a failed turn produced nothing.
    pub fn build(&self, outcome: TurnOutcome) -> Option<PersistedMessage> {
        if outcome.failed && !outcome.parts.has_content() {
            return None;
        }

        let mut parts = outcome.parts;
        if let Some(ref research) = outcome.research
            && !parts.has_text()
        {
            parts.push_text(&research.best_effort_answer());
        }
        if !parts.has_content() {
            let fallback = match outcome.agent_type {
                AgentType::SharePointV2 => SHAREPOINT_V2_FALLBACK,
                _ => EMPTY_TURN_FALLBACK,
            };
            parts.push_text(fallback);
        }

        let now = Utc::now();
        let mut attachments: Vec<Attachment> = outcome
            .selected_files
            .iter()
            .map(|file| Attachment::File(file.into()))
            .collect();
        if let Some(ref research) = outcome.research
            && !research.is_empty()
        {
            attachments.push(Attachment::ResearchProgress(
                research.to_attachment(now.timestamp_millis()),
            ));
        }

        Some(PersistedMessage {
            id: outcome.message_id,
            chat_id: outcome.chat_id,
            role: ChatRole::Assistant,
            parts: parts.into_parts(),
            attachments,
            model_id: outcome.model_id,
            agent_type: outcome.agent_type,
            input_tokens: outcome.usage.input_tokens,
            output_tokens: outcome.usage.output_tokens,
            truncated: outcome.truncated,
            processed: false,
            created_at: now,
        })
    }

    /// Persist the turn. Returns the saved id, or `None` if nothing was written.
    pub async fn finalize(&self, outcome: TurnOutcome) -> Result<Option<MessageId>> {
        let Some(message) = self.build(outcome) else {
            tracing::info!("Turn failed without content, nothing to persist");
            return Ok(None);
        };

        self.store.save(&message).await?;
        tracing::info!(
            message_id = %message.id,
            agent = %message.agent_type,
            input_tokens = message.input_tokens,
            output_tokens = message.output_tokens,
            truncated = message.truncated,
            "Message persisted"
        );
        Ok(Some(message.id))
    }
}
