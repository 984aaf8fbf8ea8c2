//! Core types for the agent crate.
//!
//! This module defines the request that enters the pipeline:
//! - [`AgentRequest`]: immutable input for one chat turn
//! - [`ChatMessage`] / [`MessagePart`]: conversation history as the client sent it
//! - [`CapabilityToggles`]: the four boolean switches that gate tools
//! - [`SelectedFile`]: files the user attached from the knowledge base

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use switchboard_llm::{ContentBlock, Message, ToolResultBlock, Usage};

// ─────────────────────────────────────────────────────────────────────────────
// ID Types
// ─────────────────────────────────────────────────────────────────────────────

/// Unique identifier for a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(Uuid);

impl ChatId {
    /// Create a new random chat ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a message. Also the idempotency key for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a user session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversation History
// ─────────────────────────────────────────────────────────────────────────────

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// One typed part of a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    /// Plain text.
    Text { text: String },
    /// A tool call made in an earlier turn, with its result if it finished.
    #[serde(rename_all = "camelCase")]
    ToolInvocation {
        call_id: String,
        tool_name: String,
        args: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    /// An uploaded file. Never forwarded to the completion service.
    #[serde(rename_all = "camelCase")]
    File {
        url: String,
        name: String,
        media_type: String,
    },
}

impl MessagePart {
    /// Create a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: ChatRole,
    pub parts: Vec<MessagePart>,
}

impl ChatMessage {
    /// Create a user message with a single text part.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: ChatRole::User,
            parts: vec![MessagePart::text(text)],
        }
    }

    /// Create an assistant message with a single text part.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: ChatRole::Assistant,
            parts: vec![MessagePart::text(text)],
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability Toggles
// ─────────────────────────────────────────────────────────────────────────────

/// Boolean switches set in the client for this turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapabilityToggles {
    pub web_search: bool,
    pub deep_research: bool,
    pub image_generation: bool,
    pub file_search: bool,
}

impl CapabilityToggles {
    /// All toggles off.
    pub fn none() -> Self {
        Self::default()
    }

    /// Turn web search on.
    pub fn with_web_search(mut self) -> Self {
        self.web_search = true;
        self
    }

    /// Turn deep research on.
    pub fn with_deep_research(mut self) -> Self {
        self.deep_research = true;
        self
    }

    /// Turn image generation on.
    pub fn with_image_generation(mut self) -> Self {
        self.image_generation = true;
        self
    }

    /// Turn file search on.
    pub fn with_file_search(mut self) -> Self {
        self.file_search = true;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent Request
// ─────────────────────────────────────────────────────────────────────────────

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub session_id: SessionId,
}

/// A knowledge-base file the user attached to the turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedFile {
    pub title: String,
    pub url: String,
    /// Excerpt or full text known to the client. May be empty.
    #[serde(default)]
    pub content: String,
}

/// Immutable input for one chat turn.
///
/// `history` ends with the user message identified by `user_message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub chat_id: ChatId,
    pub user_message_id: MessageId,
    pub identity: Identity,
    pub history: Vec<ChatMessage>,
    pub model_id: String,
    #[serde(default)]
    pub toggles: CapabilityToggles,
    #[serde(default)]
    pub selected_files: Vec<SelectedFile>,
    /// Usage of the title-generation call made before this request.
    #[serde(default)]
    pub title_usage: Usage,
}

impl AgentRequest {
    /// Create a request whose history is a single user message.
    pub fn new(model_id: impl Into<String>, user_text: impl Into<String>) -> Self {
        let message = ChatMessage::user(user_text);
        Self {
            chat_id: ChatId::new(),
            user_message_id: message.id,
            identity: Identity {
                user_id: "anonymous".to_string(),
                session_id: SessionId::new(),
            },
            history: vec![message],
            model_id: model_id.into(),
            toggles: CapabilityToggles::default(),
            selected_files: Vec::new(),
            title_usage: Usage::default(),
        }
    }

    /// Set the capability toggles.
    pub fn with_toggles(mut self, toggles: CapabilityToggles) -> Self {
        self.toggles = toggles;
        self
    }

    /// Prepend earlier messages to the history.
    pub fn with_prior_messages(mut self, prior: Vec<ChatMessage>) -> Self {
        let mut history = prior;
        history.append(&mut self.history);
        self.history = history;
        self
    }

    /// Attach selected files.
    pub fn with_selected_files(mut self, files: Vec<SelectedFile>) -> Self {
        self.selected_files = files;
        self
    }

    /// Record the usage of the title-generation call.
    pub fn with_title_usage(mut self, usage: Usage) -> Self {
        self.title_usage = usage;
        self
    }

    /// Index of the most recent user message in `history`.
    pub fn last_user_index(&self) -> Option<usize> {
        self.history.iter().rposition(|m| m.role == ChatRole::User)
    }

    /// Text of the most recent user message.
    pub fn last_user_text(&self) -> String {
        self.last_user_index()
            .map(|i| self.history[i].text())
            .unwrap_or_default()
    }

    /// Reduce the history to completion-service messages.
    ///
    /// System messages and file parts are dropped. Finished tool invocations
    /// become a tool-use block followed by a tool-result message.
    pub fn to_llm_messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();

        for chat in &self.history {
            match chat.role {
                ChatRole::System => continue,
                ChatRole::User => {
                    let text = chat.text();
                    if !text.is_empty() {
                        messages.push(Message::user(text));
                    }
                }
                ChatRole::Assistant => {
                    let mut blocks = Vec::new();
                    let mut results = Vec::new();
                    for part in &chat.parts {
                        match part {
                            MessagePart::Text { text } if !text.is_empty() => {
                                blocks.push(ContentBlock::text(text));
                            }
                            MessagePart::ToolInvocation {
                                call_id,
                                tool_name,
                                args,
                                result: Some(result),
                            } => {
                                blocks.push(ContentBlock::tool_use(call_id, tool_name, args.clone()));
                                results.push(ToolResultBlock::success(call_id, result.to_string()));
                            }
                            _ => {}
                        }
                    }
                    if blocks.is_empty() {
                        continue;
                    }
                    messages.push(Message::assistant_blocks(blocks));
                    if !results.is_empty() {
                        messages.push(Message::tool_results(results));
                    }
                }
            }
        }

        messages
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_llm::{Content, Role};

    #[test]
    fn test_ids_unique_and_display() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }

    #[test]
    fn test_toggles_camel_case() {
        let toggles: CapabilityToggles =
            serde_json::from_str(r#"{"webSearch": true, "deepResearch": false}"#).unwrap();
        assert!(toggles.web_search);
        assert!(!toggles.deep_research);
        assert!(!toggles.file_search);
    }

    #[test]
    fn test_last_user_text() {
        let request = AgentRequest::new("web-agent", "latest question")
            .with_prior_messages(vec![ChatMessage::user("first"), ChatMessage::assistant("answer")]);
        assert_eq!(request.last_user_index(), Some(2));
        assert_eq!(request.last_user_text(), "latest question");
        assert_eq!(request.history.last().unwrap().id, request.user_message_id);
    }

    #[test]
    fn test_llm_messages_drop_files_and_system() {
        let mut request = AgentRequest::new("general-assistant", "hello");
        request.history.insert(
            0,
            ChatMessage {
                id: MessageId::new(),
                role: ChatRole::System,
                parts: vec![MessagePart::text("ignored")],
            },
        );
        request.history[1].parts.push(MessagePart::File {
            url: "s3://bucket/a.pdf".to_string(),
            name: "a.pdf".to_string(),
            media_type: "application/pdf".to_string(),
        });

        let messages = request.to_llm_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content.as_text(), Some("hello"));
    }

    #[test]
    fn test_llm_messages_replay_tool_invocations() {
        let assistant = ChatMessage {
            id: MessageId::new(),
            role: ChatRole::Assistant,
            parts: vec![
                MessagePart::text("Looking it up."),
                MessagePart::ToolInvocation {
                    call_id: "call_1".to_string(),
                    tool_name: "search".to_string(),
                    args: serde_json::json!({"query": "rust"}),
                    result: Some(serde_json::json!({"hits": 3})),
                },
            ],
        };
        let request = AgentRequest::new("web-agent", "and now?")
            .with_prior_messages(vec![ChatMessage::user("search rust"), assistant]);

        let messages = request.to_llm_messages();
        assert_eq!(messages.len(), 4);
        assert!(matches!(&messages[1].content, Content::Blocks(b) if b.len() == 2));
        assert!(matches!(
            &messages[2].content,
            Content::Blocks(b) if matches!(&b[0], ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "call_1")
        ));
    }

    #[test]
    fn test_request_json_shape() {
        let request = AgentRequest::new("csv-agent", "sum column b")
            .with_toggles(CapabilityToggles::none().with_file_search());
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["modelId"], "csv-agent");
        assert_eq!(json["toggles"]["fileSearch"], true);
        assert_eq!(json["history"][0]["parts"][0]["type"], "text");

        let restored: AgentRequest = serde_json::from_value(json).unwrap();
        assert_eq!(restored.user_message_id, request.user_message_id);
    }
}
