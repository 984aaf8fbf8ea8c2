//! Error types for the agent crate.

use thiserror::Error;

/// Result type alias using the agent error type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Error type for agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Completion service error.
    #[error("LLM error: {0}")]
    Llm(#[from] switchboard_llm::LlmError),

    /// Tool execution error.
    #[error("Tool error: {0}")]
    Tool(String),

    /// Tool not found in registry.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool exists but is outside the request's whitelist.
    #[error("Tool not allowed for this request: {0}")]
    ToolNotAllowed(String),

    /// Legacy external agent failed.
    #[error("Legacy agent error: {0}")]
    LegacyAgent(String),

    /// Message store failed.
    #[error("Message store error: {0}")]
    Store(String),

    /// Object store failed.
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Turn was cancelled.
    #[error("Turn cancelled")]
    Cancelled,
}

impl AgentError {
    /// Create a tool error.
    pub fn tool(msg: impl Into<String>) -> Self {
        Self::Tool(msg.into())
    }

    /// Create a legacy agent error.
    pub fn legacy(msg: impl Into<String>) -> Self {
        Self::LegacyAgent(msg.into())
    }

    /// Create a message store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an object store error.
    pub fn object_store(msg: impl Into<String>) -> Self {
        Self::ObjectStore(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::tool("failed to chart");
        assert!(err.to_string().contains("Tool error"));
        assert!(err.to_string().contains("failed to chart"));
    }

    #[test]
    fn test_not_allowed_names_tool() {
        let err = AgentError::ToolNotAllowed("run_sql".to_string());
        assert!(err.to_string().contains("run_sql"));
    }

    #[test]
    fn test_from_llm_error() {
        let err: AgentError = switchboard_llm::LlmError::backend("down").into();
        assert!(matches!(err, AgentError::Llm(_)));
    }
}
