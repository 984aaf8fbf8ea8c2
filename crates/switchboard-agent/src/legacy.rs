//! Legacy external agent and its narrow retry wrapper.
//!
//! The SharePoint (v1) agent is a single call to an outside service. Only the
//! service's cold-start failure is retried; every other failure surfaces on
//! the first attempt.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use switchboard_llm::Usage;

use crate::error::{AgentError, Result};
use crate::types::SessionId;

/// Failure text the external agent returns while waking from auto-pause.
pub const COLD_START_SIGNATURE: &str = "resuming after being auto-paused";

const SOURCES_HEADING: &str = "**Sources**";

// ─────────────────────────────────────────────────────────────────────────────
// Agent Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Text and usage returned by the external agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyReply {
    pub text: String,
    pub usage: Usage,
}

impl LegacyReply {
    pub fn new(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}

/// A free-text external agent.
#[async_trait]
pub trait LegacyAgent: Send + Sync {
    /// Send `input` for `session_id` and wait for the full reply.
    async fn invoke(&self, input: &str, session_id: &SessionId) -> Result<LegacyReply>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Classification
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one attempt, classified before any retry decision.
#[derive(Debug)]
pub enum Attempt {
    Ok(LegacyReply),
    Retryable(AgentError),
    Fatal(AgentError),
}

impl Attempt {
    pub fn classify(result: Result<LegacyReply>) -> Self {
        match result {
            Ok(reply) => Attempt::Ok(reply),
            Err(e) if e.to_string().contains(COLD_START_SIGNATURE) => Attempt::Retryable(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retrying Invoker
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Wraps a [`LegacyAgent`] with cold-start retries.
#[derive(Clone)]
pub struct RetryingInvoker {
    agent: Arc<dyn LegacyAgent>,
    policy: RetryPolicy,
}

impl RetryingInvoker {
    pub fn new(agent: Arc<dyn LegacyAgent>) -> Self {
        Self {
            agent,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Invoke the agent, retrying only the cold-start failure.
    pub async fn invoke(&self, input: &str, session_id: &SessionId) -> Result<LegacyReply> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Attempt::classify(self.agent.invoke(input, session_id).await) {
                Attempt::Ok(reply) => return Ok(reply),
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retryable(e) if attempt > self.policy.max_retries => {
                    tracing::warn!(attempts = attempt, error = %e, "Legacy agent still cold, giving up");
                    return Err(e);
                }
                Attempt::Retryable(e) => {
                    tracing::warn!(
                        attempt,
                        max_retries = self.policy.max_retries,
                        delay_ms = self.policy.delay.as_millis() as u64,
                        error = %e,
                        "Legacy agent cold start, retrying"
                    );
                    tokio::time::sleep(self.policy.delay).await;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Agent
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokeRequest<'a> {
    input: &'a str,
    session_id: String,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeResponse {
    text: String,
    #[serde(default)]
    usage: Option<InvokeUsage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// External agent reached with a JSON POST.
#[derive(Debug, Clone)]
pub struct HttpLegacyAgent {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpLegacyAgent {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::legacy(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LegacyAgent for HttpLegacyAgent {
    async fn invoke(&self, input: &str, session_id: &SessionId) -> Result<LegacyReply> {
        let body = InvokeRequest {
            input,
            session_id: session_id.to_string(),
            model: &self.model,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::legacy(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::legacy(format!("{}: {}", status, text)));
        }

        let parsed: InvokeResponse = response
            .json()
            .await
            .map_err(|e| AgentError::legacy(format!("Invalid response body: {}", e)))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(LegacyReply::new(
            parsed.text,
            Usage::new(usage.input_tokens, usage.output_tokens),
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Input / Output Shaping
// ─────────────────────────────────────────────────────────────────────────────

/// Combine the system prompt and the user query into one input string.
pub fn build_legacy_input(system_prompt: &str, user_text: &str) -> String {
    if system_prompt.is_empty() {
        user_text.to_string()
    } else {
        format!("{}\n\nUser Query: {}", system_prompt, user_text)
    }
}

static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\d+\]").expect("citation pattern is a valid regex"));

fn has_citations(text: &str) -> bool {
    CITATION.is_match(text)
}

/// Append a placeholder sources section when the text cites but lists none.
pub fn prepare_response_text(text: &str) -> String {
    if has_citations(text) && !text.contains(SOURCES_HEADING) {
        format!("{}\n\n{}\nNo source information available", text, SOURCES_HEADING)
    } else {
        text.to_string()
    }
}

/// Split prepared text into per-line chunks for streaming.
///
/// Every chunk but the last keeps its newline, so the chunks concatenate
/// back to exactly `text`.
pub fn line_chunks(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_inclusive('\n').map(str::to_string)
}
