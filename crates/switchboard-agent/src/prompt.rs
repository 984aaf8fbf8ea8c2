//! System prompt assembly.
//!
//! Sections are joined with blank lines in a fixed order: base prompt,
//! capability status, deep-research instructions, attached files. The tool
//! constraint clause is appended last.

use crate::capability::{AgentType, Capability, ToolWhitelist};
use crate::constraint;
use crate::types::{CapabilityToggles, ChatMessage, ChatRole};

// ─────────────────────────────────────────────────────────────────────────────
// Base Prompts
// ─────────────────────────────────────────────────────────────────────────────

const REGULAR_PROMPT: &str = "You are a friendly assistant! Keep your responses concise and helpful.";

const WEB_PROMPT: &str = "You are a comprehensive web research assistant.

Research phase:
- Use the 'search' tool to find relevant web pages for the user's query (one search per request)
- Use the 'extract' tool to obtain structured data from promising results if needed
- Use the 'scrape' tool when the user provides specific URLs

Synthesis phase (never skip):
After gathering information, answer the question directly, summarize the key findings across \
sources, and cite every source with its URL. Respond in the same language as the user's query.";

const SHAREPOINT_PROMPT: &str = "You are a specialized assistant with access to an organization's \
SharePoint documents.

Answer questions from the information in the SharePoint repository. Summarize the key information \
that addresses the query, cite the specific documents you reference and link to them when possible.

If you cannot find relevant information, say so clearly and suggest alternative search terms.";

const SHAREPOINT_V2_PROMPT: &str = "You are an AI assistant that answers questions using \
SharePoint knowledge bases.

WORKFLOW:
1. For SharePoint data queries, use the 'reason' tool with appropriate direction_guidance
2. Once the reason tool returns sufficient data, give a comprehensive final answer
3. Do not call the reason tool repeatedly; one thorough analysis is usually sufficient
4. Keep the answer succinct and in the same language as the user's query

CITATIONS (MANDATORY):
- Include numbered citations [1], [2] in your response text
- End with: <references><reference id=\"1\" source=\"Title\" url=\"s3://path\" /></references>";

const CSV_PROMPT: &str = "You are an AI assistant specializing in analyzing CSV data.

WORKFLOW:
1. Use the analysis tool to gather information and execute queries
2. Once you have sufficient data, give a succinct final answer
3. Use markdown tables to present data wherever possible
4. When the data shows trends or comparisons, call the 'chart' tool directly (one or two charts at most)";

const TEXT2SQL_PROMPT: &str = "You are an assistant that helps users retrieve information from a \
database using natural language.

Tools:
1. text2sql: converts one natural language question into one SQL query. Use the sql field only \
when success is true; otherwise tell the user the query could not be generated.
2. run_sql: executes a valid SQL query and returns the result.
3. chart: visualizes query results.

Workflow: call text2sql with the question, run the returned SQL with run_sql, then answer from the \
result.";

const DEEP_RESEARCH_BLOCK: &str = "IMPORTANT: You are currently in DEEP RESEARCH MODE.
- You MUST use the 'reason_search' tool for this query
- Call it with the user's query as the topic
- Example: reason_search({ topic: \"user's question here\", depth: \"basic\" })
- Wait for the complete research results before responding
- The tool will handle multiple searches and synthesis automatically";

const CAPABILITY_FOOTER: &str = "IMPORTANT: Only use tools that are ENABLED. If a user asks for a \
disabled capability, politely explain that the feature is currently disabled and suggest they \
enable it using the toggle buttons.";

/// The base persona prompt for an agent.
pub fn base_prompt(agent: AgentType, toggles: &CapabilityToggles) -> &'static str {
    match agent {
        AgentType::General if toggles.web_search => WEB_PROMPT,
        AgentType::General => REGULAR_PROMPT,
        AgentType::Web => WEB_PROMPT,
        AgentType::SharePoint => SHAREPOINT_PROMPT,
        AgentType::SharePointV2 => SHAREPOINT_V2_PROMPT,
        AgentType::Csv | AgentType::CsvV2 => CSV_PROMPT,
        AgentType::Text2Sql => TEXT2SQL_PROMPT,
    }
}

/// `CURRENT CAPABILITY STATUS` block, or `None` when the agent has no toggles.
pub fn capability_status(agent: AgentType, toggles: &CapabilityToggles) -> Option<String> {
    let lines: Vec<String> = Capability::ALL
        .iter()
        .filter(|capability| agent.supports(**capability))
        .map(|capability| {
            let state = if capability.is_on(toggles) {
                "ENABLED"
            } else {
                "DISABLED"
            };
            format!("{}: {}", capability.label(), state)
        })
        .collect();

    if lines.is_empty() {
        return None;
    }
    Some(format!(
        "CURRENT CAPABILITY STATUS:\n{}\n\n{}",
        lines.join("\n"),
        CAPABILITY_FOOTER
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for the system prompt of one turn.
///
/// ```rust,ignore
/// let prompt = SystemPromptBuilder::new(AgentType::Web, toggles, whitelist)
///     .with_attachments(hydration.prompt_block)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct SystemPromptBuilder {
    agent: AgentType,
    toggles: CapabilityToggles,
    whitelist: ToolWhitelist,
    attachments: Option<String>,
}

impl SystemPromptBuilder {
    /// `toggles` are the effective toggles after resolution.
    pub fn new(agent: AgentType, toggles: CapabilityToggles, whitelist: ToolWhitelist) -> Self {
        Self {
            agent,
            toggles,
            whitelist,
            attachments: None,
        }
    }

    /// Attached-files block from hydration.
    pub fn with_attachments(mut self, block: Option<String>) -> Self {
        self.attachments = block;
        self
    }

    /// Sections without the tool clause. Used as the legacy agent's input prefix.
    pub fn build_sections(&self) -> String {
        let mut sections: Vec<String> = vec![base_prompt(self.agent, &self.toggles).to_string()];

        if let Some(status) = capability_status(self.agent, &self.toggles) {
            sections.push(status);
        }

        if self.toggles.deep_research {
            sections.push(DEEP_RESEARCH_BLOCK.to_string());
        }

        if let Some(block) = self.attachments.as_ref().filter(|b| !b.is_empty()) {
            sections.push(block.clone());
        }

        sections.join("\n\n")
    }

    /// Final prompt with the tool constraint clause.
    pub fn build(self) -> String {
        constraint::inject(&self.build_sections(), &self.whitelist, self.agent)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Web Reminder
// ─────────────────────────────────────────────────────────────────────────────

fn contains_url(text: &str) -> bool {
    text.contains("http://") || text.contains("https://")
}

/// Insert the tool-first reminder before the latest user message.
///
/// Only applies when at least two messages precede it. Returns whether a
/// reminder was inserted.
pub fn insert_web_reminder(history: &mut Vec<ChatMessage>) -> bool {
    let Some(index) = history
        .iter()
        .rposition(|m| m.role == ChatRole::User)
    else {
        return false;
    };
    if index < 2 {
        return false;
    }

    let follow_up = if contains_url(&history[index].text()) {
        "I see you provided a URL. I will use the scrape tool on it. DO NOT reflect on the quality \
of the returned search results in your response."
    } else {
        "I will first search for information, then extract relevant details. DO NOT reflect on the \
quality of the returned search results in your response."
    };
    history.insert(
        index,
        ChatMessage::assistant(format!(
            "I'll help you with that. Remember, I MUST use my tools first before responding\n{}",
            follow_up
        )),
    );
    true
}
