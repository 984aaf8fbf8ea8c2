//! Tool constraint clause appended to every system prompt.
//!
//! The clause is advisory. [`StepExecutor`](crate::stream::StepExecutor)
//! rejects tool calls outside the whitelist regardless of what the model
//! was told.

use crate::capability::{AgentType, ToolWhitelist, tool_description};

const HEADER: &str = "====== CURRENTLY AVAILABLE TOOLS ======";
const ALLOWED_PREFIX: &str = "ALLOWED_TOOLS: ";
const NONE_MARKER: &str = "(none)";

const CRITICAL_LINE: &str = "CRITICAL: You may ONLY use the tools listed above. Any tool not listed \
here is NOT available to you. If a request needs an unavailable tool, say so instead of calling it.";

const NO_TOOLS_LINE: &str = "CRITICAL: No tools are available. Do not attempt any tool call; answer \
directly from the conversation.";

/// Append the constraint clause for `whitelist` to `base_prompt`.
pub fn inject(base_prompt: &str, whitelist: &ToolWhitelist, agent: AgentType) -> String {
    let mut prompt = String::with_capacity(base_prompt.len() + 256);
    prompt.push_str(base_prompt.trim_end());
    if !prompt.is_empty() {
        prompt.push_str("\n\n");
    }
    prompt.push_str(HEADER);
    prompt.push('\n');

    if whitelist.is_empty() {
        prompt.push_str(&format!(
            "You are currently operating as the {} agent with no tools.\n\n",
            agent.id()
        ));
        prompt.push_str(ALLOWED_PREFIX);
        prompt.push_str(NONE_MARKER);
        prompt.push_str("\n\n");
        prompt.push_str(NO_TOOLS_LINE);
        return prompt;
    }

    prompt.push_str(&format!(
        "You are currently operating as the {} agent with access to the following tools:\n",
        agent.id()
    ));
    for name in whitelist.iter() {
        match tool_description(name) {
            Some(description) => prompt.push_str(&format!("- {}: {}\n", name, description)),
            None => prompt.push_str(&format!("- {}\n", name)),
        }
    }
    prompt.push('\n');
    prompt.push_str(ALLOWED_PREFIX);
    prompt.push_str(&whitelist.names().join(", "));
    prompt.push_str("\n\n");
    prompt.push_str(CRITICAL_LINE);
    prompt
}

/// Read the `ALLOWED_TOOLS` line back out of an injected prompt.
///
/// Returns `None` when the prompt carries no clause.
pub fn allowed_tools(prompt: &str) -> Option<ToolWhitelist> {
    let line = prompt
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(ALLOWED_PREFIX))?;
    if line.trim() == NONE_MARKER {
        return Some(ToolWhitelist::empty());
    }
    Some(
        line.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::resolve;
    use crate::types::CapabilityToggles;

    #[test]
    fn test_lists_every_tool_sorted() {
        let whitelist: ToolWhitelist = ["search", "chart", "getWeather"].into_iter().collect();
        let prompt = inject("Base prompt.", &whitelist, AgentType::Web);

        assert!(prompt.starts_with("Base prompt.\n\n====== CURRENTLY AVAILABLE TOOLS ======"));
        assert!(prompt.contains("operating as the web-agent agent"));
        assert!(prompt.contains("ALLOWED_TOOLS: chart, getWeather, search\n"));
        assert!(prompt.ends_with(CRITICAL_LINE));

        let chart = prompt.find("- chart:").unwrap();
        let search = prompt.find("- search:").unwrap();
        assert!(chart < search);
    }

    #[test]
    fn test_empty_whitelist_forbids_tools() {
        let prompt = inject("Base", &ToolWhitelist::empty(), AgentType::SharePoint);
        assert!(prompt.contains("ALLOWED_TOOLS: (none)"));
        assert!(prompt.contains("Do not attempt any tool call"));
        assert_eq!(allowed_tools(&prompt), Some(ToolWhitelist::empty()));
    }

    #[test]
    fn test_clause_round_trips_the_whitelist() {
        let (agent, whitelist) = resolve(
            "general-assistant",
            CapabilityToggles::none().with_web_search().with_image_generation(),
        );
        let prompt = inject("You are helpful.", &whitelist, agent);
        assert_eq!(allowed_tools(&prompt), Some(whitelist));
    }

    #[test]
    fn test_unknown_tool_listed_without_description() {
        let whitelist: ToolWhitelist = ["customThing"].into_iter().collect();
        let prompt = inject("", &whitelist, AgentType::General);
        assert!(prompt.starts_with(HEADER));
        assert!(prompt.contains("- customThing\n"));
    }

    #[test]
    fn test_no_clause() {
        assert_eq!(allowed_tools("just a prompt"), None);
    }
}
