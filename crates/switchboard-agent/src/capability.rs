//! Capability resolution: which agent handles a request and which tools it may call.
//!
//! [`resolve`] is pure and total. Every `(model_id, toggles)` pair maps to
//! exactly one [`AgentType`] and one [`ToolWhitelist`]; toggles an agent does
//! not support are downgraded to off instead of rejected.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::CapabilityToggles;

/// The only tool available in deep-research mode.
pub const REASON_SEARCH_TOOL: &str = "reason_search";

// ─────────────────────────────────────────────────────────────────────────────
// Agent Type
// ─────────────────────────────────────────────────────────────────────────────

/// The agent persona handling a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentType {
    #[serde(rename = "general-assistant")]
    General,
    #[serde(rename = "web-agent")]
    Web,
    #[serde(rename = "sharepoint-agent")]
    SharePoint,
    #[serde(rename = "sharepoint-agent-v2")]
    SharePointV2,
    #[serde(rename = "csv-agent")]
    Csv,
    #[serde(rename = "csv-agent-v2")]
    CsvV2,
    #[serde(rename = "text2sql-agent")]
    Text2Sql,
}

impl AgentType {
    /// Every agent type, in declaration order.
    pub const ALL: [AgentType; 7] = [
        AgentType::General,
        AgentType::Web,
        AgentType::SharePoint,
        AgentType::SharePointV2,
        AgentType::Csv,
        AgentType::CsvV2,
        AgentType::Text2Sql,
    ];

    /// Map a requested model/agent identifier onto an agent type.
    ///
    /// Unknown identifiers fall back to [`AgentType::General`].
    pub fn from_model_id(model_id: &str) -> Self {
        match model_id.trim() {
            "web-agent" => AgentType::Web,
            "sharepoint-agent" => AgentType::SharePoint,
            "sharepoint-agent-v2" => AgentType::SharePointV2,
            "csv-agent" => AgentType::Csv,
            "csv-agent-v2" => AgentType::CsvV2,
            "text2sql-agent" | "text2sql-agent-v1" => AgentType::Text2Sql,
            // general-assistant, general-bedrock-agent, chat-model,
            // chat-model-reasoning, image-agent and anything unrecognised
            _ => AgentType::General,
        }
    }

    /// Stable identifier used in persisted records and config keys.
    pub fn id(&self) -> &'static str {
        match self {
            AgentType::General => "general-assistant",
            AgentType::Web => "web-agent",
            AgentType::SharePoint => "sharepoint-agent",
            AgentType::SharePointV2 => "sharepoint-agent-v2",
            AgentType::Csv => "csv-agent",
            AgentType::CsvV2 => "csv-agent-v2",
            AgentType::Text2Sql => "text2sql-agent",
        }
    }

    /// Capabilities this agent can honour.
    pub fn supports(&self, capability: Capability) -> bool {
        use Capability::*;
        match self {
            AgentType::General => matches!(capability, WebSearch | DeepResearch | ImageGeneration),
            AgentType::Web => matches!(capability, WebSearch | DeepResearch),
            AgentType::SharePointV2 => matches!(capability, FileSearch),
            AgentType::SharePoint | AgentType::Csv | AgentType::CsvV2 | AgentType::Text2Sql => {
                false
            }
        }
    }

    /// Whether this agent runs through the legacy external invoker.
    pub fn is_legacy(&self) -> bool {
        matches!(self, AgentType::SharePoint)
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// A single capability toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    WebSearch,
    DeepResearch,
    ImageGeneration,
    FileSearch,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::WebSearch,
        Capability::DeepResearch,
        Capability::ImageGeneration,
        Capability::FileSearch,
    ];

    /// Label used in the capability status block.
    pub fn label(&self) -> &'static str {
        match self {
            Capability::WebSearch => "Web Search",
            Capability::DeepResearch => "Deep Research",
            Capability::ImageGeneration => "Image Generation",
            Capability::FileSearch => "File Search",
        }
    }

    /// Read this capability from a toggle set.
    pub fn is_on(&self, toggles: &CapabilityToggles) -> bool {
        match self {
            Capability::WebSearch => toggles.web_search,
            Capability::DeepResearch => toggles.deep_research,
            Capability::ImageGeneration => toggles.image_generation,
            Capability::FileSearch => toggles.file_search,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Whitelist
// ─────────────────────────────────────────────────────────────────────────────

/// The set of tool names a request may call. Iterates in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolWhitelist(BTreeSet<String>);

impl ToolWhitelist {
    /// An empty whitelist (no tool calling).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether `name` may be called.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// Tool names in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Tool names as a vector of borrowed strings.
    pub fn names(&self) -> Vec<&str> {
        self.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ToolWhitelist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Catalog
// ─────────────────────────────────────────────────────────────────────────────

const GENERAL_BASE_TOOLS: &[&str] = &[
    "getWeather",
    "requestSuggestions",
    "processFile",
    "chart",
    "createDocument",
    "updateDocument",
    "mapControl",
    "connector",
    "listConnectors",
];

const WEB_TOOLS: &[&str] = &["search", "extract", "scrape"];

const IMAGE_TOOLS: &[&str] = &["generateImage", "editImage"];

/// One-line description of a known tool, used in the constraint clause.
pub fn tool_description(name: &str) -> Option<&'static str> {
    let description = match name {
        "chart" => "Creates beautiful, interactive charts from data",
        "search" => "Search the web for information",
        "extract" => "Extract information from web pages",
        "scrape" => "Scrape web content",
        "createDocument" => {
            "Create new documents with full markdown support including tables, lists, and formatting"
        }
        "updateDocument" => {
            "Update existing documents with full markdown support including tables, lists, and formatting"
        }
        "processFile" => "Process and analyze files",
        "getWeather" => "Get weather information",
        "requestSuggestions" => "Request AI suggestions",
        "generateImage" => "Generate images from text",
        "editImage" => "Edit existing images",
        "mapControl" => "Show, pan and annotate the interactive map",
        "connector" => "Query a connected external data source",
        "listConnectors" => "List the external data sources connected for this user",
        "reason" => "Advanced reasoning and task planning",
        "reason_csv" => "Analyze uploaded CSV data and answer questions about it",
        "text2sql" => "Translate a question into SQL for the connected database",
        "run_sql" => "Execute a read-only SQL query and return the rows",
        REASON_SEARCH_TOOL => "Research agent for information gathering",
        _ => return None,
    };
    Some(description)
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Hop budgets per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBudgets {
    pub default_steps: u32,
    pub deep_research_steps: u32,
    pub sharepoint_v2_steps: u32,
}

impl Default for StepBudgets {
    fn default() -> Self {
        Self {
            default_steps: 6,
            deep_research_steps: 2,
            sharepoint_v2_steps: 5,
        }
    }
}

/// Everything the router needs to know about how to run a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub agent_type: AgentType,
    /// Toggles after unsupported capabilities were switched off.
    pub toggles: CapabilityToggles,
    pub whitelist: ToolWhitelist,
    pub max_steps: u32,
    pub temperature: Option<f32>,
}

impl Resolution {
    /// Whether this request runs in deep-research mode.
    pub fn is_deep_research(&self) -> bool {
        self.toggles.deep_research
    }
}

/// Resolve the agent type and tool whitelist for a request.
pub fn resolve(model_id: &str, toggles: CapabilityToggles) -> (AgentType, ToolWhitelist) {
    let resolution = resolve_with_budgets(model_id, toggles, StepBudgets::default());
    (resolution.agent_type, resolution.whitelist)
}

/// Full resolution including effective toggles, step budget and temperature.
pub fn resolve_with_budgets(
    model_id: &str,
    toggles: CapabilityToggles,
    budgets: StepBudgets,
) -> Resolution {
    let agent_type = AgentType::from_model_id(model_id);
    let toggles = effective_toggles(agent_type, toggles);
    let deep = toggles.deep_research;

    let whitelist = if deep {
        ToolWhitelist::from_iter([REASON_SEARCH_TOOL])
    } else {
        base_tools(agent_type, &toggles)
    };

    let max_steps = match agent_type {
        _ if deep => budgets.deep_research_steps,
        AgentType::SharePointV2 => budgets.sharepoint_v2_steps,
        _ => budgets.default_steps,
    };

    let temperature = match agent_type {
        _ if deep => Some(0.0),
        AgentType::SharePointV2 | AgentType::CsvV2 => Some(0.7),
        AgentType::Csv => Some(0.0),
        AgentType::Text2Sql => Some(0.5),
        AgentType::General | AgentType::Web | AgentType::SharePoint => None,
    };

    Resolution {
        agent_type,
        toggles,
        whitelist,
        max_steps,
        temperature,
    }
}

fn effective_toggles(agent_type: AgentType, requested: CapabilityToggles) -> CapabilityToggles {
    CapabilityToggles {
        web_search: requested.web_search && agent_type.supports(Capability::WebSearch),
        deep_research: requested.deep_research && agent_type.supports(Capability::DeepResearch),
        image_generation: requested.image_generation
            && agent_type.supports(Capability::ImageGeneration),
        file_search: requested.file_search && agent_type.supports(Capability::FileSearch),
    }
}

fn base_tools(agent_type: AgentType, toggles: &CapabilityToggles) -> ToolWhitelist {
    match agent_type {
        AgentType::General | AgentType::Web => {
            let mut names: Vec<&str> = GENERAL_BASE_TOOLS.to_vec();
            if toggles.web_search {
                names.extend_from_slice(WEB_TOOLS);
            }
            if agent_type == AgentType::General && toggles.image_generation {
                names.extend_from_slice(IMAGE_TOOLS);
            }
            names.into_iter().collect()
        }
        AgentType::SharePoint => ToolWhitelist::empty(),
        AgentType::SharePointV2 | AgentType::CsvV2 => ["reason", "chart"].into_iter().collect(),
        AgentType::Csv => ["reason_csv"].into_iter().collect(),
        AgentType::Text2Sql => ["text2sql", "run_sql", "chart"].into_iter().collect(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL_IDS: &[&str] = &[
        "general-assistant",
        "general-bedrock-agent",
        "chat-model",
        "chat-model-reasoning",
        "image-agent",
        "web-agent",
        "sharepoint-agent",
        "sharepoint-agent-v2",
        "csv-agent",
        "csv-agent-v2",
        "text2sql-agent",
        "text2sql-agent-v1",
        "",
        "something-else",
    ];

    fn all_toggles() -> Vec<CapabilityToggles> {
        (0..16u8)
            .map(|bits| CapabilityToggles {
                web_search: bits & 1 != 0,
                deep_research: bits & 2 != 0,
                image_generation: bits & 4 != 0,
                file_search: bits & 8 != 0,
            })
            .collect()
    }

    #[test]
    fn test_model_id_mapping() {
        assert_eq!(AgentType::from_model_id("web-agent"), AgentType::Web);
        assert_eq!(AgentType::from_model_id(" web-agent "), AgentType::Web);
        assert_eq!(AgentType::from_model_id("text2sql-agent-v1"), AgentType::Text2Sql);
        assert_eq!(AgentType::from_model_id("chat-model-reasoning"), AgentType::General);
        assert_eq!(AgentType::from_model_id("unknown"), AgentType::General);
    }

    #[test]
    fn test_id_roundtrips_through_mapping() {
        for agent in AgentType::ALL {
            assert_eq!(AgentType::from_model_id(agent.id()), agent);
            let json = serde_json::to_string(&agent).unwrap();
            assert_eq!(json, format!("\"{}\"", agent.id()));
        }
    }

    #[test]
    fn test_resolve_total_and_deterministic() {
        for model in MODEL_IDS {
            for toggles in all_toggles() {
                let first = resolve_with_budgets(model, toggles, StepBudgets::default());
                let second = resolve_with_budgets(model, toggles, StepBudgets::default());
                assert_eq!(first, second);
                assert!(first.max_steps >= 1);
            }
        }
    }

    #[test]
    fn test_deep_research_forces_reason_search_only() {
        for model in ["general-assistant", "web-agent", "chat-model"] {
            for toggles in all_toggles().into_iter().filter(|t| t.deep_research) {
                let (_, whitelist) = resolve(model, toggles);
                assert_eq!(whitelist.names(), vec![REASON_SEARCH_TOOL]);
            }
        }
    }

    #[test]
    fn test_reason_search_absent_outside_deep_research() {
        for model in MODEL_IDS {
            for toggles in all_toggles() {
                let resolution = resolve_with_budgets(model, toggles, StepBudgets::default());
                if !resolution.is_deep_research() {
                    assert!(!resolution.whitelist.contains(REASON_SEARCH_TOOL));
                }
            }
        }
    }

    #[test]
    fn test_unsupported_deep_research_downgraded() {
        let toggles = CapabilityToggles::none().with_deep_research();
        let resolution = resolve_with_budgets("csv-agent-v2", toggles, StepBudgets::default());
        assert_eq!(resolution.agent_type, AgentType::CsvV2);
        assert!(!resolution.toggles.deep_research);
        assert_eq!(resolution.whitelist.names(), vec!["chart", "reason"]);
        assert_eq!(resolution.max_steps, 6);
        assert_eq!(resolution.temperature, Some(0.7));
    }

    #[test]
    fn test_general_with_web_search_stays_general() {
        let toggles = CapabilityToggles::none().with_web_search();
        let (agent, whitelist) = resolve("general-assistant", toggles);
        assert_eq!(agent, AgentType::General);
        for tool in WEB_TOOLS {
            assert!(whitelist.contains(tool));
        }
    }

    #[test]
    fn test_image_tools_only_for_general() {
        let toggles = CapabilityToggles::none().with_image_generation();
        let (_, general) = resolve("general-assistant", toggles);
        let (_, web) = resolve("web-agent", toggles);
        assert!(general.contains("generateImage"));
        assert!(general.contains("editImage"));
        assert!(!web.contains("generateImage"));
    }

    #[test]
    fn test_web_agent_without_toggle_has_no_web_tools() {
        let (_, whitelist) = resolve("web-agent", CapabilityToggles::none());
        assert!(!whitelist.contains("search"));
        assert!(whitelist.contains("chart"));
        assert_eq!(whitelist.len(), GENERAL_BASE_TOOLS.len());
    }

    #[test]
    fn test_budgets_and_temperatures() {
        let budgets = StepBudgets::default();
        let deep = resolve_with_budgets(
            "web-agent",
            CapabilityToggles::none().with_web_search().with_deep_research(),
            budgets,
        );
        assert_eq!(deep.max_steps, 2);
        assert_eq!(deep.temperature, Some(0.0));

        let sp = resolve_with_budgets("sharepoint-agent-v2", CapabilityToggles::none(), budgets);
        assert_eq!(sp.max_steps, 5);

        let sql = resolve_with_budgets("text2sql-agent", CapabilityToggles::none(), budgets);
        assert_eq!(sql.max_steps, 6);
        assert_eq!(sql.temperature, Some(0.5));
        assert_eq!(sql.whitelist.names(), vec!["chart", "run_sql", "text2sql"]);

        let custom = StepBudgets {
            default_steps: 3,
            ..budgets
        };
        let general = resolve_with_budgets("general-assistant", CapabilityToggles::none(), custom);
        assert_eq!(general.max_steps, 3);
        assert_eq!(general.temperature, None);
    }

    #[test]
    fn test_legacy_sharepoint_has_no_tools() {
        let (agent, whitelist) = resolve("sharepoint-agent", CapabilityToggles::none().with_file_search());
        assert_eq!(agent, AgentType::SharePoint);
        assert!(agent.is_legacy());
        assert!(whitelist.is_empty());
    }

    #[test]
    fn test_every_whitelisted_tool_has_description() {
        for model in MODEL_IDS {
            for toggles in all_toggles() {
                let (_, whitelist) = resolve(model, toggles);
                for name in whitelist.iter() {
                    assert!(tool_description(name).is_some(), "missing description for {name}");
                }
            }
        }
    }
}
