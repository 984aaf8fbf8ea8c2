//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [agent]                  # completion model, step budgets
//! [agent.models]           # per-agent model overrides
//! [hydration]              # selected-file inlining threshold
//! [legacy]                 # legacy external agent endpoint and retry policy
//! [object_store]           # gateway serving s3:// selected files
//! [pricing."model-id"]     # extra or overriding price rows
//! [logging]                # log file location
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    /// Completion model and step budgets.
    pub agent: Option<AgentSection>,

    /// Selected-file hydration settings.
    pub hydration: Option<HydrationSection>,

    /// Legacy external agent settings.
    pub legacy: Option<LegacySection>,

    /// Gateway for `s3://` selected files.
    pub object_store: Option<ObjectStoreSection>,

    /// Price rows keyed by model identifier.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pricing: BTreeMap<String, PriceRow>,

    /// Log file settings.
    pub logging: Option<LoggingSection>,
}

impl SwitchboardConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        let config: SwitchboardConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: SwitchboardConfig) {
        if other.agent.is_some() {
            self.agent = other.agent;
        }

        if other.hydration.is_some() {
            self.hydration = other.hydration;
        }

        if other.legacy.is_some() {
            self.legacy = other.legacy;
        }

        if other.object_store.is_some() {
            self.object_store = other.object_store;
        }

        for (model, row) in other.pricing {
            self.pricing.insert(model, row);
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Agent settings, falling back to defaults.
    pub fn agent(&self) -> AgentSection {
        self.agent.clone().unwrap_or_default()
    }

    /// Hydration settings, falling back to defaults.
    pub fn hydration(&self) -> HydrationSection {
        self.hydration.clone().unwrap_or_default()
    }

    /// Legacy agent settings, falling back to defaults.
    pub fn legacy(&self) -> LegacySection {
        self.legacy.clone().unwrap_or_default()
    }

    /// Object store settings, falling back to defaults.
    pub fn object_store(&self) -> ObjectStoreSection {
        self.object_store.clone().unwrap_or_default()
    }

    fn validate(&self) -> crate::Result<()> {
        if let Some(ref agent) = self.agent {
            for (field, value) in [
                ("agent.default_max_steps", agent.default_max_steps),
                ("agent.deep_research_max_steps", agent.deep_research_max_steps),
                ("agent.sharepoint_v2_max_steps", agent.sharepoint_v2_max_steps),
            ] {
                if value == 0 {
                    return Err(ConfigError::invalid(field, "must be at least 1"));
                }
            }
        }

        if let Some(ref hydration) = self.hydration
            && hydration.token_threshold == 0
        {
            return Err(ConfigError::invalid(
                "hydration.token_threshold",
                "must be greater than 0",
            ));
        }

        if let Some(ref store) = self.object_store
            && store.base_url.as_deref().is_some_and(|url| url.trim().is_empty())
        {
            return Err(ConfigError::invalid(
                "object_store.base_url",
                "cannot be empty",
            ));
        }

        for (model, row) in &self.pricing {
            if row.input_per_million < 0.0 || row.output_per_million < 0.0 {
                return Err(ConfigError::invalid(
                    format!("pricing.{}", model),
                    "prices cannot be negative",
                ));
            }
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent Section
// ─────────────────────────────────────────────────────────────────────────────

/// Completion model and step budgets.
///
/// ```toml
/// [agent]
/// model = "claude-sonnet-4"
/// default_max_steps = 6
///
/// [agent.models]
/// "sharepoint-agent-v2" = "eu.anthropic.claude-sonnet-4-20250514-v1:0"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Default completion model.
    pub model: String,
    /// Maximum tokens per completion call.
    pub max_tokens: u32,
    /// Hop budget for ordinary tool-calling agents.
    pub default_max_steps: u32,
    /// Hop budget in deep-research mode.
    pub deep_research_max_steps: u32,
    /// Hop budget for the SharePoint v2 agent.
    pub sharepoint_v2_max_steps: u32,
    /// Model overrides keyed by agent id (`web-agent`, `csv-agent-v2`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub models: BTreeMap<String, String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4".to_string(),
            max_tokens: 4096,
            default_max_steps: 6,
            deep_research_max_steps: 2,
            sharepoint_v2_max_steps: 5,
            models: BTreeMap::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hydration Section
// ─────────────────────────────────────────────────────────────────────────────

/// Selected-file hydration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HydrationSection {
    /// Estimated token count at or above which files are not inlined.
    pub token_threshold: usize,
}

impl Default for HydrationSection {
    fn default() -> Self {
        Self {
            token_threshold: 150_000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Legacy Section
// ─────────────────────────────────────────────────────────────────────────────

/// Legacy external agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacySection {
    /// HTTP endpoint of the legacy agent. Unset disables the HTTP client.
    pub endpoint: Option<String>,
    /// Model identifier reported for cost and persistence.
    pub model: String,
    /// Additional attempts after the first cold-start failure.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay_ms: u64,
    /// Request timeout.
    pub timeout_secs: u64,
}

impl Default for LegacySection {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: "gemini-2.5-flash".to_string(),
            max_retries: 2,
            retry_delay_ms: 1000,
            timeout_secs: 120,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Object Store Section
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP gateway serving `s3://bucket/key` as `{base_url}/bucket/key`.
///
/// Without a `base_url`, selected files fall back to their stored excerpts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreSection {
    pub base_url: Option<String>,
    /// Request timeout.
    pub timeout_secs: u64,
}

impl Default for ObjectStoreSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 30,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pricing
// ─────────────────────────────────────────────────────────────────────────────

/// USD prices per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Log file settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Directory for the rolling JSON log. Defaults to `<config dir>/logs`.
    pub dir: Option<PathBuf>,
    /// `EnvFilter` directive for the file layer.
    pub file_filter: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config = SwitchboardConfig::new();
        assert!(config.agent.is_none());
        assert!(config.pricing.is_empty());
        assert_eq!(config.agent().default_max_steps, 6);
        assert_eq!(config.agent().deep_research_max_steps, 2);
        assert_eq!(config.agent().sharepoint_v2_max_steps, 5);
        assert_eq!(config.hydration().token_threshold, 150_000);
        assert_eq!(config.legacy().max_retries, 2);
        assert!(config.object_store().base_url.is_none());
    }

    #[test]
    fn test_parse_full() {
        let toml = r#"
[agent]
model = "claude-sonnet-4"
default_max_steps = 8

[agent.models]
"web-agent" = "gpt-4o"

[hydration]
token_threshold = 1000

[legacy]
endpoint = "http://localhost:9000/invoke"
retry_delay_ms = 10

[object_store]
base_url = "http://localhost:9100"

[pricing."my-model"]
input_per_million = 1.0
output_per_million = 2.0

[logging]
dir = "/tmp/switchboard-logs"
"#;
        let config = SwitchboardConfig::from_toml(toml).unwrap();
        let agent = config.agent();
        assert_eq!(agent.default_max_steps, 8);
        // Unset fields in a present section keep their defaults
        assert_eq!(agent.deep_research_max_steps, 2);
        assert_eq!(agent.models["web-agent"], "gpt-4o");
        assert_eq!(config.hydration().token_threshold, 1000);
        assert_eq!(config.legacy().retry_delay_ms, 10);
        assert_eq!(config.legacy().model, "gemini-2.5-flash");
        assert_eq!(
            config.object_store().base_url.as_deref(),
            Some("http://localhost:9100")
        );
        assert_eq!(config.object_store().timeout_secs, 30);
        assert_eq!(config.pricing["my-model"].output_per_million, 2.0);
        assert_eq!(
            config.logging.unwrap().dir,
            Some(PathBuf::from("/tmp/switchboard-logs"))
        );
    }

    #[test]
    fn test_rejects_zero_budget() {
        let err = SwitchboardConfig::from_toml("[agent]\ndeep_research_max_steps = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "agent.deep_research_max_steps"));
    }

    #[test]
    fn test_rejects_blank_object_store_url() {
        let err = SwitchboardConfig::from_toml("[object_store]\nbase_url = \" \"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "object_store.base_url"));
    }

    #[test]
    fn test_rejects_negative_price() {
        let toml = r#"
[pricing.cheap]
input_per_million = -1.0
output_per_million = 0.0
"#;
        assert!(SwitchboardConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_merge_override() {
        let mut base = SwitchboardConfig::from_toml(
            r#"
[agent]
model = "base-model"

[pricing.a]
input_per_million = 1.0
output_per_million = 1.0
"#,
        )
        .unwrap();

        let overlay = SwitchboardConfig::from_toml(
            r#"
[agent]
model = "project-model"

[pricing.b]
input_per_million = 2.0
output_per_million = 2.0
"#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.agent().model, "project-model");
        assert_eq!(base.pricing.len(), 2);
    }

    #[test]
    fn test_merge_keeps_base_when_overlay_empty() {
        let mut base = SwitchboardConfig::from_toml("[hydration]\ntoken_threshold = 42\n").unwrap();
        base.merge(SwitchboardConfig::new());
        assert_eq!(base.hydration().token_threshold, 42);
    }

    #[test]
    fn test_toml_roundtrip_preserves_sections() {
        let mut config = SwitchboardConfig::new();
        config.agent = Some(AgentSection::default());
        let text = config.to_toml().unwrap();
        assert!(text.contains("[agent]"));
        assert_eq!(SwitchboardConfig::from_toml(&text).unwrap(), config);
    }
}
