//! CLI command handlers.

pub mod config;
pub mod cost;
pub mod replay;
pub mod resolve;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use switchboard_agent::{
    HttpLegacyAgent, HttpObjectStore, HydrationConfig, LegacyAgent, ObjectStore, Price,
    PricingTable, RetryPolicy, RouterConfig, StepBudgets,
};
use switchboard_config::SwitchboardConfig;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

/// Load the layered config, printing any warnings in verbose mode.
pub fn load(ctx: &Context) -> Result<SwitchboardConfig> {
    let loaded = switchboard_config::load_config(None).context("Failed to load configuration")?;
    if ctx.verbose {
        for warning in &loaded.warnings {
            eprintln!("⚠ {}", warning);
        }
    }
    Ok(loaded.config)
}

/// Step budgets from the `[agent]` section.
pub fn step_budgets(config: &SwitchboardConfig) -> StepBudgets {
    let agent = config.agent();
    StepBudgets {
        default_steps: agent.default_max_steps,
        deep_research_steps: agent.deep_research_max_steps,
        sharepoint_v2_steps: agent.sharepoint_v2_max_steps,
    }
}

/// Router settings from the config file.
pub fn router_config(config: &SwitchboardConfig) -> RouterConfig {
    let agent = config.agent();
    let legacy = config.legacy();
    RouterConfig {
        model: agent.model.clone(),
        max_tokens: agent.max_tokens,
        budgets: step_budgets(config),
        agent_models: agent.models,
        hydration: HydrationConfig {
            token_threshold: config.hydration().token_threshold,
        },
        legacy_model: legacy.model,
        retry: RetryPolicy {
            max_retries: legacy.max_retries,
            delay: Duration::from_millis(legacy.retry_delay_ms),
        },
    }
}

/// Built-in prices with the `[pricing]` rows layered on top.
pub fn pricing_table(config: &SwitchboardConfig) -> PricingTable {
    config
        .pricing
        .iter()
        .fold(PricingTable::default(), |table, (model, row)| {
            table.with_price(
                model.clone(),
                Price::new(row.input_per_million, row.output_per_million),
            )
        })
}

/// HTTP legacy agent, when `[legacy] endpoint` is set.
pub fn legacy_agent(config: &SwitchboardConfig) -> Result<Option<Arc<dyn LegacyAgent>>> {
    let legacy = config.legacy();
    let Some(endpoint) = legacy.endpoint else {
        return Ok(None);
    };
    let agent = HttpLegacyAgent::new(
        endpoint,
        legacy.model,
        Duration::from_secs(legacy.timeout_secs),
    )
    .context("Failed to create legacy agent client")?;
    Ok(Some(Arc::new(agent)))
}

/// HTTP object store, when `[object_store] base_url` is set.
pub fn object_store(config: &SwitchboardConfig) -> Result<Option<Arc<dyn ObjectStore>>> {
    let section = config.object_store();
    let Some(base_url) = section.base_url else {
        return Ok(None);
    };
    let store = HttpObjectStore::new(base_url, Duration::from_secs(section.timeout_secs))
        .context("Failed to create object store client")?;
    Ok(Some(Arc::new(store)))
}
