//! Config command - configuration management.

use anyhow::Result;
use clap::{Args, Subcommand};

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show resolved configuration
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./switchboard.toml) instead of user config
        #[arg(long)]
        local: bool,
    },

    /// Show configuration file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx).await,
        ConfigCommand::Which => cmd_which(ctx).await,
        ConfigCommand::Init { local } => cmd_init(local).await,
        ConfigCommand::Path => cmd_path().await,
    }
}

async fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = switchboard_config::load_config(None)?;
    let config = &loaded.config;

    if ctx.json_output {
        let router = super::router_config(config);
        let sources: Vec<String> = loaded
            .loaded_from()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let output = serde_json::json!({
            "sources": sources,
            "model": router.model,
            "maxTokens": router.max_tokens,
            "budgets": router.budgets,
            "agentModels": router.agent_models,
            "tokenThreshold": router.hydration.token_threshold,
            "legacyModel": router.legacy_model,
            "objectStore": config.object_store().base_url,
            "warnings": loaded.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("# Switchboard Configuration\n");

    // Sources
    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("No config files loaded (using defaults)\n");
    } else {
        println!("Config files:");
        for source in &sources {
            println!("  {}", source.display());
        }
        println!();
    }

    // Agent
    let agent = config.agent();
    println!("Agent:");
    println!("  model: {}", agent.model);
    println!("  max_tokens: {}", agent.max_tokens);
    println!(
        "  steps: default {} / deep research {} / sharepoint v2 {}",
        agent.default_max_steps, agent.deep_research_max_steps, agent.sharepoint_v2_max_steps
    );
    for (agent_id, model) in &agent.models {
        println!("  {:<20} -> {}", agent_id, model);
    }
    println!();

    println!("Hydration:");
    println!("  token_threshold: {}", config.hydration().token_threshold);
    println!();

    let legacy = config.legacy();
    println!("Legacy agent:");
    match legacy.endpoint {
        Some(ref endpoint) => println!("  endpoint: {}", endpoint),
        None => println!("  endpoint: (not configured)"),
    }
    println!("  model: {}", legacy.model);
    println!(
        "  retries: {} x {}ms, timeout {}s",
        legacy.max_retries, legacy.retry_delay_ms, legacy.timeout_secs
    );
    println!();

    let objects = config.object_store();
    println!("Object store:");
    match objects.base_url {
        Some(ref url) => println!("  base_url: {} (timeout {}s)", url, objects.timeout_secs),
        None => println!("  base_url: (not configured)"),
    }
    println!();

    if !config.pricing.is_empty() {
        println!("Pricing overrides (USD per million tokens):");
        for (model, row) in &config.pricing {
            println!(
                "  {:<20} in {} / out {}",
                model, row.input_per_million, row.output_per_million
            );
        }
        println!();
    }

    // Warnings
    if !loaded.warnings.is_empty() {
        println!("Warnings:");
        for w in &loaded.warnings {
            println!("  ⚠ {}", w);
        }
        println!();
    }

    if ctx.verbose {
        println!("---\nRaw config:\n");
        if let Ok(toml_str) = config.to_toml() {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

async fn cmd_which(_ctx: &Context) -> Result<()> {
    let loaded = switchboard_config::load_config(None)?;

    println!("Config file search order (later overrides earlier):\n");

    for source in &loaded.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("  {} {}", status, source.path.display());
    }

    println!();
    let loaded_count = loaded.loaded_from().len();
    if loaded_count == 0 {
        println!("No config files found. Run 'switchboard config init' to create one.");
    } else {
        println!("{} config file(s) loaded.", loaded_count);
    }

    Ok(())
}

async fn cmd_init(local: bool) -> Result<()> {
    let path = if local {
        std::path::PathBuf::from("switchboard.toml")
    } else {
        let dir = switchboard_config::xdg_config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        std::fs::create_dir_all(&dir)?;
        dir.join("config.toml")
    };

    if path.exists() {
        println!("Config file already exists: {}", path.display());
        return Ok(());
    }

    let template = r#"# Switchboard Configuration

# Completion model and step budgets
[agent]
model = "claude-sonnet-4"
max_tokens = 4096
default_max_steps = 6
deep_research_max_steps = 2
sharepoint_v2_max_steps = 5

# Per-agent model overrides (uncomment to use)
# [agent.models]
# "sharepoint-agent-v2" = "eu.anthropic.claude-sonnet-4-20250514-v1:0"

# Selected files at or above this estimate go through the reason tool
[hydration]
token_threshold = 150000

# Legacy SharePoint agent (uncomment endpoint to enable)
[legacy]
# endpoint = "http://localhost:9000/invoke"
model = "gemini-2.5-flash"
max_retries = 2
retry_delay_ms = 1000
timeout_secs = 120

# Gateway serving s3:// selected files (uncomment to enable)
# [object_store]
# base_url = "http://localhost:9100"
# timeout_secs = 30

# Extra price rows, USD per million tokens
# [pricing."my-model"]
# input_per_million = 1.0
# output_per_million = 2.0

# [logging]
# dir = "/var/log/switchboard"
"#;

    std::fs::write(&path, template)?;
    println!("✓ Created config file: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  switchboard config show      # verify configuration");

    Ok(())
}

async fn cmd_path() -> Result<()> {
    if let Some(path) = switchboard_config::xdg_config_path() {
        println!("{}", path.display());
    } else {
        eprintln!("Could not determine config directory");
    }
    Ok(())
}
