//! Switchboard - agent execution pipeline
//!
//! Main entry point for the Switchboard CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{config, cost, replay, resolve};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Switchboard - agent execution pipeline
#[derive(Parser)]
#[command(name = "switchboard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show how a model id and toggles resolve to an agent and its tools
    Resolve(resolve::ResolveArgs),

    /// Price a token count for a model
    Cost(cost::CostArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Run one scripted turn through the router
    Replay(replay::ReplayArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A broken config must not stop `config which` / `config path` from running.
    let loaded = switchboard_config::load_config(None).ok();
    let logging = loaded
        .as_ref()
        .and_then(|l| l.config.logging.clone())
        .unwrap_or_default();

    // Initialize tracing: console (human-readable) + rotating JSON file
    let filter = if cli.verbose {
        "switchboard=debug,switchboard_agent=debug,switchboard_llm=debug,switchboard_config=debug,info"
    } else {
        "switchboard=info,switchboard_agent=info,switchboard_llm=info,switchboard_config=info,warn"
    };
    let file_filter = logging.file_filter.unwrap_or_else(|| {
        "switchboard=trace,switchboard_agent=trace,switchboard_llm=trace,switchboard_config=trace,info"
            .to_string()
    });

    let log_dir = logging
        .dir
        .or_else(|| switchboard_config::xdg_config_dir().map(|d| d.join("logs")))
        .unwrap_or_else(|| std::path::PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "switchboard.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(file_filter)),
        )
        .init();

    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Resolve(args) => resolve::run(args, &ctx).await,
        Commands::Cost(args) => cost::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
        Commands::Replay(args) => replay::run(args, &ctx).await,
    }
}
