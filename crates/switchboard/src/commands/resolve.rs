//! Resolve command - show how a request would be routed.

use anyhow::Result;
use clap::Args;
use console::Style;
use switchboard_agent::{CapabilityToggles, SystemPromptBuilder, resolve_with_budgets};

use super::Context;

/// Arguments for the resolve command.
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Model identifier chosen by the user (e.g. web-agent)
    pub model: String,

    /// Turn on web search
    #[arg(long)]
    pub web_search: bool,

    /// Turn on deep research
    #[arg(long)]
    pub deep_research: bool,

    /// Turn on image generation
    #[arg(long)]
    pub image_generation: bool,

    /// Turn on file search
    #[arg(long)]
    pub file_search: bool,

    /// Also print the constrained system prompt
    #[arg(long)]
    pub prompt: bool,
}

impl ResolveArgs {
    fn toggles(&self) -> CapabilityToggles {
        CapabilityToggles {
            web_search: self.web_search,
            deep_research: self.deep_research,
            image_generation: self.image_generation,
            file_search: self.file_search,
        }
    }
}

/// Run the resolve command.
pub async fn run(args: ResolveArgs, ctx: &Context) -> Result<()> {
    let config = super::load(ctx)?;
    let resolution = resolve_with_budgets(&args.model, args.toggles(), super::step_budgets(&config));
    let model = super::router_config(&config)
        .model_for(resolution.agent_type)
        .to_string();

    let prompt = args.prompt.then(|| {
        SystemPromptBuilder::new(
            resolution.agent_type,
            resolution.toggles,
            resolution.whitelist.clone(),
        )
        .build()
    });

    if ctx.json_output {
        let mut output = serde_json::to_value(&resolution)?;
        output["model"] = serde_json::Value::String(model);
        if let Some(prompt) = prompt {
            output["prompt"] = serde_json::Value::String(prompt);
        }
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let bold = Style::new().bold();
    let dim = Style::new().dim();

    println!("{} {}", bold.apply_to("Agent:"), resolution.agent_type);
    println!("{} {}", bold.apply_to("Model:"), model);
    println!("{} {}", bold.apply_to("Max steps:"), resolution.max_steps);
    match resolution.temperature {
        Some(t) => println!("{} {}", bold.apply_to("Temperature:"), t),
        None => println!("{} {}", bold.apply_to("Temperature:"), dim.apply_to("default")),
    }

    let toggles = resolution.toggles;
    println!("{}", bold.apply_to("Capabilities:"));
    for (label, on) in [
        ("web search", toggles.web_search),
        ("deep research", toggles.deep_research),
        ("image generation", toggles.image_generation),
        ("file search", toggles.file_search),
    ] {
        let mark = if on { "✓" } else { "·" };
        println!("  {} {}", mark, label);
    }

    if resolution.whitelist.is_empty() {
        println!("{} {}", bold.apply_to("Tools:"), dim.apply_to("(none)"));
    } else {
        println!("{}", bold.apply_to("Tools:"));
        for name in resolution.whitelist.iter() {
            println!("  {}", name);
        }
    }

    if let Some(prompt) = prompt {
        println!("\n---\n{}", prompt);
    }

    Ok(())
}
