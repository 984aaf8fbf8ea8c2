//! Replay command - run one scripted turn through the router.
//!
//! The completion service is replaced by a scripted backend and every
//! whitelisted tool by a stub that echoes its arguments, so a turn can be
//! reproduced offline from two JSON files.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use console::Style;
use futures::StreamExt;
use switchboard_agent::{
    AgentEvent, AgentRequest, AgentRouter, CancellationToken, FileMessageStore,
    InMemoryMessageStore, MessageStore, StubTool, ToolRegistry, resolve_with_budgets,
};
use switchboard_llm::{MockBackend, MockResponse};

use super::Context;

/// Arguments for the replay command.
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// JSON file holding the agent request
    #[arg(long)]
    pub request: PathBuf,

    /// JSON file holding the scripted completion responses
    #[arg(long)]
    pub script: PathBuf,

    /// Persist the message as JSON under this directory instead of in memory
    #[arg(long)]
    pub store: Option<PathBuf>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Run the replay command.
pub async fn run(args: ReplayArgs, ctx: &Context) -> Result<()> {
    let config = super::load(ctx)?;
    let request: AgentRequest = read_json(&args.request)?;
    let script: Vec<MockResponse> = read_json(&args.script)?;

    let router_config = super::router_config(&config);
    let resolution =
        resolve_with_budgets(&request.model_id, request.toggles, router_config.budgets);

    let mut tools = ToolRegistry::new();
    for name in resolution.whitelist.iter() {
        tools.register(StubTool::new(name));
    }

    let memory = Arc::new(InMemoryMessageStore::new());
    let store: Arc<dyn MessageStore> = match args.store {
        Some(ref dir) => Arc::new(FileMessageStore::new(dir)),
        None => memory.clone(),
    };

    let mut router = AgentRouter::new(Arc::new(MockBackend::scripted(script)), tools, store)
        .with_config(router_config)
        .with_pricing(super::pricing_table(&config));
    if let Some(agent) = super::legacy_agent(&config)? {
        router = router.with_legacy_agent(agent);
    }
    if let Some(objects) = super::object_store(&config)? {
        router = router.with_object_store(objects);
    }

    tracing::debug!(
        agent = %resolution.agent_type,
        tools = ?resolution.whitelist.names(),
        "Replaying turn"
    );

    let cancellation = CancellationToken::new();
    let on_interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut stream = router.handle(request, cancellation);
    let mut saved = None;
    let mut failed = false;
    let mut printer = EventPrinter::default();

    while let Some(event) = stream.next().await {
        match event {
            AgentEvent::MessageSaved { id } => saved = Some(id),
            AgentEvent::Error { .. } => failed = true,
            _ => {}
        }
        if ctx.json_output {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            printer.print(&event, ctx.verbose)?;
        }
    }

    if let Some(id) = saved {
        match args.store {
            Some(ref dir) => {
                let path = FileMessageStore::new(dir).path_for(&id);
                if !ctx.json_output {
                    println!("Saved: {}", path.display());
                }
            }
            None => {
                if let Some(message) = memory.get(&id) {
                    println!("{}", serde_json::to_string_pretty(&message)?);
                }
            }
        }
    }

    if failed {
        anyhow::bail!("Turn failed");
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Human-readable output
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct EventPrinter {
    mid_line: bool,
}

impl EventPrinter {
    fn break_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }

    fn print(&mut self, event: &AgentEvent, verbose: bool) -> Result<()> {
        let dim = Style::new().dim();

        match event {
            AgentEvent::TextDelta { text } => {
                print!("{}", text);
                std::io::stdout().flush()?;
                self.mid_line = !text.ends_with('\n');
            }
            AgentEvent::ToolCall { tool_name, args, .. } => {
                self.break_line();
                if verbose {
                    println!("{}", dim.apply_to(format!("[Running: {} {}]", tool_name, args)));
                } else {
                    println!("{}", dim.apply_to(format!("[Running: {}]", tool_name)));
                }
            }
            AgentEvent::ToolResult { is_error, .. } => {
                let status = if *is_error { "failed" } else { "done" };
                println!("{}", dim.apply_to(format!("[{}]", status)));
            }
            AgentEvent::ResearchUpdate { update } => {
                self.break_line();
                let title = update.title.as_deref().unwrap_or(&update.id);
                println!(
                    "{}",
                    dim.apply_to(format!("[research {:?}: {}]", update.status, title))
                );
            }
            AgentEvent::Status { status } if verbose => {
                self.break_line();
                println!("{}", dim.apply_to(format!("({})", status)));
            }
            AgentEvent::CostUpdate {
                model_id,
                input_tokens,
                output_tokens,
                cost,
                ..
            } => {
                self.break_line();
                println!(
                    "{}",
                    dim.apply_to(format!(
                        "[{}: {} in / {} out, ${:.6}]",
                        model_id, input_tokens, output_tokens, cost
                    ))
                );
            }
            AgentEvent::Error { message } => {
                self.break_line();
                let red = Style::new().red();
                eprintln!("{} {}", red.apply_to("Error:"), message);
            }
            AgentEvent::Finish { .. } => self.break_line(),
            _ => {}
        }
        Ok(())
    }
}
