//! Cost command - price a token count.

use anyhow::Result;
use clap::Args;

use super::Context;

/// Arguments for the cost command.
#[derive(Args, Debug)]
pub struct CostArgs {
    /// Model identifier to price
    pub model: String,

    /// Input (prompt) tokens
    pub input_tokens: u64,

    /// Output (completion) tokens
    pub output_tokens: u64,
}

/// Run the cost command.
pub async fn run(args: CostArgs, ctx: &Context) -> Result<()> {
    let config = super::load(ctx)?;
    let table = super::pricing_table(&config);
    let price = table.lookup(&args.model);
    let cost = table.cost(&args.model, args.input_tokens, args.output_tokens);

    if ctx.json_output {
        let output = serde_json::json!({
            "model": args.model,
            "inputTokens": args.input_tokens,
            "outputTokens": args.output_tokens,
            "known": price.is_some(),
            "cost": cost,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match price {
        Some(price) => {
            println!(
                "{}: {} in @ ${}/M + {} out @ ${}/M",
                args.model,
                args.input_tokens,
                price.input_per_million,
                args.output_tokens,
                price.output_per_million
            );
            println!("Cost: ${:.6}", cost);
        }
        None => {
            println!("{}: no price row (cost counts as $0)", args.model);
        }
    }

    Ok(())
}
