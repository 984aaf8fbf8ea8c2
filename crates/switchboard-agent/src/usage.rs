//! Per-request token ledger and cost lookup.
//!
//! A [`UsageLedger`] is created by the router for each turn and owned by that
//! turn's task. Nothing here is process-wide.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use switchboard_llm::Usage;

// ─────────────────────────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────────────────────────

/// Where a batch of tokens was spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    /// Chat title generation, before the agent starts.
    Title,
    /// The main completion calls of the step loop.
    Main,
    /// The legacy external agent.
    External,
    /// Outside providers called by tools, e.g. web search.
    WebSearch,
}

/// Accumulates token usage across every sub-call of one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageLedger {
    by_source: BTreeMap<UsageSource, Usage>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add tokens under `source`.
    pub fn record(&mut self, source: UsageSource, input_tokens: u64, output_tokens: u64) {
        *self.by_source.entry(source).or_default() += Usage::new(input_tokens, output_tokens);
        tracing::trace!(?source, input_tokens, output_tokens, "Usage recorded");
    }

    /// Add a [`Usage`] under `source`.
    pub fn record_usage(&mut self, source: UsageSource, usage: Usage) {
        self.record(source, usage.input_tokens, usage.output_tokens);
    }

    /// Sum over all sources.
    pub fn totals(&self) -> Usage {
        self.by_source
            .values()
            .fold(Usage::default(), |acc, usage| acc + *usage)
    }

    /// Usage recorded under one source.
    pub fn by_source(&self, source: UsageSource) -> Usage {
        self.by_source.get(&source).copied().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pricing
// ─────────────────────────────────────────────────────────────────────────────

/// USD prices per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Price {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

const BUILTIN_PRICES: &[(&str, Price)] = &[
    ("claude-sonnet-4", Price::new(3.0, 15.0)),
    ("claude-3-5-haiku", Price::new(0.8, 4.0)),
    ("gemini-2.5-flash", Price::new(0.30, 2.50)),
    ("gemini-2.5-pro", Price::new(1.25, 10.0)),
    ("gpt-4o", Price::new(2.5, 10.0)),
    ("gpt-4o-mini", Price::new(0.15, 0.60)),
];

/// Model id to price lookup.
///
/// Lookup is exact first, then the longest table key contained in the id,
/// so `eu.anthropic.claude-sonnet-4-20250514-v1:0` prices as `claude-sonnet-4`.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    prices: BTreeMap<String, Price>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            prices: BUILTIN_PRICES
                .iter()
                .map(|(model, price)| (model.to_string(), *price))
                .collect(),
        }
    }
}

impl PricingTable {
    /// The built-in table.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty table.
    pub fn empty() -> Self {
        Self {
            prices: BTreeMap::new(),
        }
    }

    /// Add or replace a row.
    pub fn with_price(mut self, model: impl Into<String>, price: Price) -> Self {
        self.prices.insert(model.into(), price);
        self
    }

    /// Find the price row for a model id.
    pub fn lookup(&self, model_id: &str) -> Option<Price> {
        if let Some(price) = self.prices.get(model_id) {
            return Some(*price);
        }
        self.prices
            .iter()
            .filter(|(key, _)| model_id.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, price)| *price)
    }

    /// Cost in USD. Unknown models cost zero and log a warning.
    pub fn cost(&self, model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match self.lookup(model_id) {
            Some(price) => {
                (input_tokens as f64 * price.input_per_million
                    + output_tokens as f64 * price.output_per_million)
                    / 1_000_000.0
            }
            None => {
                tracing::warn!(model = %model_id, "No price for model, reporting zero cost");
                0.0
            }
        }
    }

    /// Cost of a [`Usage`].
    pub fn cost_of(&self, model_id: &str, usage: Usage) -> f64 {
        self.cost(model_id, usage.input_tokens, usage.output_tokens)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_totals_sum_every_record() {
        let mut ledger = UsageLedger::new();
        ledger.record(UsageSource::Title, 50, 10);
        ledger.record(UsageSource::Main, 200, 150);
        assert_eq!(ledger.totals(), Usage::new(250, 160));
    }

    #[test]
    fn test_records_accumulate_per_source() {
        let mut ledger = UsageLedger::new();
        ledger.record(UsageSource::Main, 10, 1);
        ledger.record(UsageSource::Main, 5, 2);
        ledger.record_usage(UsageSource::WebSearch, Usage::new(100, 0));
        assert_eq!(ledger.by_source(UsageSource::Main), Usage::new(15, 3));
        assert_eq!(ledger.by_source(UsageSource::External), Usage::default());
        assert_eq!(ledger.totals(), Usage::new(115, 3));
    }

    #[test]
    fn test_empty_ledger() {
        assert!(UsageLedger::new().totals().is_zero());
    }

    #[test]
    fn test_cost_exact_match() {
        let table = PricingTable::new();
        assert!(approx(table.cost("gpt-4o", 1_000_000, 1_000_000), 12.5));
        assert!(approx(table.cost("gpt-4o-mini", 1_000_000, 0), 0.15));
    }

    #[test]
    fn test_cost_longest_contained_key() {
        let table = PricingTable::new();
        let price = table.lookup("eu.anthropic.claude-sonnet-4-20250514-v1:0").unwrap();
        assert_eq!(price, Price::new(3.0, 15.0));
        // gpt-4o-mini contains gpt-4o; the longer key wins
        assert_eq!(table.lookup("openai/gpt-4o-mini-2024").unwrap(), Price::new(0.15, 0.60));
    }

    #[test]
    fn test_unknown_model_costs_zero() {
        let table = PricingTable::new();
        assert_eq!(table.lookup("mystery-model"), None);
        assert_eq!(table.cost("mystery-model", 1000, 1000), 0.0);
    }

    #[test]
    fn test_override_row() {
        let table = PricingTable::new().with_price("gpt-4o", Price::new(1.0, 1.0));
        assert!(approx(table.cost_of("gpt-4o", Usage::new(500_000, 500_000)), 1.0));
        assert!(PricingTable::empty().lookup("gpt-4o").is_none());
    }
}
