use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Token and cost totals for one agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    fn add(&mut self, input: u64, output: u64, cost: f64) {
        self.input_tokens += input;
        self.output_tokens += output;
        self.cost_usd += cost;
    }
}

/// Running token totals for a session, overall and per agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenTracker {
    total: TokenUsage,
    per_agent: BTreeMap<String, TokenUsage>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_for_agent(&mut self, agent: &str, input: u64, output: u64, cost: f64) {
        self.total.add(input, output, cost);
        self.per_agent
            .entry(agent.to_string())
            .or_default()
            .add(input, output, cost);
    }

    pub fn total(&self) -> TokenUsage {
        self.total
    }

    pub fn for_agent(&self, agent: &str) -> TokenUsage {
        self.per_agent.get(agent).copied().unwrap_or_default()
    }
}
