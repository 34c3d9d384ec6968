//! Per-model pricing table.
//!
//! Prices are in USD per 1K tokens, split into input and output rates.
//! Config entries (`[pricing."provider/model"]`) override the built-ins.
//! Models missing from the table fall back to their tier's blended rate.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tollgate_config::ModelPriceConfig;

/// Per-1K-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// A single rate applied to both directions.
    pub fn blended(per_1k: f64) -> Self {
        Self::new(per_1k, per_1k)
    }

    /// Compute cost for the given token counts.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_1k + output_tokens as f64 * self.output_per_1k) / 1_000.0
    }

    /// Mean of input and output rates, used to rank models by price.
    pub fn average_per_1k(&self) -> f64 {
        (self.input_per_1k + self.output_per_1k) / 2.0
    }
}

/// Thread-safe pricing table with built-in defaults and custom overrides.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

impl std::fmt::Debug for PricingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricingTable").field("models", &self.len()).finish()
    }
}

impl PricingTable {
    /// Create a pricing table with built-in model prices.
    pub fn with_defaults() -> Self {
        let mut prices = HashMap::new();

        // ── Anthropic ──────────────────────────────────────────────
        prices.insert("anthropic/claude-opus-4".into(), ModelPricing::new(0.015, 0.075));
        prices.insert("anthropic/claude-sonnet-4".into(), ModelPricing::new(0.003, 0.015));
        prices.insert("anthropic/claude-3.5-haiku".into(), ModelPricing::new(0.0008, 0.004));

        // ── OpenAI ─────────────────────────────────────────────────
        prices.insert("openai/o1".into(), ModelPricing::new(0.015, 0.06));
        prices.insert("openai/gpt-4o".into(), ModelPricing::new(0.0025, 0.01));
        prices.insert("openai/gpt-4o-mini".into(), ModelPricing::new(0.00015, 0.0006));

        // ── Open weights ───────────────────────────────────────────
        prices.insert("groq/llama-3.1-8b".into(), ModelPricing::new(0.00005, 0.00008));
        prices.insert(
            "openrouter/meta-llama/llama-3.1-8b".into(),
            ModelPricing::new(0.000055, 0.000055),
        );

        Self {
            prices: RwLock::new(prices),
        }
    }

    /// Create an empty pricing table.
    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Built-ins overlaid with the `[pricing]` config section.
    pub fn from_config(overrides: &HashMap<String, ModelPriceConfig>) -> Self {
        let table = Self::with_defaults();
        for (model, price) in overrides {
            table.set(model.clone(), ModelPricing::new(price.input_per_1k, price.output_per_1k));
        }
        table
    }

    /// Add or update pricing for a model.
    pub fn set(&self, model: impl Into<String>, pricing: ModelPricing) {
        self.prices.write().insert(model.into(), pricing);
    }

    /// Look up pricing for a model.
    ///
    /// Tries the exact id first, then the longest known id whose model part
    /// prefixes the given one, so versioned ids like
    /// `openai/gpt-4o-mini-2024-07-18` still resolve.
    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        let prices = self.prices.read();
        if let Some(p) = prices.get(model) {
            return Some(*p);
        }

        let (provider, bare) = tollgate_core::decision::split_model(model);
        prices
            .iter()
            .filter(|(key, _)| {
                let (key_provider, key_bare) = tollgate_core::decision::split_model(key);
                key_provider == provider && bare.starts_with(key_bare)
            })
            .max_by_key(|(key, _)| key.len())
            .map(|(_, p)| *p)
    }

    /// Cost of a call, or `None` when the model is unpriced.
    pub fn cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> Option<f64> {
        self.get(model).map(|p| p.cost(input_tokens, output_tokens))
    }

    /// Cost of a call, falling back to a blended per-1K rate.
    pub fn cost_or_blended(&self, model: &str, input_tokens: u32, output_tokens: u32, blended_per_1k: f64) -> f64 {
        self.get(model)
            .unwrap_or_else(|| ModelPricing::blended(blended_per_1k))
            .cost(input_tokens, output_tokens)
    }

    /// List all known model names.
    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.prices.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.prices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}
