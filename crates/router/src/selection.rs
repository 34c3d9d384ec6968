//! Model selection within a tier.

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tollgate_config::SelectionStrategy;
use tollgate_core::pattern::model_permitted;
use tollgate_core::{CapabilityRecord, ModelTier, TierSet};
use tollgate_telemetry::PricingTable;

/// Picks one model from a tier's permitted members.
#[derive(Debug)]
pub struct ModelSelector {
    strategy: SelectionStrategy,
    /// Round-robin cursor per tier name
    cursors: HashMap<String, AtomicUsize>,
}

impl ModelSelector {
    pub fn new(strategy: SelectionStrategy, tiers: &TierSet) -> Self {
        let cursors = tiers
            .iter()
            .map(|t| (t.name.clone(), AtomicUsize::new(0)))
            .collect();
        Self { strategy, cursors }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Tier members the caller may use, in preference order.
    pub fn permitted<'a>(tier: &'a ModelTier, caps: &CapabilityRecord) -> Vec<&'a str> {
        tier.models
            .iter()
            .map(String::as_str)
            .filter(|m| model_permitted(&caps.model_allow, &caps.model_deny, m))
            .collect()
    }

    /// Apply the strategy. `None` only when `models` is empty.
    pub fn select<'a>(&self, tier: &ModelTier, models: &[&'a str], pricing: &PricingTable) -> Option<&'a str> {
        if models.is_empty() {
            return None;
        }
        let pick = match self.strategy {
            SelectionStrategy::PreferenceOrder => 0,
            SelectionStrategy::RoundRobin => {
                let cursor = self
                    .cursors
                    .get(&tier.name)
                    .map(|c| c.fetch_add(1, Ordering::Relaxed))
                    .unwrap_or(0);
                cursor % models.len()
            }
            SelectionStrategy::LowestCost => {
                let price = |m: &str| {
                    pricing
                        .get(m)
                        .map(|p| p.average_per_1k())
                        .unwrap_or(tier.cost_per_1k_tokens)
                };
                // min_by keeps the first of equal elements, so preference breaks ties.
                models
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| price(a).total_cmp(&price(b)))
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            }
            SelectionStrategy::Random => rand::rng().random_range(0..models.len()),
        };
        models.get(pick).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::{ComplexityRange, PermissionLevel};
    use tollgate_telemetry::ModelPricing;

    fn tier() -> ModelTier {
        ModelTier {
            name: "premium".into(),
            ordinal: 2,
            models: vec!["a/one".into(), "b/two".into(), "c/three".into()],
            complexity_range: ComplexityRange::new(0.3, 1.0),
            cost_per_1k_tokens: 0.01,
            max_context_tokens: 128_000,
        }
    }

    fn selector(strategy: SelectionStrategy) -> ModelSelector {
        ModelSelector::new(strategy, &TierSet::new(vec![tier()]))
    }

    #[test]
    fn permitted_applies_deny_first() {
        let mut caps = CapabilityRecord::builtin(PermissionLevel::Standard);
        caps.model_deny = vec!["b/*".into()];
        assert_eq!(ModelSelector::permitted(&tier(), &caps), vec!["a/one", "c/three"]);
        caps.model_allow = vec![];
        assert!(ModelSelector::permitted(&tier(), &caps).is_empty());
    }

    #[test]
    fn preference_order_takes_first() {
        let s = selector(SelectionStrategy::PreferenceOrder);
        let models = ["b/two", "c/three"];
        assert_eq!(s.select(&tier(), &models, &PricingTable::empty()), Some("b/two"));
        assert_eq!(s.select(&tier(), &[], &PricingTable::empty()), None);
    }

    #[test]
    fn round_robin_rotates() {
        let s = selector(SelectionStrategy::RoundRobin);
        let models = ["a/one", "b/two", "c/three"];
        let picks: Vec<_> = (0..4)
            .map(|_| s.select(&tier(), &models, &PricingTable::empty()).unwrap())
            .collect();
        assert_eq!(picks, vec!["a/one", "b/two", "c/three", "a/one"]);
    }

    #[test]
    fn lowest_cost_uses_pricing_and_preference_for_ties() {
        let s = selector(SelectionStrategy::LowestCost);
        let pricing = PricingTable::empty();
        pricing.set("a/one", ModelPricing::new(0.01, 0.03));
        pricing.set("b/two", ModelPricing::new(0.001, 0.002));
        pricing.set("c/three", ModelPricing::new(0.001, 0.002));
        let models = ["a/one", "b/two", "c/three"];
        assert_eq!(s.select(&tier(), &models, &pricing), Some("b/two"));
    }

    #[test]
    fn random_stays_within_set() {
        let s = selector(SelectionStrategy::Random);
        let models = ["a/one", "c/three"];
        for _ in 0..50 {
            let pick = s.select(&tier(), &models, &PricingTable::empty()).unwrap();
            assert!(models.contains(&pick));
        }
    }
}
