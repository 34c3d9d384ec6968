//! Model tiers: named buckets of interchangeable models.
//!
//! A tier's ordinal defines both ordering and escalation distance: lower
//! ordinals are cheaper and simpler. Complexity ranges may overlap.

use serde::{Deserialize, Serialize};

/// Inclusive complexity interval `[min, max]` within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexityRange {
    pub min: f64,
    pub max: f64,
}

impl ComplexityRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, complexity: f64) -> bool {
        complexity >= self.min && complexity <= self.max
    }

    /// Distance from `complexity` to the nearest edge (0 when inside).
    pub fn distance(&self, complexity: f64) -> f64 {
        if complexity < self.min {
            self.min - complexity
        } else if complexity > self.max {
            complexity - self.max
        } else {
            0.0
        }
    }
}

/// A named bucket of models at similar cost and capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTier {
    pub name: String,
    pub ordinal: u32,
    /// Member models in preference order (`provider/model`).
    pub models: Vec<String>,
    pub complexity_range: ComplexityRange,
    /// Blended USD price per 1K tokens.
    pub cost_per_1k_tokens: f64,
    pub max_context_tokens: u32,
}

impl ModelTier {
    pub fn contains_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

/// Tiers ordered by ordinal, ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierSet {
    tiers: Vec<ModelTier>,
}

impl TierSet {
    /// Build a set, sorting by ordinal. Uniqueness is a config-layer concern.
    pub fn new(mut tiers: Vec<ModelTier>) -> Self {
        tiers.sort_by_key(|t| t.ordinal);
        Self { tiers }
    }

    pub fn get(&self, name: &str) -> Option<&ModelTier> {
        self.tiers.iter().find(|t| t.name == name)
    }

    pub fn ordinal_of(&self, name: &str) -> Option<u32> {
        self.get(name).map(|t| t.ordinal)
    }

    /// The lowest-ordinal tier listing `model` as a member.
    pub fn tier_of_model(&self, model: &str) -> Option<&ModelTier> {
        self.tiers.iter().find(|t| t.contains_model(model))
    }

    /// Tiers with ordinal `<= ceiling`, ascending.
    pub fn up_to(&self, ceiling: u32) -> impl DoubleEndedIterator<Item = &ModelTier> {
        self.tiers.iter().filter(move |t| t.ordinal <= ceiling)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ModelTier> {
        self.tiers.iter()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(name: &str, ordinal: u32, models: &[&str]) -> ModelTier {
        ModelTier {
            name: name.into(),
            ordinal,
            models: models.iter().map(|m| m.to_string()).collect(),
            complexity_range: ComplexityRange::new(0.0, 1.0),
            cost_per_1k_tokens: 0.0,
            max_context_tokens: 8192,
        }
    }

    #[test]
    fn tiers_sorted_by_ordinal() {
        let set = TierSet::new(vec![
            tier("elite", 3, &[]),
            tier("free", 0, &[]),
            tier("standard", 1, &[]),
        ]);
        let names: Vec<_> = set.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["free", "standard", "elite"]);
    }

    #[test]
    fn lookup_by_name_and_model() {
        let set = TierSet::new(vec![
            tier("free", 0, &["groq/llama-3.1-8b"]),
            tier("premium", 2, &["anthropic/claude-sonnet-4"]),
        ]);
        assert_eq!(set.ordinal_of("premium"), Some(2));
        assert_eq!(set.ordinal_of("missing"), None);
        assert_eq!(set.tier_of_model("groq/llama-3.1-8b").unwrap().name, "free");
        assert!(set.tier_of_model("openai/gpt-4o").is_none());
    }

    #[test]
    fn up_to_respects_ceiling() {
        let set = TierSet::new((0..4).map(|i| tier(&format!("t{i}"), i, &[])).collect());
        assert_eq!(set.up_to(1).count(), 2);
        assert_eq!(set.up_to(1).next_back().unwrap().ordinal, 1);
    }

    #[test]
    fn range_distance() {
        let r = ComplexityRange::new(0.3, 0.7);
        assert!(r.contains(0.3) && r.contains(0.7));
        assert!((r.distance(0.9) - 0.2).abs() < 1e-10);
        assert!((r.distance(0.1) - 0.2).abs() < 1e-10);
        assert_eq!(r.distance(0.5), 0.0);
    }
}
