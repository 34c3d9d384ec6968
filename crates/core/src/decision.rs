//! Routing requests and decisions.

use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handle for a provisional budget debit, reconciled after the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ReservationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One inbound chat request, as seen by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub identity: Identity,
    /// Pre-computed task complexity in `[0, 1]`.
    pub complexity: f64,
    /// Estimated prompt size in tokens.
    pub estimated_input_tokens: u32,
    /// Caller-requested output cap; clamped to the capability record.
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    /// Explicit model pick, honoured only with `can_override_model`.
    #[serde(default)]
    pub requested_model: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl RouteRequest {
    pub fn new(identity: Identity, complexity: f64, estimated_input_tokens: u32) -> Self {
        Self {
            identity,
            complexity,
            estimated_input_tokens,
            max_output_tokens: None,
            requested_model: None,
            stream: false,
        }
    }

    pub fn with_max_output(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.requested_model = Some(model.into());
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Complexity clamped into `[0, 1]`; NaN is treated as 0.
    pub fn normalized_complexity(&self) -> f64 {
        if self.complexity.is_nan() {
            0.0
        } else {
            self.complexity.clamp(0.0, 1.0)
        }
    }
}

/// The admission verdict for one request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub reservation_id: ReservationId,
    pub identity: Identity,
    pub provider: String,
    /// Full model id as listed in the tier (`provider/model`).
    pub model: String,
    pub tier: String,
    pub tier_ordinal: u32,
    /// Reserved amount in USD, including the safety margin.
    pub cost_estimate: f64,
    pub escalated: bool,
    pub budget_constrained: bool,
    pub used_fallback: bool,
    pub streaming: bool,
    pub max_context_tokens: u32,
    pub max_output_tokens: u32,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

/// Split `provider/model` into its provider prefix and the remainder.
///
/// Models without a prefix are attributed to the `default` provider.
pub fn split_model(model: &str) -> (&str, &str) {
    match model.split_once('/') {
        Some((provider, rest)) if !provider.is_empty() => (provider, rest),
        _ => ("default", model),
    }
}
