//! Tiered router: picks a tier and model for one request.
//!
//! The caller's `max_tier` caps the candidate tiers. Within that ceiling the
//! highest tier whose complexity range covers the request wins; escalation
//! may reach a bounded distance above the ceiling; otherwise the nearest
//! range is used. Each attempt reserves budget before it is admitted, and a
//! failed reservation falls through to cheaper tiers and finally to the
//! configured fallback model, which never crosses the normal ceiling.

use crate::rate_limit::{RateCheck, RateLimiter};
use crate::selection::ModelSelector;
use chrono::Utc;
use std::sync::Arc;
use tollgate_config::RoutingConfig;
use tollgate_core::decision::split_model;
use tollgate_core::pattern::model_permitted;
use tollgate_core::{
    BudgetRejection, CapabilityRecord, ModelTier, ReservationId, RouteRequest, RoutingDecision, RoutingError,
    TierSet,
};
use tollgate_telemetry::{CostTracker, PriceBasis, PricingTable};
use tracing::debug;

/// Cost estimates never carry less headroom than this.
pub const MIN_SAFETY_MARGIN: f64 = 0.10;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub fallback_model: Option<String>,
    pub safety_margin: f64,
    pub escalation_enabled: bool,
    pub escalation_max_distance: u32,
}

impl RouterSettings {
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            fallback_model: config.fallback_model.clone(),
            safety_margin: config.safety_margin.max(MIN_SAFETY_MARGIN),
            escalation_enabled: config.escalation.enabled,
            escalation_max_distance: config.escalation.max_distance,
        }
    }
}

/// A routed request plus the rate-limit state it was admitted under.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub decision: RoutingDecision,
    pub rate: RateCheck,
}

/// The tier a request plans onto before budget is considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPreview {
    pub tier: String,
    pub escalated: bool,
}

/// Where the request should go before budget is considered.
struct Plan<'a> {
    chosen: &'a ModelTier,
    escalated: bool,
    /// Chosen tier first, then every lower tier within the ceiling.
    attempts: Vec<&'a ModelTier>,
    reason: String,
}

pub struct TieredRouter {
    tiers: TierSet,
    settings: RouterSettings,
    selector: ModelSelector,
    pricing: Arc<PricingTable>,
}

impl std::fmt::Debug for TieredRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredRouter")
            .field("tiers", &self.tiers.len())
            .field("strategy", &self.selector.strategy())
            .field("settings", &self.settings)
            .finish()
    }
}

impl TieredRouter {
    pub fn new(tiers: TierSet, settings: RouterSettings, selector: ModelSelector, pricing: Arc<PricingTable>) -> Self {
        Self {
            tiers,
            settings,
            selector,
            pricing,
        }
    }

    pub fn from_config(config: &RoutingConfig, pricing: Arc<PricingTable>) -> Self {
        let tiers = config.tier_set();
        let selector = ModelSelector::new(config.strategy, &tiers);
        Self::new(tiers, RouterSettings::from_config(config), selector, pricing)
    }

    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    pub fn route(
        &self,
        request: &RouteRequest,
        caps: &CapabilityRecord,
        rate_limiter: &RateLimiter,
        cost_tracker: &CostTracker,
    ) -> Result<RoutingDecision, RoutingError> {
        self.route_detailed(request, caps, rate_limiter, cost_tracker)
            .map(|a| a.decision)
    }

    pub fn route_detailed(
        &self,
        request: &RouteRequest,
        caps: &CapabilityRecord,
        rate_limiter: &RateLimiter,
        cost_tracker: &CostTracker,
    ) -> Result<Admitted, RoutingError> {
        let Some(ceiling) = self.tiers.ordinal_of(&caps.max_tier) else {
            return Err(RoutingError::NoTierAvailable {
                reason: format!("max_tier '{}' is not a configured tier", caps.max_tier),
            });
        };

        if let Some(model) = &request.requested_model {
            if caps.can_override_model {
                return self.route_override(request, model, ceiling, caps, rate_limiter, cost_tracker);
            }
            debug!(
                identity = %request.identity,
                requested = %model,
                "Model override not permitted, routing normally"
            );
        }

        let plan = self.plan(request.normalized_complexity(), ceiling, caps)?;
        let output_tokens = output_cap(request, caps);
        let mut first_rejection: Option<BudgetRejection> = None;

        for &tier in &plan.attempts {
            let models = ModelSelector::permitted(tier, caps);
            let Some(model) = self.selector.select(tier, &models, &self.pricing) else {
                debug!(tier = %tier.name, "No permitted models in tier");
                continue;
            };

            let estimate = self.estimate(tier, request.estimated_input_tokens, output_tokens);
            match cost_tracker.reserve_priced(&request.identity, caps, estimate, price_basis(tier, model)) {
                Ok(reservation) => {
                    let budget_constrained = first_rejection.is_some();
                    let mut reason = plan.reason.clone();
                    if tier.ordinal != plan.chosen.ordinal {
                        reason.push_str(&format!(", settled on {}", tier.name));
                    }
                    return self.admit(
                        request,
                        caps,
                        rate_limiter,
                        cost_tracker,
                        Candidate {
                            tier,
                            model,
                            reservation,
                            estimate,
                            output_tokens,
                            escalated: plan.escalated && tier.ordinal == plan.chosen.ordinal,
                            budget_constrained,
                            used_fallback: false,
                            reason,
                        },
                    );
                }
                Err(rejection) => {
                    debug!(tier = %tier.name, limit = %rejection.limit, estimate, "Tier over budget");
                    first_rejection.get_or_insert(rejection);
                }
            }
        }

        if let Some(admitted) =
            self.try_fallback(request, ceiling, caps, rate_limiter, cost_tracker, output_tokens, &mut first_rejection)
        {
            return admitted;
        }

        Err(match first_rejection {
            Some(rejection) => rejection.into(),
            None => RoutingError::NoTierAvailable {
                reason: format!("no permitted model at or below tier '{}'", caps.max_tier),
            },
        })
    }

    /// The tier `request` would be planned onto, without reserving or
    /// rate-checking anything. `None` when no tier is reachable.
    pub fn preview(&self, request: &RouteRequest, caps: &CapabilityRecord) -> Option<PlanPreview> {
        if let Some(model) = &request.requested_model
            && caps.can_override_model
        {
            return self.tiers.tier_of_model(model).map(|t| PlanPreview {
                tier: t.name.clone(),
                escalated: false,
            });
        }
        let ceiling = self.tiers.ordinal_of(&caps.max_tier)?;
        let plan = self.plan(request.normalized_complexity(), ceiling, caps).ok()?;
        Some(PlanPreview {
            tier: plan.chosen.name.clone(),
            escalated: plan.escalated,
        })
    }

    fn plan(&self, complexity: f64, ceiling: u32, caps: &CapabilityRecord) -> Result<Plan<'_>, RoutingError> {
        let candidates: Vec<&ModelTier> = self.tiers.up_to(ceiling).collect();
        if candidates.is_empty() {
            return Err(RoutingError::NoTierAvailable {
                reason: format!("no tiers at or below '{}'", caps.max_tier),
            });
        }

        if let Some(preferred) = candidates
            .iter()
            .rev()
            .copied()
            .find(|t| t.complexity_range.contains(complexity))
        {
            return Ok(Plan {
                chosen: preferred,
                escalated: false,
                attempts: fallthrough(&candidates, preferred),
                reason: format!("complexity {complexity:.2} within {}", preferred.name),
            });
        }

        let may_escalate = self.settings.escalation_enabled
            && caps.escalation_allowed
            && complexity >= caps.escalation_threshold;
        if may_escalate {
            let reach = ceiling.saturating_add(self.settings.escalation_max_distance);
            if let Some(escalated) = self
                .tiers
                .iter()
                .filter(|t| t.ordinal > ceiling && t.ordinal <= reach)
                .find(|t| t.complexity_range.contains(complexity))
            {
                let mut attempts = vec![escalated];
                attempts.extend(candidates.iter().rev().copied());
                return Ok(Plan {
                    chosen: escalated,
                    escalated: true,
                    attempts,
                    reason: format!(
                        "complexity {complexity:.2} escalated from {} to {}",
                        caps.max_tier, escalated.name
                    ),
                });
            }
        }

        // Nearest range; ties go to the higher ordinal.
        let nearest = candidates
            .iter()
            .copied()
            .min_by(|a, b| {
                a.complexity_range
                    .distance(complexity)
                    .total_cmp(&b.complexity_range.distance(complexity))
                    .then(b.ordinal.cmp(&a.ordinal))
            })
            .ok_or_else(|| RoutingError::NoTierAvailable {
                reason: "no candidate tiers".into(),
            })?;
        Ok(Plan {
            chosen: nearest,
            escalated: false,
            attempts: fallthrough(&candidates, nearest),
            reason: format!("complexity {complexity:.2} nearest to {}", nearest.name),
        })
    }

    /// Reserved amount: tier rate over input plus capped output, with margin.
    pub fn estimate(&self, tier: &ModelTier, input_tokens: u32, output_tokens: u32) -> f64 {
        let tokens = f64::from(input_tokens) + f64::from(output_tokens);
        tier.cost_per_1k_tokens * tokens / 1_000.0 * (1.0 + self.settings.safety_margin)
    }

    #[allow(clippy::too_many_arguments)]
    fn try_fallback(
        &self,
        request: &RouteRequest,
        ceiling: u32,
        caps: &CapabilityRecord,
        rate_limiter: &RateLimiter,
        cost_tracker: &CostTracker,
        output_tokens: u32,
        first_rejection: &mut Option<BudgetRejection>,
    ) -> Option<Result<Admitted, RoutingError>> {
        let model = self.settings.fallback_model.as_deref()?;
        let tier = match self.tiers.tier_of_model(model) {
            Some(tier) if tier.ordinal <= ceiling && model_permitted(&caps.model_allow, &caps.model_deny, model) => {
                tier
            }
            _ => {
                debug!(fallback = model, ceiling, "Fallback model outside caller's reach");
                return None;
            }
        };

        let estimate = self.estimate(tier, request.estimated_input_tokens, output_tokens);
        match cost_tracker.reserve_priced(&request.identity, caps, estimate, price_basis(tier, model)) {
            Ok(reservation) => Some(self.admit(
                request,
                caps,
                rate_limiter,
                cost_tracker,
                Candidate {
                    tier,
                    model,
                    reservation,
                    estimate,
                    output_tokens,
                    escalated: false,
                    budget_constrained: first_rejection.is_some(),
                    used_fallback: true,
                    reason: format!("fallback model {model}"),
                },
            )),
            Err(rejection) => {
                first_rejection.get_or_insert(rejection);
                None
            }
        }
    }

    fn route_override(
        &self,
        request: &RouteRequest,
        model: &str,
        ceiling: u32,
        caps: &CapabilityRecord,
        rate_limiter: &RateLimiter,
        cost_tracker: &CostTracker,
    ) -> Result<Admitted, RoutingError> {
        let Some(tier) = self.tiers.tier_of_model(model) else {
            return Err(RoutingError::PermissionDenied {
                reason: format!("model '{model}' is not configured in any tier"),
            });
        };
        if tier.ordinal > ceiling {
            return Err(RoutingError::PermissionDenied {
                reason: format!("model '{model}' is in tier '{}' above '{}'", tier.name, caps.max_tier),
            });
        }
        if !model_permitted(&caps.model_allow, &caps.model_deny, model) {
            return Err(RoutingError::PermissionDenied {
                reason: format!("model '{model}' is not permitted"),
            });
        }

        let output_tokens = output_cap(request, caps);
        let estimate = self.estimate(tier, request.estimated_input_tokens, output_tokens);
        let reservation = cost_tracker.reserve_priced(&request.identity, caps, estimate, price_basis(tier, model))?;
        self.admit(
            request,
            caps,
            rate_limiter,
            cost_tracker,
            Candidate {
                tier,
                model,
                reservation,
                estimate,
                output_tokens,
                escalated: false,
                budget_constrained: false,
                used_fallback: false,
                reason: format!("caller override to {model}"),
            },
        )
    }

    /// Rate-check a reserved candidate and build the decision.
    fn admit(
        &self,
        request: &RouteRequest,
        caps: &CapabilityRecord,
        rate_limiter: &RateLimiter,
        cost_tracker: &CostTracker,
        c: Candidate<'_>,
    ) -> Result<Admitted, RoutingError> {
        let rate = rate_limiter.check_detailed(&request.identity, caps.rate_limit);
        if !rate.allowed {
            cost_tracker.release(&c.reservation);
            return Err(RoutingError::RateLimited {
                retry_after_secs: rate.retry_after_secs(),
            });
        }

        let (provider, _) = split_model(c.model);
        let decision = RoutingDecision {
            reservation_id: c.reservation,
            identity: request.identity.clone(),
            provider: provider.to_string(),
            model: c.model.to_string(),
            tier: c.tier.name.clone(),
            tier_ordinal: c.tier.ordinal,
            cost_estimate: c.estimate,
            escalated: c.escalated,
            budget_constrained: c.budget_constrained,
            used_fallback: c.used_fallback,
            streaming: request.stream && caps.streaming_allowed,
            max_context_tokens: c.tier.max_context_tokens.min(caps.max_context_tokens),
            max_output_tokens: c.output_tokens,
            reason: c.reason,
            decided_at: Utc::now(),
        };
        Ok(Admitted { decision, rate })
    }
}

struct Candidate<'a> {
    tier: &'a ModelTier,
    model: &'a str,
    reservation: ReservationId,
    estimate: f64,
    output_tokens: u32,
    escalated: bool,
    budget_constrained: bool,
    used_fallback: bool,
    reason: String,
}

/// `chosen`, then every candidate below it, highest first.
fn fallthrough<'a>(candidates: &[&'a ModelTier], chosen: &'a ModelTier) -> Vec<&'a ModelTier> {
    let mut attempts = vec![chosen];
    attempts.extend(
        candidates
            .iter()
            .rev()
            .copied()
            .filter(|t| t.ordinal < chosen.ordinal),
    );
    attempts
}

fn price_basis(tier: &ModelTier, model: &str) -> PriceBasis {
    PriceBasis {
        model: model.to_string(),
        tier_cost_per_1k: tier.cost_per_1k_tokens,
    }
}

fn output_cap(request: &RouteRequest, caps: &CapabilityRecord) -> u32 {
    request
        .max_output_tokens
        .map_or(caps.max_output_tokens, |r| r.min(caps.max_output_tokens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitSettings;
    use tollgate_config::{AppConfig, SelectionStrategy};
    use tollgate_core::{BudgetLimit, Identity, PermissionLevel};
    use tollgate_telemetry::LedgerSettings;

    struct Harness {
        router: TieredRouter,
        limiter: RateLimiter,
        ledger: CostTracker,
    }

    fn harness(edit: impl FnOnce(&mut RoutingConfig)) -> Harness {
        let mut routing = AppConfig::default().routing;
        edit(&mut routing);
        Harness {
            router: TieredRouter::from_config(&routing, Arc::new(PricingTable::with_defaults())),
            limiter: RateLimiter::new(RateLimitSettings::default()),
            ledger: CostTracker::new(LedgerSettings::default()),
        }
    }

    impl Harness {
        fn route(&self, request: &RouteRequest, caps: &CapabilityRecord) -> Result<RoutingDecision, RoutingError> {
            self.router.route(request, caps, &self.limiter, &self.ledger)
        }
    }

    fn caps(level: PermissionLevel) -> CapabilityRecord {
        CapabilityRecord::builtin(level)
    }

    fn request(complexity: f64) -> RouteRequest {
        RouteRequest::new(Identity::trusted("alice", "slack"), complexity, 1_000)
    }

    #[test]
    fn simple_request_stays_in_lowest_matching_ceiling() {
        let h = harness(|_| {});
        let d = h.route(&request(0.1), &caps(PermissionLevel::Standard)).unwrap();
        // Standard (0.0..0.7) is the highest candidate covering 0.1.
        assert_eq!(d.tier, "standard");
        assert_eq!(d.model, "anthropic/claude-3.5-haiku");
        assert_eq!(d.provider, "anthropic");
        assert!(!d.escalated);
    }

    #[test]
    fn never_exceeds_ceiling_without_escalation() {
        let h = harness(|_| {});
        let mut c = caps(PermissionLevel::Standard);
        c.escalation_allowed = false;
        let d = h.route(&request(0.95), &c).unwrap();
        assert!(d.tier_ordinal <= 1);
        assert!(!d.escalated);
    }

    #[test]
    fn escalation_is_bounded_by_distance() {
        let h = harness(|r| {
            // premium only serves the top band so escalation has to find it
            r.tiers[2].complexity_range = [0.9, 1.0];
        });
        let d = h.route(&request(0.95), &caps(PermissionLevel::Standard)).unwrap();
        assert_eq!(d.tier_ordinal, 2);
        assert!(d.escalated);
    }

    #[test]
    fn escalation_disabled_globally() {
        let h = harness(|r| r.escalation.enabled = false);
        let d = h.route(&request(0.95), &caps(PermissionLevel::Standard)).unwrap();
        assert!(!d.escalated);
        assert!(d.tier_ordinal <= 1);
    }

    #[test]
    fn escalation_below_threshold_uses_nearest() {
        let h = harness(|_| {});
        let mut c = caps(PermissionLevel::Standard);
        c.escalation_threshold = 0.99;
        let d = h.route(&request(0.9), &c).unwrap();
        assert_eq!(d.tier, "standard");
        assert!(!d.escalated);
    }

    #[test]
    fn unknown_max_tier_fails_closed() {
        let h = harness(|_| {});
        let mut c = caps(PermissionLevel::Elevated);
        c.max_tier = "platinum".into();
        let err = h.route(&request(0.5), &c).unwrap_err();
        assert!(matches!(err, RoutingError::NoTierAvailable { .. }));
    }

    #[test]
    fn denied_models_fall_through_to_lower_tier() {
        let h = harness(|_| {});
        let mut c = caps(PermissionLevel::Standard);
        c.model_deny = vec!["anthropic/*".into(), "openai/*".into()];
        let d = h.route(&request(0.5), &c).unwrap();
        assert_eq!(d.tier, "free");
    }

    #[test]
    fn fallback_above_ceiling_is_refused() {
        let h = harness(|r| r.fallback_model = Some("anthropic/claude-opus-4".into()));
        let mut c = caps(PermissionLevel::Standard);
        c.model_allow = vec!["anthropic/claude-opus-4".into()];
        let err = h.route(&request(0.5), &c).unwrap_err();
        assert!(matches!(err, RoutingError::NoTierAvailable { .. }));
    }

    #[test]
    fn budget_pressure_drops_to_cheaper_tier() {
        let h = harness(|_| {});
        let mut c = caps(PermissionLevel::Standard);
        // Standard costs 0.001/1K; 5K tokens at 15% margin is ~0.00575.
        c.cost_budget_daily = 0.001;
        let req = request(0.5).with_max_output(4_000);
        let d = h.route(&req, &c).unwrap();
        assert_eq!(d.tier, "free");
        assert!(d.budget_constrained);
        assert_eq!(d.cost_estimate, 0.0);
    }

    #[test]
    fn budget_exhaustion_everywhere_reports_budget() {
        let h = harness(|r| {
            r.tiers[0].cost_per_1k_tokens = 0.0005;
        });
        let mut c = caps(PermissionLevel::Standard);
        c.cost_budget_daily = 0.000_01;
        let err = h.route(&request(0.5), &c).unwrap_err();
        match err {
            RoutingError::BudgetExceeded { limit, .. } => assert_eq!(limit, BudgetLimit::IdentityDaily),
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[test]
    fn fallback_within_ceiling_used_when_planned_tiers_unavailable() {
        let h = harness(|r| r.fallback_model = Some("openai/gpt-4o".into()));
        let mut c = caps(PermissionLevel::Elevated);
        c.model_deny = vec![
            "anthropic/claude-3.5-haiku".into(),
            "openai/gpt-4o-mini".into(),
            "groq/*".into(),
            "openrouter/*".into(),
        ];
        // 0.1 plans standard then free; both are fully denied.
        let d = h.route(&request(0.1), &c).unwrap();
        assert!(d.used_fallback);
        assert_eq!(d.model, "openai/gpt-4o");
        assert_eq!(d.tier, "premium");
    }

    #[test]
    fn rate_limited_releases_reservation() {
        let h = harness(|_| {});
        let mut c = caps(PermissionLevel::Standard);
        c.rate_limit = 1;
        h.route(&request(0.5), &c).unwrap();
        let err = h.route(&request(0.5), &c).unwrap_err();
        assert!(matches!(err, RoutingError::RateLimited { retry_after_secs } if retry_after_secs > 0));
        assert_eq!(h.ledger.pending_reservations(), 1);
    }

    #[test]
    fn output_and_context_are_clamped() {
        let h = harness(|_| {});
        let c = caps(PermissionLevel::ZeroTrust);
        let d = h.route(&request(0.1).with_max_output(50_000).streaming(true), &c).unwrap();
        assert_eq!(d.max_output_tokens, c.max_output_tokens);
        assert_eq!(d.max_context_tokens, c.max_context_tokens);
        assert!(!d.streaming);

        let d = h.route(&request(0.1).with_max_output(100), &c).unwrap();
        assert_eq!(d.max_output_tokens, 100);
    }

    #[test]
    fn safety_margin_has_floor() {
        let h = harness(|r| r.safety_margin = 0.0);
        let tier = h.router.tiers().get("premium").unwrap().clone();
        let estimate = h.router.estimate(&tier, 500, 500);
        assert!((estimate - 0.01 * 1.10).abs() < 1e-12);
    }

    #[test]
    fn override_respects_ceiling_and_patterns() {
        let h = harness(|_| {});
        let mut c = caps(PermissionLevel::Standard);
        c.can_override_model = true;

        let d = h.route(&request(0.1).with_model("openai/gpt-4o-mini"), &c).unwrap();
        assert_eq!(d.model, "openai/gpt-4o-mini");

        let err = h.route(&request(0.1).with_model("openai/o1"), &c).unwrap_err();
        assert!(matches!(err, RoutingError::PermissionDenied { .. }));

        c.model_deny = vec!["openai/gpt-4o-mini".into()];
        let err = h.route(&request(0.1).with_model("openai/gpt-4o-mini"), &c).unwrap_err();
        assert!(matches!(err, RoutingError::PermissionDenied { .. }));
    }

    #[test]
    fn override_ignored_without_permission() {
        let h = harness(|_| {});
        let d = h
            .route(&request(0.1).with_model("openai/o1"), &caps(PermissionLevel::Standard))
            .unwrap();
        assert_ne!(d.model, "openai/o1");
        assert_eq!(d.tier, "standard");
    }

    #[test]
    fn preview_reports_plan_without_reserving() {
        let h = harness(|r| r.tiers[2].complexity_range = [0.9, 1.0]);
        let c = caps(PermissionLevel::Standard);
        let p = h.router.preview(&request(0.95), &c).unwrap();
        assert_eq!(p.tier, "premium");
        assert!(p.escalated);
        assert_eq!(h.router.preview(&request(0.1), &c).unwrap().tier, "standard");
        assert_eq!(h.ledger.pending_reservations(), 0);

        let mut c = caps(PermissionLevel::Standard);
        c.max_tier = "platinum".into();
        assert_eq!(h.router.preview(&request(0.1), &c), None);
    }

    #[test]
    fn reservation_carries_model_price_basis() {
        let h = harness(|_| {});
        let d = h.route(&request(0.1), &caps(PermissionLevel::Standard)).unwrap();
        let basis = h.ledger.price_basis(&d.reservation_id).unwrap();
        assert_eq!(basis.model, d.model);
        assert_eq!(basis.tier_cost_per_1k, 0.001);
    }

    #[test]
    fn round_robin_spreads_across_members() {
        let h = harness(|r| r.strategy = SelectionStrategy::RoundRobin);
        let c = caps(PermissionLevel::Standard);
        let first = h.route(&request(0.5), &c).unwrap().model;
        let second = h.route(&request(0.5), &c).unwrap().model;
        assert_ne!(first, second);
    }
}
