//! Admission controller: the single entry point for agent requests.
//!
//! Wires the permission resolver, tiered router, rate limiter and cost
//! tracker together. Callers hand in a request, get back a decision or a
//! typed refusal, and report actual token usage once the provider answers.

use crate::rate_limit::{RateLimitSettings, RateLimiter};
use crate::tiered::TieredRouter;
use std::sync::Arc;
use tollgate_config::{AppConfig, PermissionsConfig};
use tollgate_core::{CapabilityRecord, Identity, ReservationId, RouteRequest, RoutingDecision, RoutingError};
use tollgate_security::{DecisionAuditor, DenialDetails, PermissionResolver, ToolPermissionChecker, ToolVerdict};
use tollgate_telemetry::{CostTracker, LedgerSettings, PricingTable};
use tracing::{debug, info, warn};

pub struct AdmissionController {
    resolver: PermissionResolver,
    router: TieredRouter,
    rate_limiter: RateLimiter,
    cost_tracker: Arc<CostTracker>,
    pricing: Arc<PricingTable>,
    auditor: DecisionAuditor,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("router", &self.router)
            .field("outstanding", &self.cost_tracker.pending_reservations())
            .finish()
    }
}

impl AdmissionController {
    pub fn new(
        resolver: PermissionResolver,
        router: TieredRouter,
        rate_limiter: RateLimiter,
        cost_tracker: Arc<CostTracker>,
        pricing: Arc<PricingTable>,
    ) -> Self {
        Self {
            resolver,
            router,
            rate_limiter,
            cost_tracker,
            pricing,
            auditor: DecisionAuditor::default(),
        }
    }

    /// Build every component from a validated configuration snapshot.
    pub fn from_config(config: &AppConfig, workspace: Option<PermissionsConfig>) -> Self {
        let pricing = Arc::new(PricingTable::from_config(&config.pricing));
        let router = TieredRouter::from_config(&config.routing, Arc::clone(&pricing));
        let resolver = PermissionResolver::new(config.permissions.clone(), workspace, router.tiers().clone());
        let rate_limiter = RateLimiter::new(RateLimitSettings::from_config(&config.rate_limiting));
        let cost_tracker = Arc::new(CostTracker::new(LedgerSettings::from_config(&config.budgets)));
        Self::new(resolver, router, rate_limiter, cost_tracker, pricing)
    }

    pub fn with_auditor(mut self, auditor: DecisionAuditor) -> Self {
        self.auditor = auditor;
        self
    }

    pub fn cost_tracker(&self) -> &Arc<CostTracker> {
        &self.cost_tracker
    }

    pub fn router(&self) -> &TieredRouter {
        &self.router
    }

    pub fn capabilities_for(&self, identity: &Identity) -> CapabilityRecord {
        self.resolver.resolve(identity)
    }

    /// Admit or refuse one request. An admitted request holds a budget
    /// reservation until [`report_actual_usage`](Self::report_actual_usage)
    /// or [`release`](Self::release) is called with its id.
    pub fn route(&self, request: &RouteRequest) -> Result<RoutingDecision, RoutingError> {
        let caps = self.resolver.resolve(&request.identity);
        match self
            .router
            .route_detailed(request, &caps, &self.rate_limiter, &self.cost_tracker)
        {
            Ok(admitted) => {
                let decision = admitted.decision;
                let budget_remaining = self.cost_tracker.usage(&request.identity, &caps).daily.remaining();
                info!(
                    identity = %request.identity,
                    level = %caps.level,
                    complexity = request.normalized_complexity(),
                    max_tier = %caps.max_tier,
                    tier = %decision.tier,
                    model = %decision.model,
                    escalated = decision.escalated,
                    budget_constrained = decision.budget_constrained,
                    budget_remaining = ?budget_remaining,
                    rate_remaining = ?admitted.rate.remaining,
                    "Request admitted"
                );
                self.auditor
                    .record_route(&decision, &caps, admitted.rate.remaining, budget_remaining);
                Ok(decision)
            }
            Err(e) => {
                let details = self.denial_details(request, &caps);
                warn!(
                    identity = %request.identity,
                    level = %caps.level,
                    complexity = request.normalized_complexity(),
                    requested_tier = ?details.requested_tier,
                    allowed_tier = %details.allowed_tier,
                    escalated = details.escalated,
                    budget_remaining = ?details.budget_remaining,
                    rate_remaining = ?details.rate_remaining,
                    kind = e.kind(),
                    error = %e,
                    "Request refused"
                );
                self.auditor.record_denial(&request.identity, &caps, &e, &details);
                Err(e)
            }
        }
    }

    /// State of the caller's limits at the moment of a refusal. Reads only:
    /// nothing is reserved or counted.
    fn denial_details(&self, request: &RouteRequest, caps: &CapabilityRecord) -> DenialDetails {
        let preview = self.router.preview(request, caps);
        DenialDetails {
            escalated: preview.as_ref().is_some_and(|p| p.escalated),
            requested_tier: preview.map(|p| p.tier),
            allowed_tier: caps.max_tier.clone(),
            budget_remaining: self.cost_tracker.usage(&request.identity, caps).daily.remaining(),
            rate_remaining: self.rate_limiter.peek(&request.identity, caps.rate_limit).remaining,
        }
    }

    /// Check a tool against an already-resolved record. `None` denies.
    pub fn check_tool(&self, capabilities: Option<&CapabilityRecord>, tool_name: &str) -> ToolVerdict {
        let verdict = ToolPermissionChecker::check(capabilities, tool_name);
        self.audit_tool(None, capabilities, tool_name, &verdict);
        verdict
    }

    /// Resolve, check and audit a tool invocation in one step.
    pub fn authorize_tool(&self, identity: &Identity, tool_name: &str) -> ToolVerdict {
        let caps = self.resolver.resolve(identity);
        let verdict = ToolPermissionChecker::check(Some(&caps), tool_name);
        self.audit_tool(Some(identity), Some(&caps), tool_name, &verdict);
        verdict
    }

    fn audit_tool(
        &self,
        identity: Option<&Identity>,
        caps: Option<&CapabilityRecord>,
        tool_name: &str,
        verdict: &ToolVerdict,
    ) {
        match verdict {
            ToolVerdict::Allow => debug!(
                identity = ?identity.map(Identity::key),
                tool = tool_name,
                "Tool allowed"
            ),
            ToolVerdict::Deny(reason) => warn!(
                identity = ?identity.map(Identity::key),
                level = ?caps.map(|c| c.level.as_str()),
                tool = tool_name,
                reason = %reason,
                "Tool refused"
            ),
        }
        self.auditor.record_tool(identity, caps, tool_name, verdict);
    }

    /// Settle a reservation at the cost of the tokens actually used.
    ///
    /// Returns the recorded cost, or `None` for an unknown or already
    /// settled reservation.
    pub fn report_actual_usage(&self, id: &ReservationId, tokens_in: u32, tokens_out: u32) -> Option<f64> {
        let Some(basis) = self.cost_tracker.price_basis(id) else {
            debug!(reservation = %id, "Usage reported for unknown reservation");
            return None;
        };
        let actual = self
            .pricing
            .cost_or_blended(&basis.model, tokens_in, tokens_out, basis.tier_cost_per_1k);
        let recorded = self.cost_tracker.reconcile(id, actual)?;
        debug!(
            reservation = %id,
            model = %basis.model,
            tokens_in,
            tokens_out,
            cost = recorded,
            "Usage reported"
        );
        Some(recorded)
    }

    /// Drop a reservation without charging it (the provider call never happened).
    pub fn release(&self, id: &ReservationId) -> bool {
        self.cost_tracker.release(id)
    }

    /// Reservations still waiting for usage or release.
    pub fn outstanding(&self) -> usize {
        self.cost_tracker.pending_reservations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::{CapabilityOverride, PermissionLevel};
    use tollgate_security::{AuditOutcome, MemorySink};

    fn controller(edit: impl FnOnce(&mut AppConfig)) -> (AdmissionController, Arc<MemorySink>) {
        let mut config = AppConfig::default();
        config.permissions.users.insert(
            "alice".into(),
            CapabilityOverride {
                level: Some(PermissionLevel::Standard),
                ..Default::default()
            },
        );
        edit(&mut config);
        let sink = Arc::new(MemorySink::new(100));
        let controller = AdmissionController::from_config(&config, None)
            .with_auditor(DecisionAuditor::with_sinks(vec![Box::new(Arc::clone(&sink))]));
        (controller, sink)
    }

    fn alice() -> Identity {
        Identity::trusted("alice", "slack")
    }

    #[test]
    fn admits_and_audits() {
        let (c, sink) = controller(|_| {});
        let d = c.route(&RouteRequest::new(alice(), 0.2, 500)).unwrap();
        assert_eq!(d.tier, "standard");
        assert_eq!(c.outstanding(), 1);
        assert_eq!(sink.entries_by_outcome(AuditOutcome::Allowed).len(), 1);
    }

    #[test]
    fn refusal_is_logged_and_audited() {
        let (c, sink) = controller(|cfg| {
            cfg.permissions.zero_trust.model_deny = Some(vec!["*".into()]);
        });
        let err = c
            .route(&RouteRequest::new(Identity::untrusted("mallory", "web"), 0.9, 500))
            .unwrap_err();
        assert!(matches!(err, RoutingError::NoTierAvailable { .. }));
        assert_eq!(c.outstanding(), 0);
        assert_eq!(sink.entries_by_outcome(AuditOutcome::Denied).len(), 1);
    }

    #[test]
    fn override_outside_ceiling_is_refused() {
        let (c, _) = controller(|cfg| {
            cfg.permissions.users.get_mut("alice").unwrap().can_override_model = Some(true);
        });
        let request = RouteRequest::new(alice(), 0.9, 500).with_model("anthropic/claude-opus-4");
        let err = c.route(&request).unwrap_err();
        assert!(matches!(err, RoutingError::PermissionDenied { .. }));
    }

    #[test]
    fn report_reconciles_at_model_price() {
        let (c, _) = controller(|cfg| {
            cfg.pricing.insert(
                "anthropic/claude-3.5-haiku".into(),
                tollgate_config::ModelPriceConfig {
                    input_per_1k: 0.001,
                    output_per_1k: 0.005,
                },
            );
        });
        let d = c.route(&RouteRequest::new(alice(), 0.2, 1_000)).unwrap();
        assert_eq!(d.model, "anthropic/claude-3.5-haiku");

        let actual = c.report_actual_usage(&d.reservation_id, 1_000, 1_000).unwrap();
        assert!((actual - 0.006).abs() < 1e-12);
        let usage = c.cost_tracker().usage(&alice(), &c.capabilities_for(&alice()));
        assert!((usage.daily.spent - 0.006).abs() < 1e-12);
        assert_eq!(usage.daily.reserved, 0.0);

        // Settled once only.
        assert!(c.report_actual_usage(&d.reservation_id, 1_000, 1_000).is_none());
        assert_eq!(c.outstanding(), 0);
    }

    #[test]
    fn unknown_model_price_falls_back_to_tier_rate() {
        let (c, _) = controller(|cfg| {
            cfg.routing.tiers[1].models = vec!["acme/house-model".into()];
        });
        let d = c.route(&RouteRequest::new(alice(), 0.2, 1_000)).unwrap();
        assert_eq!(d.model, "acme/house-model");
        let actual = c.report_actual_usage(&d.reservation_id, 1_000, 1_000).unwrap();
        // standard tier: 0.001 per 1K, 2K tokens.
        assert!((actual - 0.002).abs() < 1e-12);
    }

    #[test]
    fn release_frees_reservation() {
        let (c, _) = controller(|_| {});
        let d = c.route(&RouteRequest::new(alice(), 0.5, 2_000)).unwrap();
        assert!(c.cost_tracker().pending_reservations() > 0);
        assert!(c.release(&d.reservation_id));
        assert_eq!(c.cost_tracker().pending_reservations(), 0);
        assert!(!c.release(&d.reservation_id));
        assert!(c.report_actual_usage(&d.reservation_id, 10, 10).is_none());
    }

    #[test]
    fn authorize_tool_resolves_and_audits() {
        let (c, sink) = controller(|cfg| {
            cfg.permissions.standard.tool_allow = Some(vec!["*".into()]);
            cfg.permissions.standard.tool_deny = Some(vec!["spawn".into()]);
        });
        assert!(!c.authorize_tool(&alice(), "spawn").is_allowed());
        assert!(c.authorize_tool(&alice(), "read_file").is_allowed());
        assert_eq!(sink.entries_by_outcome(AuditOutcome::Denied).len(), 1);
        assert_eq!(sink.entries_by_outcome(AuditOutcome::Allowed).len(), 1);
        assert!(!c.check_tool(None, "read_file").is_allowed());
    }

    fn only_denial(sink: &MemorySink) -> tollgate_security::AuditEntry {
        let mut denied = sink.entries_by_outcome(AuditOutcome::Denied);
        assert_eq!(denied.len(), 1);
        denied.remove(0)
    }

    #[test]
    fn budget_refusal_records_limits() {
        let (c, sink) = controller(|cfg| {
            cfg.routing.tiers[0].cost_per_1k_tokens = 0.0005;
            cfg.permissions.users.get_mut("alice").unwrap().cost_budget_daily = Some(0.000_01);
        });
        let err = c.route(&RouteRequest::new(alice(), 0.2, 500)).unwrap_err();
        assert!(matches!(err, RoutingError::BudgetExceeded { .. }));

        let entry = only_denial(&sink);
        assert_eq!(entry.identity, "slack:alice");
        assert_eq!(entry.fields["level"], "standard");
        assert_eq!(entry.fields["requested_tier"], "standard");
        assert_eq!(entry.fields["allowed_tier"], "standard");
        assert_eq!(entry.fields["escalated"], false);
        let budget = entry.fields["budget_remaining"].as_f64().unwrap();
        assert!((budget - 0.000_01).abs() < 1e-12);
        assert_eq!(entry.fields["rate_remaining"], 60);
    }

    #[test]
    fn rate_refusal_records_limits() {
        let (c, sink) = controller(|cfg| {
            cfg.permissions.users.get_mut("alice").unwrap().rate_limit = Some(1);
        });
        let first = c.route(&RouteRequest::new(alice(), 0.2, 500)).unwrap();
        let err = c.route(&RouteRequest::new(alice(), 0.2, 500)).unwrap_err();
        assert!(matches!(err, RoutingError::RateLimited { .. }));
        assert_eq!(c.outstanding(), 1);

        let entry = only_denial(&sink);
        assert_eq!(entry.fields["rate_remaining"], 0);
        assert_eq!(entry.fields["requested_tier"], "standard");
        assert_eq!(entry.fields["allowed_tier"], "standard");
        assert!(entry.fields["budget_remaining"].as_f64().unwrap() < 5.0);
        assert!(entry.fields.contains_key("retry_after_secs"));
        assert!(c.release(&first.reservation_id));
    }

    #[test]
    fn unresolved_tool_check_is_audited() {
        let (c, sink) = controller(|_| {});
        assert!(!c.check_tool(None, "shell").is_allowed());

        let entry = only_denial(&sink);
        assert_eq!(entry.identity, tollgate_security::UNRESOLVED_IDENTITY);
        assert!(!entry.fields.contains_key("level"));
        assert!(entry.fields.contains_key("reason"));
    }

    #[test]
    fn unreported_admissions_stay_bounded() {
        let (c, _) = controller(|cfg| cfg.budgets.max_pending_reservations = 2);
        let decisions: Vec<_> = (0..3)
            .map(|_| c.route(&RouteRequest::new(alice(), 0.2, 500)).unwrap())
            .collect();
        assert_eq!(c.outstanding(), 2);

        // The oldest was settled at its estimate to make room.
        assert!(c.report_actual_usage(&decisions[0].reservation_id, 10, 10).is_none());
        let usage = c.cost_tracker().usage(&alice(), &c.capabilities_for(&alice()));
        assert!((usage.daily.spent - decisions[0].cost_estimate).abs() < 1e-12);
        assert!(c.report_actual_usage(&decisions[2].reservation_id, 10, 10).is_some());
        assert_eq!(c.outstanding(), 1);
    }

    #[test]
    fn capabilities_reflect_channel_elevation() {
        let (c, _) = controller(|_| {});
        let caps = c.capabilities_for(&Identity::trusted("ops", "cli"));
        assert_eq!(caps.level, PermissionLevel::Elevated);
    }
}
