//! Layered permission resolution.
//!
//! Builds a concrete [`CapabilityRecord`] for one identity. The global layers
//! merge first, lowest to highest: built-in level defaults, the per-level
//! override, the channel override, then the per-caller override, each
//! replacing field by field. The workspace layers (level, channel, caller)
//! then restrict the merged global record. A workspace limit is a ceiling no
//! global entry can lift; anything that would widen access is clamped and
//! logged at `warn`.
//!
//! This is the only place capability records are derived. Everything
//! downstream consumes the resolved record.

use tollgate_config::PermissionsConfig;
use tollgate_core::{CapabilityOverride, CapabilityRecord, Identity, PermissionLevel, TierSet};
use tracing::{debug, warn};

/// Resolves identities against a fixed global and workspace permission set.
#[derive(Debug, Clone)]
pub struct PermissionResolver {
    global: PermissionsConfig,
    workspace: Option<PermissionsConfig>,
    tiers: TierSet,
}

impl PermissionResolver {
    pub fn new(global: PermissionsConfig, workspace: Option<PermissionsConfig>, tiers: TierSet) -> Self {
        Self {
            global,
            workspace,
            tiers,
        }
    }

    pub fn resolve(&self, identity: &Identity) -> CapabilityRecord {
        resolve(identity, &self.global, self.workspace.as_ref(), &self.tiers)
    }

    /// The level the global layers alone would grant this identity.
    pub fn global_level(&self, identity: &Identity) -> PermissionLevel {
        if !identity.is_trusted() {
            return PermissionLevel::ZeroTrust;
        }
        global_level(identity, &self.global)
    }
}

/// Resolve the capability record for `identity`.
///
/// Never fails: an identity nobody configured gets the zero-trust defaults.
pub fn resolve(
    identity: &Identity,
    global: &PermissionsConfig,
    workspace: Option<&PermissionsConfig>,
    tiers: &TierSet,
) -> CapabilityRecord {
    if !identity.is_trusted() {
        return resolve_untrusted(identity, global, workspace, tiers);
    }

    let level = effective_level(identity, global, workspace);
    let mut layers = vec![format!("builtin:{level}")];
    let mut record = CapabilityRecord::builtin(level);

    apply(&mut record, global.level(level));
    layers.push(format!("global:{level}"));
    if let Some(o) = global.channels.get(&identity.channel) {
        apply(&mut record, o);
        layers.push(format!("global.channel:{}", identity.channel));
    }
    if let Some(o) = global.users.get(&identity.caller_id) {
        apply(&mut record, o);
        layers.push(format!("global.user:{}", identity.caller_id));
    }

    // Workspace layers restrict the fully merged global record, so no later
    // global entry can lift a workspace limit.
    if let Some(ws) = workspace {
        restrict(&mut record, ws.level(level), tiers, &format!("workspace.{level}"));
        layers.push(format!("workspace:{level}"));
        if let Some(o) = ws.channels.get(&identity.channel) {
            restrict(&mut record, o, tiers, &format!("workspace.channels.{}", identity.channel));
            layers.push(format!("workspace.channel:{}", identity.channel));
        }
        if let Some(o) = ws.users.get(&identity.caller_id) {
            restrict(&mut record, o, tiers, &format!("workspace.users.{}", identity.caller_id));
            layers.push(format!("workspace.user:{}", identity.caller_id));
        }
    }

    record.level = level;
    debug!(identity = %identity, level = %level, layers = ?layers, "Resolved capabilities");
    record
}

/// Level 0 with no channel or caller layers, then hardened so that no
/// override table can hand an unauthenticated caller tools or escalation.
fn resolve_untrusted(
    identity: &Identity,
    global: &PermissionsConfig,
    workspace: Option<&PermissionsConfig>,
    tiers: &TierSet,
) -> CapabilityRecord {
    let level = PermissionLevel::ZeroTrust;
    let mut record = CapabilityRecord::builtin(level);
    apply(&mut record, global.level(level));
    if let Some(ws) = workspace {
        restrict(&mut record, ws.level(level), tiers, "workspace.zero_trust");
    }

    record.level = level;
    record.tool_allow.clear();
    record.escalation_allowed = false;
    record.can_override_model = false;

    debug!(identity = %identity, "Untrusted identity resolved to hardened zero-trust record");
    record
}

fn global_level(identity: &Identity, global: &PermissionsConfig) -> PermissionLevel {
    global
        .users
        .get(&identity.caller_id)
        .and_then(|o| o.level)
        .or_else(|| global.channels.get(&identity.channel).and_then(|o| o.level))
        .unwrap_or(PermissionLevel::ZeroTrust)
}

/// Global level, lowered (never raised) by workspace caller/channel entries.
fn effective_level(
    identity: &Identity,
    global: &PermissionsConfig,
    workspace: Option<&PermissionsConfig>,
) -> PermissionLevel {
    let mut level = global_level(identity, global);
    let Some(ws) = workspace else {
        return level;
    };

    let requested = [
        ws.channels.get(&identity.channel).and_then(|o| o.level),
        ws.users.get(&identity.caller_id).and_then(|o| o.level),
    ];
    for wanted in requested.into_iter().flatten() {
        if wanted > level {
            warn!(
                identity = %identity,
                granted = %level,
                requested = %wanted,
                "Workspace tried to raise permission level, clamped"
            );
        } else {
            level = wanted;
        }
    }
    level
}

/// Global-layer merge: `Some` replaces, `None` inherits.
fn apply(record: &mut CapabilityRecord, o: &CapabilityOverride) {
    if let Some(v) = &o.max_tier {
        record.max_tier = v.clone();
    }
    if let Some(v) = &o.model_allow {
        record.model_allow = v.clone();
    }
    if let Some(v) = &o.model_deny {
        record.model_deny = v.clone();
    }
    if let Some(v) = &o.tool_allow {
        record.tool_allow = v.clone();
    }
    if let Some(v) = &o.tool_deny {
        record.tool_deny = v.clone();
    }
    if let Some(v) = o.max_context_tokens {
        record.max_context_tokens = v;
    }
    if let Some(v) = o.max_output_tokens {
        record.max_output_tokens = v;
    }
    if let Some(v) = o.rate_limit {
        record.rate_limit = v;
    }
    if let Some(v) = o.streaming_allowed {
        record.streaming_allowed = v;
    }
    if let Some(v) = o.escalation_allowed {
        record.escalation_allowed = v;
    }
    if let Some(v) = o.escalation_threshold {
        record.escalation_threshold = v;
    }
    if let Some(v) = o.can_override_model {
        record.can_override_model = v;
    }
    if let Some(v) = o.cost_budget_daily {
        record.cost_budget_daily = v;
    }
    if let Some(v) = o.cost_budget_monthly {
        record.cost_budget_monthly = v;
    }
    if let Some(ext) = &o.extensions {
        record
            .extensions
            .extend(ext.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Workspace-layer merge: every field may only tighten the record.
fn restrict(record: &mut CapabilityRecord, o: &CapabilityOverride, tiers: &TierSet, label: &str) {
    if let Some(wanted) = &o.max_tier {
        match (tiers.ordinal_of(wanted), tiers.ordinal_of(&record.max_tier)) {
            (Some(w), Some(current)) if w <= current => record.max_tier = wanted.clone(),
            _ => warn!(
                layer = label,
                field = "max_tier",
                granted = %record.max_tier,
                requested = %wanted,
                "Workspace value exceeds ceiling, clamped"
            ),
        }
    }

    if let Some(wanted) = &o.model_allow {
        record.model_allow = subset(&record.model_allow, wanted, label, "model_allow");
    }
    if let Some(wanted) = &o.tool_allow {
        record.tool_allow = subset(&record.tool_allow, wanted, label, "tool_allow");
    }
    if let Some(extra) = &o.model_deny {
        union(&mut record.model_deny, extra);
    }
    if let Some(extra) = &o.tool_deny {
        union(&mut record.tool_deny, extra);
    }

    if let Some(v) = o.max_context_tokens {
        record.max_context_tokens = record.max_context_tokens.min(v);
    }
    if let Some(v) = o.max_output_tokens {
        record.max_output_tokens = record.max_output_tokens.min(v);
    }

    if let Some(v) = o.rate_limit {
        let tightened = tighter_u32(record.rate_limit, v);
        if tightened != v {
            clamp_warn(label, "rate_limit", record.rate_limit, v);
        }
        record.rate_limit = tightened;
    }
    if let Some(v) = o.cost_budget_daily {
        let tightened = tighter_f64(record.cost_budget_daily, v);
        if tightened != v {
            clamp_warn(label, "cost_budget_daily", record.cost_budget_daily, v);
        }
        record.cost_budget_daily = tightened;
    }
    if let Some(v) = o.cost_budget_monthly {
        let tightened = tighter_f64(record.cost_budget_monthly, v);
        if tightened != v {
            clamp_warn(label, "cost_budget_monthly", record.cost_budget_monthly, v);
        }
        record.cost_budget_monthly = tightened;
    }

    if let Some(v) = o.streaming_allowed {
        if v && !record.streaming_allowed {
            clamp_warn(label, "streaming_allowed", false, true);
        }
        record.streaming_allowed &= v;
    }
    if let Some(v) = o.escalation_allowed {
        if v && !record.escalation_allowed {
            clamp_warn(label, "escalation_allowed", false, true);
        }
        record.escalation_allowed &= v;
    }
    if let Some(v) = o.can_override_model {
        if v && !record.can_override_model {
            clamp_warn(label, "can_override_model", false, true);
        }
        record.can_override_model &= v;
    }
    if let Some(v) = o.escalation_threshold {
        if v < record.escalation_threshold {
            clamp_warn(label, "escalation_threshold", record.escalation_threshold, v);
        }
        record.escalation_threshold = record.escalation_threshold.max(v);
    }

    // Workspace extensions may add dimensions but never rewrite global ones.
    if let Some(ext) = &o.extensions {
        for (k, v) in ext {
            if record.extensions.contains_key(k) {
                warn!(layer = label, key = %k, "Workspace extension shadows a global value, ignored");
            } else {
                record.extensions.insert(k.clone(), v.clone());
            }
        }
    }
}

fn clamp_warn(label: &str, field: &str, granted: impl std::fmt::Display, requested: impl std::fmt::Display) {
    warn!(
        layer = label,
        field,
        granted = %granted,
        requested = %requested,
        "Workspace value exceeds ceiling, clamped"
    );
}

/// Keep only the requested entries the current list already grants.
fn subset(current: &[String], wanted: &[String], label: &str, field: &str) -> Vec<String> {
    if current.iter().any(|c| c == "*") {
        return wanted.to_vec();
    }
    if wanted.iter().any(|w| w == "*") {
        warn!(layer = label, field, "Workspace wildcard narrowed to the global list");
        return current.to_vec();
    }
    let (kept, dropped): (Vec<String>, Vec<String>) =
        wanted.iter().cloned().partition(|w| current.contains(w));
    if !dropped.is_empty() {
        warn!(layer = label, field, dropped = ?dropped, "Workspace allow entries not granted globally, removed");
    }
    kept
}

fn union(list: &mut Vec<String>, extra: &[String]) {
    for item in extra {
        if !list.contains(item) {
            list.push(item.clone());
        }
    }
}

/// The more restrictive of two limits where 0 means unlimited.
fn tighter_u32(current: u32, wanted: u32) -> u32 {
    match (current, wanted) {
        (0, w) => w,
        (c, 0) => c,
        (c, w) => c.min(w),
    }
}

fn tighter_f64(current: f64, wanted: f64) -> f64 {
    if current <= 0.0 {
        wanted
    } else if wanted <= 0.0 {
        current
    } else {
        current.min(wanted)
    }
}
