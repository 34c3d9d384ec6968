//! Decision audit trail.
//!
//! Every admission decision (allow or deny) and every tool verdict is
//! recorded as an [`AuditEntry`] and forwarded to the configured sinks.

use crate::tool_policy::ToolVerdict;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use tollgate_core::{CapabilityRecord, Identity, RoutingDecision, RoutingError};

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    /// `channel:caller_id`
    pub identity: String,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

/// Types of auditable admission events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A request was admitted and routed
    RouteDecision { tier: String, model: String },
    /// A request was refused
    RouteDenied { kind: String },
    /// A tool invocation was checked
    ToolCheck { tool_name: String },
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
}

/// Context gathered when a request is refused.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DenialDetails {
    /// Tier the request planned onto, if any tier was reachable.
    pub requested_tier: Option<String>,
    /// The caller's ceiling.
    pub allowed_tier: String,
    pub escalated: bool,
    /// Daily budget left; `None` when unlimited.
    pub budget_remaining: Option<f64>,
    /// Requests left in the rate window; `None` when unlimited.
    pub rate_remaining: Option<u32>,
}

/// Identity recorded for tool checks made without one.
pub const UNRESOLVED_IDENTITY: &str = "unresolved";

/// Trait for audit log sinks (where events are written).
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Builds audit entries for admission decisions and fans them out to sinks.
pub struct DecisionAuditor {
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for DecisionAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionAuditor")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Default for DecisionAuditor {
    fn default() -> Self {
        Self::with_sinks(vec![Box::new(TracingSink)])
    }
}

impl DecisionAuditor {
    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    fn emit(&self, entry: AuditEntry) {
        for sink in &self.sinks {
            sink.record(&entry);
        }
    }

    /// Record an admitted request.
    pub fn record_route(
        &self,
        decision: &RoutingDecision,
        caps: &CapabilityRecord,
        rate_remaining: Option<u32>,
        budget_remaining: Option<f64>,
    ) {
        let mut fields = BTreeMap::new();
        fields.insert("level".into(), json!(caps.level.as_str()));
        fields.insert("max_tier".into(), json!(caps.max_tier));
        fields.insert("tier_ordinal".into(), json!(decision.tier_ordinal));
        fields.insert("escalated".into(), json!(decision.escalated));
        fields.insert("budget_constrained".into(), json!(decision.budget_constrained));
        fields.insert("used_fallback".into(), json!(decision.used_fallback));
        fields.insert("cost_estimate".into(), json!(decision.cost_estimate));
        fields.insert("reservation_id".into(), json!(decision.reservation_id.to_string()));
        fields.insert("rate_remaining".into(), json!(rate_remaining));
        fields.insert("budget_remaining".into(), json!(budget_remaining));

        self.emit(AuditEntry {
            timestamp: decision.decided_at,
            event: AuditEvent::RouteDecision {
                tier: decision.tier.clone(),
                model: decision.model.clone(),
            },
            identity: decision.identity.key(),
            outcome: AuditOutcome::Allowed,
            fields,
        });
    }

    /// Record a refused request.
    pub fn record_denial(
        &self,
        identity: &Identity,
        caps: &CapabilityRecord,
        error: &RoutingError,
        details: &DenialDetails,
    ) {
        let mut fields = BTreeMap::new();
        fields.insert("level".into(), json!(caps.level.as_str()));
        fields.insert("requested_tier".into(), json!(details.requested_tier));
        fields.insert("allowed_tier".into(), json!(details.allowed_tier));
        fields.insert("escalated".into(), json!(details.escalated));
        fields.insert("budget_remaining".into(), json!(details.budget_remaining));
        fields.insert("rate_remaining".into(), json!(details.rate_remaining));
        fields.insert("reason".into(), json!(error.to_string()));
        if let RoutingError::RateLimited { retry_after_secs } = error {
            fields.insert("retry_after_secs".into(), json!(retry_after_secs));
        }

        self.emit(AuditEntry {
            timestamp: Utc::now(),
            event: AuditEvent::RouteDenied {
                kind: error.kind().into(),
            },
            identity: identity.key(),
            outcome: AuditOutcome::Denied,
            fields,
        });
    }

    /// Record a tool verdict. Checks made without a resolved identity are
    /// recorded as [`UNRESOLVED_IDENTITY`].
    pub fn record_tool(
        &self,
        identity: Option<&Identity>,
        caps: Option<&CapabilityRecord>,
        tool_name: &str,
        verdict: &ToolVerdict,
    ) {
        let mut fields = BTreeMap::new();
        if let Some(caps) = caps {
            fields.insert("level".into(), json!(caps.level.as_str()));
        }
        let outcome = match verdict {
            ToolVerdict::Allow => AuditOutcome::Allowed,
            ToolVerdict::Deny(reason) => {
                fields.insert("reason".into(), json!(reason));
                AuditOutcome::Denied
            }
        };

        self.emit(AuditEntry {
            timestamp: Utc::now(),
            event: AuditEvent::ToolCheck {
                tool_name: tool_name.trim().into(),
            },
            identity: identity.map_or_else(|| UNRESOLVED_IDENTITY.to_string(), Identity::key),
            outcome,
            fields,
        });
    }
}

/// A tracing-based audit sink. Allowed entries log at `info`, denials at `warn`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        let fields = serde_json::to_string(&entry.fields).unwrap_or_default();
        match entry.outcome {
            AuditOutcome::Allowed => tracing::info!(
                event = ?entry.event,
                identity = %entry.identity,
                fields = %fields,
                "AUDIT"
            ),
            AuditOutcome::Denied => tracing::warn!(
                event = ?entry.event,
                identity = %entry.identity,
                fields = %fields,
                "AUDIT"
            ),
        }
    }
}

/// Bounded in-memory sink, newest entries kept.
pub struct MemorySink {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn entries_by_outcome(&self, outcome: AuditOutcome) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.outcome == outcome)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl AuditSink for MemorySink {
    fn record(&self, entry: &AuditEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
    }
}

impl<S: AuditSink> AuditSink for std::sync::Arc<S> {
    fn record(&self, entry: &AuditEntry) {
        (**self).record(entry);
    }
}
