//! Error types for the Tollgate domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Routing failures form their own bounded context because callers branch on
//! them (retry later, offer a cheaper tier, or surface a hard denial).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a request could not be admitted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoutingError {
    /// Tool or model access refused. Never retried.
    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// A spend ceiling would be crossed by the reservation.
    #[error("Budget exceeded: {limit} limit reached (spent ${spent:.4} of ${cap:.4})")]
    BudgetExceeded {
        limit: BudgetLimit,
        spent: f64,
        cap: f64,
    },

    /// The caller's sliding window is full.
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Permission ceiling, patterns and budget leave nothing reachable.
    #[error("No tier available: {reason}")]
    NoTierAvailable { reason: String },
}

impl RoutingError {
    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::BudgetExceeded { .. })
    }

    /// Stable machine-readable label for logs and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "permission_denied",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::RateLimited { .. } => "rate_limited",
            Self::NoTierAvailable { .. } => "no_tier_available",
        }
    }
}

/// Which spend ceiling rejected a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    IdentityDaily,
    IdentityMonthly,
    GlobalDaily,
    GlobalMonthly,
}

impl std::fmt::Display for BudgetLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdentityDaily => write!(f, "daily"),
            Self::IdentityMonthly => write!(f, "monthly"),
            Self::GlobalDaily => write!(f, "global daily"),
            Self::GlobalMonthly => write!(f, "global monthly"),
        }
    }
}

/// A reservation refused by the cost ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetRejection {
    pub limit: BudgetLimit,
    /// Committed plus reserved spend at the time of the check.
    pub spent: f64,
    /// The ceiling that would have been crossed.
    pub cap: f64,
}

impl BudgetRejection {
    /// Remaining headroom under the rejecting ceiling.
    pub fn remaining(&self) -> f64 {
        (self.cap - self.spent).max(0.0)
    }
}

impl From<BudgetRejection> for RoutingError {
    fn from(r: BudgetRejection) -> Self {
        RoutingError::BudgetExceeded {
            limit: r.limit,
            spent: r.spent,
            cap: r.cap,
        }
    }
}
