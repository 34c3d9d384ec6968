//! # Tollgate Core
//!
//! Domain types and error definitions for the Tollgate admission-control core.
//! This crate has **no policy logic**; it defines the vocabulary that the
//! resolver, ledger, limiter and router crates share.
//!
//! ## Design Philosophy
//!
//! Permissions are resolved exactly once (in `tollgate-security`) into a
//! [`CapabilityRecord`]; every other component consumes that record and never
//! re-derives access rules. Override layers use `Option` fields so "unset"
//! and "explicitly empty" can never be confused.

pub mod capability;
pub mod decision;
pub mod error;
pub mod identity;
pub mod pattern;
pub mod shard;
pub mod tier;

// Re-export key types at crate root for ergonomics
pub use capability::{CapabilityOverride, CapabilityRecord, PermissionLevel};
pub use decision::{ReservationId, RouteRequest, RoutingDecision};
pub use error::{BudgetLimit, BudgetRejection, RoutingError};
pub use identity::Identity;
pub use shard::ShardedLru;
pub use tier::{ComplexityRange, ModelTier, TierSet};
