//! Request routing and admission for Tollgate.
//!
//! The [`AdmissionController`] is the entry point: it resolves the caller's
//! capabilities, asks the [`TieredRouter`] for a tier and model, reserves
//! budget, applies the [`RateLimiter`], and settles reservations once actual
//! usage is known.

pub mod admission;
pub mod rate_limit;
pub mod selection;
pub mod tiered;

pub use admission::AdmissionController;
pub use rate_limit::{RateCheck, RateLimitSettings, RateLimiter};
pub use selection::ModelSelector;
pub use tiered::{Admitted, MIN_SAFETY_MARGIN, PlanPreview, RouterSettings, TieredRouter};
