//! Cost accounting and budget enforcement for Tollgate.
//!
//! Provides the per-identity and global spend ledger with atomic
//! check-and-reserve, reconciliation of estimated against actual cost,
//! forward-only daily/monthly resets, per-model pricing, and best-effort
//! background persistence.

pub mod ledger;
pub mod pricing;
pub mod store;

pub use ledger::{CostTracker, LedgerSettings, LedgerSnapshot, PeriodMarkers, PeriodUsage, PersistedEntry, PriceBasis, UsageSnapshot};
pub use pricing::{ModelPricing, PricingTable};
pub use store::{FileLedgerStore, LedgerStore, MemoryLedgerStore, flush, restore, spawn_flush_task};

/// Errors from the ledger subsystem.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("incompatible ledger: {0}")]
    Incompatible(String),

    #[error("background task failed: {0}")]
    Task(String),
}
