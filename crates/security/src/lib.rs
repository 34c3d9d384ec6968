//! Security layer for Tollgate: permission resolution, tool policy, and audit.
//!
//! Provides:
//! - **Permissions**: Layered, ceiling-enforced capability resolution
//! - **Tool policy**: Deny-wins allow/deny evaluation for tool invocations
//! - **Audit logging**: Structured records of every admission decision

pub mod audit;
pub mod permissions;
pub mod tool_policy;

pub use audit::{
    AuditEntry, AuditEvent, AuditOutcome, AuditSink, DecisionAuditor, DenialDetails, MemorySink, TracingSink,
    UNRESOLVED_IDENTITY,
};
pub use permissions::{PermissionResolver, resolve};
pub use tool_policy::{ToolPermissionChecker, ToolVerdict};
