//! Tool invocation policy.
//!
//! Gates the tool-dispatch layer with the same resolved capabilities the
//! router used. Deny by default: no record, an empty name, or an empty allow
//! list all deny.

use tollgate_core::CapabilityRecord;

/// Result of checking a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolVerdict {
    Allow,
    Deny(String),
}

impl ToolVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

impl std::fmt::Display for ToolVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny(reason) => write!(f, "deny: {reason}"),
        }
    }
}

/// Stateless tool permission evaluator.
pub struct ToolPermissionChecker;

impl ToolPermissionChecker {
    /// Check whether `tool_name` may run under `capabilities`.
    ///
    /// Rules:
    /// - Missing capabilities → deny
    /// - Deny list is consulted first and always wins, even over `"*"`
    /// - Allow list must contain the exact name or exactly `"*"`
    /// - Wildcard-looking entries such as `"file_*"` are literal names
    pub fn check(capabilities: Option<&CapabilityRecord>, tool_name: &str) -> ToolVerdict {
        let Some(caps) = capabilities else {
            return ToolVerdict::Deny("No capabilities resolved (deny by default)".into());
        };

        let tool = tool_name.trim();
        if tool.is_empty() {
            return ToolVerdict::Deny("Empty tool name".into());
        }

        if caps.tool_deny.iter().any(|d| d.trim() == tool) {
            return ToolVerdict::Deny(format!("Tool '{tool}' is explicitly denied"));
        }

        if caps.tool_allow.iter().any(|a| a.trim() == "*" || a.trim() == tool) {
            ToolVerdict::Allow
        } else {
            ToolVerdict::Deny(format!(
                "Tool '{}' not in allowlist ({} tools allowed at level {})",
                tool,
                caps.tool_allow.len(),
                caps.level
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::PermissionLevel;

    fn caps(allow: &[&str], deny: &[&str]) -> CapabilityRecord {
        let mut record = CapabilityRecord::builtin(PermissionLevel::Standard);
        record.tool_allow = allow.iter().map(|s| s.to_string()).collect();
        record.tool_deny = deny.iter().map(|s| s.to_string()).collect();
        record
    }

    #[test]
    fn missing_capabilities_deny() {
        assert!(!ToolPermissionChecker::check(None, "read_file").is_allowed());
    }

    #[test]
    fn deny_wins_over_wildcard() {
        let record = caps(&["*"], &["spawn"]);
        assert!(!ToolPermissionChecker::check(Some(&record), "spawn").is_allowed());
        assert!(ToolPermissionChecker::check(Some(&record), "read_file").is_allowed());
    }

    #[test]
    fn exact_match_allows() {
        let record = caps(&["read_file"], &[]);
        assert_eq!(ToolPermissionChecker::check(Some(&record), "read_file"), ToolVerdict::Allow);
        assert!(!ToolPermissionChecker::check(Some(&record), "write_file").is_allowed());
    }

    #[test]
    fn glob_tokens_are_literal() {
        let record = caps(&["file_*"], &[]);
        assert!(!ToolPermissionChecker::check(Some(&record), "file_read").is_allowed());
        assert!(ToolPermissionChecker::check(Some(&record), "file_*").is_allowed());
    }

    #[test]
    fn names_are_trimmed_and_case_sensitive() {
        let record = caps(&["read_file"], &[]);
        assert!(ToolPermissionChecker::check(Some(&record), "  read_file ").is_allowed());
        assert!(!ToolPermissionChecker::check(Some(&record), "Read_File").is_allowed());
    }

    #[test]
    fn empty_name_denied() {
        let record = caps(&["*"], &[]);
        assert!(!ToolPermissionChecker::check(Some(&record), "   ").is_allowed());
    }

    #[test]
    fn empty_allowlist_denies_all() {
        let record = caps(&[], &[]);
        match ToolPermissionChecker::check(Some(&record), "read_file") {
            ToolVerdict::Deny(reason) => assert!(reason.contains("not in allowlist")),
            ToolVerdict::Allow => panic!("empty allowlist must deny"),
        }
    }
}
