//! Permission levels, resolved capability records, and override layers.
//!
//! A [`CapabilityRecord`] is always concrete: every field holds a value.
//! A [`CapabilityOverride`] is the config-layer shape where every field is
//! optional. `None` means "inherit", while `Some(vec![])` means "explicitly
//! empty" and replaces the inherited list.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Ordinal trust level of a caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PermissionLevel {
    /// Level 0: unauthenticated or unknown callers.
    #[default]
    ZeroTrust,
    /// Level 1: known users.
    Standard,
    /// Level 2: operators and administrators.
    Elevated,
}

impl PermissionLevel {
    pub const ALL: [PermissionLevel; 3] = [Self::ZeroTrust, Self::Standard, Self::Elevated];

    pub fn ordinal(self) -> u8 {
        match self {
            Self::ZeroTrust => 0,
            Self::Standard => 1,
            Self::Elevated => 2,
        }
    }

    pub fn from_ordinal(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::ZeroTrust),
            1 => Some(Self::Standard),
            2 => Some(Self::Elevated),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ZeroTrust => "zero_trust",
            Self::Standard => "standard",
            Self::Elevated => "elevated",
        }
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "zero_trust" | "zero-trust" | "zerotrust" | "0" => Ok(Self::ZeroTrust),
            "standard" | "user" | "1" => Ok(Self::Standard),
            "elevated" | "admin" | "2" => Ok(Self::Elevated),
            other => Err(format!(
                "invalid permission level '{other}', expected: zero_trust, standard, elevated"
            )),
        }
    }
}

impl Serialize for PermissionLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PermissionLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Ordinal(u8),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Name(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Ordinal(n) => Self::from_ordinal(n).ok_or_else(|| {
                serde::de::Error::custom(format!("permission level {n} out of range 0..=2"))
            }),
        }
    }
}

/// The resolved, concrete permission set for one caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub level: PermissionLevel,
    /// Highest model tier reachable without escalation.
    pub max_tier: String,
    pub model_allow: Vec<String>,
    pub model_deny: Vec<String>,
    pub tool_allow: Vec<String>,
    pub tool_deny: Vec<String>,
    pub max_context_tokens: u32,
    pub max_output_tokens: u32,
    /// Requests per rate window. 0 = unlimited.
    pub rate_limit: u32,
    pub streaming_allowed: bool,
    pub escalation_allowed: bool,
    /// Complexity at or above which escalation may trigger.
    pub escalation_threshold: f64,
    pub can_override_model: bool,
    /// USD per day. 0.0 = unlimited.
    pub cost_budget_daily: f64,
    /// USD per month. 0.0 = unlimited.
    pub cost_budget_monthly: f64,
    /// Forward-compatible custom dimensions.
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// Tools a standard-level caller may use out of the box.
const STANDARD_TOOLS: &[&str] = &[
    "read_file",
    "write_file",
    "edit_file",
    "list_directory",
    "web_search",
    "web_fetch",
    "message",
];

impl CapabilityRecord {
    /// Hard-coded defaults for a level: the lowest resolution layer.
    pub fn builtin(level: PermissionLevel) -> Self {
        match level {
            PermissionLevel::ZeroTrust => Self {
                level,
                max_tier: "free".into(),
                model_allow: vec!["*".into()],
                model_deny: vec![],
                tool_allow: vec![],
                tool_deny: vec![],
                max_context_tokens: 4_096,
                max_output_tokens: 1_024,
                rate_limit: 10,
                streaming_allowed: false,
                escalation_allowed: false,
                escalation_threshold: 1.0,
                can_override_model: false,
                cost_budget_daily: 0.10,
                cost_budget_monthly: 2.00,
                extensions: BTreeMap::new(),
            },
            PermissionLevel::Standard => Self {
                level,
                max_tier: "standard".into(),
                model_allow: vec!["*".into()],
                model_deny: vec![],
                tool_allow: STANDARD_TOOLS.iter().map(|t| t.to_string()).collect(),
                tool_deny: vec![],
                max_context_tokens: 16_384,
                max_output_tokens: 4_096,
                rate_limit: 60,
                streaming_allowed: true,
                escalation_allowed: true,
                escalation_threshold: 0.6,
                can_override_model: false,
                cost_budget_daily: 5.00,
                cost_budget_monthly: 100.00,
                extensions: BTreeMap::new(),
            },
            PermissionLevel::Elevated => Self {
                level,
                max_tier: "elite".into(),
                model_allow: vec!["*".into()],
                model_deny: vec![],
                tool_allow: vec!["*".into()],
                tool_deny: vec![],
                max_context_tokens: 200_000,
                max_output_tokens: 16_384,
                rate_limit: 0,
                streaming_allowed: true,
                escalation_allowed: true,
                escalation_threshold: 0.0,
                can_override_model: true,
                cost_budget_daily: 0.0,
                cost_budget_monthly: 0.0,
                extensions: BTreeMap::new(),
            },
        }
    }

    /// Whether the tool allow list grants everything.
    pub fn allows_all_tools(&self) -> bool {
        self.tool_allow.iter().any(|t| t == "*")
    }
}

/// One config layer's opinion on a capability record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapabilityOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<PermissionLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_allow: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_deny: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_allow: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_deny: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming_allowed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_allowed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_override_model: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_budget_daily: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_budget_monthly: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<BTreeMap<String, serde_json::Value>>,
}

impl CapabilityOverride {
    /// True when the override would change nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering_follows_ordinal() {
        assert!(PermissionLevel::ZeroTrust < PermissionLevel::Standard);
        assert!(PermissionLevel::Standard < PermissionLevel::Elevated);
        for level in PermissionLevel::ALL {
            assert_eq!(PermissionLevel::from_ordinal(level.ordinal()), Some(level));
        }
        assert_eq!(PermissionLevel::from_ordinal(3), None);
    }

    #[test]
    fn level_deserializes_from_name_or_ordinal() {
        let by_name: PermissionLevel = serde_json::from_str(r#""elevated""#).unwrap();
        let by_num: PermissionLevel = serde_json::from_str("1").unwrap();
        assert_eq!(by_name, PermissionLevel::Elevated);
        assert_eq!(by_num, PermissionLevel::Standard);
        assert!(serde_json::from_str::<PermissionLevel>("7").is_err());
        assert!(serde_json::from_str::<PermissionLevel>(r#""root""#).is_err());
    }

    #[test]
    fn builtin_levels_are_ordered_by_privilege() {
        let zero = CapabilityRecord::builtin(PermissionLevel::ZeroTrust);
        let standard = CapabilityRecord::builtin(PermissionLevel::Standard);
        let elevated = CapabilityRecord::builtin(PermissionLevel::Elevated);

        assert!(zero.tool_allow.is_empty());
        assert!(!zero.escalation_allowed);
        assert!(!standard.allows_all_tools());
        assert!(elevated.allows_all_tools());
        assert!(zero.max_context_tokens < standard.max_context_tokens);
        assert!(standard.max_context_tokens < elevated.max_context_tokens);
        assert_eq!(elevated.rate_limit, 0);
    }

    #[test]
    fn override_distinguishes_unset_from_empty() {
        let unset: CapabilityOverride = serde_json::from_str("{}").unwrap();
        let empty: CapabilityOverride = serde_json::from_str(r#"{"tool_allow":[]}"#).unwrap();
        assert!(unset.is_empty());
        assert_eq!(unset.tool_allow, None);
        assert_eq!(empty.tool_allow, Some(vec![]));
        assert!(!empty.is_empty());
    }

    #[test]
    fn override_rejects_unknown_fields() {
        let result = serde_json::from_str::<CapabilityOverride>(r#"{"max_tierr":"elite"}"#);
        assert!(result.is_err());
    }
}
