//! Configuration loading, validation, and management for Tollgate.
//!
//! Loads configuration from `~/.tollgate/config.toml` (or `$TOLLGATE_CONFIG`)
//! plus an optional workspace overlay at `.tollgate/workspace.toml`, applies
//! environment overrides, and validates everything at startup. The routing
//! core only ever sees a snapshot that passed [`AppConfig::validate`].

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tollgate_core::{CapabilityOverride, CapabilityRecord, ComplexityRange, ModelTier, PermissionLevel, TierSet};

/// The root configuration structure.
///
/// Maps directly to `~/.tollgate/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Tier definitions, model selection, escalation, fallback
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Global spend ceilings and ledger persistence
    #[serde(default)]
    pub budgets: BudgetConfig,

    /// Sliding-window rate limiter settings
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,

    /// Global permission layers
    #[serde(default = "default_permissions")]
    pub permissions: PermissionsConfig,

    /// Per-model pricing (USD per 1K tokens)
    #[serde(default)]
    pub pricing: HashMap<String, ModelPriceConfig>,

    /// Tool namespace settings
    #[serde(default)]
    pub tools: ToolsConfig,
}

fn default_true() -> bool {
    true
}

// ── Routing ──────────────────────────────────────────────────────────────

/// How a concrete model is picked within a tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// First listed model that passes the caller's patterns.
    #[default]
    PreferenceOrder,
    /// Rotating cursor per tier.
    RoundRobin,
    /// Cheapest model by the pricing table.
    LowestCost,
    /// Uniformly random.
    Random,
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreferenceOrder => write!(f, "preference_order"),
            Self::RoundRobin => write!(f, "round_robin"),
            Self::LowestCost => write!(f, "lowest_cost"),
            Self::Random => write!(f, "random"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub strategy: SelectionStrategy,

    /// Model used when no tier fits the budget (ceiling-checked).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,

    /// Multiplier headroom added to every cost estimate (floor 0.10).
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,

    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

fn default_safety_margin() -> f64 {
    0.15
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            fallback_model: None,
            safety_margin: default_safety_margin(),
            escalation: EscalationConfig::default(),
            tiers: default_tiers(),
        }
    }
}

impl RoutingConfig {
    /// Convert tier definitions into the core's ordered tier set.
    ///
    /// Tiers without an explicit ordinal take their position in the list.
    pub fn tier_set(&self) -> TierSet {
        TierSet::new(
            self.tiers
                .iter()
                .enumerate()
                .map(|(i, t)| t.to_model_tier(i as u32))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How many ordinals above the caller's ceiling escalation may reach.
    #[serde(default = "default_escalation_distance")]
    pub max_distance: u32,

    /// Reserved: escalation rate limiting is not implemented yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_hour: Option<u32>,
}

fn default_escalation_distance() -> u32 {
    1
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_distance: default_escalation_distance(),
            max_per_hour: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u32>,

    pub models: Vec<String>,

    /// `[min, max]` complexity this tier serves.
    pub complexity_range: [f64; 2],

    #[serde(default)]
    pub cost_per_1k_tokens: f64,

    #[serde(default = "default_tier_context")]
    pub max_context_tokens: u32,
}

fn default_tier_context() -> u32 {
    8_192
}

impl TierConfig {
    fn to_model_tier(&self, position: u32) -> ModelTier {
        ModelTier {
            name: self.name.clone(),
            ordinal: self.ordinal.unwrap_or(position),
            models: self.models.clone(),
            complexity_range: ComplexityRange::new(self.complexity_range[0], self.complexity_range[1]),
            cost_per_1k_tokens: self.cost_per_1k_tokens,
            max_context_tokens: self.max_context_tokens,
        }
    }
}

fn tier(name: &str, models: &[&str], range: [f64; 2], cost: f64, context: u32) -> TierConfig {
    TierConfig {
        name: name.into(),
        ordinal: None,
        models: models.iter().map(|m| m.to_string()).collect(),
        complexity_range: range,
        cost_per_1k_tokens: cost,
        max_context_tokens: context,
    }
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        tier(
            "free",
            &["groq/llama-3.1-8b", "openrouter/meta-llama/llama-3.1-8b"],
            [0.0, 0.3],
            0.0,
            8_192,
        ),
        tier(
            "standard",
            &["anthropic/claude-3.5-haiku", "openai/gpt-4o-mini"],
            [0.0, 0.7],
            0.001,
            16_384,
        ),
        tier(
            "premium",
            &["anthropic/claude-sonnet-4", "openai/gpt-4o"],
            [0.3, 1.0],
            0.01,
            128_000,
        ),
        tier(
            "elite",
            &["anthropic/claude-opus-4", "openai/o1"],
            [0.7, 1.0],
            0.05,
            200_000,
        ),
    ]
}

// ── Budgets ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Daily ceiling across all identities (0 = unlimited)
    #[serde(default)]
    pub global_daily_limit_usd: f64,

    /// Monthly ceiling across all identities (0 = unlimited)
    #[serde(default)]
    pub global_monthly_limit_usd: f64,

    /// UTC hour (0-23) at which daily counters roll over
    #[serde(default)]
    pub reset_hour_utc: u8,

    #[serde(default = "default_true")]
    pub persist: bool,

    /// Ledger file; defaults to `~/.tollgate/ledger.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_max_tracked")]
    pub max_tracked_identities: usize,

    /// Unreported reservations held at once (at most
    /// `max_tracked_identities`); beyond this the oldest is settled at its
    /// estimate
    #[serde(default = "default_max_pending")]
    pub max_pending_reservations: usize,
}

fn default_flush_interval() -> u64 {
    30
}
fn default_max_tracked() -> usize {
    10_000
}
fn default_max_pending() -> usize {
    10_000
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            global_daily_limit_usd: 0.0,
            global_monthly_limit_usd: 0.0,
            reset_hour_utc: 0,
            persist: true,
            ledger_path: None,
            flush_interval_secs: default_flush_interval(),
            max_tracked_identities: default_max_tracked(),
            max_pending_reservations: default_max_pending(),
        }
    }
}

impl BudgetConfig {
    /// Effective ledger path.
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("ledger.json"))
    }
}

// ── Rate limiting ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_max_tracked")]
    pub max_tracked_identities: usize,

    /// Limits above this use a counter approximation instead of timestamps
    #[serde(default = "default_max_exact")]
    pub max_exact_timestamps: usize,
}

fn default_window_secs() -> u64 {
    60
}
fn default_max_exact() -> usize {
    1_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_tracked_identities: default_max_tracked(),
            max_exact_timestamps: default_max_exact(),
        }
    }
}

// ── Permissions ──────────────────────────────────────────────────────────

/// One permission layer: per-level overrides plus keyed caller/channel maps.
///
/// The same shape is used for the global config and the workspace overlay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    pub zero_trust: CapabilityOverride,
    pub standard: CapabilityOverride,
    pub elevated: CapabilityOverride,
    /// Keyed by bare caller id, not `channel:caller_id`. An entry applies to
    /// that caller on every channel, so channels must not share a caller id
    /// namespace unless they authenticate the same principal. Untrusted
    /// identities never reach this layer. Budgets and rate windows stay
    /// per `channel:caller_id` regardless.
    pub users: HashMap<String, CapabilityOverride>,
    /// Keyed by channel name
    pub channels: HashMap<String, CapabilityOverride>,
}

impl PermissionsConfig {
    pub fn level(&self, level: PermissionLevel) -> &CapabilityOverride {
        match level {
            PermissionLevel::ZeroTrust => &self.zero_trust,
            PermissionLevel::Standard => &self.standard,
            PermissionLevel::Elevated => &self.elevated,
        }
    }

    /// Every override in this layer, labelled for diagnostics.
    fn labelled(&self) -> Vec<(String, &CapabilityOverride)> {
        let mut out: Vec<(String, &CapabilityOverride)> = PermissionLevel::ALL
            .iter()
            .map(|l| (format!("permissions.{l}"), self.level(*l)))
            .collect();
        out.extend(self.users.iter().map(|(k, v)| (format!("permissions.users.{k}"), v)));
        out.extend(self.channels.iter().map(|(k, v)| (format!("permissions.channels.{k}"), v)));
        out
    }
}

/// Local operator terminals resolve to the elevated level through a channel
/// override, never through a changed built-in default.
fn default_permissions() -> PermissionsConfig {
    let mut channels = HashMap::new();
    channels.insert(
        "cli".to_string(),
        CapabilityOverride {
            level: Some(PermissionLevel::Elevated),
            ..Default::default()
        },
    );
    PermissionsConfig {
        channels,
        ..Default::default()
    }
}

/// Workspace overlay file shape (`.tollgate/workspace.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub permissions: PermissionsConfig,
}

// ── Pricing & tools ──────────────────────────────────────────────────────

/// Per-1K-token pricing for a single model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPriceConfig {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Reserved: MCP/plugin tool namespace collision handling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_policy: Option<String>,
}

// ── Loading ──────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from `$TOLLGATE_CONFIG` or the default path.
    ///
    /// Environment overrides (highest priority):
    /// - `TOLLGATE_RESET_HOUR`
    /// - `TOLLGATE_LEDGER_PATH`
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("TOLLGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        let mut config = Self::load_from(&path)?;

        if let Ok(hour) = std::env::var("TOLLGATE_RESET_HOUR") {
            config.budgets.reset_hour_utc = hour.parse().map_err(|_| {
                ConfigError::ValidationError(format!("TOLLGATE_RESET_HOUR '{hour}' is not an hour"))
            })?;
        }

        if let Ok(ledger) = std::env::var("TOLLGATE_LEDGER_PATH") {
            config.budgets.ledger_path = Some(PathBuf::from(ledger));
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load a workspace overlay. A missing file means "no workspace layer".
    pub fn load_workspace(&self, path: &Path) -> Result<Option<PermissionsConfig>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let workspace: WorkspaceConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        self.validate_layer(&workspace.permissions, &self.routing.tier_set())?;
        tracing::debug!(path = %path.display(), "Loaded workspace permissions overlay");
        Ok(Some(workspace.permissions))
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tollgate")
    }

    /// Default workspace overlay location, relative to the working directory.
    pub fn workspace_path() -> PathBuf {
        PathBuf::from(".tollgate").join("workspace.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let routing = &self.routing;
        if routing.tiers.is_empty() {
            return Err(ConfigError::ValidationError("routing.tiers must not be empty".into()));
        }

        let mut names = HashSet::new();
        let mut ordinals = HashSet::new();
        for (i, t) in routing.tiers.iter().enumerate() {
            if !names.insert(t.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate tier name '{}'",
                    t.name
                )));
            }
            if !ordinals.insert(t.ordinal.unwrap_or(i as u32)) {
                return Err(ConfigError::ValidationError(format!(
                    "tier '{}' reuses ordinal {}",
                    t.name,
                    t.ordinal.unwrap_or(i as u32)
                )));
            }
            let [min, max] = t.complexity_range;
            if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) || min > max {
                return Err(ConfigError::ValidationError(format!(
                    "tier '{}' complexity_range must satisfy 0 <= min <= max <= 1",
                    t.name
                )));
            }
            if t.cost_per_1k_tokens < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "tier '{}' cost_per_1k_tokens must be >= 0",
                    t.name
                )));
            }
            if t.models.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "tier '{}' must list at least one model",
                    t.name
                )));
            }
        }

        let tiers = routing.tier_set();
        if let Some(fallback) = &routing.fallback_model
            && tiers.tier_of_model(fallback).is_none()
        {
            return Err(ConfigError::ValidationError(format!(
                "fallback_model '{fallback}' is not a member of any tier"
            )));
        }

        if routing.safety_margin < 0.0 {
            return Err(ConfigError::ValidationError("routing.safety_margin must be >= 0".into()));
        }

        if routing.escalation.max_per_hour.is_some() {
            return Err(ConfigError::ValidationError(
                "routing.escalation.max_per_hour is reserved and not supported yet".into(),
            ));
        }

        if self.tools.namespace_policy.is_some() {
            return Err(ConfigError::ValidationError(
                "tools.namespace_policy is reserved and not supported yet".into(),
            ));
        }

        if self.budgets.reset_hour_utc > 23 {
            return Err(ConfigError::ValidationError(
                "budgets.reset_hour_utc must be between 0 and 23".into(),
            ));
        }

        if self.budgets.global_daily_limit_usd < 0.0 || self.budgets.global_monthly_limit_usd < 0.0 {
            return Err(ConfigError::ValidationError("global budget limits must be >= 0".into()));
        }

        if self.rate_limiting.window_secs == 0 {
            return Err(ConfigError::ValidationError("rate_limiting.window_secs must be > 0".into()));
        }

        if self.rate_limiting.max_tracked_identities == 0 || self.budgets.max_tracked_identities == 0 {
            return Err(ConfigError::ValidationError(
                "max_tracked_identities must be > 0".into(),
            ));
        }

        if self.budgets.max_pending_reservations == 0 {
            return Err(ConfigError::ValidationError(
                "budgets.max_pending_reservations must be > 0".into(),
            ));
        }

        if self.budgets.flush_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "budgets.flush_interval_secs must be > 0".into(),
            ));
        }

        for (model, price) in &self.pricing {
            if price.input_per_1k < 0.0 || price.output_per_1k < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "pricing for '{model}' must be >= 0"
                )));
            }
        }

        // Built-in defaults must land on real tiers unless overridden.
        for level in PermissionLevel::ALL {
            if self.permissions.level(level).max_tier.is_none() {
                let builtin = CapabilityRecord::builtin(level);
                if tiers.get(&builtin.max_tier).is_none() {
                    return Err(ConfigError::ValidationError(format!(
                        "built-in {level} ceiling tier '{}' is not defined; set permissions.{level}.max_tier",
                        builtin.max_tier
                    )));
                }
            }
        }

        self.validate_layer(&self.permissions, &tiers)
    }

    /// Field-level checks shared by the global and workspace layers.
    fn validate_layer(&self, layer: &PermissionsConfig, tiers: &TierSet) -> Result<(), ConfigError> {
        for (label, o) in layer.labelled() {
            if let Some(tier) = &o.max_tier
                && tiers.get(tier).is_none()
            {
                return Err(ConfigError::ValidationError(format!(
                    "{label}.max_tier '{tier}' is not a defined tier"
                )));
            }
            if let Some(t) = o.escalation_threshold
                && !(0.0..=1.0).contains(&t)
            {
                return Err(ConfigError::ValidationError(format!(
                    "{label}.escalation_threshold must be between 0 and 1"
                )));
            }
            let negative_budget = o.cost_budget_daily.is_some_and(|b| b < 0.0)
                || o.cost_budget_monthly.is_some_and(|b| b < 0.0);
            if negative_budget {
                return Err(ConfigError::ValidationError(format!(
                    "{label} cost budgets must be >= 0"
                )));
            }
        }
        Ok(())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            budgets: BudgetConfig::default(),
            rate_limiting: RateLimitConfig::default(),
            permissions: default_permissions(),
            pricing: HashMap::new(),
            tools: ToolsConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
