//! Model allow/deny pattern matching.
//!
//! Model patterns support exactly two wildcard forms: a bare `"*"` (every
//! model) and a trailing `*` prefix match (`"anthropic/*"`). Anything else is
//! compared literally. Tool names never use this module; tool lists only
//! honour an exact `"*"` (see `tollgate-security::tool_policy`).

/// Whether a single model pattern matches `model`.
pub fn model_pattern_matches(pattern: &str, model: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) if !prefix.contains('*') => model.starts_with(prefix),
        _ => pattern == model,
    }
}

/// Whether any pattern in `patterns` matches `model`.
pub fn any_model_pattern(patterns: &[String], model: &str) -> bool {
    patterns.iter().any(|p| model_pattern_matches(p, model))
}

/// Deny wins; otherwise the model must match the allow list.
///
/// An empty allow list permits nothing.
pub fn model_permitted(allow: &[String], deny: &[String], model: &str) -> bool {
    !any_model_pattern(deny, model) && any_model_pattern(allow, model)
}
