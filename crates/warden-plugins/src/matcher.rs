//! Condition matching: decides whether a plugin applies to one hook call.
//!
//! Pure functions, no I/O. A plugin with no conditions applies everywhere.
//! Rules are OR'd; within a rule every non-empty field must match.

use serde_json::{Map, Value};

use warden_types::config::{AppliedTo, MatchRule, PluginConfig, TargetBinding};
use warden_types::context::{CallIdentity, CallScope};
use warden_types::hooks::{HookPayload, TargetKind};

/// Everything a rule can be matched against for one call.
#[derive(Debug, Clone, Copy)]
pub struct MatchIdentity<'a> {
    pub call: &'a CallIdentity,
    /// Tool name, prompt id, or resource URI; `None` for HTTP hooks.
    pub target: Option<(TargetKind, &'a str)>,
}

impl<'a> MatchIdentity<'a> {
    pub fn new(call: &'a CallIdentity, payload: &'a HookPayload) -> Self {
        let target = payload
            .hook_type()
            .target_kind()
            .zip(payload.target_name());
        Self { call, target }
    }
}

/// Whether any rule in `conditions` matches. Empty conditions match everything.
pub fn matches(conditions: &[MatchRule], identity: &MatchIdentity<'_>) -> bool {
    conditions.is_empty() || conditions.iter().any(|rule| rule_matches(rule, identity))
}

/// Whether every specified field of `rule` matches.
pub fn rule_matches(rule: &MatchRule, identity: &MatchIdentity<'_>) -> bool {
    if !field_matches(&rule.server_ids, identity.call.server_id.as_deref()) {
        return false;
    }
    if !field_matches(&rule.tenant_ids, identity.call.tenant_id.as_deref()) {
        return false;
    }
    // Anonymous calls are not constrained by user patterns.
    if let Some(user) = identity.call.user.as_deref() {
        if !rule.user_patterns.is_empty()
            && !rule.user_patterns.iter().any(|p| user.contains(p.as_str()))
        {
            return false;
        }
    }

    // Name filters only constrain hooks of their own category.
    match identity.target {
        Some((TargetKind::Tool, name)) => field_matches(&rule.tools, Some(name)),
        Some((TargetKind::Prompt, name)) => field_matches(&rule.prompts, Some(name)),
        Some((TargetKind::Resource, name)) => field_matches(&rule.resources, Some(name)),
        None => true,
    }
}

/// Decide whether `plugin` runs for this call and, if so, with which scope.
///
/// Returns `None` on a condition or `applied_to` mismatch. The scope merges
/// the extensions of every matching rule (in order) and then the matching
/// `applied_to` binding's extensions, key by key.
pub fn resolve_scope(plugin: &PluginConfig, identity: &MatchIdentity<'_>) -> Option<CallScope> {
    if !matches(&plugin.conditions, identity) {
        return None;
    }

    let mut scope = CallScope::default();
    for rule in plugin.conditions.iter().filter(|r| rule_matches(r, identity)) {
        merge_extensions(&mut scope.extensions, &rule.extensions);
    }

    if let (Some(applied_to), Some((kind, name))) = (&plugin.applied_to, identity.target) {
        let bindings = bindings_for(applied_to, kind);
        if !bindings.is_empty() {
            let binding = bindings.iter().find(|b| b.name == name)?;
            merge_extensions(&mut scope.extensions, &binding.extensions);
            scope.context_paths = binding.context.clone();
        }
    }
    Some(scope)
}

fn bindings_for(applied_to: &AppliedTo, kind: TargetKind) -> &[TargetBinding] {
    match kind {
        TargetKind::Tool => &applied_to.tools,
        TargetKind::Prompt => &applied_to.prompts,
        TargetKind::Resource => &applied_to.resources,
    }
}

fn field_matches(allowed: &[String], value: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    value.is_some_and(|v| allowed.iter().any(|a| a == v))
}

fn merge_extensions(into: &mut Map<String, Value>, from: &Map<String, Value>) {
    for (key, value) in from {
        into.insert(key.clone(), value.clone());
    }
}
