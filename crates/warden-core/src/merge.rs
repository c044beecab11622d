//! Merging the payload modifications of one band.
//!
//! Every plugin in a band sees the same band-entry payload, so each
//! modification is a diff against that base. Diffs are applied field by field
//! in registration order: untouched fields keep the base value, appends to a
//! string or array compose, and any other overlapping change is last writer
//! wins.

use serde_json::Value;
use tracing::warn;

use warden_types::errors::WardenError;
use warden_types::hooks::HookPayload;

/// Combine `modified` (registration order) against the band-entry `base`.
///
/// All payloads must be the variant of `base`. If the merged document no
/// longer decodes, the last modification wins outright.
pub(crate) fn merge_band_payloads(
    base: &HookPayload,
    mut modified: Vec<HookPayload>,
) -> HookPayload {
    if modified.len() <= 1 {
        return modified.pop().unwrap_or_else(|| base.clone());
    }
    match three_way_merge(base, &modified) {
        Ok(merged) => merged,
        Err(e) => {
            warn!(
                hook = %base.hook_type(),
                error = %e,
                "band merge failed, keeping last modification"
            );
            modified.pop().unwrap_or_else(|| base.clone())
        }
    }
}

fn three_way_merge(
    base: &HookPayload,
    modified: &[HookPayload],
) -> Result<HookPayload, WardenError> {
    let base_value = base.to_wire()?;
    let mut merged = base_value.clone();
    for payload in modified {
        let changed = payload.to_wire()?;
        merge_value(&mut merged, &base_value, &changed);
    }
    HookPayload::from_wire(base.hook_type(), merged)
}

fn merge_value(target: &mut Value, base: &Value, changed: &Value) {
    if changed == base {
        return;
    }

    if let (Value::Object(t), Value::Object(b), Value::Object(c)) = (&mut *target, base, changed) {
        for (key, c_val) in c {
            match (b.get(key), t.get_mut(key)) {
                (Some(b_val), Some(t_val)) => merge_value(t_val, b_val, c_val),
                // Unchanged against base: an earlier writer's removal stands.
                (b_val, None) if b_val == Some(c_val) => {}
                _ => {
                    t.insert(key.clone(), c_val.clone());
                }
            }
        }
        for key in b.keys() {
            if !c.contains_key(key) {
                t.remove(key);
            }
        }
        return;
    }

    if let (Value::String(t), Value::String(b), Value::String(c)) = (&mut *target, base, changed) {
        if c.starts_with(b.as_str()) && t.starts_with(b.as_str()) {
            t.push_str(&c[b.len()..]);
            return;
        }
    }

    if let (Value::Array(t), Value::Array(b), Value::Array(c)) = (&mut *target, base, changed) {
        if c.starts_with(b) && t.starts_with(b) {
            t.extend(c[b.len()..].iter().cloned());
            return;
        }
    }

    *target = changed.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use warden_types::hooks::ToolPreInvokePayload;

    fn tool(args: Value) -> HookPayload {
        let Value::Object(args) = args else {
            panic!("args must be an object");
        };
        HookPayload::ToolPreInvoke(ToolPreInvokePayload {
            name: "search".to_string(),
            args,
            headers: None,
        })
    }

    fn args(payload: &HookPayload) -> &Map<String, Value> {
        match payload {
            HookPayload::ToolPreInvoke(p) => &p.args,
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn test_no_modifications_returns_base() {
        let base = tool(json!({"q": "x"}));
        assert_eq!(merge_band_payloads(&base, vec![]), base);
    }

    #[test]
    fn test_single_modification_taken_as_is() {
        let base = tool(json!({"q": "x"}));
        let changed = tool(json!({"q": "y", "limit": 3}));
        assert_eq!(
            merge_band_payloads(&base, vec![changed.clone()]),
            changed
        );
    }

    #[test]
    fn test_disjoint_fields_combine() {
        let base = tool(json!({"q": "x", "limit": 10}));
        let a = tool(json!({"q": "redacted", "limit": 10}));
        let b = tool(json!({"q": "x", "limit": 5}));
        let merged = merge_band_payloads(&base, vec![a, b]);
        assert_eq!(args(&merged)["q"], json!("redacted"));
        assert_eq!(args(&merged)["limit"], json!(5));
    }

    #[test]
    fn test_string_appends_compose_in_registration_order() {
        let base = tool(json!({"text": ""}));
        let a = tool(json!({"text": "A"}));
        let b = tool(json!({"text": "B"}));
        let merged = merge_band_payloads(&base, vec![a, b]);
        assert_eq!(args(&merged)["text"], json!("AB"));
    }

    #[test]
    fn test_array_appends_compose() {
        let base = tool(json!({"tags": ["x"]}));
        let a = tool(json!({"tags": ["x", "a"]}));
        let b = tool(json!({"tags": ["x", "b"]}));
        let merged = merge_band_payloads(&base, vec![a, b]);
        assert_eq!(args(&merged)["tags"], json!(["x", "a", "b"]));
    }

    #[test]
    fn test_overlapping_replacement_is_last_writer_wins() {
        let base = tool(json!({"q": "original"}));
        let a = tool(json!({"q": "first"}));
        let b = tool(json!({"q": "second"}));
        let merged = merge_band_payloads(&base, vec![a, b]);
        assert_eq!(args(&merged)["q"], json!("second"));
    }

    #[test]
    fn test_removed_and_added_keys() {
        let base = tool(json!({"secret": "s", "keep": 1}));
        let a = tool(json!({"keep": 1}));
        let b = tool(json!({"secret": "s", "keep": 1, "added": true}));
        let merged = merge_band_payloads(&base, vec![a, b]);
        assert!(!args(&merged).contains_key("secret"));
        assert_eq!(args(&merged)["added"], json!(true));
        assert_eq!(args(&merged)["keep"], json!(1));
    }

    #[test]
    fn test_redaction_survives_sibling_that_only_adds() {
        let base = tool(json!({"ssn": "123-45-6789", "to": "ops"}));
        let redactor = tool(json!({"to": "ops"}));
        let tracer = tool(json!({"ssn": "123-45-6789", "to": "ops", "trace": 1}));
        let merged = merge_band_payloads(&base, vec![redactor, tracer]);
        assert!(!args(&merged).contains_key("ssn"));
        assert_eq!(args(&merged)["trace"], json!(1));
        assert_eq!(args(&merged)["to"], json!("ops"));
    }

    #[test]
    fn test_removed_key_rewritten_by_later_writer_is_kept() {
        let base = tool(json!({"q": "x"}));
        let a = tool(json!({}));
        let b = tool(json!({"q": "y"}));
        let merged = merge_band_payloads(&base, vec![a, b]);
        assert_eq!(args(&merged)["q"], json!("y"));
    }
}
