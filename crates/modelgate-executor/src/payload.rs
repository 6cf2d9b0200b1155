//! Declarative payload rule application.
//!
//! Rules are matched by protocol (case-insensitive) and model glob; the
//! candidate set covers the upstream model and the client-requested name
//! in base and suffixed form. Paths are relative to a per-provider root
//! (`""` for flat bodies, `"request"` for CLI envelopes).

use std::collections::HashSet;

use serde_json::Value;

use modelgate_common::{
    PayloadRuleMatch, PayloadRules, json_delete, json_get, json_set, match_model_pattern,
};

use crate::thinking::{join_path, parse_model_suffix};

/// Candidate model names for rule matching, deduplicated case-insensitively.
pub fn model_candidates(model: &str, requested_model: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |value: &str| {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        if seen.insert(value.to_ascii_lowercase()) {
            out.push(value.to_string());
        }
    };
    push(model);
    let parsed = parse_model_suffix(requested_model);
    push(&parsed.base);
    if parsed.effort.is_some() || parsed.budget.is_some() {
        push(requested_model);
    }
    out
}

fn rule_matches(matchers: &[PayloadRuleMatch], protocol: &str, candidates: &[String]) -> bool {
    if matchers.is_empty() || candidates.is_empty() {
        return false;
    }
    for candidate in candidates {
        for matcher in matchers {
            let name = matcher.name.trim();
            if name.is_empty() {
                continue;
            }
            if let Some(rule_protocol) = matcher.protocol.as_deref().map(str::trim)
                && !rule_protocol.is_empty()
                && !protocol.is_empty()
                && !rule_protocol.eq_ignore_ascii_case(protocol)
            {
                continue;
            }
            if match_model_pattern(name, candidate) {
                return true;
            }
        }
    }
    false
}

/// Applies the configured rules in order: default, default-raw, override,
/// override-raw, filter. Defaults check the *original translated* payload
/// and are first-write-wins; overrides are last-write-wins.
pub fn apply_payload_rules(
    rules: &PayloadRules,
    model: &str,
    requested_model: &str,
    protocol: &str,
    root: &str,
    mut payload: Value,
    original: &Value,
) -> Value {
    if rules.is_empty() {
        return payload;
    }
    let candidates = model_candidates(model, requested_model);
    if candidates.is_empty() {
        return payload;
    }
    let source = if original.is_null() { &payload } else { original };
    let source = source.clone();

    let mut applied_defaults: HashSet<String> = HashSet::new();
    for rule in &rules.default {
        if !rule_matches(&rule.models, protocol, &candidates) {
            continue;
        }
        for (path, value) in &rule.params {
            let full_path = join_path(root, path);
            if full_path.is_empty()
                || json_get(&source, &full_path).is_some()
                || applied_defaults.contains(&full_path)
            {
                continue;
            }
            json_set(&mut payload, &full_path, value.clone());
            applied_defaults.insert(full_path);
        }
    }
    for rule in &rules.default_raw {
        if !rule_matches(&rule.models, protocol, &candidates) {
            continue;
        }
        for (path, raw) in &rule.params {
            let full_path = join_path(root, path);
            if full_path.is_empty()
                || json_get(&source, &full_path).is_some()
                || applied_defaults.contains(&full_path)
            {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(raw) else {
                continue;
            };
            json_set(&mut payload, &full_path, value);
            applied_defaults.insert(full_path);
        }
    }
    for rule in &rules.override_ {
        if !rule_matches(&rule.models, protocol, &candidates) {
            continue;
        }
        for (path, value) in &rule.params {
            let full_path = join_path(root, path);
            if !full_path.is_empty() {
                json_set(&mut payload, &full_path, value.clone());
            }
        }
    }
    for rule in &rules.override_raw {
        if !rule_matches(&rule.models, protocol, &candidates) {
            continue;
        }
        for (path, raw) in &rule.params {
            let full_path = join_path(root, path);
            if full_path.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(raw) else {
                continue;
            };
            json_set(&mut payload, &full_path, value);
        }
    }
    for rule in &rules.filter {
        if !rule_matches(&rule.models, protocol, &candidates) {
            continue;
        }
        for path in &rule.params {
            let full_path = join_path(root, path);
            if !full_path.is_empty() {
                json_delete(&mut payload, &full_path);
            }
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_common::{PayloadFilterRule, PayloadParamRule, PayloadRawRule};
    use serde_json::json;

    fn matcher(name: &str, protocol: Option<&str>) -> PayloadRuleMatch {
        PayloadRuleMatch {
            name: name.to_string(),
            protocol: protocol.map(str::to_string),
        }
    }

    fn rules() -> PayloadRules {
        PayloadRules {
            default: vec![PayloadParamRule {
                models: vec![matcher("gemini-*", Some("antigravity"))],
                params: [(
                    "generationConfig.temperature".to_string(),
                    json!(0.7),
                )]
                .into(),
            }],
            default_raw: vec![PayloadRawRule {
                models: vec![matcher("gemini-*", None)],
                params: [(
                    "generationConfig.topP".to_string(),
                    "0.9".to_string(),
                )]
                .into(),
            }],
            override_: vec![PayloadParamRule {
                models: vec![matcher("*", None)],
                params: [("userAgent".to_string(), json!("modelgate"))].into(),
            }],
            override_raw: vec![],
            filter: vec![PayloadFilterRule {
                models: vec![matcher("*", None)],
                params: vec!["safetySettings".to_string()],
            }],
        }
    }

    #[test]
    fn defaults_respect_original_payload() {
        let payload = json!({"request": {"safetySettings": []}});
        // The client already set temperature in the original request, so
        // the default must not fire even though the working copy lost it.
        let original = json!({"request": {"generationConfig": {"temperature": 0.1}}});
        let out = apply_payload_rules(
            &rules(),
            "gemini-2.5-pro",
            "gemini-2.5-pro",
            "antigravity",
            "request",
            payload,
            &original,
        );
        assert!(json_get(&out, "request.generationConfig.temperature").is_none());
        assert_eq!(json_get(&out, "request.generationConfig.topP"), Some(&json!(0.9)));
        assert_eq!(json_get(&out, "request.userAgent"), Some(&json!("modelgate")));
        assert!(json_get(&out, "request.safetySettings").is_none());
    }

    #[test]
    fn protocol_mismatch_skips_rule() {
        let payload = json!({});
        let out = apply_payload_rules(
            &rules(),
            "gemini-2.5-pro",
            "",
            "openai",
            "",
            payload,
            &Value::Null,
        );
        // The antigravity-only default does not apply on openai protocol.
        assert!(json_get(&out, "generationConfig.temperature").is_none());
        // Protocol-free rules still do.
        assert_eq!(json_get(&out, "generationConfig.topP"), Some(&json!(0.9)));
    }

    #[test]
    fn suffixed_requested_model_matches() {
        let mut rules = PayloadRules::default();
        rules.override_ = vec![PayloadParamRule {
            models: vec![matcher("gemini-2.5-pro(high)", None)],
            params: [("marker".to_string(), json!(true))].into(),
        }];
        let out = apply_payload_rules(
            &rules,
            "gemini-2.5-pro-high-internal",
            "gemini-2.5-pro(high)",
            "antigravity",
            "",
            json!({}),
            &Value::Null,
        );
        assert_eq!(json_get(&out, "marker"), Some(&json!(true)));
    }

    #[test]
    fn candidates_deduplicate() {
        let candidates = model_candidates("gemini-2.5-pro", "gemini-2.5-pro(8192)");
        assert_eq!(
            candidates,
            vec!["gemini-2.5-pro".to_string(), "gemini-2.5-pro(8192)".to_string()]
        );
    }
}
