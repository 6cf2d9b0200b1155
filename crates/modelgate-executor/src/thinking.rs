//! Model capability registry and thinking/reasoning normalization.
//!
//! Capability lookups classify a model as no-thinking, level-based, or
//! budget-based. Alias tables live here as well so executors never
//! hardcode name mappings in their hot paths.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::{Map, Value, json};

use modelgate_common::{json_delete, json_get, json_set};
use modelgate_protocol::StatusError;

#[derive(Debug, Clone, PartialEq)]
pub enum ThinkingMode {
    /// Categorical effort levels (`low`/`medium`/`high`, ...).
    Levels(Vec<&'static str>),
    /// Integer token budget with a valid range.
    Budget { min: i64, max: i64 },
}

#[derive(Debug, Clone, Default)]
pub struct ModelInfo {
    pub thinking: Option<ThinkingMode>,
    pub max_completion_tokens: Option<i64>,
}

/// Canonical budgets for level suffixes on budget-based models.
pub fn level_budget(level: &str) -> Option<i64> {
    match level {
        "none" => Some(0),
        "low" | "minimal" => Some(1024),
        "medium" => Some(8192),
        "high" => Some(24576),
        _ => None,
    }
}

#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, ModelInfo>>,
    /// external client name -> upstream name
    aliases: RwLock<HashMap<String, String>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-seeded with the models the bundled providers serve.
    pub fn with_builtin_models() -> Self {
        let registry = Self::new();
        for (pattern, info) in builtin_models() {
            registry.insert(pattern, info);
        }
        for (external, upstream) in builtin_aliases() {
            registry.alias(external, upstream);
        }
        registry
    }

    pub fn insert(&self, model: &str, info: ModelInfo) {
        self.models
            .write()
            .expect("model registry lock")
            .insert(model.to_string(), info);
    }

    pub fn alias(&self, external: &str, upstream: &str) {
        self.aliases
            .write()
            .expect("alias table lock")
            .insert(external.to_string(), upstream.to_string());
    }

    pub fn info(&self, model: &str) -> Option<ModelInfo> {
        let guard = self.models.read().expect("model registry lock");
        if let Some(info) = guard.get(model) {
            return Some(info.clone());
        }
        // Longest-prefix family match: "gemini-2.5-pro-exp-0801" picks up
        // "gemini-2.5-pro".
        guard
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, info)| info.clone())
    }

    /// Resolves a client-visible name to the upstream name.
    pub fn upstream_model(&self, external: &str) -> String {
        self.aliases
            .read()
            .expect("alias table lock")
            .get(external)
            .cloned()
            .unwrap_or_else(|| external.to_string())
    }

    /// Resolves an upstream name back to the client-visible alias.
    pub fn external_model(&self, upstream: &str) -> String {
        let guard = self.aliases.read().expect("alias table lock");
        guard
            .iter()
            .find(|(_, v)| v.as_str() == upstream)
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| upstream.to_string())
    }

    pub fn supports_thinking(&self, model: &str) -> bool {
        self.info(model).is_some_and(|info| info.thinking.is_some())
    }

    pub fn uses_levels(&self, model: &str) -> bool {
        matches!(
            self.info(model).and_then(|info| info.thinking),
            Some(ThinkingMode::Levels(_))
        )
    }

    pub fn thinking_levels(&self, model: &str) -> Vec<&'static str> {
        match self.info(model).and_then(|info| info.thinking) {
            Some(ThinkingMode::Levels(levels)) => levels,
            _ => Vec::new(),
        }
    }

    pub fn min_thinking_budget(&self, model: &str) -> Option<i64> {
        match self.info(model).and_then(|info| info.thinking) {
            Some(ThinkingMode::Budget { min, .. }) => Some(min),
            _ => None,
        }
    }

    pub fn max_completion_tokens(&self, model: &str) -> Option<i64> {
        self.info(model).and_then(|info| info.max_completion_tokens)
    }

    /// Clamps a numeric budget into the model's valid range. Negative
    /// budgets mean "dynamic" and pass through as -1.
    pub fn normalize_budget(&self, model: &str, budget: i64) -> i64 {
        if budget < 0 {
            return -1;
        }
        match self.info(model).and_then(|info| info.thinking) {
            Some(ThinkingMode::Budget { min, max }) => budget.clamp(min, max),
            _ => budget,
        }
    }

    /// Case-folds a client effort level onto a supported one, or `None`
    /// when the level is unknown for the model.
    pub fn normalize_level(&self, model: &str, level: &str) -> Option<&'static str> {
        let wanted = level.trim().to_ascii_lowercase();
        self.thinking_levels(model)
            .into_iter()
            .find(|candidate| *candidate == wanted)
    }
}

fn builtin_models() -> Vec<(&'static str, ModelInfo)> {
    let budget = |min, max, cap| ModelInfo {
        thinking: Some(ThinkingMode::Budget { min, max }),
        max_completion_tokens: Some(cap),
    };
    let levels = |levels: Vec<&'static str>, cap| ModelInfo {
        thinking: Some(ThinkingMode::Levels(levels)),
        max_completion_tokens: Some(cap),
    };
    let plain = |cap| ModelInfo {
        thinking: None,
        max_completion_tokens: Some(cap),
    };
    vec![
        ("gemini-2.5-pro", budget(128, 32768, 65536)),
        ("gemini-2.5-flash", budget(0, 24576, 65536)),
        ("gemini-3-pro-preview", levels(vec!["low", "high"], 65536)),
        ("gemini-3-flash-preview", levels(vec!["low", "medium", "high"], 65536)),
        ("claude-sonnet-4-5", budget(1024, 32000, 64000)),
        ("claude-sonnet-4-6", budget(1024, 32000, 64000)),
        ("claude-opus-4-5", budget(1024, 32000, 32000)),
        ("claude-opus-4-6", budget(1024, 32000, 32000)),
        ("gpt-5", levels(vec!["minimal", "low", "medium", "high"], 128000)),
        ("gpt-4.1", plain(32768)),
        ("qwen3-coder", plain(65536)),
    ]
}

fn builtin_aliases() -> Vec<(&'static str, &'static str)> {
    vec![
        ("gemini-3-pro-preview", "gemini-3-pro-high"),
        ("gemini-3-flash-preview", "gemini-3-flash"),
        ("gemini-claude-sonnet-4-5", "claude-sonnet-4-5"),
        ("gemini-claude-sonnet-4-6", "claude-sonnet-4-6"),
        ("gemini-claude-opus-4-5-thinking", "claude-opus-4-5-thinking"),
        ("gemini-claude-opus-4-6-thinking", "claude-opus-4-6-thinking"),
        (
            "gemini-2.5-computer-use-preview-10-2025",
            "rev19-uic3-1p",
        ),
    ]
}

/// A parsed `model(suffix)` form: `gemini-2.5-pro(high)` or
/// `claude-sonnet-4-5(8192)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSuffix {
    pub base: String,
    pub effort: Option<String>,
    pub budget: Option<i64>,
}

pub fn parse_model_suffix(model: &str) -> ModelSuffix {
    let trimmed = model.trim();
    if let Some(open) = trimmed.rfind('(')
        && trimmed.ends_with(')')
        && open > 0
    {
        let base = trimmed[..open].trim().to_string();
        let inner = trimmed[open + 1..trimmed.len() - 1].trim();
        if let Ok(budget) = inner.parse::<i64>() {
            return ModelSuffix {
                base,
                effort: None,
                budget: Some(budget),
            };
        }
        if !inner.is_empty() {
            return ModelSuffix {
                base,
                effort: Some(inner.to_ascii_lowercase()),
                budget: None,
            };
        }
    }
    ModelSuffix {
        base: trimmed.to_string(),
        effort: None,
        budget: None,
    }
}

/// Metadata keys the router fills from the model suffix.
pub const META_REASONING_EFFORT: &str = "reasoning_effort";
pub const META_THINKING_BUDGET: &str = "thinking_budget";

/// Turns a parsed suffix into request metadata.
pub fn suffix_metadata(suffix: &ModelSuffix) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(effort) = &suffix.effort {
        out.insert(META_REASONING_EFFORT.to_string(), json!(effort));
    }
    if let Some(budget) = suffix.budget {
        out.insert(META_THINKING_BUDGET.to_string(), json!(budget));
    }
    out
}

/// Flat-body (OpenAI-style) thinking normalization, per capability class:
/// no-thinking strips reasoning fields, level-based normalizes them, and
/// budget-based drops effort strings.
pub fn normalize_flat_thinking(
    registry: &ModelRegistry,
    mut payload: Value,
    model: &str,
    allow_compat: bool,
) -> Value {
    if !registry.supports_thinking(model) {
        if !allow_compat {
            for field in ["reasoning", "thinking", "reasoning_effort", "reasoning.effort"] {
                json_delete(&mut payload, field);
            }
        }
        return payload;
    }
    if registry.uses_levels(model) {
        for field in ["reasoning_effort", "reasoning.effort"] {
            if let Some(level) = json_get(&payload, field).and_then(Value::as_str)
                && let Some(normalized) = registry.normalize_level(model, level)
            {
                json_set(&mut payload, field, json!(normalized));
            }
        }
        return payload;
    }
    // Budget-based: effort strings do not apply.
    json_delete(&mut payload, "reasoning_effort");
    json_delete(&mut payload, "reasoning.effort");
    payload
}

/// Rejects unknown effort levels on level-based models with HTTP 400.
pub fn validate_thinking(
    registry: &ModelRegistry,
    payload: &Value,
    model: &str,
) -> Result<(), StatusError> {
    if !registry.supports_thinking(model) || !registry.uses_levels(model) {
        return Ok(());
    }
    for field in ["reasoning_effort", "reasoning.effort"] {
        if let Some(level) = json_get(payload, field).and_then(Value::as_str)
            && registry.normalize_level(model, level).is_none()
        {
            return Err(StatusError::bad_request(format!(
                "unsupported reasoning effort level {level:?} for model {model} (supported: {})",
                registry.thinking_levels(model).join(", ")
            )));
        }
    }
    Ok(())
}

/// Applies model-suffix metadata onto a Gemini-shaped payload under `root`.
/// Metadata wins over client-provided values.
pub fn apply_thinking_metadata(
    registry: &ModelRegistry,
    mut payload: Value,
    metadata: &Map<String, Value>,
    model: &str,
    root: &str,
) -> Value {
    if metadata.is_empty() || !registry.supports_thinking(model) {
        return payload;
    }
    let config_path = join_path(root, "generationConfig.thinkingConfig");

    if registry.uses_levels(model) {
        if let Some(effort) = metadata.get(META_REASONING_EFFORT).and_then(Value::as_str)
            && let Some(level) = registry.normalize_level(model, effort)
        {
            json_set(
                &mut payload,
                &format!("{config_path}.thinkingLevel"),
                json!(level),
            );
        }
        return payload;
    }

    let budget = metadata
        .get(META_THINKING_BUDGET)
        .and_then(Value::as_i64)
        .or_else(|| {
            metadata
                .get(META_REASONING_EFFORT)
                .and_then(Value::as_str)
                .and_then(level_budget)
        });
    if let Some(budget) = budget {
        let normalized = registry.normalize_budget(model, budget);
        json_set(
            &mut payload,
            &format!("{config_path}.thinkingBudget"),
            json!(normalized),
        );
        json_set(
            &mut payload,
            &format!("{config_path}.includeThoughts"),
            json!(true),
        );
    }
    payload
}

pub(crate) fn join_path(root: &str, path: &str) -> String {
    let root = root.trim().trim_matches('.');
    let path = path.trim().trim_start_matches('.');
    if root.is_empty() {
        path.to_string()
    } else if path.is_empty() {
        root.to_string()
    } else {
        format!("{root}.{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_parsing() {
        assert_eq!(
            parse_model_suffix("gemini-2.5-pro(high)"),
            ModelSuffix {
                base: "gemini-2.5-pro".to_string(),
                effort: Some("high".to_string()),
                budget: None,
            }
        );
        assert_eq!(
            parse_model_suffix("claude-sonnet-4-5(8192)").budget,
            Some(8192)
        );
        assert_eq!(parse_model_suffix("gpt-5").base, "gpt-5");
    }

    #[test]
    fn budget_normalization_clamps() {
        let registry = ModelRegistry::with_builtin_models();
        assert_eq!(registry.normalize_budget("gemini-2.5-pro", 64), 128);
        assert_eq!(registry.normalize_budget("gemini-2.5-pro", 99_999), 32768);
        assert_eq!(registry.normalize_budget("gemini-2.5-pro", -5), -1);
    }

    #[test]
    fn metadata_overrides_client_budget() {
        let registry = ModelRegistry::with_builtin_models();
        let payload = json!({"request": {"generationConfig": {"thinkingConfig": {"thinkingBudget": 64}}}});
        let suffix = parse_model_suffix("gemini-2.5-pro(high)");
        let metadata = suffix_metadata(&suffix);
        let out = apply_thinking_metadata(&registry, payload, &metadata, &suffix.base, "request");
        assert_eq!(
            json_get(&out, "request.generationConfig.thinkingConfig.thinkingBudget"),
            Some(&json!(24576))
        );
    }

    #[test]
    fn flat_normalization_by_capability() {
        let registry = ModelRegistry::with_builtin_models();

        // No thinking support: fields are stripped.
        let payload = json!({"reasoning_effort": "high", "thinking": {"type": "enabled"}});
        let out = normalize_flat_thinking(&registry, payload, "gpt-4.1", false);
        assert!(out.get("reasoning_effort").is_none());
        assert!(out.get("thinking").is_none());

        // Level-based: level normalized, unknown rejected by validation.
        let payload = json!({"reasoning_effort": "HIGH"});
        let out = normalize_flat_thinking(&registry, payload, "gpt-5", false);
        assert_eq!(out["reasoning_effort"], "high");
        let err = validate_thinking(&registry, &json!({"reasoning_effort": "extreme"}), "gpt-5")
            .unwrap_err();
        assert_eq!(err.code, 400);

        // Budget-based: effort strings are dropped.
        let payload = json!({"reasoning_effort": "high"});
        let out = normalize_flat_thinking(&registry, payload, "claude-sonnet-4-5", false);
        assert!(out.get("reasoning_effort").is_none());
    }

    #[test]
    fn alias_round_trip() {
        let registry = ModelRegistry::with_builtin_models();
        assert_eq!(
            registry.upstream_model("gemini-3-pro-preview"),
            "gemini-3-pro-high"
        );
        assert_eq!(
            registry.external_model("gemini-3-pro-high"),
            "gemini-3-pro-preview"
        );
        assert_eq!(registry.upstream_model("unmapped"), "unmapped");
    }

    #[test]
    fn family_prefix_lookup() {
        let registry = ModelRegistry::with_builtin_models();
        assert!(registry.supports_thinking("gemini-2.5-pro-exp-0801"));
        assert!(registry.uses_levels("gpt-5-codex"));
    }
}
