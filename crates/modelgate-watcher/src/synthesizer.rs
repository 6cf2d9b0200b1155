//! Auth synthesis from inline config keys and auth-directory JSON files.

use std::path::Path;

use serde_json::Value;
use time::OffsetDateTime;

use modelgate_auth::{Auth, AuthStatus, StableIdGenerator};
use modelgate_common::{ApiKeyEntry, GatewayConfig, content_hash};

/// Inputs for one synthesis pass. `now` is injected so synthesis is
/// deterministic under test.
pub struct SynthesisContext<'a> {
    pub config: &'a GatewayConfig,
    pub now: OffsetDateTime,
    pub id_generator: StableIdGenerator,
}

/// Synthesizes `Auth` records from the configured API-key arrays.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigSynthesizer;

impl ConfigSynthesizer {
    pub fn new() -> Self {
        Self
    }

    pub fn synthesize(&self, ctx: &SynthesisContext<'_>) -> Vec<Auth> {
        let mut out = Vec::new();
        for (provider, entries) in [
            ("gemini", &ctx.config.gemini_keys),
            ("codex", &ctx.config.codex_keys),
            ("claude", &ctx.config.claude_keys),
            ("openai-compat", &ctx.config.openai_compat_keys),
        ] {
            for entry in entries {
                if let Some(auth) = synthesize_entry(ctx, provider, entry) {
                    out.push(auth);
                }
            }
        }
        out
    }
}

fn synthesize_entry(
    ctx: &SynthesisContext<'_>,
    provider: &str,
    entry: &ApiKeyEntry,
) -> Option<Auth> {
    let key = entry.api_key.trim();
    if key.is_empty() {
        return None;
    }
    let base_url = entry.base_url.as_deref().map(str::trim).unwrap_or("");
    let (id, token) = ctx
        .id_generator
        .next(&format!("{provider}:apikey"), key, base_url);

    let mut auth = Auth::new(id, provider, ctx.now);
    auth.label = format!("{provider}-apikey");
    auth.prefix = entry
        .prefix
        .as_deref()
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    auth.status = AuthStatus::Active;
    auth.proxy_url = entry
        .proxy_url
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);
    auth.attributes
        .insert("source".to_string(), format!("config:{provider}[{token}]"));
    auth.attributes
        .insert("api_key".to_string(), key.to_string());
    if !base_url.is_empty() {
        auth.attributes
            .insert("base_url".to_string(), base_url.to_string());
    }
    if entry.priority != 0 {
        auth.attributes
            .insert("priority".to_string(), entry.priority.to_string());
    }
    if let Some(hash) = models_hash(&entry.models) {
        auth.attributes.insert("models_hash".to_string(), hash);
    }
    for (name, value) in &entry.headers {
        auth.attributes
            .insert(format!("header:{name}"), value.clone());
    }
    for model in &entry.excluded_models {
        let model = model.trim();
        if !model.is_empty() {
            auth.model_states.insert(
                model.to_string(),
                modelgate_auth::ModelState {
                    available: false,
                    recover_at: None,
                },
            );
        }
    }
    Some(auth)
}

/// Canonical hash of the per-entry model list; changes when the model
/// mapping changes without comparing whole objects.
fn models_hash(models: &[String]) -> Option<String> {
    let mut sorted: Vec<&str> = models
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_unstable();
    Some(content_hash(sorted.join("\n").as_bytes()))
}

/// Synthesizes `Auth` records from OAuth JSON files under the auth dir.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSynthesizer;

impl FileSynthesizer {
    pub fn new() -> Self {
        Self
    }

    /// Builds one `Auth` from a credential file. The provider comes from
    /// the JSON `type` field, falling back to the enclosing directory
    /// name; the stable ID is the normalized file stem.
    pub fn synthesize_file(&self, path: &Path, body: &[u8], now: OffsetDateTime) -> Option<Auth> {
        let parsed: Value = serde_json::from_slice(body).ok()?;
        let map = parsed.as_object()?;

        let provider = map
            .get("type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| {
                path.parent()
                    .and_then(Path::file_name)
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            })?;

        let stem = path.file_stem()?.to_str()?;
        let id = normalize_file_id(stem);

        let mut auth = Auth::new(id, provider.clone(), now);
        auth.label = format!("{provider}-oauth");
        auth.metadata = map.clone();
        auth.attributes
            .insert("source".to_string(), format!("file:{}", path.display()));
        Some(auth)
    }
}

fn normalize_file_id(stem: &str) -> String {
    stem.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
