use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Gateway configuration, loaded from YAML and hot-reloaded by the watcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Client-facing API keys accepted on proxy routes.
    #[serde(rename = "api-keys")]
    pub api_keys: Vec<String>,
    /// Key gating the management API. Empty disables management routes.
    #[serde(rename = "management-key")]
    pub management_key: Option<String>,
    /// Allow unauthenticated management calls from loopback addresses.
    #[serde(rename = "allow-localhost-management")]
    pub allow_localhost_management: bool,
    /// Directory holding per-credential JSON files.
    #[serde(rename = "auth-dir")]
    pub auth_dir: Option<String>,
    /// Extra directories of vendor credential caches to observe
    /// (e.g. `~/.aws/sso/cache`).
    #[serde(rename = "vendor-auth-dirs")]
    pub vendor_auth_dirs: Vec<String>,
    /// Extra attempts after the first for retry-worthy upstream failures.
    #[serde(rename = "request-retry")]
    pub request_retry: u32,
    /// Optional outbound proxy URL for upstream egress.
    pub proxy: Option<String>,
    pub routing: RoutingStrategy,
    #[serde(rename = "quota-exceeded")]
    pub quota_exceeded: QuotaExceededBehavior,
    pub payload: PayloadRules,
    #[serde(rename = "gemini-keys")]
    pub gemini_keys: Vec<ApiKeyEntry>,
    #[serde(rename = "codex-keys")]
    pub codex_keys: Vec<ApiKeyEntry>,
    #[serde(rename = "claude-keys")]
    pub claude_keys: Vec<ApiKeyEntry>,
    #[serde(rename = "openai-compat-keys")]
    pub openai_compat_keys: Vec<ApiKeyEntry>,
}

impl GatewayConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("0.0.0.0")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8317)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    FillFirst,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaExceededBehavior {
    /// Rotate the credential's project before entering cooldown, for
    /// providers that support alternate projects.
    #[serde(rename = "switch-project")]
    pub switch_project: bool,
}

/// One inline API key for a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeyEntry {
    #[serde(rename = "api-key")]
    pub api_key: String,
    #[serde(rename = "base-url")]
    pub base_url: Option<String>,
    #[serde(rename = "proxy-url")]
    pub proxy_url: Option<String>,
    pub prefix: Option<String>,
    pub priority: i32,
    /// Extra headers sent with every request on this credential.
    pub headers: BTreeMap<String, String>,
    /// Optional model allow-list override for this credential.
    pub models: Vec<String>,
    #[serde(rename = "excluded-models")]
    pub excluded_models: Vec<String>,
}

/// Declarative JSON-path transforms applied to outgoing payloads.
///
/// Application order: default, default-raw, override, override-raw, filter.
/// Defaults are first-write-wins and only apply when the field is absent in
/// the original translated payload; overrides are last-write-wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadRules {
    pub default: Vec<PayloadParamRule>,
    #[serde(rename = "default-raw")]
    pub default_raw: Vec<PayloadRawRule>,
    #[serde(rename = "override")]
    pub override_: Vec<PayloadParamRule>,
    #[serde(rename = "override-raw")]
    pub override_raw: Vec<PayloadRawRule>,
    pub filter: Vec<PayloadFilterRule>,
}

impl PayloadRules {
    pub fn is_empty(&self) -> bool {
        self.default.is_empty()
            && self.default_raw.is_empty()
            && self.override_.is_empty()
            && self.override_raw.is_empty()
            && self.filter.is_empty()
    }
}

/// Model/protocol selector for one payload rule entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadRuleMatch {
    /// Model glob; `*` matches zero or more characters.
    pub name: String,
    /// Provider protocol; compared case-insensitively, empty matches all.
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadParamRule {
    pub models: Vec<PayloadRuleMatch>,
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Like [`PayloadParamRule`] but each param value is a raw JSON string,
/// parsed at apply time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadRawRule {
    pub models: Vec<PayloadRuleMatch>,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadFilterRule {
    pub models: Vec<PayloadRuleMatch>,
    pub params: Vec<String>,
}

/// SHA-256 hex digest, used for config reload detection and stable hashes.
pub fn content_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_yaml() {
        let cfg = GatewayConfig::from_yaml("port: 9000\napi-keys: [\"sk-1\"]\n").unwrap();
        assert_eq!(cfg.port(), 9000);
        assert_eq!(cfg.host(), "0.0.0.0");
        assert_eq!(cfg.api_keys, vec!["sk-1".to_string()]);
        assert_eq!(cfg.routing, RoutingStrategy::RoundRobin);
    }

    #[test]
    fn parse_keys_and_payload_rules() {
        let text = r#"
gemini-keys:
  - api-key: "AIza-one"
    priority: 2
    headers:
      X-Team: alpha
payload:
  default:
    - models:
        - name: "gemini-*"
          protocol: gemini-cli
      params:
        "generationConfig.temperature": 0.7
  filter:
    - models:
        - name: "*"
      params:
        - "request.safetySettings"
"#;
        let cfg = GatewayConfig::from_yaml(text).unwrap();
        assert_eq!(cfg.gemini_keys.len(), 1);
        assert_eq!(cfg.gemini_keys[0].priority, 2);
        assert_eq!(cfg.payload.default.len(), 1);
        assert_eq!(cfg.payload.filter[0].params[0], "request.safetySettings");
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"").len(), 64);
    }
}
