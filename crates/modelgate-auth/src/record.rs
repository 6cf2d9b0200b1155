use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub type AuthId = String;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    #[default]
    Active,
    Disabled,
}

/// Quota backoff bookkeeping for one credential.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaState {
    pub exceeded: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub next_recover_at: Option<OffsetDateTime>,
    pub backoff_level: u32,
}

/// Per-model availability override on one credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub available: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub recover_at: Option<OffsetDateTime>,
}

/// One credential record. Consumers never mutate an `Auth` in place;
/// updates go through the conductor, which bumps `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    pub id: AuthId,
    /// Matches an executor identifier.
    pub provider: String,
    pub label: String,
    /// Optional routing prefix: `team-a/gpt-5` selects only credentials
    /// with `prefix == "team-a"`.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub status: AuthStatus,
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Small string map: `api_key`, `base_url`, `priority`, `models_hash`,
    /// `source`, `header:<Name>`.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// OAuth payload: `access_token`, `refresh_token`, `expires_in`,
    /// `timestamp`, `expired` (RFC3339), `project_id`, `tier`, `type`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub quota: QuotaState,
    #[serde(default)]
    pub model_states: BTreeMap<String, ModelState>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Auth {
    pub fn new(id: impl Into<AuthId>, provider: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            label: String::new(),
            prefix: String::new(),
            status: AuthStatus::Active,
            proxy_url: None,
            attributes: BTreeMap::new(),
            metadata: Map::new(),
            quota: QuotaState::default(),
            model_states: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.attribute("api_key")
    }

    pub fn base_url(&self) -> Option<&str> {
        self.attribute("base_url").or_else(|| {
            self.metadata
                .get("base_url")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
    }

    pub fn priority(&self) -> i32 {
        self.attribute("priority")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Extra headers declared as `header:<Name>` attributes.
    pub fn extra_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|(key, value)| {
            key.strip_prefix("header:").map(|name| (name, value.as_str()))
        })
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn access_token(&self) -> Option<&str> {
        self.meta_str("access_token")
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.meta_str("refresh_token")
    }

    /// Token expiry from metadata: the RFC3339 `expired` field wins, else
    /// `timestamp` (ms) + `expires_in` (s).
    pub fn token_expiry(&self) -> Option<OffsetDateTime> {
        if let Some(expired) = self.meta_str("expired")
            && let Ok(parsed) = OffsetDateTime::parse(expired, &Rfc3339)
        {
            return Some(parsed);
        }
        let expires_in = meta_i64(&self.metadata, "expires_in")?;
        let timestamp_ms = meta_i64(&self.metadata, "timestamp")?;
        let base = OffsetDateTime::from_unix_timestamp_nanos(timestamp_ms as i128 * 1_000_000)
            .ok()?;
        Some(base + Duration::from_secs(expires_in.max(0) as u64))
    }

    /// Whether this credential needs a refresh at `now`, given the
    /// provider's refresh lead.
    pub fn needs_refresh(&self, now: OffsetDateTime, lead: Duration) -> bool {
        if self.refresh_token().is_none() {
            return false;
        }
        match self.token_expiry() {
            Some(expiry) => now + lead >= expiry,
            None => self.access_token().is_none(),
        }
    }

    /// Prefix matching for selection: empty selector matches empty prefix;
    /// a non-empty selector must equal the credential prefix.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.prefix.trim() == prefix.trim()
    }

    /// Selectable at `now` with respect to quota cooldown and per-model
    /// overrides.
    pub fn available_for(&self, model: &str, now: OffsetDateTime) -> bool {
        if self.status != AuthStatus::Active {
            return false;
        }
        if let Some(recover_at) = self.quota.next_recover_at
            && recover_at > now
        {
            return false;
        }
        if let Some(state) = self.model_states.get(model)
            && !state.available
            && state.recover_at.is_none_or(|at| at > now)
        {
            return false;
        }
        true
    }
}

fn meta_i64(metadata: &Map<String, Value>, key: &str) -> Option<i64> {
    match metadata.get(key)? {
        Value::Number(num) => num.as_i64().or_else(|| num.as_f64().map(|f| f as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn auth() -> Auth {
        Auth::new("a-1", "gemini", datetime!(2025-06-01 00:00:00 UTC))
    }

    #[test]
    fn token_expiry_prefers_rfc3339() {
        let mut a = auth();
        a.metadata
            .insert("expired".to_string(), json!("2025-06-01T01:00:00Z"));
        a.metadata.insert("expires_in".to_string(), json!(10));
        a.metadata.insert("timestamp".to_string(), json!(0));
        assert_eq!(a.token_expiry(), Some(datetime!(2025-06-01 01:00:00 UTC)));
    }

    #[test]
    fn token_expiry_from_timestamp() {
        let mut a = auth();
        a.metadata.insert("expires_in".to_string(), json!(3600));
        a.metadata
            .insert("timestamp".to_string(), json!(1_748_736_000_000i64));
        let expiry = a.token_expiry().unwrap();
        assert_eq!(expiry.unix_timestamp(), 1_748_736_000 + 3600);
    }

    #[test]
    fn needs_refresh_honors_lead() {
        let mut a = auth();
        a.metadata.insert("access_token".to_string(), json!("tok"));
        a.metadata.insert("refresh_token".to_string(), json!("ref"));
        a.metadata
            .insert("expired".to_string(), json!("2025-06-01T00:10:00Z"));
        let now = datetime!(2025-06-01 00:00:00 UTC);
        assert!(!a.needs_refresh(now, Duration::from_secs(300)));
        assert!(a.needs_refresh(now, Duration::from_secs(900)));
    }

    #[test]
    fn availability_checks_cooldown_and_model_state() {
        let now = datetime!(2025-06-01 00:00:00 UTC);
        let mut a = auth();
        assert!(a.available_for("m", now));

        a.quota.next_recover_at = Some(now + Duration::from_secs(30));
        assert!(!a.available_for("m", now));
        assert!(a.available_for("m", now + Duration::from_secs(31)));

        a.quota.next_recover_at = None;
        a.model_states.insert(
            "m".to_string(),
            ModelState {
                available: false,
                recover_at: None,
            },
        );
        assert!(!a.available_for("m", now));
        assert!(a.available_for("other", now));
    }

    #[test]
    fn extra_headers_come_from_attributes() {
        let mut a = auth();
        a.attributes
            .insert("header:X-Team".to_string(), "alpha".to_string());
        a.attributes
            .insert("api_key".to_string(), "k".to_string());
        let headers: Vec<_> = a.extra_headers().collect();
        assert_eq!(headers, vec![("X-Team", "alpha")]);
    }
}
