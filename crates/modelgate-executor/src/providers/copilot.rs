//! GitHub Copilot executor.
//!
//! A GitHub OAuth token is exchanged for a short-lived Copilot API token,
//! cached per access token. The target dialect and endpoint depend on the
//! model family: Claude models speak the Messages API, GPT-5 the
//! Responses API, everything else chat completions.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use modelgate_auth::Auth;
use modelgate_common::{json_delete, json_get, json_set};
use modelgate_protocol::{ChunkStream, Dialect, RequestEnvelope, StatusError};

use crate::providers::common::{
    ExchangePlan, execute_flat, execute_stream_flat, normalize_flat_payload,
    status_error_from_response, translate_pair, transport_status_error,
};
use crate::thinking::ModelRegistry;
use crate::transport::TransportRequest;
use crate::{ExecutorContext, ProviderExecutor};

const PROVIDER_NAME: &str = "github-copilot";
const API_BASE_URL: &str = "https://api.githubcopilot.com";
const TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const CHAT_PATH: &str = "/chat/completions";
const RESPONSES_PATH: &str = "/responses";
const MESSAGES_PATH: &str = "/v1/messages";
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(25 * 60);
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(5 * 60);

const USER_AGENT: &str = "GithubCopilot/1.0";
const EDITOR_VERSION: &str = "vscode/1.109.0";
const EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.37.0";
const INTEGRATION_ID: &str = "vscode-chat";
const OPENAI_INTENT: &str = "conversation-panel";
const API_VERSION: &str = "2025-10-01";
const CLAUDE_THINKING_BETA: &str =
    "interleaved-thinking-2025-05-14,context-management-2025-06-27";

struct CachedApiToken {
    token: String,
    expires_at: OffsetDateTime,
}

pub struct CopilotExecutor {
    ctx: ExecutorContext,
    cache: RwLock<HashMap<String, CachedApiToken>>,
}

impl CopilotExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self {
            ctx,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn ensure_api_token(&self, auth: &Auth) -> Result<String, StatusError> {
        let access_token = auth
            .access_token()
            .ok_or_else(|| StatusError::unauthorized("missing github access token"))?;

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(access_token)
                && cached.expires_at > OffsetDateTime::now_utc() + TOKEN_EXPIRY_BUFFER
            {
                return Ok(cached.token.clone());
            }
        }

        let request = TransportRequest {
            method: "GET",
            url: TOKEN_URL.to_string(),
            headers: vec![
                ("Authorization".to_string(), format!("token {access_token}")),
                ("Accept".to_string(), "application/json".to_string()),
                ("User-Agent".to_string(), USER_AGENT.to_string()),
                ("Editor-Version".to_string(), EDITOR_VERSION.to_string()),
            ],
            body: None,
            stream: false,
            proxy: auth.proxy_url.clone(),
        };
        let response = self
            .ctx
            .transport
            .send(request)
            .await
            .map_err(transport_status_error)?;
        if !(200..300).contains(&response.status) {
            let err = status_error_from_response(response).await;
            return Err(StatusError::unauthorized(format!(
                "failed to get copilot api token: {}",
                err.message
            )));
        }
        let raw = response.body.collect().await.map_err(transport_status_error)?;
        let parsed: Value = serde_json::from_slice(&raw)
            .map_err(|err| StatusError::unauthorized(format!("copilot token response: {err}")))?;
        let token = parsed
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| StatusError::unauthorized("copilot token response missing token"))?
            .to_string();
        let expires_at = parsed
            .get("expires_at")
            .and_then(Value::as_i64)
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            .unwrap_or_else(|| OffsetDateTime::now_utc() + TOKEN_CACHE_TTL);

        let mut cache = self.cache.write().await;
        cache.insert(
            access_token.to_string(),
            CachedApiToken {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(token)
    }

    fn plan(&self, env: &RequestEnvelope, api_token: &str, stream: bool) -> ExchangePlan {
        let target = copilot_target(&env.model);
        let path = match target {
            Dialect::Claude => MESSAGES_PATH,
            Dialect::Codex => RESPONSES_PATH,
            _ => CHAT_PATH,
        };
        let protocol = match target {
            Dialect::Claude => "claude",
            Dialect::Codex => "codex",
            _ => "openai",
        };
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Authorization".to_string(), format!("Bearer {api_token}")),
            ("Accept".to_string(), accept.to_string()),
            ("User-Agent".to_string(), USER_AGENT.to_string()),
            ("Editor-Version".to_string(), EDITOR_VERSION.to_string()),
            (
                "Editor-Plugin-Version".to_string(),
                EDITOR_PLUGIN_VERSION.to_string(),
            ),
            ("Openai-Intent".to_string(), OPENAI_INTENT.to_string()),
            (
                "Copilot-Integration-Id".to_string(),
                INTEGRATION_ID.to_string(),
            ),
            ("X-GitHub-Api-Version".to_string(), API_VERSION.to_string()),
            (
                "X-Request-Id".to_string(),
                uuid::Uuid::new_v4().to_string(),
            ),
            ("X-Initiator".to_string(), "agent".to_string()),
            (
                "VScode-SessionId".to_string(),
                uuid::Uuid::new_v4().to_string(),
            ),
            (
                "VScode-MachineId".to_string(),
                uuid::Uuid::new_v4().to_string(),
            ),
        ];
        if target == Dialect::Claude {
            headers.push(("anthropic-beta".to_string(), CLAUDE_THINKING_BETA.to_string()));
        }
        ExchangePlan {
            target,
            protocol,
            url: format!("{API_BASE_URL}{path}"),
            headers,
        }
    }

    fn prepare_body(
        &self,
        env: &RequestEnvelope,
        plan: &ExchangePlan,
        stream: bool,
    ) -> Result<Value, StatusError> {
        let (payload, original) = translate_pair(&self.ctx, env, plan.target, stream);
        let mut body = normalize_flat_payload(&self.ctx, env, plan, payload, &original)?;
        json_set(&mut body, "model", json!(strip_copilot_prefix(&env.model)));
        if plan.target == Dialect::Claude {
            body = normalize_claude_thinking(&self.ctx.models, &env.model, body);
        }
        json_set(&mut body, "stream", json!(stream));
        if stream && plan.target == Dialect::OpenAi {
            json_set(&mut body, "stream_options.include_usage", json!(true));
        } else {
            // The Messages and Responses endpoints reject stream_options.
            json_delete(&mut body, "stream_options");
        }
        Ok(body)
    }
}

#[async_trait]
impl ProviderExecutor for CopilotExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn execute(&self, auth: &Auth, env: &RequestEnvelope) -> Result<Bytes, StatusError> {
        let api_token = self.ensure_api_token(auth).await?;
        let plan = self.plan(env, &api_token, false);
        let body = self.prepare_body(env, &plan, false)?;
        execute_flat(&self.ctx, auth, env, plan, body).await
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        env: &RequestEnvelope,
    ) -> Result<ChunkStream, StatusError> {
        let api_token = self.ensure_api_token(auth).await?;
        let plan = self.plan(env, &api_token, true);
        let body = self.prepare_body(env, &plan, true)?;
        execute_stream_flat(&self.ctx, auth, env, plan, body).await
    }

    /// GitHub access tokens don't expire on a schedule; refresh just
    /// revalidates that a Copilot API token can still be minted.
    async fn refresh(&self, auth: Auth) -> Result<Auth, StatusError> {
        self.ensure_api_token(&auth).await?;
        Ok(auth)
    }
}

fn strip_copilot_prefix(model: &str) -> &str {
    model.strip_prefix("copilot-").unwrap_or(model)
}

fn copilot_target(model: &str) -> Dialect {
    let normalized = strip_copilot_prefix(model);
    if normalized.starts_with("claude-") {
        Dialect::Claude
    } else if normalized.starts_with("gpt-5") {
        Dialect::Codex
    } else {
        Dialect::OpenAi
    }
}

/// Claude thinking on Copilot must sit strictly below `max_tokens`; below
/// the model minimum the thinking block is dropped entirely.
fn normalize_claude_thinking(models: &ModelRegistry, model: &str, mut body: Value) -> Value {
    if !models.supports_thinking(model) {
        return body;
    }
    if json_get(&body, "max_tokens").and_then(Value::as_i64).is_none()
        && let Some(cap) = models.max_completion_tokens(model)
    {
        json_set(&mut body, "max_tokens", json!(cap));
    }
    let Some(max_tokens) = json_get(&body, "max_tokens").and_then(Value::as_i64) else {
        return body;
    };
    if max_tokens <= 0 || json_get(&body, "thinking").is_none() {
        return body;
    }
    if json_get(&body, "thinking.type").and_then(Value::as_str) == Some("disabled") {
        return body;
    }
    let mut budget = json_get(&body, "thinking.budget_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(-1);
    budget = models.normalize_budget(model, budget);
    if budget < 0 {
        budget = models.normalize_budget(model, max_tokens / 2);
    }
    if budget >= max_tokens {
        budget = max_tokens - 1;
    }
    if let Some(min) = models.min_thinking_budget(model)
        && min > 0
        && budget < min
    {
        json_delete(&mut body, "thinking");
        return body;
    }
    json_set(&mut body, "thinking.type", json!("enabled"));
    json_set(&mut body, "thinking.budget_tokens", json!(budget));
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_selection_by_model_family() {
        assert_eq!(copilot_target("copilot-claude-sonnet-4-5"), Dialect::Claude);
        assert_eq!(copilot_target("claude-sonnet-4-5"), Dialect::Claude);
        assert_eq!(copilot_target("copilot-gpt-5"), Dialect::Codex);
        assert_eq!(copilot_target("gpt-5.2"), Dialect::Codex);
        assert_eq!(copilot_target("copilot-gpt-4.1"), Dialect::OpenAi);
    }

    #[test]
    fn claude_thinking_clamped_below_max_tokens() {
        let models = ModelRegistry::with_builtin_models();
        let body = json!({
            "max_tokens": 2000,
            "thinking": {"type": "enabled", "budget_tokens": 64000},
        });
        let out = normalize_claude_thinking(&models, "claude-sonnet-4-5", body);
        assert_eq!(json_get(&out, "thinking.budget_tokens"), Some(&json!(1999)));
        assert_eq!(json_get(&out, "thinking.type"), Some(&json!("enabled")));
    }

    #[test]
    fn tiny_budget_drops_thinking() {
        let models = ModelRegistry::with_builtin_models();
        let body = json!({
            "max_tokens": 900,
            "thinking": {"type": "enabled", "budget_tokens": 512},
        });
        let out = normalize_claude_thinking(&models, "claude-sonnet-4-5", body);
        assert!(json_get(&out, "thinking").is_none());
    }

    #[test]
    fn missing_max_tokens_falls_back_to_registry() {
        let models = ModelRegistry::with_builtin_models();
        let body = json!({"thinking": {"type": "enabled", "budget_tokens": 2048}});
        let out = normalize_claude_thinking(&models, "claude-sonnet-4-5", body);
        assert_eq!(json_get(&out, "max_tokens"), Some(&json!(64000)));
        assert_eq!(json_get(&out, "thinking.budget_tokens"), Some(&json!(2048)));
    }
}
