//! Codex executor: the OpenAI Responses backend.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};

use modelgate_auth::Auth;
use modelgate_common::{json_delete, json_set};
use modelgate_protocol::{ChunkStream, Dialect, RequestEnvelope, StatusError};

use crate::providers::common::{
    ExchangePlan, execute_flat, execute_stream_flat, normalize_flat_payload, translate_pair,
};
use crate::{ExecutorContext, ProviderExecutor};

const PROVIDER_NAME: &str = "codex";
const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const RESPONSES_PATH: &str = "/responses";

pub struct CodexExecutor {
    ctx: ExecutorContext,
}

impl CodexExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self { ctx }
    }

    fn plan(&self, auth: &Auth, stream: bool) -> Result<ExchangePlan, StatusError> {
        let api_key = auth
            .api_key()
            .or_else(|| auth.access_token())
            .ok_or_else(|| StatusError::unauthorized("missing api key"))?;
        let base = auth
            .base_url()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        Ok(ExchangePlan {
            target: Dialect::Codex,
            protocol: "codex",
            url: format!("{base}{RESPONSES_PATH}"),
            headers: vec![
                ("Authorization".to_string(), format!("Bearer {api_key}")),
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), accept.to_string()),
                ("OpenAI-Beta".to_string(), "responses=experimental".to_string()),
            ],
        })
    }

    fn prepare_body(
        &self,
        env: &RequestEnvelope,
        plan: &ExchangePlan,
        stream: bool,
    ) -> Result<Value, StatusError> {
        let (payload, original) = translate_pair(&self.ctx, env, plan.target, stream);
        let mut body = normalize_flat_payload(&self.ctx, env, plan, payload, &original)?;
        json_set(&mut body, "model", json!(env.model));
        json_set(&mut body, "stream", json!(stream));
        json_delete(&mut body, "stream_options");
        Ok(body)
    }
}

#[async_trait]
impl ProviderExecutor for CodexExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn execute(&self, auth: &Auth, env: &RequestEnvelope) -> Result<Bytes, StatusError> {
        let plan = self.plan(auth, false)?;
        let body = self.prepare_body(env, &plan, false)?;
        execute_flat(&self.ctx, auth, env, plan, body).await
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        env: &RequestEnvelope,
    ) -> Result<ChunkStream, StatusError> {
        let plan = self.plan(auth, true)?;
        let body = self.prepare_body(env, &plan, true)?;
        execute_stream_flat(&self.ctx, auth, env, plan, body).await
    }
}
