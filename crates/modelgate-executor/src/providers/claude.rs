//! Anthropic Messages executor (API-key credentials).

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};

use modelgate_auth::Auth;
use modelgate_common::{json_delete, json_set};
use modelgate_protocol::{ChunkStream, Dialect, RequestEnvelope, StatusError};

use crate::providers::common::{
    ExchangePlan, execute_flat, execute_stream_flat, normalize_flat_payload, status_error_from_response,
    translate_pair, transport_status_error,
};
use crate::transport::TransportRequest;
use crate::{ExecutorContext, ProviderExecutor};

const PROVIDER_NAME: &str = "claude";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeExecutor {
    ctx: ExecutorContext,
}

impl ClaudeExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self { ctx }
    }

    fn plan(&self, auth: &Auth, path: &str) -> Result<ExchangePlan, StatusError> {
        let api_key = auth
            .api_key()
            .ok_or_else(|| StatusError::unauthorized("missing api key"))?;
        let base = auth
            .base_url()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        Ok(ExchangePlan {
            target: Dialect::Claude,
            protocol: "claude",
            url: format!("{base}{path}"),
            headers: vec![
                ("x-api-key".to_string(), api_key.to_string()),
                ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
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
impl ProviderExecutor for ClaudeExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn execute(&self, auth: &Auth, env: &RequestEnvelope) -> Result<Bytes, StatusError> {
        let plan = self.plan(auth, "/v1/messages")?;
        let body = self.prepare_body(env, &plan, false)?;
        execute_flat(&self.ctx, auth, env, plan, body).await
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        env: &RequestEnvelope,
    ) -> Result<ChunkStream, StatusError> {
        let plan = self.plan(auth, "/v1/messages")?;
        let body = self.prepare_body(env, &plan, true)?;
        execute_stream_flat(&self.ctx, auth, env, plan, body).await
    }

    async fn count_tokens(&self, auth: &Auth, env: &RequestEnvelope) -> Result<Bytes, StatusError> {
        let plan = self.plan(auth, "/v1/messages/count_tokens")?;
        let body = self.ctx.registry.translate_token_count_request(
            env.source_format,
            plan.target,
            &env.model,
            env.payload.clone(),
        );
        let mut request = TransportRequest::post(plan.url.clone()).body(body);
        request.headers = plan.headers.clone();
        request.proxy = auth.proxy_url.clone();
        let response = self
            .ctx
            .transport
            .send(request)
            .await
            .map_err(transport_status_error)?;
        if !(200..300).contains(&response.status) {
            return Err(status_error_from_response(response).await);
        }
        response.body.collect().await.map_err(transport_status_error)
    }
}
