//! Gemini executor (generativelanguage API keys).

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use modelgate_auth::Auth;
use modelgate_common::json_get;
use modelgate_protocol::{ChunkStream, Dialect, RequestEnvelope, StatusError};
use modelgate_translate::TranslateContext;

use crate::payload::apply_payload_rules;
use crate::providers::common::{
    ExchangePlan, execute_flat, execute_stream_flat, status_error_from_response, translate_pair,
    transport_status_error,
};
use crate::thinking::apply_thinking_metadata;
use crate::transport::TransportRequest;
use crate::{ExecutorContext, ProviderExecutor};

const PROVIDER_NAME: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiExecutor {
    ctx: ExecutorContext,
}

impl GeminiExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self { ctx }
    }

    fn plan(&self, auth: &Auth, env: &RequestEnvelope, action: &str) -> Result<ExchangePlan, StatusError> {
        let api_key = auth
            .api_key()
            .ok_or_else(|| StatusError::unauthorized("missing api key"))?;
        let base = auth
            .base_url()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        let model = env.model.trim_start_matches("models/");
        let suffix = if action == "streamGenerateContent" {
            "?alt=sse"
        } else {
            ""
        };
        Ok(ExchangePlan {
            target: Dialect::Gemini,
            protocol: "gemini",
            url: format!("{base}/v1beta/models/{model}:{action}{suffix}"),
            headers: vec![
                ("x-goog-api-key".to_string(), api_key.to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ],
        })
    }

    fn prepare_body(
        &self,
        env: &RequestEnvelope,
        stream: bool,
    ) -> Result<Value, StatusError> {
        let (payload, original) = translate_pair(&self.ctx, env, Dialect::Gemini, stream);
        let payload =
            apply_thinking_metadata(&self.ctx.models, payload, &env.metadata, &env.model, "");
        let requested = env.requested_model().unwrap_or(&env.model);
        let config = self.ctx.config.load();
        Ok(apply_payload_rules(
            &config.payload,
            &env.model,
            requested,
            PROVIDER_NAME,
            "",
            payload,
            &original,
        ))
    }
}

#[async_trait]
impl ProviderExecutor for GeminiExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn execute(&self, auth: &Auth, env: &RequestEnvelope) -> Result<Bytes, StatusError> {
        let plan = self.plan(auth, env, "generateContent")?;
        let body = self.prepare_body(env, false)?;
        execute_flat(&self.ctx, auth, env, plan, body).await
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        env: &RequestEnvelope,
    ) -> Result<ChunkStream, StatusError> {
        let plan = self.plan(auth, env, "streamGenerateContent")?;
        let body = self.prepare_body(env, true)?;
        execute_stream_flat(&self.ctx, auth, env, plan, body).await
    }

    async fn count_tokens(&self, auth: &Auth, env: &RequestEnvelope) -> Result<Bytes, StatusError> {
        let plan = self.plan(auth, env, "countTokens")?;
        let body = self.ctx.registry.translate_token_count_request(
            env.source_format,
            plan.target,
            &env.model,
            env.payload.clone(),
        );
        let mut request = TransportRequest::post(plan.url.clone()).body(body.clone());
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
        let raw = response.body.collect().await.map_err(transport_status_error)?;
        let total = serde_json::from_slice::<Value>(&raw)
            .ok()
            .and_then(|v| json_get(&v, "totalTokens").and_then(Value::as_i64))
            .unwrap_or(0);
        let tctx = TranslateContext {
            model: &env.model,
            original_request: &env.original_request,
            translated_request: &body,
        };
        Ok(self.ctx.registry.translate_token_count(
            env.source_format,
            plan.target,
            &tctx,
            total,
            &raw,
        ))
    }
}
