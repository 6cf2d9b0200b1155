//! Antigravity executor (Google cloudcode internal API, OAuth).
//!
//! The quirkiest upstream the gateway speaks to: three fallback base
//! URLs, a `v1internal` request envelope, deterministic session IDs,
//! Claude-specific schema laundering, empty-stream detection, and
//! malformed-function-call repair.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;

use modelgate_auth::Auth;
use modelgate_common::{json_delete, json_get, json_set};
use modelgate_protocol::{
    ChunkStream, Dialect, RequestEnvelope, StatusError, StreamChunk, parse_retry_delay,
    sse::sse_payload,
};
use modelgate_translate::{StreamInput, StreamState, TranslateContext};

use crate::lines::LineReader;
use crate::payload::apply_payload_rules;
use crate::providers::common::transport_status_error;
use crate::repair::{attempt_json_repair, check_malformed_function_call};
use crate::retry::{attempts, is_no_capacity, retry_delay};
use crate::schema::rewrite_tool_schemas;
use crate::thinking::apply_thinking_metadata;
use crate::transport::{TransportBody, TransportRequest};
use crate::usage::{UsageReporter, gemini_usage};
use crate::{ExecutorContext, ProviderExecutor};

const PROVIDER_NAME: &str = "antigravity";
const SANDBOX_DAILY_BASE_URL: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
const DAILY_BASE_URL: &str = "https://daily-cloudcode-pa.googleapis.com";
const PROD_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
const GENERATE_PATH: &str = "/v1internal:generateContent";
const STREAM_PATH: &str = "/v1internal:streamGenerateContent?alt=sse";
const COUNT_TOKENS_PATH: &str = "/v1internal:countTokens";
const LOAD_CODE_ASSIST_PATH: &str = "/v1internal:loadCodeAssist";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";
const DEFAULT_USER_AGENT: &str = "antigravity/1.104.0 darwin/arm64";
/// Refresh well ahead of expiry; upstream invalidates tokens aggressively.
pub const REFRESH_LEAD: Duration = Duration::from_secs(3000);
/// Lines inspected before declaring a stream empty.
const STREAM_VALIDATION_MAX_LINES: usize = 50;

const AGENT_PREAMBLE: &str = "You are Antigravity, a powerful agentic AI coding assistant designed by the Google Deepmind team working on Advanced Agentic Coding. You are pair programming with a USER to solve their coding task.";

pub struct AntigravityExecutor {
    ctx: ExecutorContext,
}

impl AntigravityExecutor {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self { ctx }
    }

    // ---- credentials ----

    async fn ensure_access_token(&self, auth: &Auth) -> Result<(String, Option<Auth>), StatusError> {
        let now = OffsetDateTime::now_utc();
        if let Some(token) = auth.access_token()
            && auth
                .token_expiry()
                .is_some_and(|expiry| expiry > now + REFRESH_LEAD)
        {
            return Ok((token.to_string(), None));
        }
        let refreshed = self.refresh_token(auth.clone()).await?;
        let token = refreshed
            .access_token()
            .ok_or_else(|| StatusError::unauthorized("refresh produced no access token"))?
            .to_string();
        Ok((token, Some(refreshed)))
    }

    async fn refresh_token(&self, mut auth: Auth) -> Result<Auth, StatusError> {
        let refresh_token = auth
            .refresh_token()
            .ok_or_else(|| StatusError::unauthorized("missing refresh token"))?
            .to_string();
        let form = format!(
            "client_id={}&client_secret={}&grant_type=refresh_token&refresh_token={}",
            urlencode(CLIENT_ID),
            urlencode(CLIENT_SECRET),
            urlencode(&refresh_token),
        );
        let request = TransportRequest {
            method: "POST",
            url: TOKEN_URL.to_string(),
            headers: vec![
                (
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                ),
                ("User-Agent".to_string(), user_agent(&auth).to_string()),
            ],
            body: Some(Bytes::from(form)),
            stream: false,
            proxy: auth.proxy_url.clone(),
        };
        let response = self
            .ctx
            .transport
            .send(request)
            .await
            .map_err(transport_status_error)?;
        let status = response.status;
        let raw = response.body.collect().await.map_err(transport_status_error)?;
        if !(200..300).contains(&status) {
            let retry_after = (status == 429).then(|| parse_retry_delay(&raw)).flatten();
            return Err(
                StatusError::new(status, String::from_utf8_lossy(&raw).to_string())
                    .with_retry_after(retry_after),
            );
        }
        let parsed: Value = serde_json::from_slice(&raw)
            .map_err(|err| StatusError::unauthorized(format!("token response: {err}")))?;
        let access_token = parsed
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| StatusError::unauthorized("token response missing access_token"))?;
        let expires_in = parsed
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(3600);

        let now = OffsetDateTime::now_utc();
        auth.metadata
            .insert("access_token".to_string(), json!(access_token));
        if let Some(new_refresh) = parsed.get("refresh_token").and_then(Value::as_str)
            && !new_refresh.is_empty()
        {
            auth.metadata
                .insert("refresh_token".to_string(), json!(new_refresh));
        }
        auth.metadata
            .insert("expires_in".to_string(), json!(expires_in));
        auth.metadata.insert(
            "timestamp".to_string(),
            json!(now.unix_timestamp_nanos() / 1_000_000),
        );
        let expired = (now + Duration::from_secs(expires_in.max(0) as u64))
            .format(&Rfc3339)
            .unwrap_or_default();
        auth.metadata.insert("expired".to_string(), json!(expired));
        auth.metadata
            .insert("type".to_string(), json!(PROVIDER_NAME));
        auth.updated_at = now;

        if auth.meta_str("project_id").is_none()
            && let Some(project_id) = self
                .detect_project_id(&auth, access_token)
                .await
                .unwrap_or(None)
        {
            auth.metadata
                .insert("project_id".to_string(), json!(project_id));
        }
        Ok(auth)
    }

    /// Best-effort project discovery via `loadCodeAssist`.
    async fn detect_project_id(
        &self,
        auth: &Auth,
        access_token: &str,
    ) -> Result<Option<String>, StatusError> {
        let base = base_url_order(auth)[0].clone();
        let body = json!({
            "metadata": {
                "ideType": "ANTIGRAVITY",
                "platform": "PLATFORM_UNSPECIFIED",
                "pluginType": "GEMINI",
            }
        });
        let request = TransportRequest {
            method: "POST",
            url: format!("{base}{LOAD_CODE_ASSIST_PATH}"),
            headers: vec![
                ("Authorization".to_string(), format!("Bearer {access_token}")),
                ("Content-Type".to_string(), "application/json".to_string()),
                ("User-Agent".to_string(), user_agent(auth).to_string()),
            ],
            body: Some(Bytes::from(serde_json::to_vec(&body).unwrap_or_default())),
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
            return Ok(None);
        }
        let raw = response.body.collect().await.map_err(transport_status_error)?;
        let parsed: Value = serde_json::from_slice(&raw).unwrap_or(Value::Null);
        Ok(parsed
            .get("cloudaicompanionProject")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    // ---- payload shaping ----

    fn prepare_payload(&self, env: &RequestEnvelope, auth: &Auth) -> Result<Value, StatusError> {
        let translated = self.ctx.registry.translate_request(
            env.source_format,
            Dialect::Antigravity,
            &env.model,
            env.payload.clone(),
            env.stream,
        );
        let original = self.ctx.registry.translate_request(
            env.source_format,
            Dialect::Antigravity,
            &env.model,
            env.original_request.clone(),
            env.stream,
        );
        let payload: Value = serde_json::from_slice(&translated)
            .map_err(|err| StatusError::bad_request(format!("request body: {err}")))?;
        let original: Value = serde_json::from_slice(&original).unwrap_or(Value::Null);

        let payload = apply_thinking_metadata(
            &self.ctx.models,
            payload,
            &env.metadata,
            &env.model,
            "request",
        );
        let payload = normalize_antigravity_thinking(&self.ctx, &env.model, payload);

        let requested = env.requested_model().unwrap_or(&env.model);
        let config = self.ctx.config.load();
        let mut payload = apply_payload_rules(
            &config.payload,
            &env.model,
            requested,
            PROVIDER_NAME,
            "request",
            payload,
            &original,
        );
        self.finalize_body(&mut payload, &env.model, auth);
        Ok(payload)
    }

    fn finalize_body(&self, payload: &mut Value, model: &str, auth: &Auth) {
        let upstream_model = self.ctx.models.upstream_model(model);
        json_set(payload, "model", json!(upstream_model));
        json_set(payload, "userAgent", json!("antigravity"));
        json_set(payload, "requestType", json!(request_type_for_model(model)));
        let project = auth
            .meta_str("project_id")
            .map(str::to_string)
            .unwrap_or_else(random_project_id);
        json_set(payload, "project", json!(project));
        json_set(payload, "requestId", json!(format!("agent-{}", uuid::Uuid::new_v4())));
        let session_id = stable_session_id(payload);
        json_set(payload, "request.sessionId", json!(session_id));
        json_delete(payload, "request.safetySettings");
        json_set(
            payload,
            "request.toolConfig.functionCallingConfig.mode",
            json!("VALIDATED"),
        );

        let is_claude = model.to_ascii_lowercase().contains("claude");
        if !model.starts_with("gemini-3-")
            && json_get(payload, "request.generationConfig.thinkingConfig.thinkingLevel").is_some()
        {
            json_delete(payload, "request.generationConfig.thinkingConfig.thinkingLevel");
            json_set(
                payload,
                "request.generationConfig.thinkingConfig.thinkingBudget",
                json!(-1),
            );
        }

        if is_claude {
            rewrite_tool_schemas(payload);
        } else {
            json_delete(payload, "request.generationConfig.maxOutputTokens");
        }

        if is_claude || model.contains("gemini-3-pro-preview") {
            inject_agent_preamble(payload);
        }
    }

    // ---- transport ----

    fn build_request(
        &self,
        auth: &Auth,
        token: &str,
        base: &str,
        path: &str,
        payload: &Value,
        stream: bool,
    ) -> TransportRequest {
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        TransportRequest {
            method: "POST",
            url: format!("{}{path}", base.trim_end_matches('/')),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), format!("Bearer {token}")),
                ("User-Agent".to_string(), user_agent(auth).to_string()),
                ("Accept".to_string(), accept.to_string()),
            ],
            body: Some(Bytes::from(serde_json::to_vec(payload).unwrap_or_default())),
            stream,
            proxy: auth.proxy_url.clone(),
        }
    }

    /// One pass over the base-URL fallback list. `Ok` carries the
    /// successful response; `Err(Retryable)` asks the caller to back off
    /// and run another attempt.
    async fn send_with_fallback(
        &self,
        auth: &Auth,
        token: &str,
        path: &str,
        payload: &Value,
        stream: bool,
    ) -> Result<TransportBody, FallbackError> {
        let bases = base_url_order(auth);
        let mut last_error: Option<StatusError> = None;

        for (idx, base) in bases.iter().enumerate() {
            let request = self.build_request(auth, token, base, path, payload, stream);
            let response = match self.ctx.transport.send(request).await {
                Ok(response) => response,
                Err(err) => {
                    if idx + 1 < bases.len() {
                        tracing::debug!(%base, %err, "transport error, trying fallback base url");
                        last_error = Some(transport_status_error(err));
                        continue;
                    }
                    return Err(FallbackError::Fatal(transport_status_error(err)));
                }
            };
            if (200..300).contains(&response.status) {
                return Ok(response.body);
            }
            let status = response.status;
            let body = response
                .body
                .collect()
                .await
                .unwrap_or_else(|err| Bytes::from(err.to_string()));

            if status == 429 {
                let retry_after = parse_retry_delay(&body);
                if retry_after.is_none() {
                    // Bare 429: transient, retried internally.
                    return Err(FallbackError::Retryable);
                }
                if idx + 1 < bases.len() {
                    tracing::debug!(%base, "rate limited, trying fallback base url");
                    last_error = Some(
                        StatusError::new(status, String::from_utf8_lossy(&body).to_string())
                            .with_retry_after(retry_after),
                    );
                    continue;
                }
                return Err(FallbackError::Fatal(
                    StatusError::new(status, String::from_utf8_lossy(&body).to_string())
                        .with_retry_after(retry_after),
                ));
            }
            if is_no_capacity(status, &body) {
                if idx + 1 < bases.len() {
                    tracing::debug!(%base, "no capacity, trying fallback base url");
                    last_error = Some(StatusError::new(
                        status,
                        String::from_utf8_lossy(&body).to_string(),
                    ));
                    continue;
                }
                return Err(FallbackError::Retryable);
            }
            return Err(FallbackError::Fatal(StatusError::new(
                status,
                String::from_utf8_lossy(&body).to_string(),
            )));
        }

        Err(FallbackError::Fatal(last_error.unwrap_or_else(|| {
            StatusError::service_unavailable("no base url available")
        })))
    }

    // ---- streaming ----

    async fn open_validated_stream(
        &self,
        auth: &Auth,
        env: &RequestEnvelope,
        token: &str,
        payload: &Value,
        reporter: &Arc<UsageReporter>,
        translated_bytes: &Bytes,
    ) -> Result<Option<(Vec<Bytes>, LineReader, StreamState)>, FallbackError> {
        let body = self
            .send_with_fallback(auth, token, STREAM_PATH, payload, true)
            .await?;
        let body_stream = into_body_stream(body);
        let mut reader = LineReader::new(body_stream);
        let mut state = StreamState::new();
        let mut buffered: Vec<Bytes> = Vec::new();
        let mut content_chunks = 0usize;

        let tctx = TranslateContext {
            model: &env.model,
            original_request: &env.original_request,
            translated_request: translated_bytes,
        };

        for _ in 0..STREAM_VALIDATION_MAX_LINES {
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    return Err(FallbackError::Fatal(transport_status_error(err)));
                }
            };
            if let Some(raw) = sse_payload(&line)
                && let Ok(value) = serde_json::from_slice::<Value>(raw)
            {
                let inner = unwrap_response(&value);
                if let Some(malformed) = check_malformed_function_call(inner) {
                    tracing::warn!("malformed function call detected, attempting repair");
                    match attempt_json_repair(&malformed)
                        .and_then(|fixed| synthetic_function_call_line(&fixed))
                    {
                        Some(repaired_line) => {
                            let chunks = self.ctx.registry.translate_stream(
                                env.source_format,
                                Dialect::Antigravity,
                                &tctx,
                                &mut state,
                                StreamInput::Line(&repaired_line),
                            );
                            content_chunks += chunks.len();
                            buffered.extend(chunks);
                            continue;
                        }
                        None => return Ok(None),
                    }
                }
                if let Some(tokens) = gemini_usage(&value) {
                    reporter.observe(tokens);
                }
            }
            let chunks = self.ctx.registry.translate_stream(
                env.source_format,
                Dialect::Antigravity,
                &tctx,
                &mut state,
                StreamInput::Line(&line),
            );
            content_chunks += chunks.len();
            buffered.extend(chunks);
            if content_chunks > 0 {
                break;
            }
        }

        if content_chunks == 0 {
            tracing::warn!(model = %env.model, "empty stream detected within validation window");
            return Ok(None);
        }
        Ok(Some((buffered, reader, state)))
    }

    fn spawn_forwarder(
        &self,
        env: &RequestEnvelope,
        buffered: Vec<Bytes>,
        mut reader: LineReader,
        mut state: StreamState,
        reporter: Arc<UsageReporter>,
        translated_bytes: Bytes,
    ) -> ChunkStream {
        let (tx, rx) = mpsc::channel::<StreamChunk>(buffered.len() + 16);
        let registry = self.ctx.registry.clone();
        let source = env.source_format;
        let model = env.model.clone();
        let original_request = env.original_request.clone();

        tokio::spawn(async move {
            let tctx = TranslateContext {
                model: &model,
                original_request: &original_request,
                translated_request: &translated_bytes,
            };
            for chunk in buffered {
                if tx.send(StreamChunk::Payload(chunk)).await.is_err() {
                    return;
                }
            }
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        let mut line = line;
                        if let Some(raw) = sse_payload(&line)
                            && let Ok(value) = serde_json::from_slice::<Value>(raw)
                        {
                            let inner = unwrap_response(&value);
                            if let Some(malformed) = check_malformed_function_call(inner) {
                                match attempt_json_repair(&malformed)
                                    .and_then(|fixed| synthetic_function_call_line(&fixed))
                                {
                                    Some(repaired) => line = repaired,
                                    None => continue,
                                }
                            } else if let Some(tokens) = gemini_usage(&value) {
                                reporter.observe(tokens);
                            }
                        }
                        let chunks = registry.translate_stream(
                            source,
                            Dialect::Antigravity,
                            &tctx,
                            &mut state,
                            StreamInput::Line(&line),
                        );
                        for chunk in chunks {
                            if tx.send(StreamChunk::Payload(chunk)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        let tail = registry.translate_stream(
                            source,
                            Dialect::Antigravity,
                            &tctx,
                            &mut state,
                            StreamInput::Done,
                        );
                        for chunk in tail {
                            if tx.send(StreamChunk::Payload(chunk)).await.is_err() {
                                return;
                            }
                        }
                        reporter.ensure_published();
                        return;
                    }
                    Err(err) => {
                        reporter.publish_failure();
                        let _ = tx
                            .send(StreamChunk::Error(transport_status_error(err)))
                            .await;
                        return;
                    }
                }
            }
        });
        rx
    }

    /// Buffers a whole upstream stream and reassembles it into one
    /// non-stream body, merging adjacent thought/text runs. Claude and
    /// Gemini-3-pro models only answer on the streaming endpoint.
    async fn execute_via_stream(
        &self,
        auth: &Auth,
        env: &RequestEnvelope,
        token: &str,
        payload: &Value,
        reporter: &Arc<UsageReporter>,
        translated_bytes: &Bytes,
    ) -> Result<Bytes, StatusError> {
        let body = self
            .send_with_fallback(auth, token, STREAM_PATH, payload, true)
            .await
            .map_err(|err| err.into_status("antigravity"))?;
        let mut reader = LineReader::new(into_body_stream(body));
        let mut values: Vec<Value> = Vec::new();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if let Some(raw) = sse_payload(&line)
                        && let Ok(value) = serde_json::from_slice::<Value>(raw)
                    {
                        values.push(value);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    reporter.publish_failure();
                    return Err(transport_status_error(err));
                }
            }
        }
        let merged = merge_stream_values(&values);
        if let Some(tokens) = gemini_usage(&merged) {
            reporter.observe(tokens);
        }
        let merged_bytes = serde_json::to_vec(&merged).unwrap_or_default();
        let tctx = TranslateContext {
            model: &env.model,
            original_request: &env.original_request,
            translated_request: translated_bytes,
        };
        let out = self.ctx.registry.translate_non_stream(
            env.source_format,
            Dialect::Antigravity,
            &tctx,
            &merged_bytes,
        );
        reporter.ensure_published();
        Ok(out)
    }
}

enum FallbackError {
    /// Back off and re-run the whole attempt (bare 429, no capacity).
    Retryable,
    Fatal(StatusError),
}

impl FallbackError {
    fn into_status(self, provider: &str) -> StatusError {
        match self {
            FallbackError::Fatal(err) => err,
            FallbackError::Retryable => {
                StatusError::service_unavailable(format!("{provider}: retry attempts exhausted"))
            }
        }
    }
}

#[async_trait]
impl ProviderExecutor for AntigravityExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn execute(&self, auth: &Auth, env: &RequestEnvelope) -> Result<Bytes, StatusError> {
        let (token, refreshed) = self.ensure_access_token(auth).await?;
        let auth = refreshed.as_ref().unwrap_or(auth);
        let reporter = Arc::new(UsageReporter::new(
            self.ctx.usage.clone(),
            PROVIDER_NAME,
            env.model.clone(),
            auth.id.clone(),
        ));
        let payload = self.prepare_payload(env, auth)?;
        let translated_bytes = Bytes::from(serde_json::to_vec(&payload).unwrap_or_default());

        let lower = env.model.to_ascii_lowercase();
        if lower.contains("claude") || lower.contains("gemini-3-pro") {
            return self
                .execute_via_stream(auth, env, &token, &payload, &reporter, &translated_bytes)
                .await
                .inspect_err(|_| reporter.publish_failure());
        }

        let max_attempts = attempts(self.ctx.request_retry());
        for attempt in 0..max_attempts {
            match self
                .send_with_fallback(auth, &token, GENERATE_PATH, &payload, false)
                .await
            {
                Ok(body) => {
                    let raw = body.collect().await.map_err(transport_status_error)?;
                    if let Ok(value) = serde_json::from_slice::<Value>(&raw)
                        && let Some(tokens) = gemini_usage(&value)
                    {
                        reporter.observe(tokens);
                    }
                    let tctx = TranslateContext {
                        model: &env.model,
                        original_request: &env.original_request,
                        translated_request: &translated_bytes,
                    };
                    let out = self.ctx.registry.translate_non_stream(
                        env.source_format,
                        Dialect::Antigravity,
                        &tctx,
                        &raw,
                    );
                    reporter.ensure_published();
                    return Ok(out);
                }
                Err(FallbackError::Retryable) if attempt + 1 < max_attempts => {
                    let delay = retry_delay(attempt);
                    tracing::debug!(model = %env.model, attempt, ?delay, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    reporter.publish_failure();
                    return Err(err.into_status(PROVIDER_NAME));
                }
            }
        }
        reporter.publish_failure();
        Err(StatusError::service_unavailable(
            "antigravity: max retry attempts exceeded",
        ))
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        env: &RequestEnvelope,
    ) -> Result<ChunkStream, StatusError> {
        let (token, refreshed) = self.ensure_access_token(auth).await?;
        let auth = refreshed.as_ref().unwrap_or(auth);
        let reporter = Arc::new(UsageReporter::new(
            self.ctx.usage.clone(),
            PROVIDER_NAME,
            env.model.clone(),
            auth.id.clone(),
        ));
        let payload = self.prepare_payload(env, auth)?;
        let translated_bytes = Bytes::from(serde_json::to_vec(&payload).unwrap_or_default());

        let max_attempts = attempts(self.ctx.request_retry());
        for attempt in 0..max_attempts {
            match self
                .open_validated_stream(auth, env, &token, &payload, &reporter, &translated_bytes)
                .await
            {
                Ok(Some((buffered, reader, state))) => {
                    return Ok(self.spawn_forwarder(
                        env,
                        buffered,
                        reader,
                        state,
                        reporter,
                        translated_bytes,
                    ));
                }
                Ok(None) | Err(FallbackError::Retryable) if attempt + 1 < max_attempts => {
                    let delay = retry_delay(attempt);
                    tracing::warn!(
                        model = %env.model,
                        attempt = attempt + 1,
                        total = max_attempts,
                        ?delay,
                        "stream validation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(None) => {
                    reporter.publish_failure();
                    return Err(StatusError::service_unavailable(
                        "antigravity: upstream returned an empty stream",
                    ));
                }
                Err(err) => {
                    reporter.publish_failure();
                    return Err(err.into_status(PROVIDER_NAME));
                }
            }
        }
        reporter.publish_failure();
        Err(StatusError::service_unavailable(
            "antigravity: max retry attempts exceeded",
        ))
    }

    async fn count_tokens(&self, auth: &Auth, env: &RequestEnvelope) -> Result<Bytes, StatusError> {
        let (token, refreshed) = self.ensure_access_token(auth).await?;
        let auth = refreshed.as_ref().unwrap_or(auth);

        let translated = self.ctx.registry.translate_token_count_request(
            env.source_format,
            Dialect::Antigravity,
            &env.model,
            env.payload.clone(),
        );
        let mut payload: Value = serde_json::from_slice(&translated)
            .map_err(|err| StatusError::bad_request(format!("request body: {err}")))?;
        json_delete(&mut payload, "project");
        json_delete(&mut payload, "model");
        json_delete(&mut payload, "request.safetySettings");

        let body = self
            .send_with_fallback(auth, &token, COUNT_TOKENS_PATH, &payload, false)
            .await
            .map_err(|err| err.into_status(PROVIDER_NAME))?;
        let raw = body.collect().await.map_err(transport_status_error)?;
        let total = serde_json::from_slice::<Value>(&raw)
            .ok()
            .and_then(|v| {
                v.get("totalTokens")
                    .or_else(|| v.pointer("/response/totalTokens"))
                    .and_then(Value::as_i64)
            })
            .unwrap_or(0);
        let translated_bytes = Bytes::from(serde_json::to_vec(&payload).unwrap_or_default());
        let tctx = TranslateContext {
            model: &env.model,
            original_request: &env.original_request,
            translated_request: &translated_bytes,
        };
        Ok(self.ctx.registry.translate_token_count(
            env.source_format,
            Dialect::Antigravity,
            &tctx,
            total,
            &raw,
        ))
    }

    async fn refresh(&self, auth: Auth) -> Result<Auth, StatusError> {
        self.refresh_token(auth).await
    }
}

// ---- helpers ----

fn into_body_stream(body: TransportBody) -> crate::transport::BodyStream {
    match body {
        TransportBody::Stream(stream) => stream,
        TransportBody::Bytes(bytes) => {
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.try_send(Ok(bytes));
            rx
        }
    }
}

fn base_url_order(auth: &Auth) -> Vec<String> {
    if let Some(custom) = auth.base_url() {
        return vec![custom.trim_end_matches('/').to_string()];
    }
    vec![
        SANDBOX_DAILY_BASE_URL.to_string(),
        DAILY_BASE_URL.to_string(),
        PROD_BASE_URL.to_string(),
    ]
}

fn user_agent(auth: &Auth) -> &str {
    auth.attribute("user_agent")
        .or_else(|| auth.meta_str("user_agent"))
        .unwrap_or(DEFAULT_USER_AGENT)
}

fn request_type_for_model(model: &str) -> &'static str {
    if model.to_ascii_lowercase().contains("image") {
        "image_gen"
    } else {
        "agent"
    }
}

fn random_project_id() -> String {
    let adjectives = ["useful", "bright", "swift", "calm", "bold"];
    let nouns = ["fuze", "wave", "spark", "flow", "core"];
    let mut rng = rand::rng();
    let adjective = adjectives[rng.random_range(0..adjectives.len())];
    let noun = nouns[rng.random_range(0..nouns.len())];
    let tail = uuid::Uuid::new_v4().simple().to_string();
    format!("{adjective}-{noun}-{}", &tail[..5])
}

/// Deterministic session ID from the first user text, so retries of the
/// same conversation share a session.
fn stable_session_id(payload: &Value) -> String {
    if let Some(contents) = json_get(payload, "request.contents").and_then(Value::as_array) {
        for content in contents {
            if content.get("role").and_then(Value::as_str) != Some("user") {
                continue;
            }
            let Some(text) = content
                .pointer("/parts/0/text")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
            else {
                continue;
            };
            let digest = Sha256::digest(text.as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let n = (i64::from_be_bytes(head)) & 0x7FFF_FFFF_FFFF_FFFF;
            return format!("-{n}");
        }
    }
    let mut rng = rand::rng();
    format!("-{}", rng.random_range(0..9_000_000_000_000_000_000i64))
}

/// Rewrites the system instruction for Claude and Gemini-3-pro routes to
/// the fixed agent preamble, appending any client-provided parts.
fn inject_agent_preamble(payload: &mut Value) {
    let existing = json_get(payload, "request.systemInstruction.parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut parts = vec![
        json!({"text": AGENT_PREAMBLE}),
        json!({"text": format!("Please ignore following [ignore]{AGENT_PREAMBLE}[/ignore]")}),
    ];
    parts.extend(existing);
    json_set(payload, "request.systemInstruction.role", json!("user"));
    json_set(payload, "request.systemInstruction.parts", json!(parts));
}

/// Clamps or removes thinking config per model support. Claude budgets
/// must additionally stay below `maxOutputTokens`.
fn normalize_antigravity_thinking(ctx: &ExecutorContext, model: &str, mut payload: Value) -> Value {
    const BUDGET_PATH: &str = "request.generationConfig.thinkingConfig.thinkingBudget";
    const CONFIG_PATH: &str = "request.generationConfig.thinkingConfig";

    if !ctx.models.supports_thinking(model) {
        json_delete(&mut payload, CONFIG_PATH);
        return payload;
    }
    let Some(budget) = json_get(&payload, BUDGET_PATH).and_then(Value::as_i64) else {
        return payload;
    };
    let mut normalized = ctx.models.normalize_budget(model, budget);

    if model.to_ascii_lowercase().contains("claude") {
        let max_path = "request.generationConfig.maxOutputTokens";
        let (effective_max, from_model) = match json_get(&payload, max_path).and_then(Value::as_i64)
        {
            Some(v) if v > 0 => (v, false),
            _ => (
                ctx.models.max_completion_tokens(model).unwrap_or(0),
                true,
            ),
        };
        if effective_max > 0 && normalized >= effective_max {
            normalized = effective_max - 1;
        }
        if let Some(min) = ctx.models.min_thinking_budget(model)
            && min > 0
            && normalized >= 0
            && normalized < min
        {
            json_delete(&mut payload, CONFIG_PATH);
            return payload;
        }
        if from_model && effective_max > 0 {
            json_set(&mut payload, max_path, json!(effective_max));
        }
    }

    json_set(&mut payload, BUDGET_PATH, json!(normalized));
    payload
}

fn unwrap_response(value: &Value) -> &Value {
    value.get("response").unwrap_or(value)
}

/// A synthetic upstream line carrying the repaired call as a proper
/// Gemini function-call part, so the normal translation path emits a
/// dialect-correct tool-call chunk.
fn synthetic_function_call_line(repaired: &str) -> Option<Bytes> {
    let parsed: Value = serde_json::from_str(repaired).ok()?;
    let name = parsed.get("name")?.clone();
    let args = parsed.get("args").cloned().unwrap_or_else(|| {
        let mut rest = parsed.as_object().cloned().unwrap_or(Map::new());
        rest.remove("name");
        Value::Object(rest)
    });
    let chunk = json!({
        "response": {
            "candidates": [{
                "content": {"role": "model", "parts": [{
                    "functionCall": {"name": name, "args": args},
                }]},
                "finishReason": "STOP",
            }],
        }
    });
    let mut framed = b"data: ".to_vec();
    framed.extend_from_slice(&serde_json::to_vec(&chunk).ok()?);
    Some(Bytes::from(framed))
}

/// Merges buffered stream chunks into a single response body, collapsing
/// adjacent thought/text parts and flushing on kind changes, function
/// calls, and inline data.
fn merge_stream_values(values: &[Value]) -> Value {
    let mut template: Option<Value> = None;
    let mut trace_id: Option<String> = None;
    let mut role: Option<String> = None;
    let mut finish_reason: Option<String> = None;
    let mut model_version: Option<String> = None;
    let mut response_id: Option<String> = None;
    let mut usage: Option<Value> = None;

    let mut parts: Vec<Value> = Vec::new();
    let mut pending_kind: Option<&'static str> = None;
    let mut pending_text = String::new();
    let mut pending_signature: Option<String> = None;

    fn flush(
        parts: &mut Vec<Value>,
        kind: &mut Option<&'static str>,
        text: &mut String,
        signature: &mut Option<String>,
    ) {
        let Some(current) = kind.take() else {
            return;
        };
        let body = std::mem::take(text);
        let sig = signature.take();
        match current {
            "text" => {
                if !body.trim().is_empty() {
                    parts.push(json!({"text": body}));
                }
            }
            _ => {
                if !body.trim().is_empty() || sig.is_some() {
                    let mut part = json!({"thought": true, "text": body});
                    if let Some(sig) = sig {
                        part["thoughtSignature"] = json!(sig);
                    }
                    parts.push(part);
                }
            }
        }
    }

    for value in values {
        let response = match value.get("response") {
            Some(inner) => inner,
            None if value.get("candidates").is_some() => value,
            None => continue,
        };
        template = Some(response.clone());
        if let Some(id) = value.get("traceId").and_then(Value::as_str).filter(|s| !s.is_empty()) {
            trace_id = Some(id.to_string());
        }
        if let Some(r) = response
            .pointer("/candidates/0/content/role")
            .and_then(Value::as_str)
        {
            role = Some(r.to_string());
        }
        if let Some(reason) = response
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            finish_reason = Some(reason.to_string());
        }
        if let Some(v) = response.get("modelVersion").and_then(Value::as_str) {
            model_version = Some(v.to_string());
        }
        if let Some(v) = response.get("responseId").and_then(Value::as_str) {
            response_id = Some(v.to_string());
        }
        if let Some(u) = response
            .get("usageMetadata")
            .or_else(|| value.get("usageMetadata"))
            .filter(|u| !u.is_null())
        {
            usage = Some(u.clone());
        }

        let Some(chunk_parts) = response
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        else {
            continue;
        };
        for part in chunk_parts {
            let has_call = part.get("functionCall").is_some();
            let has_inline =
                part.get("inlineData").is_some() || part.get("inline_data").is_some();
            if has_call || has_inline {
                flush(&mut parts, &mut pending_kind, &mut pending_text, &mut pending_signature);
                parts.push(normalize_part(part));
                continue;
            }
            let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
            if is_thought || part.get("text").is_some() {
                let kind = if is_thought { "thought" } else { "text" };
                if pending_kind.is_some() && pending_kind != Some(kind) {
                    flush(&mut parts, &mut pending_kind, &mut pending_text, &mut pending_signature);
                }
                pending_kind = Some(kind);
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    pending_text.push_str(text);
                }
                if is_thought {
                    let sig = part
                        .get("thoughtSignature")
                        .or_else(|| part.get("thought_signature"))
                        .and_then(Value::as_str);
                    if let Some(sig) = sig {
                        pending_signature = Some(sig.to_string());
                    }
                }
                continue;
            }
            flush(&mut parts, &mut pending_kind, &mut pending_text, &mut pending_signature);
            parts.push(normalize_part(part));
        }
    }
    flush(&mut parts, &mut pending_kind, &mut pending_text, &mut pending_signature);

    let mut response = template
        .unwrap_or_else(|| json!({"candidates": [{"content": {"role": "model", "parts": []}}]}));
    json_set(&mut response, "candidates.0.content.parts", json!(parts));
    if let Some(role) = role {
        json_set(&mut response, "candidates.0.content.role", json!(role));
    }
    if let Some(reason) = finish_reason {
        json_set(&mut response, "candidates.0.finishReason", json!(reason));
    }
    if let Some(version) = model_version {
        json_set(&mut response, "modelVersion", json!(version));
    }
    if let Some(id) = response_id {
        json_set(&mut response, "responseId", json!(id));
    }
    match usage {
        Some(usage) => json_set(&mut response, "usageMetadata", usage),
        None => {
            if json_get(&response, "usageMetadata").is_none() {
                json_set(
                    &mut response,
                    "usageMetadata",
                    json!({"promptTokenCount": 0, "candidatesTokenCount": 0, "totalTokenCount": 0}),
                );
            }
        }
    }

    let mut out = json!({"response": response});
    if let Some(trace_id) = trace_id {
        out["traceId"] = json!(trace_id);
    }
    out
}

fn normalize_part(part: &Value) -> Value {
    let mut map = part.as_object().cloned().unwrap_or_default();
    if let Some(sig) = map
        .remove("thought_signature")
        .or_else(|| map.get("thoughtSignature").cloned())
    {
        map.insert("thoughtSignature".to_string(), sig);
    }
    if let Some(inline) = map.remove("inline_data") {
        map.insert("inlineData".to_string(), inline);
    }
    Value::Object(map)
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
