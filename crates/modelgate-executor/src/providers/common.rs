//! The shared execution pipeline for flat-body providers (Claude, Codex,
//! Copilot, OpenAI-compatible): translate, normalize, apply payload
//! rules, send, and demux.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use modelgate_auth::Auth;
use modelgate_protocol::{
    ChunkStream, Dialect, RequestEnvelope, StatusError, StreamChunk, parse_retry_delay,
    sse::sse_payload,
};
use modelgate_translate::{StreamInput, StreamState, TranslateContext};

use crate::payload::apply_payload_rules;
use crate::thinking::{normalize_flat_thinking, validate_thinking};
use crate::transport::{TransportBody, TransportError, TransportRequest, TransportResponse};
use crate::usage::{UsageReporter, claude_usage, gemini_usage, openai_usage};
use crate::ExecutorContext;

/// Everything provider-specific the shared pipeline needs for one call.
pub struct ExchangePlan {
    pub target: Dialect,
    /// Protocol name for payload-rule matching.
    pub protocol: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Translates the client payload and the immutable original payload into
/// the provider dialect. The original translation is what payload-rule
/// defaults are checked against.
pub fn translate_pair(
    ctx: &ExecutorContext,
    env: &RequestEnvelope,
    target: Dialect,
    stream: bool,
) -> (Value, Value) {
    let translated = ctx.registry.translate_request(
        env.source_format,
        target,
        &env.model,
        env.payload.clone(),
        stream,
    );
    let original = ctx.registry.translate_request(
        env.source_format,
        target,
        &env.model,
        env.original_request.clone(),
        stream,
    );
    let translated: Value = serde_json::from_slice(&translated).unwrap_or(Value::Null);
    let original: Value = serde_json::from_slice(&original).unwrap_or(Value::Null);
    (translated, original)
}

/// Thinking normalization + payload rules for a flat provider body.
pub fn normalize_flat_payload(
    ctx: &ExecutorContext,
    env: &RequestEnvelope,
    plan: &ExchangePlan,
    payload: Value,
    original: &Value,
) -> Result<Value, StatusError> {
    validate_thinking(&ctx.models, &payload, &env.model)?;
    let payload = normalize_flat_thinking(&ctx.models, payload, &env.model, false);
    let requested = env.requested_model().unwrap_or(&env.model);
    let config = ctx.config.load();
    Ok(apply_payload_rules(
        &config.payload,
        &env.model,
        requested,
        plan.protocol,
        "",
        payload,
        original,
    ))
}

pub fn build_request(
    plan: &ExchangePlan,
    auth: &Auth,
    body: Bytes,
    stream: bool,
) -> TransportRequest {
    let mut request = TransportRequest::post(plan.url.clone()).body(body);
    request.stream = stream;
    request.proxy = auth.proxy_url.clone();
    request.headers = plan.headers.clone();
    for (name, value) in auth.extra_headers() {
        request.headers.push((name.to_string(), value.to_string()));
    }
    request
}

pub fn transport_status_error(err: TransportError) -> StatusError {
    StatusError::new(502, format!("upstream transport: {err}"))
}

/// Maps a non-2xx upstream response to the error surfaced to callers,
/// lifting structured retry hints out of the body.
pub async fn status_error_from_response(response: TransportResponse) -> StatusError {
    let status = response.status;
    let body = response
        .body
        .collect()
        .await
        .unwrap_or_else(|err| Bytes::from(err.to_string()));
    let retry_after = (status == 429).then(|| parse_retry_delay(&body)).flatten();
    StatusError::new(status, String::from_utf8_lossy(&body).to_string()).with_retry_after(retry_after)
}

fn observe_usage(reporter: &UsageReporter, target: Dialect, value: &Value) {
    let tokens = match target {
        Dialect::Claude => claude_usage(value).or_else(|| openai_usage(value)),
        Dialect::Gemini | Dialect::GeminiCli | Dialect::Antigravity => gemini_usage(value),
        _ => openai_usage(value).or_else(|| claude_usage(value)),
    };
    if let Some(tokens) = tokens {
        reporter.observe(tokens);
    }
}

/// Non-streaming exchange: send, check status, account usage, translate
/// the body back to the client dialect.
pub async fn execute_flat(
    ctx: &ExecutorContext,
    auth: &Auth,
    env: &RequestEnvelope,
    plan: ExchangePlan,
    body: Value,
) -> Result<Bytes, StatusError> {
    let reporter = UsageReporter::new(
        ctx.usage.clone(),
        auth.provider.clone(),
        env.model.clone(),
        auth.id.clone(),
    );

    let translated_bytes = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
    let request = build_request(&plan, auth, translated_bytes.clone(), false);
    let response = ctx
        .transport
        .send(request)
        .await
        .map_err(transport_status_error)
        .inspect_err(|_| reporter.publish_failure())?;
    if !(200..300).contains(&response.status) {
        let err = status_error_from_response(response).await;
        tracing::debug!(provider = %auth.provider, status = err.code, "upstream error");
        reporter.publish_failure();
        return Err(err);
    }

    let raw = response
        .body
        .collect()
        .await
        .map_err(transport_status_error)
        .inspect_err(|_| reporter.publish_failure())?;
    if let Ok(value) = serde_json::from_slice::<Value>(&raw) {
        observe_usage(&reporter, plan.target, &value);
    }

    let tctx = TranslateContext {
        model: &env.model,
        original_request: &env.original_request,
        translated_request: &translated_bytes,
    };
    let out = ctx
        .registry
        .translate_non_stream(env.source_format, plan.target, &tctx, &raw);
    reporter.ensure_published();
    Ok(out)
}

/// Streaming exchange: send, then demux SSE lines into translated
/// client-dialect chunks on a bounded channel.
pub async fn execute_stream_flat(
    ctx: &ExecutorContext,
    auth: &Auth,
    env: &RequestEnvelope,
    plan: ExchangePlan,
    body: Value,
) -> Result<ChunkStream, StatusError> {
    let reporter = Arc::new(UsageReporter::new(
        ctx.usage.clone(),
        auth.provider.clone(),
        env.model.clone(),
        auth.id.clone(),
    ));

    let translated_bytes = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
    let request = build_request(&plan, auth, translated_bytes.clone(), true);
    let response = ctx
        .transport
        .send(request)
        .await
        .map_err(transport_status_error)
        .inspect_err(|_| reporter.publish_failure())?;
    if !(200..300).contains(&response.status) {
        let err = status_error_from_response(response).await;
        reporter.publish_failure();
        return Err(err);
    }
    let body_stream = match response.body {
        TransportBody::Stream(stream) => stream,
        TransportBody::Bytes(bytes) => {
            // Some fixtures and proxies buffer; feed the bytes through the
            // same line path.
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.send(Ok(bytes)).await;
            rx
        }
    };

    let (tx, rx) = mpsc::channel::<StreamChunk>(16);
    let registry = ctx.registry.clone();
    let source = env.source_format;
    let target = plan.target;
    let model = env.model.clone();
    let original_request = env.original_request.clone();
    let reporter_task = reporter.clone();

    tokio::spawn(async move {
        let mut reader = crate::lines::LineReader::new(body_stream);
        let mut state = StreamState::new();
        let tctx = TranslateContext {
            model: &model,
            original_request: &original_request,
            translated_request: &translated_bytes,
        };
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if let Some(payload) = sse_payload(&line)
                        && let Ok(value) = serde_json::from_slice::<Value>(payload)
                    {
                        observe_usage(&reporter_task, target, &value);
                    }
                    let chunks = registry.translate_stream(
                        source,
                        target,
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
                    let tail =
                        registry.translate_stream(source, target, &tctx, &mut state, StreamInput::Done);
                    for chunk in tail {
                        if tx.send(StreamChunk::Payload(chunk)).await.is_err() {
                            return;
                        }
                    }
                    reporter_task.ensure_published();
                    return;
                }
                Err(err) => {
                    reporter_task.publish_failure();
                    let _ = tx
                        .send(StreamChunk::Error(transport_status_error(err)))
                        .await;
                    return;
                }
            }
        }
    });

    Ok(rx)
}
