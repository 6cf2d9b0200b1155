//! Client-facing proxy routes.
//!
//! Each handler builds a [`RequestEnvelope`] in the client's dialect and
//! hands it to the engine; streaming responses come back as SSE bodies in
//! the dialect's own framing. Errors are always the OpenAI error shape.

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use modelgate_common::GatewayConfig;
use modelgate_core::GatewayEngine;
use modelgate_protocol::{Dialect, RequestEnvelope, ResponseEnvelope, StatusError, StreamChunk};

#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<GatewayEngine>,
    pub config: Arc<ArcSwap<GatewayConfig>>,
}

pub fn proxy_router(engine: Arc<GatewayEngine>, config: Arc<ArcSwap<GatewayConfig>>) -> Router {
    let state = ProxyState { engine, config };
    Router::new()
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1/completions", post(openai_completions))
        .route("/v1/responses", post(openai_responses))
        .route("/v1/messages", post(claude_messages))
        .route("/v1/messages/count_tokens", post(claude_count_tokens))
        .route("/v1/models", get(openai_models_list))
        .route("/v1beta/models", get(gemini_models_list))
        .route("/v1beta/models/{*model_action}", post(gemini_generate))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            client_auth_middleware,
        ))
        .with_state(state)
}

/// `Authorization: Bearer <key>` or `api-key`/`x-api-key`/`x-goog-api-key`
/// against the configured list. An empty list disables client auth.
async fn client_auth_middleware(
    State(state): State<ProxyState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let config = state.config.load();
    if config.api_keys.is_empty() {
        return next.run(request).await;
    }
    let presented = presented_key(request.headers());
    let authorized = presented
        .map(|key| config.api_keys.iter().any(|allowed| allowed == key))
        .unwrap_or(false);
    if !authorized {
        return error_response(StatusError::unauthorized("invalid or missing api key"));
    }
    next.run(request).await
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
        {
            return Some(token.trim());
        }
    }
    for name in ["api-key", "x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            return Some(value.trim());
        }
    }
    None
}

fn error_response(err: StatusError) -> Response {
    let status = StatusCode::from_u16(err.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (
        status,
        axum::Json(err.to_error_body()),
    )
        .into_response();
    if let Some(retry_after) = err.retry_after {
        let secs = retry_after.as_secs().max(1);
        if let Ok(value) = secs.to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

fn json_response(body: Bytes) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn sse_response(stream: modelgate_protocol::ChunkStream) -> Response {
    let body_stream = ReceiverStream::new(stream).map(|chunk| {
        Ok::<Bytes, std::convert::Infallible>(match chunk {
            StreamChunk::Payload(bytes) => bytes,
            StreamChunk::Error(err) => {
                let frame = serde_json::to_vec(&err.to_error_body()).unwrap_or_default();
                let mut out = b"data: ".to_vec();
                out.extend_from_slice(&frame);
                out.extend_from_slice(b"\n\n");
                Bytes::from(out)
            }
        })
    });
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(body_stream),
    )
        .into_response()
}

fn parse_body(body: &Bytes) -> Result<Value, StatusError> {
    serde_json::from_slice(body)
        .map_err(|err| StatusError::bad_request(format!("invalid JSON body: {err}")))
}

fn model_of(value: &Value) -> Result<String, StatusError> {
    value
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .ok_or_else(|| StatusError::bad_request("missing model"))
}

fn stream_of(value: &Value) -> bool {
    value.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

async fn dispatch(state: &ProxyState, dialect: Dialect, body: Bytes) -> Response {
    let parsed = match parse_body(&body) {
        Ok(parsed) => parsed,
        Err(err) => return error_response(err),
    };
    let model = match model_of(&parsed) {
        Ok(model) => model,
        Err(err) => return error_response(err),
    };
    let stream = stream_of(&parsed);
    let mut envelope = RequestEnvelope::new(dialect, model, body).with_stream(stream);
    match state.engine.handle(&mut envelope).await {
        Ok(ResponseEnvelope::Payload(out)) => json_response(out),
        Ok(ResponseEnvelope::Stream(chunks)) => sse_response(chunks),
        Err(err) => error_response(err),
    }
}

async fn openai_chat_completions(State(state): State<ProxyState>, body: Bytes) -> Response {
    dispatch(&state, Dialect::OpenAi, body).await
}

/// Legacy completions: the prompt is folded into a single user message
/// and the request runs through the chat pipeline.
async fn openai_completions(State(state): State<ProxyState>, body: Bytes) -> Response {
    let parsed = match parse_body(&body) {
        Ok(parsed) => parsed,
        Err(err) => return error_response(err),
    };
    let prompt = match parsed.get("prompt") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    let mut chat = parsed.clone();
    if let Some(map) = chat.as_object_mut() {
        map.remove("prompt");
        map.insert(
            "messages".to_string(),
            json!([{"role": "user", "content": prompt}]),
        );
    }
    let body = Bytes::from(serde_json::to_vec(&chat).unwrap_or_default());
    dispatch(&state, Dialect::OpenAi, body).await
}

async fn openai_responses(State(state): State<ProxyState>, body: Bytes) -> Response {
    dispatch(&state, Dialect::OpenAiResponses, body).await
}

async fn claude_messages(State(state): State<ProxyState>, body: Bytes) -> Response {
    dispatch(&state, Dialect::Claude, body).await
}

async fn claude_count_tokens(State(state): State<ProxyState>, body: Bytes) -> Response {
    let parsed = match parse_body(&body) {
        Ok(parsed) => parsed,
        Err(err) => return error_response(err),
    };
    let model = match model_of(&parsed) {
        Ok(model) => model,
        Err(err) => return error_response(err),
    };
    let mut envelope = RequestEnvelope::new(Dialect::Claude, model, body);
    match state.engine.count_tokens(&mut envelope).await {
        Ok(out) => json_response(out),
        Err(err) => error_response(err),
    }
}

/// `/v1beta/models/{model}:{action}` with `generateContent`,
/// `streamGenerateContent`, and `countTokens`.
async fn gemini_generate(
    State(state): State<ProxyState>,
    Path(model_action): Path<String>,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.rsplit_once(':') else {
        return error_response(StatusError::bad_request(
            "expected /v1beta/models/{model}:{action}",
        ));
    };
    let model = model.trim_start_matches("models/").to_string();
    match action {
        "generateContent" => {
            let mut envelope = RequestEnvelope::new(Dialect::Gemini, model, body);
            match state.engine.execute(&mut envelope).await {
                Ok(out) => json_response(out),
                Err(err) => error_response(err),
            }
        }
        "streamGenerateContent" => {
            let mut envelope =
                RequestEnvelope::new(Dialect::Gemini, model, body).with_stream(true);
            match state.engine.execute_stream(&mut envelope).await {
                Ok(chunks) => sse_response(chunks),
                Err(err) => error_response(err),
            }
        }
        "countTokens" => {
            let mut envelope = RequestEnvelope::new(Dialect::Gemini, model, body);
            match state.engine.count_tokens(&mut envelope).await {
                Ok(out) => json_response(out),
                Err(err) => error_response(err),
            }
        }
        other => error_response(StatusError::bad_request(format!(
            "unsupported action {other}"
        ))),
    }
}

async fn openai_models_list(State(state): State<ProxyState>) -> Response {
    let models = state.engine.available_models().await;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let data: Vec<Value> = models
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": now,
                "owned_by": "modelgate",
            })
        })
        .collect();
    axum::Json(json!({"object": "list", "data": data})).into_response()
}

async fn gemini_models_list(State(state): State<ProxyState>) -> Response {
    let models = state.engine.available_models().await;
    let data: Vec<Value> = models
        .into_iter()
        .map(|id| {
            json!({
                "name": format!("models/{id}"),
                "displayName": id,
                "supportedGenerationMethods": [
                    "generateContent",
                    "streamGenerateContent",
                    "countTokens",
                ],
            })
        })
        .collect();
    axum::Json(json!({"models": data})).into_response()
}
