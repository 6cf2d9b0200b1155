use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use modelgate_auth::Auth;
use modelgate_common::GatewayConfig;
use modelgate_executor::providers::{AntigravityExecutor, ClaudeExecutor};
use modelgate_executor::transport::{
    TransportBody, TransportError, TransportRequest, TransportResponse, UpstreamTransport,
};
use modelgate_executor::usage::{UsageRecord, UsageSink};
use modelgate_executor::{ExecutorContext, ModelRegistry, ProviderExecutor};
use modelgate_protocol::{Dialect, RequestEnvelope, StreamChunk};
use modelgate_translate::{Registry, register_builtin};

struct Scripted {
    status: u16,
    body: String,
}

struct ScriptedTransport {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(request);
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected extra upstream request");
        Ok(TransportResponse {
            status: scripted.status,
            headers: Vec::new(),
            body: TransportBody::Bytes(Bytes::from(scripted.body)),
        })
    }
}

#[derive(Default)]
struct CaptureSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageSink for CaptureSink {
    fn record(&self, record: UsageRecord) {
        self.records.lock().unwrap().push(record);
    }
}

fn context(
    transport: Arc<ScriptedTransport>,
    sink: Arc<CaptureSink>,
    request_retry: u32,
) -> ExecutorContext {
    let mut registry = Registry::new();
    register_builtin(&mut registry).unwrap();
    let config = GatewayConfig {
        request_retry,
        ..GatewayConfig::default()
    };
    ExecutorContext {
        transport,
        registry: Arc::new(registry),
        models: Arc::new(ModelRegistry::with_builtin_models()),
        usage: sink,
        config: Arc::new(ArcSwap::from_pointee(config)),
    }
}

fn antigravity_auth() -> Auth {
    let now = OffsetDateTime::now_utc();
    let mut auth = Auth::new("ag-1", "antigravity", now);
    auth.metadata
        .insert("access_token".to_string(), json!("ya29.test"));
    auth.metadata
        .insert("refresh_token".to_string(), json!("1//refresh"));
    let expired = (now + Duration::from_secs(7200))
        .format(&Rfc3339)
        .unwrap();
    auth.metadata.insert("expired".to_string(), json!(expired));
    auth.metadata
        .insert("project_id".to_string(), json!("proj-123"));
    auth
}

fn openai_envelope(model: &str, stream: bool) -> RequestEnvelope {
    let payload = json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream,
    });
    RequestEnvelope::new(
        Dialect::OpenAi,
        model,
        Bytes::from(serde_json::to_vec(&payload).unwrap()),
    )
    .with_stream(stream)
}

async fn collect_stream(mut rx: modelgate_protocol::ChunkStream) -> (String, usize) {
    let mut combined = String::new();
    let mut errors = 0;
    while let Some(chunk) = rx.recv().await {
        match chunk {
            StreamChunk::Payload(bytes) => combined.push_str(&String::from_utf8_lossy(&bytes)),
            StreamChunk::Error(_) => errors += 1,
        }
    }
    (combined, errors)
}

fn gemini_line(text: &str, finish: Option<&str>) -> String {
    let mut candidate = json!({"content": {"role": "model", "parts": [{"text": text}]}});
    if let Some(finish) = finish {
        candidate["finishReason"] = json!(finish);
    }
    let chunk = json!({"response": {
        "candidates": [candidate],
        "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 3, "totalTokenCount": 5},
    }});
    format!("data: {chunk}\n")
}

#[tokio::test]
async fn bare_429_is_retried_internally_and_never_surfaced() {
    let success = json!({
        "response": {
            "candidates": [{"content": {"role": "model", "parts": [{"text": "hello"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 2, "totalTokenCount": 3},
        }
    });
    let transport = ScriptedTransport::new(vec![
        Scripted {
            status: 429,
            body: "{}".to_string(),
        },
        Scripted {
            status: 200,
            body: success.to_string(),
        },
    ]);
    let sink = Arc::new(CaptureSink::default());
    let executor = AntigravityExecutor::new(context(transport.clone(), sink.clone(), 1));

    let out = executor
        .execute(&antigravity_auth(), &openai_envelope("gemini-2.5-flash", false))
        .await
        .unwrap();
    let out: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(out["choices"][0]["message"]["content"], "hello");
    assert_eq!(transport.request_count(), 2);

    // Usage is reported exactly once.
    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].tokens.total, 3);
}

#[tokio::test]
async fn quota_429_with_retry_info_surfaces_with_retry_after() {
    let body = json!({"error": {"code": 429, "details": [{"retryDelay": "7s"}]}});
    // One response per fallback base URL; all three rate limited.
    let transport = ScriptedTransport::new(vec![
        Scripted { status: 429, body: body.to_string() },
        Scripted { status: 429, body: body.to_string() },
        Scripted { status: 429, body: body.to_string() },
    ]);
    let sink = Arc::new(CaptureSink::default());
    let executor = AntigravityExecutor::new(context(transport, sink, 0));

    let err = executor
        .execute(&antigravity_auth(), &openai_envelope("gemini-2.5-flash", false))
        .await
        .unwrap_err();
    assert_eq!(err.code, 429);
    assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn empty_stream_recovers_on_retry() {
    let empty_body = "data: {}\n".repeat(60);
    let good_body = gemini_line("recovered", Some("STOP"));
    let transport = ScriptedTransport::new(vec![
        Scripted {
            status: 200,
            body: empty_body,
        },
        Scripted {
            status: 200,
            body: good_body,
        },
    ]);
    let sink = Arc::new(CaptureSink::default());
    let executor = AntigravityExecutor::new(context(transport.clone(), sink.clone(), 1));

    let stream = executor
        .execute_stream(&antigravity_auth(), &openai_envelope("gemini-2.5-flash", true))
        .await
        .unwrap();
    let (combined, errors) = collect_stream(stream).await;
    assert_eq!(errors, 0);
    assert!(combined.contains("recovered"));
    assert_eq!(combined.matches("[DONE]").count(), 1);
    assert_eq!(transport.request_count(), 2);
    assert_eq!(sink.records.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_function_call_is_repaired_into_tool_call() {
    let malformed = json!({"response": {"candidates": [{
        "finishReason": "MALFORMED_FUNCTION_CALL",
        "finishMessage": "{name: 'search', args: {q: 'x',}}",
    }]}});
    let body = format!("data: {malformed}\n");
    let transport = ScriptedTransport::new(vec![Scripted {
        status: 200,
        body,
    }]);
    let sink = Arc::new(CaptureSink::default());
    let executor = AntigravityExecutor::new(context(transport, sink, 0));

    let stream = executor
        .execute_stream(&antigravity_auth(), &openai_envelope("gemini-2.5-flash", true))
        .await
        .unwrap();
    let (combined, errors) = collect_stream(stream).await;
    assert_eq!(errors, 0);
    assert!(combined.contains("\"tool_calls\""));
    assert!(combined.contains("\"search\""));
    assert!(combined.contains("\\\"q\\\":\\\"x\\\"") || combined.contains("\"q\":\"x\""));
    assert_eq!(combined.matches("[DONE]").count(), 1);
}

#[tokio::test]
async fn claude_client_streaming_from_antigravity() {
    let thought = json!({"response": {"candidates": [{"content": {"role": "model", "parts": [
        {"text": "pondering", "thought": true},
    ]}}]}});
    let text = json!({"response": {"candidates": [{"content": {"parts": [
        {"text": "hello"},
    ]}, "finishReason": "STOP"}], "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}}});
    let body = format!("data: {thought}\ndata: {text}\n");
    let transport = ScriptedTransport::new(vec![Scripted {
        status: 200,
        body,
    }]);
    let sink = Arc::new(CaptureSink::default());
    let executor = AntigravityExecutor::new(context(transport, sink.clone(), 0));

    let payload = json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 1024,
        "stream": true,
        "messages": [{"role": "user", "content": "hi"}],
    });
    let envelope = RequestEnvelope::new(
        Dialect::Claude,
        "claude-sonnet-4-5",
        Bytes::from(serde_json::to_vec(&payload).unwrap()),
    )
    .with_stream(true);

    let stream = executor
        .execute_stream(&antigravity_auth(), &envelope)
        .await
        .unwrap();
    let (combined, errors) = collect_stream(stream).await;
    assert_eq!(errors, 0);
    let thinking_pos = combined.find("thinking_delta").unwrap();
    let text_pos = combined.find("text_delta").unwrap();
    let stop_pos = combined.find("message_stop").unwrap();
    assert!(thinking_pos < text_pos && text_pos < stop_pos);
    assert_eq!(combined.matches("message_stop").count(), 1);
    assert_eq!(sink.records.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn claude_nonstream_is_reassembled_from_stream() {
    let thought = json!({"response": {"candidates": [{"content": {"role": "model", "parts": [
        {"text": "thinking", "thought": true},
    ]}}]}});
    let answer = json!({"response": {"candidates": [{"content": {"parts": [
        {"text": "final answer"},
    ]}, "finishReason": "STOP"}], "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 4, "totalTokenCount": 7}}});
    let body = format!("data: {thought}\ndata: {answer}\n");
    let transport = ScriptedTransport::new(vec![Scripted {
        status: 200,
        body,
    }]);
    let sink = Arc::new(CaptureSink::default());
    let executor = AntigravityExecutor::new(context(transport.clone(), sink, 0));

    let payload = json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 512,
        "messages": [{"role": "user", "content": "hi"}],
    });
    let envelope = RequestEnvelope::new(
        Dialect::Claude,
        "claude-sonnet-4-5",
        Bytes::from(serde_json::to_vec(&payload).unwrap()),
    );

    let out = executor
        .execute(&antigravity_auth(), &envelope)
        .await
        .unwrap();
    let out: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(out["type"], "message");
    assert_eq!(out["content"][0]["type"], "thinking");
    assert_eq!(out["content"][1]["text"], "final answer");
    assert_eq!(out["stop_reason"], "end_turn");
    assert_eq!(out["usage"]["input_tokens"], 3);

    // The reassembly path hits the streaming endpoint.
    let requests = transport.requests.lock().unwrap();
    assert!(requests[0].url.contains("streamGenerateContent"));
}

#[tokio::test]
async fn openai_client_on_claude_provider_round_trips() {
    let upstream = json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": "hey"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 2, "output_tokens": 3},
    });
    let transport = ScriptedTransport::new(vec![Scripted {
        status: 200,
        body: upstream.to_string(),
    }]);
    let sink = Arc::new(CaptureSink::default());
    let executor = ClaudeExecutor::new(context(transport.clone(), sink.clone(), 0));

    let mut auth = Auth::new("cl-1", "claude", OffsetDateTime::now_utc());
    auth.attributes
        .insert("api_key".to_string(), "sk-ant-test".to_string());

    let out = executor
        .execute(&auth, &openai_envelope("claude-sonnet-4-5", false))
        .await
        .unwrap();
    let out: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(out["object"], "chat.completion");
    assert_eq!(out["choices"][0]["message"]["content"], "hey");
    assert_eq!(out["usage"]["total_tokens"], 5);

    // Credential injection happened via headers, not the body.
    let requests = transport.requests.lock().unwrap();
    assert!(
        requests[0]
            .headers
            .iter()
            .any(|(name, value)| name == "x-api-key" && value == "sk-ant-test")
    );
    let body: serde_json::Value =
        serde_json::from_slice(requests[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(body["model"], "claude-sonnet-4-5");
    assert_eq!(body["stream"], false);
    assert_eq!(sink.records.lock().unwrap().len(), 1);
}
