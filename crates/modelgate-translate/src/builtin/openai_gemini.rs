//! OpenAI chat completions ⇄ Gemini generateContent.
//!
//! Registered as the `(openai, gemini)` pair: requests go left to right,
//! responses come back right to left.

use bytes::Bytes;
use serde_json::{Value, json};

use modelgate_protocol::sse::{DONE_MARKER, sse_data_frame, sse_payload};

use crate::registry::{StreamInput, StreamState, TranslateContext};

use super::util::{
    chat_completion_id, epoch_seconds, gemini_finish_to_openai, gemini_usage_tokens,
    openai_content_text, openai_usage_object, parse_arguments, parse_data_url, system_instruction,
};

pub fn request(model: &str, payload: Value, _stream: bool) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    let mut system_parts: Vec<String> = Vec::new();

    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        for message in messages {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
            match role {
                "system" | "developer" => {
                    system_parts.push(openai_content_text(
                        message.get("content").unwrap_or(&Value::Null),
                    ));
                }
                "assistant" => contents.push(assistant_message_to_content(message)),
                "tool" => contents.push(tool_message_to_content(message)),
                _ => contents.push(user_message_to_content(message)),
            }
        }
    }

    let mut out = json!({ "contents": contents });
    if let Some(system) = system_instruction(system_parts) {
        out["systemInstruction"] = system;
    }
    if let Some(tools) = payload.get("tools").and_then(Value::as_array) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|tool| tool.get("function"))
            .map(|function| {
                json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "parametersJsonSchema": function.get("parameters").cloned().unwrap_or(json!({})),
                })
            })
            .collect();
        if !declarations.is_empty() {
            out["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
    }

    let mut generation = serde_json::Map::new();
    if let Some(v) = payload.get("temperature").filter(|v| !v.is_null()) {
        generation.insert("temperature".to_string(), v.clone());
    }
    if let Some(v) = payload.get("top_p").filter(|v| !v.is_null()) {
        generation.insert("topP".to_string(), v.clone());
    }
    let max_tokens = payload
        .get("max_completion_tokens")
        .or_else(|| payload.get("max_tokens"))
        .filter(|v| !v.is_null());
    if let Some(v) = max_tokens {
        generation.insert("maxOutputTokens".to_string(), v.clone());
    }
    if let Some(stop) = payload.get("stop").filter(|v| !v.is_null()) {
        let sequences = match stop {
            Value::String(s) => json!([s]),
            other => other.clone(),
        };
        generation.insert("stopSequences".to_string(), sequences);
    }
    if !generation.is_empty() {
        out["generationConfig"] = Value::Object(generation);
    }

    let _ = model;
    out
}

fn user_message_to_content(message: &Value) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    match message.get("content") {
        Some(Value::String(text)) => parts.push(json!({"text": text})),
        Some(Value::Array(items)) => {
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("image_url") => {
                        let url = item
                            .get("image_url")
                            .and_then(|v| v.get("url"))
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        if let Some((mime, data)) = parse_data_url(url) {
                            parts.push(json!({"inlineData": {"mimeType": mime, "data": data}}));
                        }
                    }
                    _ => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            parts.push(json!({"text": text}));
                        }
                    }
                }
            }
        }
        _ => {}
    }
    if parts.is_empty() {
        parts.push(json!({"text": ""}));
    }
    json!({"role": "user", "parts": parts})
}

fn assistant_message_to_content(message: &Value) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    let text = openai_content_text(message.get("content").unwrap_or(&Value::Null));
    if !text.is_empty() {
        parts.push(json!({"text": text}));
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let function = call.get("function").cloned().unwrap_or(json!({}));
            let args = function
                .get("arguments")
                .and_then(Value::as_str)
                .map(parse_arguments)
                .unwrap_or_else(|| json!({}));
            let mut function_call = json!({
                "name": function.get("name").cloned().unwrap_or(Value::Null),
                "args": args,
            });
            if let Some(id) = call.get("id").and_then(Value::as_str) {
                function_call["id"] = json!(id);
            }
            parts.push(json!({"functionCall": function_call}));
        }
    }
    if parts.is_empty() {
        parts.push(json!({"text": ""}));
    }
    json!({"role": "model", "parts": parts})
}

fn tool_message_to_content(message: &Value) -> Value {
    let name = message
        .get("tool_call_id")
        .and_then(Value::as_str)
        .unwrap_or("tool");
    let text = openai_content_text(message.get("content").unwrap_or(&Value::Null));
    json!({
        "role": "user",
        "parts": [{
            "functionResponse": {
                "name": name,
                "response": {"result": text},
            }
        }]
    })
}

/// Extracted view over one Gemini candidate's parts.
#[derive(Default)]
struct CandidateParts {
    text: String,
    reasoning: String,
    tool_calls: Vec<Value>,
}

fn collect_parts(candidate: &Value, next_tool_index: &mut i64) -> CandidateParts {
    let mut out = CandidateParts::default();
    let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
    else {
        return out;
    };
    for part in parts {
        if let Some(call) = part.get("functionCall") {
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(super::util::call_id);
            let arguments = call
                .get("args")
                .map(|args| serde_json::to_string(args).unwrap_or_default())
                .unwrap_or_default();
            out.tool_calls.push(json!({
                "index": *next_tool_index,
                "id": id,
                "type": "function",
                "function": {
                    "name": call.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": arguments,
                }
            }));
            *next_tool_index += 1;
            continue;
        }
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                out.reasoning.push_str(text);
            } else {
                out.text.push_str(text);
            }
        }
    }
    out
}

pub fn non_stream(ctx: &TranslateContext<'_>, body: &[u8]) -> Bytes {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Bytes::copy_from_slice(body);
    };
    let candidate = value
        .pointer("/candidates/0")
        .cloned()
        .unwrap_or(Value::Null);
    let mut tool_index = 0i64;
    let parts = collect_parts(&candidate, &mut tool_index);

    let mut message = json!({"role": "assistant", "content": parts.text});
    if !parts.reasoning.is_empty() {
        message["reasoning_content"] = json!(parts.reasoning);
    }
    if !parts.tool_calls.is_empty() {
        message["tool_calls"] = json!(parts.tool_calls);
    }

    let finish = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .unwrap_or("STOP");
    let (prompt, completion, total) =
        gemini_usage_tokens(value.get("usageMetadata").unwrap_or(&Value::Null));

    let out = json!({
        "id": value
            .get("responseId")
            .and_then(Value::as_str)
            .map(|id| format!("chatcmpl-{id}"))
            .unwrap_or_else(chat_completion_id),
        "object": "chat.completion",
        "created": epoch_seconds(),
        "model": ctx.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": gemini_finish_to_openai(finish, !parts.tool_calls.is_empty()),
        }],
        "usage": openai_usage_object(prompt, completion, total),
    });
    Bytes::from(serde_json::to_vec(&out).unwrap_or_default())
}

#[derive(Debug)]
pub(crate) struct GeminiToOpenAiStream {
    id: String,
    created: i64,
    role_sent: bool,
    tool_index: i64,
    finish_sent: bool,
    usage: Option<Value>,
    done_sent: bool,
}

impl GeminiToOpenAiStream {
    fn new() -> Self {
        Self {
            id: chat_completion_id(),
            created: epoch_seconds(),
            role_sent: false,
            tool_index: 0,
            finish_sent: false,
            usage: None,
            done_sent: false,
        }
    }

    fn chunk(&self, model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
        let mut out = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if finish_reason.is_some()
            && let Some(usage) = &self.usage
        {
            out["usage"] = usage.clone();
        }
        out
    }

    fn handle_payload(&mut self, model: &str, value: &Value) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if let Some(usage) = value.get("usageMetadata").filter(|u| !u.is_null()) {
            let (prompt, completion, total) = gemini_usage_tokens(usage);
            if total > 0 {
                self.usage = Some(openai_usage_object(prompt, completion, total));
            }
        }
        let Some(candidate) = value.pointer("/candidates/0") else {
            return frames;
        };
        let mut tool_index = self.tool_index;
        let parts = collect_parts(candidate, &mut tool_index);
        self.tool_index = tool_index;

        let mut delta = serde_json::Map::new();
        if !self.role_sent {
            delta.insert("role".to_string(), json!("assistant"));
            self.role_sent = true;
        }
        if !parts.reasoning.is_empty() {
            delta.insert("reasoning_content".to_string(), json!(parts.reasoning));
        }
        if !parts.text.is_empty() {
            delta.insert("content".to_string(), json!(parts.text));
        }
        if !parts.tool_calls.is_empty() {
            delta.insert("tool_calls".to_string(), json!(parts.tool_calls));
        }

        let finish = candidate.get("finishReason").and_then(Value::as_str);
        if let Some(finish) = finish {
            self.finish_sent = true;
            let reason = gemini_finish_to_openai(finish, !parts.tool_calls.is_empty());
            let chunk = self.chunk(model, Value::Object(delta), Some(reason));
            frames.push(sse_data_frame(&serde_json::to_vec(&chunk).unwrap_or_default()));
        } else if !delta.is_empty() {
            let chunk = self.chunk(model, Value::Object(delta), None);
            frames.push(sse_data_frame(&serde_json::to_vec(&chunk).unwrap_or_default()));
        }
        frames
    }

    fn finish(&mut self, model: &str) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.done_sent {
            return frames;
        }
        if !self.finish_sent {
            self.finish_sent = true;
            let chunk = self.chunk(model, json!({}), Some("stop"));
            frames.push(sse_data_frame(&serde_json::to_vec(&chunk).unwrap_or_default()));
        }
        self.done_sent = true;
        frames.push(sse_data_frame(DONE_MARKER.as_bytes()));
        frames
    }
}

pub fn stream(
    ctx: &TranslateContext<'_>,
    state: &mut StreamState,
    input: StreamInput<'_>,
) -> Vec<Bytes> {
    let stream_state = state.get_or_insert_with(GeminiToOpenAiStream::new);
    match input {
        StreamInput::Line(line) => match sse_payload(line) {
            Some(payload) => match serde_json::from_slice::<Value>(payload) {
                Ok(value) => stream_state.handle_payload(ctx.model, &value),
                Err(_) => Vec::new(),
            },
            None => Vec::new(),
        },
        StreamInput::Done => stream_state.finish(ctx.model),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>() -> TranslateContext<'a> {
        TranslateContext {
            model: "gemini-2.5-pro",
            original_request: b"{}",
            translated_request: b"{}",
        }
    }

    #[test]
    fn request_maps_roles_and_tools() {
        let payload = json!({
            "model": "gemini-2.5-pro",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "search", "arguments": "{\"q\":\"x\"}"},
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "found"},
            ],
            "tools": [{"type": "function", "function": {
                "name": "search",
                "description": "web search",
                "parameters": {"type": "object"},
            }}],
            "temperature": 0.5,
            "max_tokens": 256,
        });
        let out = request("gemini-2.5-pro", payload, false);
        let contents = out["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "search");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"]["q"], "x");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["result"],
            "found"
        );
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(
            out["tools"][0]["functionDeclarations"][0]["name"],
            "search"
        );
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn non_stream_maps_text_and_usage() {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "hello"},
                ]},
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 5, "totalTokenCount": 8},
        });
        let out = non_stream(&ctx(), &serde_json::to_vec(&body).unwrap());
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "hello");
        assert_eq!(
            out["choices"][0]["message"]["reasoning_content"],
            "thinking..."
        );
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["total_tokens"], 8);
    }

    #[test]
    fn stream_emits_single_done() {
        let mut state = StreamState::new();
        let context = ctx();
        let chunk = json!({"candidates": [{"content": {"parts": [{"text": "he"}]}}]});
        let line = format!("data: {chunk}");
        let frames = stream(&context, &mut state, StreamInput::Line(line.as_bytes()));
        assert_eq!(frames.len(), 1);
        let text = String::from_utf8(frames[0].to_vec()).unwrap();
        assert!(text.contains("\"content\":\"he\""));

        let frames = stream(&context, &mut state, StreamInput::Done);
        let combined: String = frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).to_string())
            .collect();
        assert_eq!(combined.matches(DONE_MARKER).count(), 1);
        // A second Done produces nothing further.
        assert!(stream(&context, &mut state, StreamInput::Done).is_empty());
    }

    #[test]
    fn stream_maps_tool_call() {
        let mut state = StreamState::new();
        let context = ctx();
        let chunk = json!({"candidates": [{
            "content": {"parts": [{"functionCall": {"name": "search", "args": {"q": "x"}}}]},
            "finishReason": "STOP",
        }]});
        let line = format!("data: {chunk}");
        let frames = stream(&context, &mut state, StreamInput::Line(line.as_bytes()));
        let text = String::from_utf8(frames[0].to_vec()).unwrap();
        assert!(text.contains("\"tool_calls\""));
        assert!(text.contains("\"finish_reason\":\"tool_calls\""));
    }
}
