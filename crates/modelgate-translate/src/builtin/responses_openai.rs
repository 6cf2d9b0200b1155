//! OpenAI Responses ⇄ OpenAI chat completions.
//!
//! Used directly for responses clients on chat-completion providers, and
//! as the first leg of composite pairs onto Gemini-shaped upstreams.

use bytes::Bytes;
use serde_json::{Value, json};

use modelgate_protocol::sse::{sse_named_frame, sse_payload};

use crate::registry::{StreamInput, StreamState, TranslateContext};

use super::util::{epoch_seconds, message_id, response_id};

pub fn request(model: &str, payload: Value, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(instructions) = payload.get("instructions").and_then(Value::as_str)
        && !instructions.trim().is_empty()
    {
        messages.push(json!({"role": "system", "content": instructions}));
    }

    match payload.get("input") {
        Some(Value::String(text)) => {
            messages.push(json!({"role": "user", "content": text}));
        }
        Some(Value::Array(items)) => {
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("function_call") => messages.push(json!({
                        "role": "assistant",
                        "content": Value::Null,
                        "tool_calls": [{
                            "id": item.get("call_id").cloned().unwrap_or(Value::Null),
                            "type": "function",
                            "function": {
                                "name": item.get("name").cloned().unwrap_or(Value::Null),
                                "arguments": item.get("arguments").cloned().unwrap_or(json!("{}")),
                            }
                        }],
                    })),
                    Some("function_call_output") => messages.push(json!({
                        "role": "tool",
                        "tool_call_id": item.get("call_id").cloned().unwrap_or(Value::Null),
                        "content": item.get("output").cloned().unwrap_or(json!("")),
                    })),
                    _ => {
                        let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
                        let text = match item.get("content") {
                            Some(Value::String(text)) => text.clone(),
                            Some(Value::Array(parts)) => parts
                                .iter()
                                .filter_map(|p| p.get("text").and_then(Value::as_str))
                                .collect(),
                            _ => String::new(),
                        };
                        messages.push(json!({"role": role, "content": text}));
                    }
                }
            }
        }
        _ => {}
    }

    let mut out = json!({"model": model, "messages": messages, "stream": stream});
    if let Some(tools) = payload.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools
            .iter()
            .filter(|tool| tool.get("type").and_then(Value::as_str) == Some("function"))
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("parameters").cloned().unwrap_or(json!({})),
                    }
                })
            })
            .collect();
        if !mapped.is_empty() {
            out["tools"] = json!(mapped);
        }
    }
    if let Some(v) = payload.get("max_output_tokens").filter(|v| !v.is_null()) {
        out["max_completion_tokens"] = v.clone();
    }
    for field in ["temperature", "top_p"] {
        if let Some(v) = payload.get(field).filter(|v| !v.is_null()) {
            out[field] = v.clone();
        }
    }
    if let Some(effort) = payload.pointer("/reasoning/effort").and_then(Value::as_str) {
        out["reasoning_effort"] = json!(effort);
    }
    out
}

fn response_from_chat(model: &str, chat: &Value) -> Value {
    let choice = chat.pointer("/choices/0").cloned().unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut output: Vec<Value> = Vec::new();
    if let Some(reasoning) = message.get("reasoning_content").and_then(Value::as_str)
        && !reasoning.is_empty()
    {
        output.push(json!({
            "type": "reasoning",
            "id": format!("rs_{}", uuid::Uuid::new_v4().simple()),
            "summary": [{"type": "summary_text", "text": reasoning}],
        }));
    }
    if let Some(text) = message.get("content").and_then(Value::as_str)
        && !text.is_empty()
    {
        output.push(json!({
            "type": "message",
            "id": message_id(),
            "role": "assistant",
            "status": "completed",
            "content": [{"type": "output_text", "text": text, "annotations": []}],
        }));
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            output.push(json!({
                "type": "function_call",
                "id": format!("fc_{}", uuid::Uuid::new_v4().simple()),
                "call_id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": call.pointer("/function/name").cloned().unwrap_or(Value::Null),
                "arguments": call
                    .pointer("/function/arguments")
                    .cloned()
                    .unwrap_or(json!("{}")),
                "status": "completed",
            }));
        }
    }

    let status = match choice.get("finish_reason").and_then(Value::as_str) {
        Some("length") => "incomplete",
        _ => "completed",
    };
    let prompt = chat
        .pointer("/usage/prompt_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let completion = chat
        .pointer("/usage/completion_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    json!({
        "id": response_id(),
        "object": "response",
        "created_at": epoch_seconds(),
        "status": status,
        "model": model,
        "output": output,
        "usage": {
            "input_tokens": prompt,
            "output_tokens": completion,
            "total_tokens": prompt + completion,
        },
    })
}

pub fn non_stream(ctx: &TranslateContext<'_>, body: &[u8]) -> Bytes {
    let Ok(chat) = serde_json::from_slice::<Value>(body) else {
        return Bytes::copy_from_slice(body);
    };
    let out = response_from_chat(ctx.model, &chat);
    Bytes::from(serde_json::to_vec(&out).unwrap_or_default())
}

#[derive(Debug)]
pub(crate) struct ChatToResponsesStream {
    id: String,
    created_sent: bool,
    text: String,
    reasoning: String,
    usage: Option<Value>,
    completed_sent: bool,
}

impl ChatToResponsesStream {
    fn new() -> Self {
        Self {
            id: response_id(),
            created_sent: false,
            text: String::new(),
            reasoning: String::new(),
            usage: None,
            completed_sent: false,
        }
    }

    fn frame(event: &str, payload: &Value) -> Bytes {
        sse_named_frame(event, &serde_json::to_vec(payload).unwrap_or_default())
    }

    fn handle_chunk(&mut self, model: &str, chunk: &Value) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.completed_sent {
            return frames;
        }
        if !self.created_sent {
            self.created_sent = true;
            frames.push(Self::frame(
                "response.created",
                &json!({
                    "type": "response.created",
                    "response": {"id": self.id, "object": "response", "status": "in_progress", "model": model},
                }),
            ));
        }
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            let prompt = usage
                .get("prompt_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let completion = usage
                .get("completion_tokens")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            self.usage = Some(json!({
                "input_tokens": prompt,
                "output_tokens": completion,
                "total_tokens": prompt + completion,
            }));
        }
        let choice = chunk.pointer("/choices/0").cloned().unwrap_or(Value::Null);
        if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str)
            && !text.is_empty()
        {
            self.text.push_str(text);
            frames.push(Self::frame(
                "response.output_text.delta",
                &json!({"type": "response.output_text.delta", "delta": text}),
            ));
        }
        if let Some(text) = choice
            .pointer("/delta/reasoning_content")
            .and_then(Value::as_str)
            && !text.is_empty()
        {
            self.reasoning.push_str(text);
            frames.push(Self::frame(
                "response.reasoning_summary_text.delta",
                &json!({"type": "response.reasoning_summary_text.delta", "delta": text}),
            ));
        }
        if choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .is_some()
        {
            frames.extend(self.complete(model));
        }
        frames
    }

    fn complete(&mut self, model: &str) -> Vec<Bytes> {
        if self.completed_sent {
            return Vec::new();
        }
        self.completed_sent = true;
        let mut response = json!({
            "id": self.id,
            "object": "response",
            "status": "completed",
            "model": model,
            "output": [{
                "type": "message",
                "id": message_id(),
                "role": "assistant",
                "status": "completed",
                "content": [{"type": "output_text", "text": self.text, "annotations": []}],
            }],
        });
        if let Some(usage) = &self.usage {
            response["usage"] = usage.clone();
        }
        vec![Self::frame(
            "response.completed",
            &json!({"type": "response.completed", "response": response}),
        )]
    }
}

pub fn stream(
    ctx: &TranslateContext<'_>,
    state: &mut StreamState,
    input: StreamInput<'_>,
) -> Vec<Bytes> {
    let stream_state = state.get_or_insert_with(ChatToResponsesStream::new);
    match input {
        StreamInput::Line(line) => match sse_payload(line) {
            Some(payload) => match serde_json::from_slice::<Value>(payload) {
                Ok(chunk) => stream_state.handle_chunk(ctx.model, &chunk),
                Err(_) => Vec::new(),
            },
            None => Vec::new(),
        },
        StreamInput::Done => stream_state.complete(ctx.model),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>() -> TranslateContext<'a> {
        TranslateContext {
            model: "gpt-5",
            original_request: b"{}",
            translated_request: b"{}",
        }
    }

    #[test]
    fn request_maps_input_items() {
        let payload = json!({
            "model": "gpt-5",
            "instructions": "be terse",
            "input": [
                {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "hi"}]},
                {"type": "function_call", "call_id": "c1", "name": "f", "arguments": "{}"},
                {"type": "function_call_output", "call_id": "c1", "output": "ok"},
            ],
            "max_output_tokens": 64,
            "reasoning": {"effort": "low"},
        });
        let out = request("gpt-5", payload, true);
        assert_eq!(out["messages"][0]["role"], "system");
        assert_eq!(out["messages"][1]["content"], "hi");
        assert_eq!(out["messages"][2]["tool_calls"][0]["id"], "c1");
        assert_eq!(out["messages"][3]["role"], "tool");
        assert_eq!(out["max_completion_tokens"], 64);
        assert_eq!(out["reasoning_effort"], "low");
        assert_eq!(out["stream"], true);
    }

    #[test]
    fn non_stream_builds_response() {
        let chat = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "hello", "tool_calls": [{
                    "id": "call_1",
                    "function": {"name": "f", "arguments": "{}"},
                }]},
                "finish_reason": "tool_calls",
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4},
        });
        let out = non_stream(&ctx(), &serde_json::to_vec(&chat).unwrap());
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(out["object"], "response");
        assert_eq!(out["output"][0]["type"], "message");
        assert_eq!(out["output"][1]["type"], "function_call");
        assert_eq!(out["usage"]["total_tokens"], 7);
    }

    #[test]
    fn stream_terminates_once() {
        let mut state = StreamState::new();
        let context = ctx();
        let mut combined = String::new();
        for chunk in [
            json!({"choices": [{"delta": {"role": "assistant", "content": "he"}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "stop"}], "usage": {"prompt_tokens": 1, "completion_tokens": 1}}),
        ] {
            let line = format!("data: {chunk}");
            for frame in stream(&context, &mut state, StreamInput::Line(line.as_bytes())) {
                combined.push_str(&String::from_utf8_lossy(&frame));
            }
        }
        for frame in stream(&context, &mut state, StreamInput::Done) {
            combined.push_str(&String::from_utf8_lossy(&frame));
        }
        assert_eq!(combined.matches("response.created").count(), 1);
        assert_eq!(combined.matches("response.completed").count(), 1);
    }
}
