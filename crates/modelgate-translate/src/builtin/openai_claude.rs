//! OpenAI chat completions ⇄ Claude Messages.

use bytes::Bytes;
use serde_json::{Value, json};

use modelgate_protocol::sse::{DONE_MARKER, sse_data_frame, sse_payload};

use crate::registry::{StreamInput, StreamState, TranslateContext};

use super::util::{
    chat_completion_id, claude_stop_to_openai, epoch_seconds, openai_content_text,
    openai_usage_object, parse_arguments,
};

const DEFAULT_MAX_TOKENS: i64 = 4096;

pub fn request(model: &str, payload: Value, _stream: bool) -> Value {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    if let Some(items) = payload.get("messages").and_then(Value::as_array) {
        for message in items {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
            match role {
                "system" | "developer" => system_parts.push(openai_content_text(
                    message.get("content").unwrap_or(&Value::Null),
                )),
                "assistant" => messages.push(assistant_to_claude(message)),
                "tool" => messages.push(tool_to_claude(message)),
                _ => {
                    let text = openai_content_text(message.get("content").unwrap_or(&Value::Null));
                    messages.push(json!({"role": "user", "content": text}));
                }
            }
        }
    }

    let max_tokens = payload
        .get("max_completion_tokens")
        .or_else(|| payload.get("max_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_MAX_TOKENS);

    let mut out = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });
    let system = system_parts.join("\n");
    if !system.trim().is_empty() {
        out["system"] = json!(system);
    }
    for field in ["temperature", "top_p"] {
        if let Some(v) = payload.get(field).filter(|v| !v.is_null()) {
            out[field] = v.clone();
        }
    }
    if let Some(stop) = payload.get("stop").filter(|v| !v.is_null()) {
        out["stop_sequences"] = match stop {
            Value::String(s) => json!([s]),
            other => other.clone(),
        };
    }
    if let Some(tools) = payload.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools
            .iter()
            .filter_map(|tool| tool.get("function"))
            .map(|function| {
                json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "input_schema": function.get("parameters").cloned().unwrap_or(json!({})),
                })
            })
            .collect();
        if !mapped.is_empty() {
            out["tools"] = json!(mapped);
        }
    }
    out
}

fn assistant_to_claude(message: &Value) -> Value {
    let mut blocks: Vec<Value> = Vec::new();
    let text = openai_content_text(message.get("content").unwrap_or(&Value::Null));
    if !text.is_empty() {
        blocks.push(json!({"type": "text", "text": text}));
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let function = call.get("function").cloned().unwrap_or(json!({}));
            blocks.push(json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": function.get("name").cloned().unwrap_or(Value::Null),
                "input": function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .map(parse_arguments)
                    .unwrap_or_else(|| json!({})),
            }));
        }
    }
    if blocks.is_empty() {
        blocks.push(json!({"type": "text", "text": ""}));
    }
    json!({"role": "assistant", "content": blocks})
}

fn tool_to_claude(message: &Value) -> Value {
    json!({
        "role": "user",
        "content": [{
            "type": "tool_result",
            "tool_use_id": message.get("tool_call_id").cloned().unwrap_or(Value::Null),
            "content": openai_content_text(message.get("content").unwrap_or(&Value::Null)),
        }]
    })
}

pub fn non_stream(ctx: &TranslateContext<'_>, body: &[u8]) -> Bytes {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Bytes::copy_from_slice(body);
    };

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    if let Some(blocks) = value.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    text.push_str(block.get("text").and_then(Value::as_str).unwrap_or(""))
                }
                Some("thinking") => {
                    reasoning.push_str(block.get("thinking").and_then(Value::as_str).unwrap_or(""))
                }
                Some("tool_use") => {
                    let arguments = block
                        .get("input")
                        .map(|i| serde_json::to_string(i).unwrap_or_default())
                        .unwrap_or_default();
                    tool_calls.push(json!({
                        "index": tool_calls.len(),
                        "id": block.get("id").cloned().unwrap_or(Value::Null),
                        "type": "function",
                        "function": {
                            "name": block.get("name").cloned().unwrap_or(Value::Null),
                            "arguments": arguments,
                        }
                    }));
                }
                _ => {}
            }
        }
    }

    let mut message = json!({"role": "assistant", "content": text});
    if !reasoning.is_empty() {
        message["reasoning_content"] = json!(reasoning);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }

    let stop = value
        .get("stop_reason")
        .and_then(Value::as_str)
        .unwrap_or("end_turn");
    let prompt = value
        .pointer("/usage/input_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let completion = value
        .pointer("/usage/output_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);

    let out = json!({
        "id": value
            .get("id")
            .and_then(Value::as_str)
            .map(|id| format!("chatcmpl-{id}"))
            .unwrap_or_else(chat_completion_id),
        "object": "chat.completion",
        "created": epoch_seconds(),
        "model": ctx.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": claude_stop_to_openai(stop),
        }],
        "usage": openai_usage_object(prompt, completion, prompt + completion),
    });
    Bytes::from(serde_json::to_vec(&out).unwrap_or_default())
}

#[derive(Debug, Default)]
struct ToolBlock {
    id: String,
    name: String,
    openai_index: i64,
    started: bool,
}

#[derive(Debug)]
pub(crate) struct ClaudeToOpenAiStream {
    id: String,
    created: i64,
    role_sent: bool,
    tools: std::collections::BTreeMap<u64, ToolBlock>,
    next_tool_index: i64,
    input_tokens: i64,
    output_tokens: i64,
    finish_sent: bool,
    done_sent: bool,
}

impl ClaudeToOpenAiStream {
    fn new() -> Self {
        Self {
            id: chat_completion_id(),
            created: epoch_seconds(),
            role_sent: false,
            tools: std::collections::BTreeMap::new(),
            next_tool_index: 0,
            input_tokens: 0,
            output_tokens: 0,
            finish_sent: false,
            done_sent: false,
        }
    }

    fn chunk(&self, model: &str, delta: Value, finish_reason: Option<&str>) -> Bytes {
        let mut out = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        });
        if finish_reason.is_some() {
            out["usage"] = openai_usage_object(
                self.input_tokens,
                self.output_tokens,
                self.input_tokens + self.output_tokens,
            );
        }
        sse_data_frame(&serde_json::to_vec(&out).unwrap_or_default())
    }

    fn delta_with_role(&mut self, mut delta: Value) -> Value {
        if !self.role_sent {
            delta["role"] = json!("assistant");
            self.role_sent = true;
        }
        delta
    }

    fn handle_event(&mut self, model: &str, event: &Value) -> Vec<Bytes> {
        let mut frames = Vec::new();
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                self.input_tokens = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
            }
            Some("content_block_start") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(block) = event.get("content_block")
                    && block.get("type").and_then(Value::as_str) == Some("tool_use")
                {
                    let tool = ToolBlock {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        openai_index: self.next_tool_index,
                        started: false,
                    };
                    self.next_tool_index += 1;
                    self.tools.insert(index, tool);
                }
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                match event.pointer("/delta/type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = event.pointer("/delta/text").and_then(Value::as_str) {
                            let delta = self.delta_with_role(json!({"content": text}));
                            frames.push(self.chunk(model, delta, None));
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) =
                            event.pointer("/delta/thinking").and_then(Value::as_str)
                        {
                            let delta =
                                self.delta_with_role(json!({"reasoning_content": text}));
                            frames.push(self.chunk(model, delta, None));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) =
                            event.pointer("/delta/partial_json").and_then(Value::as_str)
                        {
                            let Some(tool) = self.tools.get_mut(&index) else {
                                return frames;
                            };
                            let mut call = json!({
                                "index": tool.openai_index,
                                "function": {"arguments": partial},
                            });
                            if !tool.started {
                                tool.started = true;
                                call["id"] = json!(tool.id);
                                call["type"] = json!("function");
                                call["function"]["name"] = json!(tool.name);
                            }
                            let delta = self.delta_with_role(json!({"tool_calls": [call]}));
                            frames.push(self.chunk(model, delta, None));
                        }
                    }
                    _ => {}
                }
            }
            Some("message_delta") => {
                if let Some(tokens) = event
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_i64)
                {
                    self.output_tokens = tokens;
                }
                if let Some(stop) = event
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                {
                    self.finish_sent = true;
                    frames.push(self.chunk(model, json!({}), Some(claude_stop_to_openai(stop))));
                }
            }
            Some("message_stop") => {
                frames.extend(self.finish(model));
            }
            _ => {}
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
            frames.push(self.chunk(model, json!({}), Some("stop")));
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
    let stream_state = state.get_or_insert_with(ClaudeToOpenAiStream::new);
    match input {
        StreamInput::Line(line) => match sse_payload(line) {
            Some(payload) => match serde_json::from_slice::<Value>(payload) {
                Ok(event) => stream_state.handle_event(ctx.model, &event),
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
            model: "claude-sonnet-4-5",
            original_request: b"{}",
            translated_request: b"{}",
        }
    }

    #[test]
    fn request_maps_system_tools_and_history() {
        let payload = json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "system", "content": "be kind"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "checking", "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": {"name": "lookup", "arguments": "{\"k\":1}"},
                }]},
                {"role": "tool", "tool_call_id": "call_9", "content": "v"},
            ],
            "tools": [{"type": "function", "function": {"name": "lookup", "parameters": {}}}],
            "max_tokens": 512,
        });
        let out = request("claude-sonnet-4-5", payload, false);
        assert_eq!(out["system"], "be kind");
        assert_eq!(out["max_tokens"], 512);
        assert_eq!(out["messages"][1]["content"][1]["type"], "tool_use");
        assert_eq!(out["messages"][2]["content"][0]["tool_use_id"], "call_9");
        assert_eq!(out["tools"][0]["input_schema"], json!({}));
    }

    #[test]
    fn default_max_tokens_applied() {
        let out = request(
            "claude-sonnet-4-5",
            json!({"messages": [{"role": "user", "content": "x"}]}),
            false,
        );
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn non_stream_maps_tool_use() {
        let body = json!({
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "calling"},
                {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {"k": 1}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 7, "output_tokens": 9},
        });
        let out = non_stream(&ctx(), &serde_json::to_vec(&body).unwrap());
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            out["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "lookup"
        );
        assert_eq!(out["usage"]["total_tokens"], 16);
    }

    #[test]
    fn stream_translates_claude_events() {
        let mut state = StreamState::new();
        let context = ctx();
        let events = [
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 5}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "hey"}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}}),
            json!({"type": "message_stop"}),
        ];
        let mut combined = String::new();
        for event in events {
            let line = format!("data: {event}");
            for frame in stream(&context, &mut state, StreamInput::Line(line.as_bytes())) {
                combined.push_str(&String::from_utf8_lossy(&frame));
            }
        }
        assert!(combined.contains("\"content\":\"hey\""));
        assert!(combined.contains("\"finish_reason\":\"stop\""));
        assert_eq!(combined.matches(DONE_MARKER).count(), 1);
        assert!(stream(&context, &mut state, StreamInput::Done).is_empty());
    }
}
