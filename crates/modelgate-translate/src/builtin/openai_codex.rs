//! OpenAI chat completions ⇄ Codex (OpenAI Responses wire).

use bytes::Bytes;
use serde_json::{Value, json};

use modelgate_protocol::sse::{DONE_MARKER, sse_data_frame, sse_payload};

use crate::registry::{StreamInput, StreamState, TranslateContext};

use super::util::{chat_completion_id, epoch_seconds, openai_content_text, openai_usage_object};

pub fn request(model: &str, payload: Value, stream: bool) -> Value {
    let mut instructions: Vec<String> = Vec::new();
    let mut input: Vec<Value> = Vec::new();

    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        for message in messages {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
            match role {
                "system" | "developer" => instructions.push(openai_content_text(
                    message.get("content").unwrap_or(&Value::Null),
                )),
                "assistant" => {
                    let text = openai_content_text(message.get("content").unwrap_or(&Value::Null));
                    if !text.is_empty() {
                        input.push(json!({
                            "type": "message",
                            "role": "assistant",
                            "content": [{"type": "output_text", "text": text}],
                        }));
                    }
                    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
                        for call in calls {
                            let function = call.get("function").cloned().unwrap_or(json!({}));
                            input.push(json!({
                                "type": "function_call",
                                "call_id": call.get("id").cloned().unwrap_or(Value::Null),
                                "name": function.get("name").cloned().unwrap_or(Value::Null),
                                "arguments": function
                                    .get("arguments")
                                    .cloned()
                                    .unwrap_or(json!("{}")),
                            }));
                        }
                    }
                }
                "tool" => input.push(json!({
                    "type": "function_call_output",
                    "call_id": message.get("tool_call_id").cloned().unwrap_or(Value::Null),
                    "output": openai_content_text(message.get("content").unwrap_or(&Value::Null)),
                })),
                _ => input.push(json!({
                    "type": "message",
                    "role": "user",
                    "content": [{
                        "type": "input_text",
                        "text": openai_content_text(message.get("content").unwrap_or(&Value::Null)),
                    }],
                })),
            }
        }
    }

    let mut out = json!({
        "model": model,
        "input": input,
        "stream": stream,
        "store": false,
    });
    let instructions = instructions.join("\n");
    if !instructions.trim().is_empty() {
        out["instructions"] = json!(instructions);
    }
    if let Some(tools) = payload.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools
            .iter()
            .filter_map(|tool| tool.get("function"))
            .map(|function| {
                json!({
                    "type": "function",
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "parameters": function.get("parameters").cloned().unwrap_or(json!({})),
                })
            })
            .collect();
        if !mapped.is_empty() {
            out["tools"] = json!(mapped);
        }
    }
    if let Some(v) = payload
        .get("max_completion_tokens")
        .or_else(|| payload.get("max_tokens"))
        .filter(|v| !v.is_null())
    {
        out["max_output_tokens"] = v.clone();
    }
    for field in ["temperature", "top_p"] {
        if let Some(v) = payload.get(field).filter(|v| !v.is_null()) {
            out[field] = v.clone();
        }
    }
    if let Some(effort) = payload
        .get("reasoning_effort")
        .and_then(Value::as_str)
        .or_else(|| {
            payload
                .pointer("/reasoning/effort")
                .and_then(Value::as_str)
        })
    {
        out["reasoning"] = json!({"effort": effort});
    }
    out
}

pub fn non_stream(ctx: &TranslateContext<'_>, body: &[u8]) -> Bytes {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Bytes::copy_from_slice(body);
    };
    let response = value.get("response").unwrap_or(&value);

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    // Convenience aggregate some backends include.
    if let Some(aggregate) = response.get("output_text").and_then(Value::as_str) {
        text.push_str(aggregate);
    }
    if let Some(output) = response.get("output").and_then(Value::as_array) {
        for item in output {
            match item.get("type").and_then(Value::as_str) {
                Some("message") => {
                    if text.is_empty()
                        && let Some(content) = item.get("content").and_then(Value::as_array)
                    {
                        for part in content {
                            if let Some(t) = part.get("text").and_then(Value::as_str) {
                                text.push_str(t);
                            }
                        }
                    }
                }
                Some("reasoning") => {
                    if let Some(summary) = item.get("summary").and_then(Value::as_array) {
                        for part in summary {
                            if let Some(t) = part.get("text").and_then(Value::as_str) {
                                reasoning.push_str(t);
                            }
                        }
                    }
                }
                Some("function_call") => {
                    tool_calls.push(json!({
                        "index": tool_calls.len(),
                        "id": item
                            .get("call_id")
                            .or_else(|| item.get("id"))
                            .cloned()
                            .unwrap_or(Value::Null),
                        "type": "function",
                        "function": {
                            "name": item.get("name").cloned().unwrap_or(Value::Null),
                            "arguments": item.get("arguments").cloned().unwrap_or(json!("{}")),
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

    let finish = if !tool_calls.is_empty() {
        "tool_calls"
    } else if response.get("status").and_then(Value::as_str) == Some("incomplete") {
        "length"
    } else {
        "stop"
    };

    let prompt = response
        .pointer("/usage/input_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let completion = response
        .pointer("/usage/output_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let total = response
        .pointer("/usage/total_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(prompt + completion);

    let out = json!({
        "id": response
            .get("id")
            .and_then(Value::as_str)
            .map(|id| format!("chatcmpl-{id}"))
            .unwrap_or_else(chat_completion_id),
        "object": "chat.completion",
        "created": epoch_seconds(),
        "model": ctx.model,
        "choices": [{"index": 0, "message": message, "finish_reason": finish}],
        "usage": openai_usage_object(prompt, completion, total),
    });
    Bytes::from(serde_json::to_vec(&out).unwrap_or_default())
}

#[derive(Debug)]
pub(crate) struct CodexToOpenAiStream {
    id: String,
    created: i64,
    role_sent: bool,
    tool_index: i64,
    saw_tool_call: bool,
    usage: Option<Value>,
    finish_sent: bool,
    done_sent: bool,
}

impl CodexToOpenAiStream {
    fn new() -> Self {
        Self {
            id: chat_completion_id(),
            created: epoch_seconds(),
            role_sent: false,
            tool_index: -1,
            saw_tool_call: false,
            usage: None,
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
        if finish_reason.is_some()
            && let Some(usage) = &self.usage
        {
            out["usage"] = usage.clone();
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
            Some("response.output_text.delta") => {
                if let Some(text) = event.get("delta").and_then(Value::as_str) {
                    let delta = self.delta_with_role(json!({"content": text}));
                    frames.push(self.chunk(model, delta, None));
                }
            }
            Some("response.reasoning_summary_text.delta") => {
                if let Some(text) = event.get("delta").and_then(Value::as_str) {
                    let delta = self.delta_with_role(json!({"reasoning_content": text}));
                    frames.push(self.chunk(model, delta, None));
                }
            }
            Some("response.output_item.added") => {
                if let Some(item) = event.get("item")
                    && item.get("type").and_then(Value::as_str) == Some("function_call")
                {
                    self.tool_index += 1;
                    self.saw_tool_call = true;
                    let call = json!({
                        "index": self.tool_index,
                        "id": item
                            .get("call_id")
                            .or_else(|| item.get("id"))
                            .cloned()
                            .unwrap_or(Value::Null),
                        "type": "function",
                        "function": {
                            "name": item.get("name").cloned().unwrap_or(Value::Null),
                            "arguments": "",
                        }
                    });
                    let delta = self.delta_with_role(json!({"tool_calls": [call]}));
                    frames.push(self.chunk(model, delta, None));
                }
            }
            Some("response.function_call_arguments.delta") => {
                if let Some(arguments) = event.get("delta").and_then(Value::as_str)
                    && self.tool_index >= 0
                {
                    let call = json!({
                        "index": self.tool_index,
                        "function": {"arguments": arguments},
                    });
                    let delta = self.delta_with_role(json!({"tool_calls": [call]}));
                    frames.push(self.chunk(model, delta, None));
                }
            }
            Some("response.completed") | Some("response.incomplete") => {
                if let Some(usage) = event.pointer("/response/usage") {
                    let prompt = usage
                        .get("input_tokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    let completion = usage
                        .get("output_tokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    let total = usage
                        .get("total_tokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(prompt + completion);
                    self.usage = Some(openai_usage_object(prompt, completion, total));
                }
                let reason = if self.saw_tool_call {
                    "tool_calls"
                } else if event.get("type").and_then(Value::as_str)
                    == Some("response.incomplete")
                {
                    "length"
                } else {
                    "stop"
                };
                self.finish_sent = true;
                frames.push(self.chunk(model, json!({}), Some(reason)));
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
    let stream_state = state.get_or_insert_with(CodexToOpenAiStream::new);
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
            model: "gpt-5",
            original_request: b"{}",
            translated_request: b"{}",
        }
    }

    #[test]
    fn request_builds_responses_input() {
        let payload = json!({
            "model": "gpt-5",
            "messages": [
                {"role": "system", "content": "short answers"},
                {"role": "user", "content": "hi"},
            ],
            "max_tokens": 128,
            "reasoning_effort": "high",
            "stream": false,
        });
        let out = request("gpt-5", payload, false);
        assert_eq!(out["instructions"], "short answers");
        assert_eq!(out["input"][0]["type"], "message");
        assert_eq!(out["input"][0]["content"][0]["type"], "input_text");
        assert_eq!(out["max_output_tokens"], 128);
        assert_eq!(out["reasoning"]["effort"], "high");
        assert_eq!(out["store"], false);
    }

    #[test]
    fn non_stream_maps_output_text() {
        let body = json!({
            "id": "resp_1",
            "status": "completed",
            "output_text": "hello",
            "output": [],
            "usage": {"input_tokens": 2, "output_tokens": 3, "total_tokens": 5},
        });
        let out = non_stream(&ctx(), &serde_json::to_vec(&body).unwrap());
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "hello");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["total_tokens"], 5);
    }

    #[test]
    fn non_stream_maps_function_call() {
        let body = json!({
            "id": "resp_2",
            "status": "completed",
            "output": [{
                "type": "function_call",
                "call_id": "call_7",
                "name": "search",
                "arguments": "{\"q\":\"x\"}",
            }],
        });
        let out = non_stream(&ctx(), &serde_json::to_vec(&body).unwrap());
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            out["choices"][0]["message"]["tool_calls"][0]["id"],
            "call_7"
        );
    }

    #[test]
    fn stream_text_then_completed() {
        let mut state = StreamState::new();
        let context = ctx();
        let mut combined = String::new();
        for event in [
            json!({"type": "response.output_text.delta", "delta": "he"}),
            json!({"type": "response.output_text.delta", "delta": "y"}),
            json!({"type": "response.completed", "response": {"usage": {"input_tokens": 1, "output_tokens": 2}}}),
        ] {
            let line = format!("data: {event}");
            for frame in stream(&context, &mut state, StreamInput::Line(line.as_bytes())) {
                combined.push_str(&String::from_utf8_lossy(&frame));
            }
        }
        for frame in stream(&context, &mut state, StreamInput::Done) {
            combined.push_str(&String::from_utf8_lossy(&frame));
        }
        assert!(combined.contains("\"content\":\"he\""));
        assert!(combined.contains("\"finish_reason\":\"stop\""));
        assert_eq!(combined.matches(DONE_MARKER).count(), 1);
    }
}
