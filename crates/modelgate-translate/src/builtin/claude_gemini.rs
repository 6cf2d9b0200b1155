//! Claude Messages ⇄ Gemini generateContent.
//!
//! The streaming direction rebuilds Claude's named-event protocol from
//! Gemini chunks: thought parts become `thinking_delta`, text becomes
//! `text_delta`, and function calls become `tool_use` blocks with
//! `input_json_delta` payloads.

use bytes::Bytes;
use serde_json::{Value, json};

use modelgate_protocol::sse::{sse_named_frame, sse_payload};

use crate::registry::{StreamInput, StreamState, TranslateContext};

use super::util::{gemini_finish_to_claude, gemini_usage_tokens, message_id, system_instruction};

pub fn request(model: &str, payload: Value, _stream: bool) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    let mut system_parts: Vec<String> = Vec::new();

    match payload.get("system") {
        Some(Value::String(text)) => system_parts.push(text.clone()),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    system_parts.push(text.to_string());
                }
            }
        }
        _ => {}
    }

    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        for message in messages {
            let role = match message.get("role").and_then(Value::as_str) {
                Some("assistant") => "model",
                _ => "user",
            };
            let parts = claude_content_to_parts(message.get("content").unwrap_or(&Value::Null));
            if !parts.is_empty() {
                contents.push(json!({"role": role, "parts": parts}));
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
            .filter(|tool| tool.get("name").is_some())
            .map(|tool| {
                json!({
                    "name": tool.get("name").cloned().unwrap_or(Value::Null),
                    "description": tool.get("description").cloned().unwrap_or(Value::Null),
                    "parametersJsonSchema": tool.get("input_schema").cloned().unwrap_or(json!({})),
                })
            })
            .collect();
        if !declarations.is_empty() {
            out["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
    }

    let mut generation = serde_json::Map::new();
    for (src, dst) in [
        ("max_tokens", "maxOutputTokens"),
        ("temperature", "temperature"),
        ("top_p", "topP"),
        ("top_k", "topK"),
    ] {
        if let Some(v) = payload.get(src).filter(|v| !v.is_null()) {
            generation.insert(dst.to_string(), v.clone());
        }
    }
    if let Some(stops) = payload.get("stop_sequences").filter(|v| !v.is_null()) {
        generation.insert("stopSequences".to_string(), stops.clone());
    }
    if let Some(thinking) = payload.get("thinking")
        && thinking.get("type").and_then(Value::as_str) == Some("enabled")
    {
        let mut config = json!({"includeThoughts": true});
        if let Some(budget) = thinking.get("budget_tokens").filter(|v| !v.is_null()) {
            config["thinkingBudget"] = budget.clone();
        }
        generation.insert("thinkingConfig".to_string(), config);
    }
    if !generation.is_empty() {
        out["generationConfig"] = Value::Object(generation);
    }

    let _ = model;
    out
}

fn claude_content_to_parts(content: &Value) -> Vec<Value> {
    let mut parts = Vec::new();
    match content {
        Value::String(text) => parts.push(json!({"text": text})),
        Value::Array(blocks) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            parts.push(json!({"text": text}));
                        }
                    }
                    Some("thinking") => {
                        let mut part = json!({
                            "thought": true,
                            "text": block.get("thinking").cloned().unwrap_or(json!("")),
                        });
                        if let Some(sig) = block.get("signature").and_then(Value::as_str) {
                            part["thoughtSignature"] = json!(sig);
                        }
                        parts.push(part);
                    }
                    Some("image") => {
                        if let Some(source) = block.get("source") {
                            parts.push(json!({"inlineData": {
                                "mimeType": source.get("media_type").cloned().unwrap_or(json!("image/png")),
                                "data": source.get("data").cloned().unwrap_or(json!("")),
                            }}));
                        }
                    }
                    Some("tool_use") => {
                        parts.push(json!({"functionCall": {
                            "id": block.get("id").cloned().unwrap_or(Value::Null),
                            "name": block.get("name").cloned().unwrap_or(Value::Null),
                            "args": block.get("input").cloned().unwrap_or(json!({})),
                        }}));
                    }
                    Some("tool_result") => {
                        let name = block
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .unwrap_or("tool");
                        let result = match block.get("content") {
                            Some(Value::String(text)) => json!(text),
                            Some(Value::Array(items)) => {
                                let text: String = items
                                    .iter()
                                    .filter_map(|i| i.get("text").and_then(Value::as_str))
                                    .collect();
                                json!(text)
                            }
                            _ => json!(""),
                        };
                        parts.push(json!({"functionResponse": {
                            "name": name,
                            "response": {"result": result},
                        }}));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    parts
}

pub fn non_stream(ctx: &TranslateContext<'_>, body: &[u8]) -> Bytes {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Bytes::copy_from_slice(body);
    };
    let candidate = value
        .pointer("/candidates/0")
        .cloned()
        .unwrap_or(Value::Null);

    let mut content: Vec<Value> = Vec::new();
    let mut has_tool_use = false;
    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(call) = part.get("functionCall") {
                has_tool_use = true;
                content.push(json!({
                    "type": "tool_use",
                    "id": call
                        .get("id")
                        .cloned()
                        .unwrap_or_else(|| json!(super::util::call_id())),
                    "name": call.get("name").cloned().unwrap_or(Value::Null),
                    "input": call.get("args").cloned().unwrap_or(json!({})),
                }));
                continue;
            }
            let Some(text) = part.get("text").and_then(Value::as_str) else {
                continue;
            };
            if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                let mut block = json!({"type": "thinking", "thinking": text});
                if let Some(sig) = part.get("thoughtSignature").and_then(Value::as_str) {
                    block["signature"] = json!(sig);
                }
                content.push(block);
            } else {
                content.push(json!({"type": "text", "text": text}));
            }
        }
    }

    let finish = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .unwrap_or("STOP");
    let (prompt, completion, _) =
        gemini_usage_tokens(value.get("usageMetadata").unwrap_or(&Value::Null));

    let out = json!({
        "id": message_id(),
        "type": "message",
        "role": "assistant",
        "model": ctx.model,
        "content": content,
        "stop_reason": gemini_finish_to_claude(finish, has_tool_use),
        "stop_sequence": Value::Null,
        "usage": {"input_tokens": prompt, "output_tokens": completion},
    });
    Bytes::from(serde_json::to_vec(&out).unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
    ToolUse,
}

#[derive(Debug)]
pub(crate) struct GeminiToClaudeStream {
    message_started: bool,
    open_block: Option<(usize, BlockKind)>,
    next_block_index: usize,
    input_tokens: i64,
    output_tokens: i64,
    finished: bool,
}

impl GeminiToClaudeStream {
    fn new() -> Self {
        Self {
            message_started: false,
            open_block: None,
            next_block_index: 0,
            input_tokens: 0,
            output_tokens: 0,
            finished: false,
        }
    }

    fn frame(event: &str, payload: &Value) -> Bytes {
        sse_named_frame(event, &serde_json::to_vec(payload).unwrap_or_default())
    }

    fn ensure_message_start(&mut self, model: &str, frames: &mut Vec<Bytes>) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        frames.push(Self::frame(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": message_id(),
                    "type": "message",
                    "role": "assistant",
                    "model": model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            }),
        ));
    }

    fn open_block(&mut self, kind: BlockKind, start: Value, frames: &mut Vec<Bytes>) -> usize {
        if let Some((index, open_kind)) = self.open_block
            && open_kind == kind
            && kind != BlockKind::ToolUse
        {
            return index;
        }
        self.close_block(frames);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = Some((index, kind));
        frames.push(Self::frame(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": index,
                "content_block": start,
            }),
        ));
        index
    }

    fn close_block(&mut self, frames: &mut Vec<Bytes>) {
        if let Some((index, _)) = self.open_block.take() {
            frames.push(Self::frame(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }
    }

    fn handle_payload(&mut self, model: &str, value: &Value) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }
        self.ensure_message_start(model, &mut frames);

        if let Some(usage) = value.get("usageMetadata").filter(|u| !u.is_null()) {
            let (prompt, completion, _) = gemini_usage_tokens(usage);
            if prompt > 0 {
                self.input_tokens = prompt;
            }
            if completion > 0 {
                self.output_tokens = completion;
            }
        }

        let Some(candidate) = value.pointer("/candidates/0") else {
            return frames;
        };
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                self.handle_part(part, &mut frames);
            }
        }

        if let Some(finish) = candidate.get("finishReason").and_then(Value::as_str) {
            let has_tool_use = matches!(self.open_block, Some((_, BlockKind::ToolUse)));
            self.finish_message(
                gemini_finish_to_claude(finish, has_tool_use),
                &mut frames,
            );
        }
        frames
    }

    fn handle_part(&mut self, part: &Value, frames: &mut Vec<Bytes>) {
        if let Some(call) = part.get("functionCall") {
            let index = self.open_block(
                BlockKind::ToolUse,
                json!({
                    "type": "tool_use",
                    "id": call
                        .get("id")
                        .cloned()
                        .unwrap_or_else(|| json!(super::util::call_id())),
                    "name": call.get("name").cloned().unwrap_or(Value::Null),
                    "input": {},
                }),
                frames,
            );
            let args = call
                .get("args")
                .map(|a| serde_json::to_string(a).unwrap_or_default())
                .unwrap_or_default();
            if !args.is_empty() {
                frames.push(Self::frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "input_json_delta", "partial_json": args},
                    }),
                ));
            }
            return;
        }

        let Some(text) = part.get("text").and_then(Value::as_str) else {
            return;
        };
        let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
        if is_thought {
            let index = self.open_block(
                BlockKind::Thinking,
                json!({"type": "thinking", "thinking": ""}),
                frames,
            );
            if !text.is_empty() {
                frames.push(Self::frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "thinking_delta", "thinking": text},
                    }),
                ));
            }
            if let Some(sig) = part.get("thoughtSignature").and_then(Value::as_str) {
                frames.push(Self::frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "signature_delta", "signature": sig},
                    }),
                ));
            }
        } else {
            let index = self.open_block(
                BlockKind::Text,
                json!({"type": "text", "text": ""}),
                frames,
            );
            if !text.is_empty() {
                frames.push(Self::frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                ));
            }
        }
    }

    fn finish_message(&mut self, stop_reason: &str, frames: &mut Vec<Bytes>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.close_block(frames);
        frames.push(Self::frame(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
                "usage": {
                    "input_tokens": self.input_tokens,
                    "output_tokens": self.output_tokens,
                },
            }),
        ));
        frames.push(Self::frame(
            "message_stop",
            &json!({"type": "message_stop"}),
        ));
    }

    fn finish(&mut self, model: &str) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }
        self.ensure_message_start(model, &mut frames);
        self.finish_message("end_turn", &mut frames);
        frames
    }
}

pub fn stream(
    ctx: &TranslateContext<'_>,
    state: &mut StreamState,
    input: StreamInput<'_>,
) -> Vec<Bytes> {
    let stream_state = state.get_or_insert_with(GeminiToClaudeStream::new);
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

/// Claude `count_tokens` request → Gemini `countTokens`.
pub fn token_count_request(model: &str, payload: Value, _stream: bool) -> Value {
    let translated = request(model, payload, false);
    let mut out = json!({});
    if let Some(contents) = translated.get("contents") {
        out["contents"] = contents.clone();
    }
    out
}

/// Gemini `countTokens` response → Claude `count_tokens` response.
pub fn token_count_response(_ctx: &TranslateContext<'_>, total_tokens: i64, _body: &[u8]) -> Bytes {
    Bytes::from(
        serde_json::to_vec(&json!({"input_tokens": total_tokens})).unwrap_or_default(),
    )
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
    fn request_maps_blocks_and_thinking() {
        let payload = json!({
            "model": "claude-sonnet-4-5",
            "system": "stay factual",
            "max_tokens": 1024,
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "hi"},
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "42"},
                ]},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "hmm", "signature": "sig1"},
                    {"type": "tool_use", "id": "toolu_1", "name": "calc", "input": {"a": 1}},
                ]},
            ],
            "tools": [{"name": "calc", "description": "adds", "input_schema": {"type": "object"}}],
        });
        let out = request("claude-sonnet-4-5", payload, true);
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "stay factual");
        assert_eq!(out["contents"][0]["role"], "user");
        assert_eq!(
            out["contents"][0]["parts"][1]["functionResponse"]["name"],
            "toolu_1"
        );
        assert_eq!(out["contents"][1]["parts"][0]["thought"], true);
        assert_eq!(out["contents"][1]["parts"][0]["thoughtSignature"], "sig1");
        assert_eq!(out["contents"][1]["parts"][1]["functionCall"]["name"], "calc");
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(
            out["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            2048
        );
        assert_eq!(
            out["tools"][0]["functionDeclarations"][0]["parametersJsonSchema"]["type"],
            "object"
        );
    }

    #[test]
    fn non_stream_builds_claude_message() {
        let body = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "let me think", "thought": true, "thoughtSignature": "s"},
                    {"text": "answer"},
                ]},
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 4},
        });
        let out = non_stream(&ctx(), &serde_json::to_vec(&body).unwrap());
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(out["content"][0]["type"], "thinking");
        assert_eq!(out["content"][0]["signature"], "s");
        assert_eq!(out["content"][1]["text"], "answer");
        assert_eq!(out["stop_reason"], "end_turn");
        assert_eq!(out["usage"]["input_tokens"], 10);
    }

    #[test]
    fn stream_thought_then_text_then_stop() {
        let mut state = StreamState::new();
        let context = ctx();
        let chunk = json!({"candidates": [{"content": {"parts": [
            {"text": "pondering", "thought": true},
            {"text": "hello"},
        ]}, "finishReason": "STOP"}]});
        let line = format!("data: {chunk}");
        let frames = stream(&context, &mut state, StreamInput::Line(line.as_bytes()));
        let combined: String = frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).to_string())
            .collect();
        let thinking_pos = combined.find("thinking_delta").unwrap();
        let text_pos = combined.find("text_delta").unwrap();
        let stop_pos = combined.find("message_stop").unwrap();
        assert!(thinking_pos < text_pos && text_pos < stop_pos);
        assert_eq!(combined.matches("message_stop").count(), 1);
        // EOF after a finished stream adds nothing.
        assert!(stream(&context, &mut state, StreamInput::Done).is_empty());
    }

    #[test]
    fn token_count_round_trip() {
        let payload = json!({"model": "claude-sonnet-4-5", "messages": [
            {"role": "user", "content": "count me"}
        ]});
        let translated = token_count_request("claude-sonnet-4-5", payload, false);
        assert!(translated["contents"].is_array());
        let out = token_count_response(&ctx(), 17, b"{}");
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(out["input_tokens"], 17);
    }
}
