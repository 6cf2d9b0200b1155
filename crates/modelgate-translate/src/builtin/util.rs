use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

pub(crate) fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

pub(crate) fn chat_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn response_id() -> String {
    format!("resp_{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Flattens OpenAI message content (string or part array) into plain text.
pub(crate) fn openai_content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
            out
        }
        _ => String::new(),
    }
}

/// Splits a `data:<mime>;base64,<payload>` URL into its halves.
pub(crate) fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    Some((mime.to_string(), data.to_string()))
}

/// Parses a JSON-encoded tool-argument string, defaulting to `{}`.
pub(crate) fn parse_arguments(arguments: &str) -> Value {
    serde_json::from_str(arguments).unwrap_or_else(|_| json!({}))
}

pub(crate) fn gemini_finish_to_openai(reason: &str, has_tool_calls: bool) -> &'static str {
    if has_tool_calls {
        return "tool_calls";
    }
    match reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" | "BLOCKLIST" => "content_filter",
        _ => "stop",
    }
}

pub(crate) fn gemini_finish_to_claude(reason: &str, has_tool_calls: bool) -> &'static str {
    if has_tool_calls {
        return "tool_use";
    }
    match reason {
        "MAX_TOKENS" => "max_tokens",
        "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" | "BLOCKLIST" => "refusal",
        _ => "end_turn",
    }
}

pub(crate) fn claude_stop_to_openai(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        _ => "stop",
    }
}

/// Gemini `usageMetadata` → `(prompt, completion, total)` token counts.
///
/// `thoughtsTokenCount` counts toward completion, matching how upstream
/// reports totals.
pub(crate) fn gemini_usage_tokens(usage: &Value) -> (i64, i64, i64) {
    let prompt = usage
        .get("promptTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let candidates = usage
        .get("candidatesTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let thoughts = usage
        .get("thoughtsTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let total = usage
        .get("totalTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(prompt + candidates + thoughts);
    (prompt, candidates + thoughts, total)
}

pub(crate) fn openai_usage_object(prompt: i64, completion: i64, total: i64) -> Value {
    json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": total,
    })
}

/// Collects `systemInstruction` parts from plain text.
pub(crate) fn system_instruction(parts: Vec<String>) -> Option<Value> {
    let parts: Vec<Value> = parts
        .into_iter()
        .filter(|text| !text.trim().is_empty())
        .map(|text| json!({"text": text}))
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(json!({"role": "user", "parts": parts}))
}

