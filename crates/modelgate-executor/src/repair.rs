//! Malformed tool-call detection and JSON repair.
//!
//! Some upstreams terminate a candidate with `MALFORMED_FUNCTION_CALL`
//! and ship the broken arguments in `finishMessage`. Repair handles the
//! three common defects: single quotes, unquoted keys, trailing commas.

use bytes::Bytes;
use serde_json::{Value, json};

/// Returns the malformed payload when a chunk carries the sentinel.
pub fn check_malformed_function_call(chunk: &Value) -> Option<String> {
    let finish = chunk
        .pointer("/candidates/0/finishReason")
        .and_then(Value::as_str)?;
    if finish != "MALFORMED_FUNCTION_CALL" {
        return None;
    }
    let message = chunk
        .pointer("/candidates/0/finishMessage")
        .and_then(Value::as_str)
        .unwrap_or("MALFORMED_FUNCTION_CALL detected");
    Some(message.to_string())
}

/// Attempts to repair broken tool-call JSON. Returns `None` when the text
/// still fails to parse after all fixes.
pub fn attempt_json_repair(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if serde_json::from_str::<Value>(raw).is_ok() {
        return Some(raw.to_string());
    }
    let fixed = replace_single_quotes(raw);
    let fixed = quote_bare_keys(&fixed);
    let fixed = drop_trailing_commas(&fixed);
    serde_json::from_str::<Value>(&fixed).ok()?;
    Some(fixed)
}

fn replace_single_quotes(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        let ch = bytes[i];
        if ch == b'"' && (i == 0 || bytes[i - 1] != b'\\') {
            in_string = !in_string;
            out.push('"');
        } else if ch == b'\'' && !in_string {
            out.push('"');
        } else {
            out.push(ch as char);
        }
        i += 1;
    }
    out
}

fn quote_bare_keys(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len() + 8);
    let mut i = 0;
    while i < bytes.len() {
        let ch = bytes[i];
        if ch == b'"' {
            // Copy the string literal verbatim.
            out.push('"');
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                if bytes[i] == b'\\' && i + 1 < bytes.len() {
                    out.push(bytes[i] as char);
                    i += 1;
                }
                out.push(bytes[i] as char);
                i += 1;
            }
            if i < bytes.len() {
                out.push('"');
                i += 1;
            }
            continue;
        }
        if ch == b'{' || ch == b',' {
            out.push(ch as char);
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                out.push(bytes[i] as char);
                i += 1;
            }
            if i < bytes.len() && is_identifier_start(bytes[i]) {
                let key_start = i;
                while i < bytes.len() && is_identifier_char(bytes[i]) {
                    i += 1;
                }
                let key = &input[key_start..i];
                let ws_start = i;
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                let ws = &input[ws_start..i];
                if i < bytes.len() && bytes[i] == b':' {
                    out.push('"');
                    out.push_str(key);
                    out.push('"');
                    out.push_str(ws);
                } else {
                    out.push_str(key);
                    out.push_str(ws);
                }
            }
            continue;
        }
        out.push(ch as char);
        i += 1;
    }
    out
}

fn drop_trailing_commas(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        let ch = bytes[i];
        if ch == b'"' {
            out.push('"');
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                if bytes[i] == b'\\' && i + 1 < bytes.len() {
                    out.push(bytes[i] as char);
                    i += 1;
                }
                out.push(bytes[i] as char);
                i += 1;
            }
            if i < bytes.len() {
                out.push('"');
                i += 1;
            }
            continue;
        }
        if ch == b',' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j < bytes.len() && (bytes[j] == b'}' || bytes[j] == b']') {
                i += 1;
                continue;
            }
        }
        out.push(ch as char);
        i += 1;
    }
    out
}

fn is_identifier_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_' || ch == b'$'
}

fn is_identifier_char(ch: u8) -> bool {
    is_identifier_start(ch) || ch.is_ascii_digit()
}

/// Builds a synthetic OpenAI tool-call chunk from repaired JSON, framed as
/// a `data:` line ready for stream translation.
pub fn repaired_tool_call_chunk(repaired: &str, model: &str) -> Option<Bytes> {
    let parsed: Value = serde_json::from_str(repaired).ok()?;
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let chunk = json!({
        "id": format!("repaired_{nonce}"),
        "object": "chat.completion.chunk",
        "created": std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": {
                "role": "assistant",
                "tool_calls": [{
                    "index": 0,
                    "id": format!("repaired_call_{nonce}"),
                    "type": "function",
                    "function": {
                        "name": parsed.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": parsed
                            .get("args")
                            .map(|args| args.to_string())
                            .unwrap_or_else(|| repaired.to_string()),
                    }
                }],
            },
            "finish_reason": "tool_calls",
        }],
    });
    let mut framed = b"data: ".to_vec();
    framed.extend_from_slice(&serde_json::to_vec(&chunk).ok()?);
    Some(Bytes::from(framed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_sentinel() {
        let chunk = serde_json::json!({"candidates": [{
            "finishReason": "MALFORMED_FUNCTION_CALL",
            "finishMessage": "{name: 'search'}",
        }]});
        assert_eq!(
            check_malformed_function_call(&chunk).as_deref(),
            Some("{name: 'search'}")
        );
        let ok = serde_json::json!({"candidates": [{"finishReason": "STOP"}]});
        assert!(check_malformed_function_call(&ok).is_none());
    }

    #[test]
    fn repairs_common_defects() {
        let fixed = attempt_json_repair("{name: 'search', args: {q: 'x',}}").unwrap();
        let value: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["name"], "search");
        assert_eq!(value["args"]["q"], "x");
    }

    #[test]
    fn valid_json_passes_through() {
        let input = r#"{"name":"search","args":{"q":"x"}}"#;
        assert_eq!(attempt_json_repair(input).unwrap(), input);
    }

    #[test]
    fn hopeless_input_fails() {
        assert!(attempt_json_repair("").is_none());
        assert!(attempt_json_repair("not even close {{{").is_none());
    }

    #[test]
    fn single_quotes_inside_strings_survive() {
        let fixed = attempt_json_repair(r#"{key: "it's fine"}"#).unwrap();
        let value: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["key"], "it's fine");
    }

    #[test]
    fn synthetic_chunk_is_a_tool_call() {
        let chunk = repaired_tool_call_chunk(r#"{"name":"search","args":{"q":"x"}}"#, "m").unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        let value: Value =
            serde_json::from_str(text.strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(
            value["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
            "search"
        );
        assert_eq!(value["choices"][0]["finish_reason"], "tool_calls");
    }
}
