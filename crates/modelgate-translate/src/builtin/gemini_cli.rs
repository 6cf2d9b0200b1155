//! Gemini ⇄ the Gemini-CLI / Antigravity internal envelope.
//!
//! The CLI wire nests the standard body under `request` on the way out and
//! under `response` on the way back; everything else is untouched.

use bytes::Bytes;
use serde_json::{Value, json};

use modelgate_protocol::sse::{sse_data_frame, sse_payload};

use crate::registry::{StreamInput, StreamState, TranslateContext};

pub fn request(model: &str, payload: Value, _stream: bool) -> Value {
    json!({
        "model": model,
        "request": payload,
    })
}

/// Pulls the inner body out of a wrapped upstream value.
pub fn unwrap_response(value: Value) -> Value {
    match value {
        Value::Object(mut map) => match map.remove("response") {
            Some(inner) => inner,
            None => Value::Object(map),
        },
        other => other,
    }
}

pub fn non_stream(_ctx: &TranslateContext<'_>, body: &[u8]) -> Bytes {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Bytes::copy_from_slice(body);
    };
    let inner = unwrap_response(value);
    Bytes::from(serde_json::to_vec(&inner).unwrap_or_default())
}

pub fn stream(
    _ctx: &TranslateContext<'_>,
    _state: &mut StreamState,
    input: StreamInput<'_>,
) -> Vec<Bytes> {
    match input {
        StreamInput::Line(line) => match sse_payload(line) {
            Some(payload) => match serde_json::from_slice::<Value>(payload) {
                Ok(value) => {
                    let inner = unwrap_response(value);
                    vec![sse_data_frame(
                        &serde_json::to_vec(&inner).unwrap_or_default(),
                    )]
                }
                Err(_) => Vec::new(),
            },
            None => Vec::new(),
        },
        StreamInput::Done => Vec::new(),
    }
}
