//! Built-in dialect pair registrations.
//!
//! Registration happens through an explicit call at service construction
//! so that order is deterministic and duplicate pairs fail loudly instead
//! of silently overwriting each other.

mod claude_gemini;
mod gemini_cli;
mod openai_claude;
mod openai_codex;
mod openai_gemini;
mod responses_openai;
mod util;

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use modelgate_protocol::Dialect;
use modelgate_protocol::sse::sse_payload;

use crate::registry::{
    NonStreamTransform, Registration, Registry, RegistryError, RequestTransform, StreamInput,
    StreamState, StreamTransform, TranslateContext,
};

type RequestFn = fn(&str, Value, bool) -> Value;
type StreamFn = fn(&TranslateContext<'_>, &mut StreamState, StreamInput<'_>) -> Vec<Bytes>;
type NonStreamFn = fn(&TranslateContext<'_>, &[u8]) -> Bytes;

/// Populates `registry` with every built-in pair. Call exactly once while
/// constructing the service.
pub fn register_builtin(registry: &mut Registry) -> Result<(), RegistryError> {
    use Dialect::*;

    // Direct pairs.
    registry.register(
        OpenAi,
        Gemini,
        plain(
            openai_gemini::request,
            openai_gemini::stream,
            openai_gemini::non_stream,
        ),
    )?;
    registry.register(
        Claude,
        Gemini,
        Registration {
            token_count_request: Some(Arc::new(claude_gemini::token_count_request)),
            token_count_response: Some(Arc::new(claude_gemini::token_count_response)),
            ..plain(
                claude_gemini::request,
                claude_gemini::stream,
                claude_gemini::non_stream,
            )
        },
    )?;
    registry.register(
        OpenAi,
        Claude,
        plain(
            openai_claude::request,
            openai_claude::stream,
            openai_claude::non_stream,
        ),
    )?;
    registry.register(
        OpenAi,
        Codex,
        plain(
            openai_codex::request,
            openai_codex::stream,
            openai_codex::non_stream,
        ),
    )?;
    registry.register(
        OpenAiResponses,
        OpenAi,
        plain(
            responses_openai::request,
            responses_openai::stream,
            responses_openai::non_stream,
        ),
    )?;
    registry.register(
        Gemini,
        GeminiCli,
        plain(gemini_cli::request, gemini_cli::stream, gemini_cli::non_stream),
    )?;
    registry.register(
        Gemini,
        Antigravity,
        plain(gemini_cli::request, gemini_cli::stream, gemini_cli::non_stream),
    )?;

    // The Codex wire *is* the Responses wire; only the dialect label differs.
    registry.register(OpenAiResponses, Codex, identity())?;

    // Composite pairs onto the CLI envelope. The intermediate value is
    // cloned by construction: each leg works on its own owned `Value`.
    for target in [GeminiCli, Antigravity] {
        registry.register(
            OpenAi,
            target,
            wrapped(
                openai_gemini::request,
                openai_gemini::stream,
                openai_gemini::non_stream,
                None,
            ),
        )?;
        registry.register(
            Claude,
            target,
            wrapped(
                claude_gemini::request,
                claude_gemini::stream,
                claude_gemini::non_stream,
                Some((
                    claude_gemini::token_count_request as RequestFn,
                    claude_gemini::token_count_response,
                )),
            ),
        )?;
        registry.register(
            OpenAiResponses,
            target,
            Registration {
                request: compose_request(responses_openai::request, move |model, payload, stream| {
                    gemini_cli::request(model, openai_gemini::request(model, payload, stream), stream)
                }),
                stream: compose_stream(
                    wrapped_stream(openai_gemini::stream),
                    Arc::new(responses_openai::stream),
                ),
                non_stream: compose_non_stream(
                    wrapped_non_stream(openai_gemini::non_stream),
                    Arc::new(responses_openai::non_stream),
                ),
                token_count_request: None,
                token_count_response: None,
            },
        )?;
    }

    // Responses clients on Gemini upstreams, without the CLI envelope.
    registry.register(
        OpenAiResponses,
        Gemini,
        Registration {
            request: compose_request(responses_openai::request, openai_gemini::request),
            stream: compose_stream(
                Arc::new(openai_gemini::stream),
                Arc::new(responses_openai::stream),
            ),
            non_stream: compose_non_stream(
                Arc::new(openai_gemini::non_stream),
                Arc::new(responses_openai::non_stream),
            ),
            token_count_request: None,
            token_count_response: None,
        },
    )?;

    Ok(())
}

fn plain(request: RequestFn, stream: StreamFn, non_stream: NonStreamFn) -> Registration {
    Registration {
        request: Arc::new(request),
        stream: Arc::new(stream),
        non_stream: Arc::new(non_stream),
        token_count_request: None,
        token_count_response: None,
    }
}

fn identity() -> Registration {
    fn passthrough_request(_model: &str, payload: Value, _stream: bool) -> Value {
        payload
    }
    fn passthrough_stream(
        _ctx: &TranslateContext<'_>,
        _state: &mut StreamState,
        input: StreamInput<'_>,
    ) -> Vec<Bytes> {
        match input {
            StreamInput::Line(line) if !line.is_empty() => {
                let mut framed = Vec::with_capacity(line.len() + 2);
                framed.extend_from_slice(line);
                framed.extend_from_slice(b"\n\n");
                vec![Bytes::from(framed)]
            }
            _ => Vec::new(),
        }
    }
    fn passthrough_non_stream(_ctx: &TranslateContext<'_>, body: &[u8]) -> Bytes {
        Bytes::copy_from_slice(body)
    }
    plain(passthrough_request, passthrough_stream, passthrough_non_stream)
}

/// A pair whose provider side is the CLI envelope around Gemini: the
/// request is wrapped, responses are unwrapped before the inner transform.
fn wrapped(
    request: RequestFn,
    stream: StreamFn,
    non_stream: NonStreamFn,
    token_count: Option<(
        RequestFn,
        fn(&TranslateContext<'_>, i64, &[u8]) -> Bytes,
    )>,
) -> Registration {
    Registration {
        request: compose_request(request, gemini_cli::request),
        stream: wrapped_stream(stream),
        non_stream: wrapped_non_stream(non_stream),
        token_count_request: token_count.map(|(req, _)| {
            let composed: RequestTransform = Arc::new(move |model: &str, payload: Value, s: bool| {
                let inner = req(model, payload, s);
                serde_json::json!({"request": inner})
            });
            composed
        }),
        token_count_response: token_count.map(|(_, resp)| {
            let transform: crate::registry::TokenCountTransform = Arc::new(resp);
            transform
        }),
    }
}

fn compose_request(first: RequestFn, second: RequestFn) -> RequestTransform {
    Arc::new(move |model: &str, payload: Value, stream: bool| {
        second(model, first(model, payload, stream), stream)
    })
}

fn wrapped_non_stream(inner: NonStreamFn) -> NonStreamTransform {
    Arc::new(move |ctx: &TranslateContext<'_>, body: &[u8]| {
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return inner(ctx, body);
        };
        let unwrapped = gemini_cli::unwrap_response(value);
        let bytes = serde_json::to_vec(&unwrapped).unwrap_or_default();
        inner(ctx, &bytes)
    })
}

fn wrapped_stream(inner: StreamFn) -> StreamTransform {
    Arc::new(
        move |ctx: &TranslateContext<'_>, state: &mut StreamState, input: StreamInput<'_>| {
            match input {
                StreamInput::Line(line) => {
                    let Some(payload) = sse_payload(line) else {
                        return Vec::new();
                    };
                    let Ok(value) = serde_json::from_slice::<Value>(payload) else {
                        return Vec::new();
                    };
                    let unwrapped = gemini_cli::unwrap_response(value);
                    let mut framed = b"data: ".to_vec();
                    framed.extend_from_slice(&serde_json::to_vec(&unwrapped).unwrap_or_default());
                    inner(ctx, state, StreamInput::Line(&framed))
                }
                StreamInput::Done => inner(ctx, state, StreamInput::Done),
            }
        },
    )
}

/// Chains two stream transforms: frames emitted by `first` are replayed
/// into `second` line by line, each leg holding its own state.
fn compose_stream(first: StreamTransform, second: StreamTransform) -> StreamTransform {
    struct ComposedState {
        first: StreamState,
        second: StreamState,
    }
    Arc::new(
        move |ctx: &TranslateContext<'_>, state: &mut StreamState, input: StreamInput<'_>| {
            let is_done = matches!(input, StreamInput::Done);
            let composed = state.get_or_insert_with(|| ComposedState {
                first: StreamState::new(),
                second: StreamState::new(),
            });
            let mid = first(ctx, &mut composed.first, input);
            let mut out = Vec::new();
            for frame in mid {
                for line in frame.split(|b| *b == b'\n') {
                    if line.is_empty() {
                        continue;
                    }
                    out.extend(second(ctx, &mut composed.second, StreamInput::Line(line)));
                }
            }
            if is_done {
                out.extend(second(ctx, &mut composed.second, StreamInput::Done));
            }
            out
        },
    )
}

fn compose_non_stream(first: NonStreamTransform, second: NonStreamTransform) -> NonStreamTransform {
    Arc::new(move |ctx: &TranslateContext<'_>, body: &[u8]| {
        let mid = first(ctx, body);
        second(ctx, &mid)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        register_builtin(&mut registry).unwrap();
        registry
    }

    fn ctx<'a>() -> TranslateContext<'a> {
        TranslateContext {
            model: "gemini-2.5-pro",
            original_request: b"{}",
            translated_request: b"{}",
        }
    }

    #[test]
    fn register_builtin_is_single_shot() {
        let mut reg = registry();
        assert!(register_builtin(&mut reg).is_err());
    }

    #[test]
    fn composite_openai_to_antigravity_wraps_request() {
        let reg = registry();
        let payload = json!({"messages": [{"role": "user", "content": "hi"}]});
        let out = reg.translate_request(
            Dialect::OpenAi,
            Dialect::Antigravity,
            "gemini-2.5-pro",
            Bytes::from(serde_json::to_vec(&payload).unwrap()),
            true,
        );
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(out["model"], "gemini-2.5-pro");
        assert_eq!(out["request"]["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn composite_stream_unwraps_envelope() {
        let reg = registry();
        let context = ctx();
        let mut state = StreamState::new();
        let chunk = json!({"response": {"candidates": [{"content": {"parts": [{"text": "ok"}]}}]}});
        let line = format!("data: {chunk}");
        let frames = reg.translate_stream(
            Dialect::OpenAi,
            Dialect::Antigravity,
            &context,
            &mut state,
            StreamInput::Line(line.as_bytes()),
        );
        assert_eq!(frames.len(), 1);
        assert!(String::from_utf8_lossy(&frames[0]).contains("\"content\":\"ok\""));
    }

    #[test]
    fn responses_to_gemini_round_trip() {
        let reg = registry();
        let payload = json!({"input": "hello", "model": "gemini-2.5-pro"});
        let out = reg.translate_request(
            Dialect::OpenAiResponses,
            Dialect::Gemini,
            "gemini-2.5-pro",
            Bytes::from(serde_json::to_vec(&payload).unwrap()),
            false,
        );
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(out["contents"][0]["parts"][0]["text"], "hello");

        let body = json!({"candidates": [{"content": {"parts": [{"text": "hi"}]}, "finishReason": "STOP"}]});
        let resp = reg.translate_non_stream(
            Dialect::OpenAiResponses,
            Dialect::Gemini,
            &ctx(),
            &serde_json::to_vec(&body).unwrap(),
        );
        let resp: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp["object"], "response");
        assert_eq!(resp["output"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn claude_token_count_via_antigravity_pair() {
        let reg = registry();
        let payload = json!({"model": "claude-sonnet-4-5", "messages": [{"role": "user", "content": "x"}]});
        let out = reg.translate_token_count_request(
            Dialect::Claude,
            Dialect::Antigravity,
            "claude-sonnet-4-5",
            Bytes::from(serde_json::to_vec(&payload).unwrap()),
        );
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert!(out["request"]["contents"].is_array());

        let resp = reg.translate_token_count(
            Dialect::Claude,
            Dialect::Antigravity,
            &ctx(),
            42,
            b"{\"totalTokens\":42}",
        );
        let resp: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp["input_tokens"], 42);
    }
}
