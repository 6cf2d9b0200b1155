use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use modelgate_protocol::Dialect;

/// Inputs shared by every response transform of one exchange.
#[derive(Debug, Clone, Copy)]
pub struct TranslateContext<'a> {
    pub model: &'a str,
    /// The untouched client payload, as first received.
    pub original_request: &'a [u8],
    /// The payload after request translation, as sent upstream.
    pub translated_request: &'a [u8],
}

/// One unit of upstream stream input handed to a stream transform.
#[derive(Debug, Clone, Copy)]
pub enum StreamInput<'a> {
    /// A raw upstream SSE line (including any `event:`/`data:` framing).
    Line(&'a [u8]),
    /// Upstream EOF; the transform must emit its terminal frame exactly once.
    Done,
}

/// Opaque per-stream scratch carried across chunks of one stream.
///
/// Each pair downcasts to its own state type; the registry never looks
/// inside.
#[derive(Default)]
pub struct StreamState {
    slot: Option<Box<dyn Any + Send>>,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with<T: Any + Send>(&mut self, init: impl FnOnce() -> T) -> &mut T {
        let needs_init = !matches!(&self.slot, Some(slot) if slot.is::<T>());
        if needs_init {
            self.slot = Some(Box::new(init()));
        }
        self.slot
            .as_mut()
            .expect("slot populated above")
            .downcast_mut::<T>()
            .expect("slot type checked above")
    }
}

pub type RequestTransform = Arc<dyn Fn(&str, Value, bool) -> Value + Send + Sync>;
pub type StreamTransform =
    Arc<dyn Fn(&TranslateContext<'_>, &mut StreamState, StreamInput<'_>) -> Vec<Bytes> + Send + Sync>;
pub type NonStreamTransform = Arc<dyn Fn(&TranslateContext<'_>, &[u8]) -> Bytes + Send + Sync>;
pub type TokenCountTransform = Arc<dyn Fn(&TranslateContext<'_>, i64, &[u8]) -> Bytes + Send + Sync>;

/// The transforms registered for one ordered `(client, provider)` pair.
///
/// `request` maps client → provider; `stream`/`non_stream`/
/// `token_count_response` map provider → client. `token_count_request`
/// overrides `request` for count-tokens calls when the shapes differ.
#[derive(Clone)]
pub struct Registration {
    pub request: RequestTransform,
    pub stream: StreamTransform,
    pub non_stream: NonStreamTransform,
    pub token_count_request: Option<RequestTransform>,
    pub token_count_response: Option<TokenCountTransform>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("translator pair already registered: {from} -> {to}")]
    DuplicatePair { from: Dialect, to: Dialect },
}

/// Dialect-pair transform registry.
///
/// Identity pairs pass through untouched. Unknown pairs also pass through,
/// with a warning, so a new dialect can roll out without blocking traffic.
/// Duplicate registration is a construction error rather than a silent
/// overwrite.
#[derive(Default, Clone)]
pub struct Registry {
    pairs: HashMap<(Dialect, Dialect), Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        from: Dialect,
        to: Dialect,
        registration: Registration,
    ) -> Result<(), RegistryError> {
        if self.pairs.contains_key(&(from, to)) {
            return Err(RegistryError::DuplicatePair { from, to });
        }
        self.pairs.insert((from, to), registration);
        Ok(())
    }

    pub fn has_pair(&self, from: Dialect, to: Dialect) -> bool {
        from == to || self.pairs.contains_key(&(from, to))
    }

    /// Translates a client request payload into the provider dialect.
    pub fn translate_request(
        &self,
        from: Dialect,
        to: Dialect,
        model: &str,
        payload: Bytes,
        stream: bool,
    ) -> Bytes {
        if from == to {
            return payload;
        }
        let Some(reg) = self.pairs.get(&(from, to)) else {
            tracing::warn!(%from, %to, "no request translator registered, passing through");
            return payload;
        };
        let Ok(value) = serde_json::from_slice::<Value>(&payload) else {
            tracing::warn!(%from, %to, "request payload is not JSON, passing through");
            return payload;
        };
        let out = (reg.request)(model, value, stream);
        Bytes::from(serde_json::to_vec(&out).unwrap_or_default())
    }

    /// Translates one upstream stream line into zero or more client frames.
    pub fn translate_stream(
        &self,
        from: Dialect,
        to: Dialect,
        ctx: &TranslateContext<'_>,
        state: &mut StreamState,
        input: StreamInput<'_>,
    ) -> Vec<Bytes> {
        if from == to {
            return passthrough_stream(input);
        }
        let Some(reg) = self.pairs.get(&(from, to)) else {
            tracing::warn!(%from, %to, "no stream translator registered, passing through");
            return passthrough_stream(input);
        };
        (reg.stream)(ctx, state, input)
    }

    /// Translates a complete upstream response body back to the client
    /// dialect.
    pub fn translate_non_stream(
        &self,
        from: Dialect,
        to: Dialect,
        ctx: &TranslateContext<'_>,
        body: &[u8],
    ) -> Bytes {
        if from == to {
            return Bytes::copy_from_slice(body);
        }
        let Some(reg) = self.pairs.get(&(from, to)) else {
            tracing::warn!(%from, %to, "no response translator registered, passing through");
            return Bytes::copy_from_slice(body);
        };
        (reg.non_stream)(ctx, body)
    }

    /// Translates a client count-tokens request into the provider dialect.
    ///
    /// Falls back to the plain request transform when the pair has no
    /// dedicated count-tokens mapping.
    pub fn translate_token_count_request(
        &self,
        from: Dialect,
        to: Dialect,
        model: &str,
        payload: Bytes,
    ) -> Bytes {
        if from == to {
            return payload;
        }
        if let Some(transform) = self
            .pairs
            .get(&(from, to))
            .and_then(|r| r.token_count_request.clone())
        {
            let Ok(value) = serde_json::from_slice::<Value>(&payload) else {
                return payload;
            };
            let out = transform(model, value, false);
            return Bytes::from(serde_json::to_vec(&out).unwrap_or_default());
        }
        self.translate_request(from, to, model, payload, false)
    }

    /// Translates a provider token-count response back to the client
    /// dialect.
    pub fn translate_token_count(
        &self,
        from: Dialect,
        to: Dialect,
        ctx: &TranslateContext<'_>,
        total_tokens: i64,
        body: &[u8],
    ) -> Bytes {
        if from == to {
            return Bytes::copy_from_slice(body);
        }
        match self
            .pairs
            .get(&(from, to))
            .and_then(|r| r.token_count_response.clone())
        {
            Some(transform) => transform(ctx, total_tokens, body),
            None => Bytes::copy_from_slice(body),
        }
    }
}

fn passthrough_stream(input: StreamInput<'_>) -> Vec<Bytes> {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_request(_model: &str, payload: Value, _stream: bool) -> Value {
        payload
    }

    fn noop_stream(
        _ctx: &TranslateContext<'_>,
        _state: &mut StreamState,
        _input: StreamInput<'_>,
    ) -> Vec<Bytes> {
        Vec::new()
    }

    fn noop_non_stream(_ctx: &TranslateContext<'_>, body: &[u8]) -> Bytes {
        Bytes::copy_from_slice(body)
    }

    fn noop_registration() -> Registration {
        Registration {
            request: Arc::new(noop_request),
            stream: Arc::new(noop_stream),
            non_stream: Arc::new(noop_non_stream),
            token_count_request: None,
            token_count_response: None,
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = Registry::new();
        registry
            .register(Dialect::OpenAi, Dialect::Gemini, noop_registration())
            .unwrap();
        let err = registry
            .register(Dialect::OpenAi, Dialect::Gemini, noop_registration())
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicatePair { .. }));
    }

    #[test]
    fn identity_and_unknown_pairs_pass_through() {
        let registry = Registry::new();
        let payload = Bytes::from_static(b"{\"model\":\"m\"}");
        let same = registry.translate_request(
            Dialect::Claude,
            Dialect::Claude,
            "m",
            payload.clone(),
            false,
        );
        assert_eq!(same, payload);
        let unknown =
            registry.translate_request(Dialect::Codex, Dialect::Claude, "m", payload.clone(), false);
        assert_eq!(unknown, payload);
    }

    #[test]
    fn stream_state_slot_downcasts() {
        let mut state = StreamState::new();
        *state.get_or_insert_with(|| 1u32) += 1;
        assert_eq!(*state.get_or_insert_with(|| 9u32), 2);
        // Switching the type resets the slot.
        assert_eq!(state.get_or_insert_with(String::new).as_str(), "");
    }
}
