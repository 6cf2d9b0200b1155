//! Thin middleware layer around the registry.
//!
//! Request middlewares may rewrite the envelope before pair lookup;
//! response middlewares may rewrite emitted chunks. Middlewares must not
//! carry state across requests.

use std::sync::Arc;

use bytes::Bytes;

use modelgate_protocol::{Dialect, RequestEnvelope};

use crate::registry::{Registry, StreamInput, StreamState, TranslateContext};

pub trait RequestMiddleware: Send + Sync {
    fn on_request(&self, envelope: &mut RequestEnvelope);
}

pub trait ResponseMiddleware: Send + Sync {
    /// May replace the outgoing chunk. Returning `None` keeps it as-is.
    fn on_chunk(&self, chunk: &Bytes) -> Option<Bytes>;
}

/// The registry plus its ordered middleware chains.
#[derive(Clone, Default)]
pub struct Pipeline {
    registry: Arc<Registry>,
    request_middlewares: Vec<Arc<dyn RequestMiddleware>>,
    response_middlewares: Vec<Arc<dyn ResponseMiddleware>>,
}

impl Pipeline {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            request_middlewares: Vec::new(),
            response_middlewares: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn push_request_middleware(&mut self, middleware: Arc<dyn RequestMiddleware>) {
        self.request_middlewares.push(middleware);
    }

    pub fn push_response_middleware(&mut self, middleware: Arc<dyn ResponseMiddleware>) {
        self.response_middlewares.push(middleware);
    }

    /// Runs the ordered request middleware chain over an envelope.
    pub fn apply_request(&self, envelope: &mut RequestEnvelope) {
        for middleware in &self.request_middlewares {
            middleware.on_request(envelope);
        }
    }

    /// Runs request middlewares, then translates into the provider dialect.
    pub fn translate_request(&self, envelope: &mut RequestEnvelope, to: Dialect) -> Bytes {
        self.apply_request(envelope);
        self.registry.translate_request(
            envelope.source_format,
            to,
            &envelope.model,
            envelope.payload.clone(),
            envelope.stream,
        )
    }

    /// Translates one upstream line and filters it through the response
    /// middleware chain.
    pub fn translate_stream(
        &self,
        from: Dialect,
        to: Dialect,
        ctx: &TranslateContext<'_>,
        state: &mut StreamState,
        input: StreamInput<'_>,
    ) -> Vec<Bytes> {
        let chunks = self.registry.translate_stream(from, to, ctx, state, input);
        if self.response_middlewares.is_empty() {
            return chunks;
        }
        chunks
            .into_iter()
            .map(|chunk| {
                let mut current = chunk;
                for middleware in &self.response_middlewares {
                    if let Some(replacement) = middleware.on_chunk(&current) {
                        current = replacement;
                    }
                }
                current
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::register_builtin;
    use serde_json::json;

    struct ForceModel(&'static str);

    impl RequestMiddleware for ForceModel {
        fn on_request(&self, envelope: &mut RequestEnvelope) {
            envelope.model = self.0.to_string();
        }
    }

    #[test]
    fn request_middleware_runs_before_lookup() {
        let mut registry = Registry::new();
        register_builtin(&mut registry).unwrap();
        let mut pipeline = Pipeline::new(registry);
        pipeline.push_request_middleware(Arc::new(ForceModel("gemini-2.5-flash")));

        let payload = json!({"messages": [{"role": "user", "content": "hi"}]});
        let mut envelope = RequestEnvelope::new(
            Dialect::OpenAi,
            "gemini-2.5-pro",
            Bytes::from(serde_json::to_vec(&payload).unwrap()),
        );
        pipeline.translate_request(&mut envelope, Dialect::Gemini);
        assert_eq!(envelope.model, "gemini-2.5-flash");
    }
}
