//! The gateway engine: model routing, credential rotation, and the error
//! taxonomy between executors and the HTTP surface.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use time::OffsetDateTime;

use modelgate_auth::{Conductor, SelectError};
use modelgate_executor::ProviderExecutor;
use modelgate_executor::thinking::{ModelRegistry, parse_model_suffix, suffix_metadata};
use modelgate_protocol::{ChunkStream, RequestEnvelope, ResponseEnvelope, StatusError};
use modelgate_translate::Pipeline;

/// How many credentials one request may burn through before surfacing the
/// last quota error.
const MAX_CREDENTIAL_ROTATIONS: usize = 3;

pub struct GatewayEngine {
    conductor: Arc<Conductor>,
    executors: HashMap<&'static str, Arc<dyn ProviderExecutor>>,
    models: Arc<ModelRegistry>,
    pipeline: Arc<Pipeline>,
}

impl GatewayEngine {
    pub fn new(
        conductor: Arc<Conductor>,
        executors: HashMap<&'static str, Arc<dyn ProviderExecutor>>,
        models: Arc<ModelRegistry>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            conductor,
            executors,
            models,
            pipeline,
        }
    }

    pub fn conductor(&self) -> &Arc<Conductor> {
        &self.conductor
    }

    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    /// Splits an inbound model reference into `(prefix, model)` where a
    /// slash routes to prefixed credentials: `team-a/gpt-5`.
    fn split_prefix(model: &str) -> (&str, &str) {
        match model.split_once('/') {
            Some((prefix, rest)) if !prefix.is_empty() && !rest.is_empty() => (prefix, rest),
            _ => ("", model),
        }
    }

    /// Normalizes the envelope for execution: prefix extraction, model
    /// suffix parsing into metadata, requested-model bookkeeping. Returns
    /// the routing prefix.
    pub fn prepare(&self, envelope: &mut RequestEnvelope) -> String {
        let raw = envelope.model.clone();
        let (prefix, rest) = Self::split_prefix(&raw);
        let suffix = parse_model_suffix(rest);
        envelope.set_requested_model(rest);
        for (key, value) in suffix_metadata(&suffix) {
            envelope.metadata.insert(key, value);
        }
        envelope.model = suffix.base;
        self.pipeline.apply_request(envelope);
        prefix.to_string()
    }

    /// Candidate providers for a model, most specific first. Only
    /// providers with configured executors are returned.
    fn provider_candidates(&self, model: &str) -> Vec<&'static str> {
        let lower = model.to_ascii_lowercase();
        let ordered: Vec<&'static str> = if lower.starts_with("copilot-") {
            vec!["github-copilot"]
        } else if lower.contains("claude") {
            vec!["claude", "antigravity", "github-copilot"]
        } else if lower.starts_with("gemini") || lower.starts_with("rev") {
            vec!["gemini", "antigravity"]
        } else if lower.starts_with("gpt-") || lower.contains("codex") {
            vec!["codex", "github-copilot", "openai-compat"]
        } else {
            vec!["openai-compat"]
        };
        ordered
            .into_iter()
            .filter(|provider| self.executors.contains_key(provider))
            .collect()
    }

    /// Picks a credential for the request, walking provider candidates in
    /// order. Providers without credentials are skipped; if every match is
    /// cooling down, the earliest-recovery cooldown error surfaces.
    async fn select(
        &self,
        model: &str,
        prefix: &str,
    ) -> Result<(Arc<dyn ProviderExecutor>, modelgate_auth::Auth), StatusError> {
        let now = OffsetDateTime::now_utc();
        let mut cooldown: Option<SelectError> = None;
        for provider in self.provider_candidates(model) {
            match self.conductor.select(provider, model, prefix, now).await {
                Ok(auth) => {
                    let executor = self.executors[provider].clone();
                    return Ok((executor, auth));
                }
                Err(err @ SelectError::Cooldown { .. }) => {
                    cooldown.get_or_insert(err);
                }
                Err(SelectError::NoCredentials { .. }) => {}
            }
        }
        match cooldown {
            Some(err) => Err(err.to_status_error()),
            None => Err(StatusError::service_unavailable(format!(
                "no provider available for model {model}"
            ))),
        }
    }

    async fn account(&self, auth_id: &str, result: &Result<(), StatusError>) {
        let now = OffsetDateTime::now_utc();
        match result {
            Ok(()) => self.conductor.mark_success(auth_id, now).await,
            Err(err) if err.is_quota_exhausted() => {
                self.conductor.mark_quota_exceeded(auth_id, now).await;
            }
            Err(_) => {}
        }
    }

    /// Single entry point: streams when the envelope asks for it.
    pub async fn handle(
        &self,
        envelope: &mut RequestEnvelope,
    ) -> Result<ResponseEnvelope, StatusError> {
        if envelope.stream {
            Ok(ResponseEnvelope::Stream(
                self.execute_stream(envelope).await?,
            ))
        } else {
            Ok(ResponseEnvelope::Payload(self.execute(envelope).await?))
        }
    }

    pub async fn execute(&self, envelope: &mut RequestEnvelope) -> Result<Bytes, StatusError> {
        let prefix = self.prepare(envelope);
        let mut last_err: Option<StatusError> = None;
        for _ in 0..MAX_CREDENTIAL_ROTATIONS {
            let (executor, auth) = self.select(&envelope.model, &prefix).await?;
            let result = executor.execute(&auth, envelope).await;
            let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
            self.account(&auth.id, &outcome).await;
            match result {
                Ok(out) => return Ok(out),
                Err(err) if err.is_quota_exhausted() => {
                    tracing::debug!(auth = %auth.id, "quota exhausted, rotating credential");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| StatusError::service_unavailable("no credential available")))
    }

    pub async fn execute_stream(
        &self,
        envelope: &mut RequestEnvelope,
    ) -> Result<ChunkStream, StatusError> {
        let prefix = self.prepare(envelope);
        let mut last_err: Option<StatusError> = None;
        for _ in 0..MAX_CREDENTIAL_ROTATIONS {
            let (executor, auth) = self.select(&envelope.model, &prefix).await?;
            let result = executor.execute_stream(&auth, envelope).await;
            let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
            self.account(&auth.id, &outcome).await;
            match result {
                Ok(stream) => return Ok(stream),
                Err(err) if err.is_quota_exhausted() => {
                    tracing::debug!(auth = %auth.id, "quota exhausted, rotating credential");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| StatusError::service_unavailable("no credential available")))
    }

    pub async fn count_tokens(&self, envelope: &mut RequestEnvelope) -> Result<Bytes, StatusError> {
        let prefix = self.prepare(envelope);
        let (executor, auth) = self.select(&envelope.model, &prefix).await?;
        let result = executor.count_tokens(&auth, envelope).await;
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        self.account(&auth.id, &outcome).await;
        result
    }

    /// Model listing: every model the credential population can serve,
    /// deduplicated, in stable order.
    pub async fn available_models(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for auth in self.conductor.list().await {
            for model in provider_catalog(&auth.provider) {
                let external = self.models.external_model(model);
                if !out.contains(&external) {
                    out.push(external);
                }
            }
        }
        out.sort();
        out
    }
}

/// Static per-provider model catalogs used by the listing endpoints.
fn provider_catalog(provider: &str) -> &'static [&'static str] {
    match provider {
        "gemini" => &["gemini-2.5-pro", "gemini-2.5-flash", "gemini-3-flash"],
        "antigravity" => &[
            "gemini-3-pro-high",
            "gemini-3-flash",
            "gemini-2.5-flash",
            "claude-sonnet-4-5",
            "claude-sonnet-4-6",
            "claude-opus-4-6-thinking",
        ],
        "claude" => &["claude-sonnet-4-5", "claude-sonnet-4-6", "claude-opus-4-6"],
        "codex" => &["gpt-5", "gpt-5-codex"],
        "github-copilot" => &["copilot-gpt-5", "copilot-gpt-4.1", "copilot-claude-sonnet-4-5"],
        "openai-compat" => &["qwen3-coder"],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use modelgate_protocol::Dialect;

    fn engine() -> GatewayEngine {
        let conductor = Arc::new(Conductor::new(
            modelgate_common::RoutingStrategy::RoundRobin,
            None,
        ));
        GatewayEngine::new(
            conductor,
            HashMap::new(),
            Arc::new(ModelRegistry::with_builtin_models()),
            Arc::new(Pipeline::default()),
        )
    }

    #[test]
    fn prepare_extracts_prefix_and_suffix() {
        let engine = engine();
        let mut envelope = RequestEnvelope::new(
            Dialect::OpenAi,
            "team-a/gemini-2.5-pro(high)",
            Bytes::from_static(b"{}"),
        );
        let prefix = engine.prepare(&mut envelope);
        assert_eq!(prefix, "team-a");
        assert_eq!(envelope.model, "gemini-2.5-pro");
        assert_eq!(envelope.requested_model(), Some("gemini-2.5-pro(high)"));
        assert_eq!(
            envelope
                .metadata
                .get("reasoning_effort")
                .and_then(serde_json::Value::as_str),
            Some("high")
        );
    }

    #[test]
    fn plain_model_has_no_prefix() {
        let engine = engine();
        let mut envelope =
            RequestEnvelope::new(Dialect::OpenAi, "gpt-5", Bytes::from_static(b"{}"));
        assert_eq!(engine.prepare(&mut envelope), "");
        assert_eq!(envelope.model, "gpt-5");
    }
}
