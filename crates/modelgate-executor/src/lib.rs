//! Per-provider executors: credential injection, endpoint fallback,
//! payload normalization, SSE demux, and retry policy.
//!
//! Executors receive already-routed [`RequestEnvelope`]s, translate them
//! into the provider dialect through the shared registry, and hand back
//! client-dialect payloads or chunk streams.

pub mod lines;
pub mod payload;
pub mod providers;
pub mod repair;
pub mod retry;
pub mod schema;
pub mod thinking;
pub mod transport;
pub mod usage;

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;

use modelgate_auth::Auth;
use modelgate_common::GatewayConfig;
use modelgate_protocol::{ChunkStream, RequestEnvelope, StatusError};
use modelgate_translate::Registry;

pub use thinking::ModelRegistry;
pub use transport::{UpstreamTransport, WreqTransport, WreqTransportConfig};
pub use usage::{LogUsageSink, UsageSink};

/// Shared collaborators handed to every executor.
#[derive(Clone)]
pub struct ExecutorContext {
    pub transport: Arc<dyn UpstreamTransport>,
    pub registry: Arc<Registry>,
    pub models: Arc<ModelRegistry>,
    pub usage: Arc<dyn UsageSink>,
    pub config: Arc<ArcSwap<GatewayConfig>>,
}

impl ExecutorContext {
    pub fn request_retry(&self) -> u32 {
        self.config.load().request_retry
    }
}

/// One upstream provider family.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    fn identifier(&self) -> &'static str;

    async fn execute(&self, auth: &Auth, request: &RequestEnvelope) -> Result<Bytes, StatusError>;

    async fn execute_stream(
        &self,
        auth: &Auth,
        request: &RequestEnvelope,
    ) -> Result<ChunkStream, StatusError>;

    async fn count_tokens(
        &self,
        _auth: &Auth,
        _request: &RequestEnvelope,
    ) -> Result<Bytes, StatusError> {
        Err(StatusError::new(
            501,
            format!("count tokens not supported for {}", self.identifier()),
        ))
    }

    /// Refreshes OAuth material; providers with static keys return the
    /// credential unchanged.
    async fn refresh(&self, auth: Auth) -> Result<Auth, StatusError> {
        Ok(auth)
    }
}
