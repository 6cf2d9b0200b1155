use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::dialect::Dialect;
use crate::error::StatusError;

/// Metadata key carrying the client-requested model name before alias
/// resolution, so payload rules can target either name.
pub const REQUESTED_MODEL_METADATA_KEY: &str = "requested_model";

/// An inbound request after routing, before provider translation.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// Dialect the client spoke.
    pub source_format: Dialect,
    /// Upstream model name after alias resolution.
    pub model: String,
    /// Opaque JSON request body.
    pub payload: Bytes,
    /// Request-scoped metadata (requested model, thinking suffix, ...).
    pub metadata: Map<String, Value>,
    pub stream: bool,
    /// Immutable copy of the first-arriving payload. Used to decide which
    /// fields the client actually provided when applying defaults.
    pub original_request: Bytes,
}

impl RequestEnvelope {
    pub fn new(source_format: Dialect, model: impl Into<String>, payload: Bytes) -> Self {
        let original_request = payload.clone();
        Self {
            source_format,
            model: model.into(),
            payload,
            metadata: Map::new(),
            stream: false,
            original_request,
        }
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn requested_model(&self) -> Option<&str> {
        self.metadata
            .get(REQUESTED_MODEL_METADATA_KEY)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn set_requested_model(&mut self, model: &str) {
        self.metadata.insert(
            REQUESTED_MODEL_METADATA_KEY.to_string(),
            Value::String(model.to_string()),
        );
    }
}

/// One chunk of a streaming response: payload bytes already framed for the
/// client dialect, or a terminal error.
#[derive(Debug)]
pub enum StreamChunk {
    Payload(Bytes),
    Error(StatusError),
}

pub type ChunkStream = mpsc::Receiver<StreamChunk>;

/// A completed upstream exchange, translated back to the client dialect.
#[derive(Debug)]
pub enum ResponseEnvelope {
    /// Single JSON body.
    Payload(Bytes),
    /// Lazy, finite chunk sequence ending with the dialect's terminal frame.
    Stream(ChunkStream),
}
