//! Wire-level vocabulary shared by the router, translators, and executors.
//!
//! Payloads stay as JSON bytes end to end; this crate only names the
//! dialects, frames SSE, and shapes errors. It knows nothing about
//! providers or credentials.

pub mod dialect;
pub mod envelope;
pub mod error;
pub mod sse;

pub use dialect::{Dialect, StreamFraming};
pub use envelope::{
    ChunkStream, REQUESTED_MODEL_METADATA_KEY, RequestEnvelope, ResponseEnvelope, StreamChunk,
};
pub use error::{StatusError, parse_retry_delay};
pub use sse::{DONE_MARKER, SseEvent, SseParser, sse_data_frame, sse_named_frame, sse_payload};
