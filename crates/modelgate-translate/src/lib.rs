//! N×M dialect translation for modelgate.
//!
//! The registry holds pure transforms per ordered dialect pair; the
//! pipeline layers request/response middleware on top. Executors call
//! into this crate for every payload crossing the gateway.

pub mod builtin;
pub mod pipeline;
pub mod registry;

pub use builtin::register_builtin;
pub use pipeline::{Pipeline, RequestMiddleware, ResponseMiddleware};
pub use registry::{
    Registration, Registry, RegistryError, StreamInput, StreamState, TranslateContext,
};
