//! Gateway engine and service bootstrap.

pub mod bootstrap;
pub mod engine;

pub use bootstrap::{BootstrapError, Gateway, bootstrap};
pub use engine::GatewayEngine;
