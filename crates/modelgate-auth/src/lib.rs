//! Credential records and the conductor that owns them.
//!
//! The conductor performs selection under priority/cooldown constraints,
//! tracks quota backoff, and runs the background OAuth refresh loop.
//! Executors implement [`AuthRefresher`] per provider; the watcher crate
//! synthesizes [`Auth`] records and feeds them in.

pub mod conductor;
pub mod id;
pub mod record;
pub mod store;

pub use conductor::{AuthEvent, AuthRefresher, Conductor, SelectError};
pub use id::StableIdGenerator;
pub use record::{Auth, AuthId, AuthStatus, ModelState, QuotaState};
pub use store::{AuthStore, FileAuthStore};
