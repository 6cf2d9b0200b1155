//! Hot-reload plane: observes the config file and the auth directory,
//! synthesizes [`modelgate_auth::Auth`] records, and dispatches ordered
//! add/modify/delete deltas without restarting the service.

pub mod dispatch;
pub mod synthesizer;
pub mod watcher;

pub use dispatch::{AuthChange, DispatchQueue};
pub use synthesizer::{ConfigSynthesizer, FileSynthesizer, SynthesisContext};
pub use watcher::Watcher;
