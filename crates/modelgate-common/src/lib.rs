//! Shared configuration and JSON plumbing for modelgate.
//!
//! This crate intentionally has no async or HTTP dependencies. Everything
//! here is pure data: the gateway config file, the declarative payload
//! rules, the model glob matcher, and dotted-path edits over JSON values.

pub mod config;
pub mod glob;
pub mod path;

pub use config::{
    ApiKeyEntry, ConfigError, GatewayConfig, PayloadFilterRule, PayloadParamRule, PayloadRawRule,
    PayloadRuleMatch, PayloadRules, QuotaExceededBehavior, RoutingStrategy, content_hash,
};
pub use glob::match_model_pattern;
pub use path::{json_delete, json_get, json_set};
