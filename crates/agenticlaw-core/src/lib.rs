//! Agenticlaw Core - Types, traits, and error handling

pub mod error;
pub mod protocol;
pub mod runtime_config;
pub mod subagent_profile;
pub mod types;

pub use error::{Error, Result};
pub use protocol::*;
pub use runtime_config::{RetryConfig, RuntimeConfig, SensitiveRuleKind, SensitiveRuleSpec};
pub use subagent_profile::{builtin_profiles, load_profiles, SubAgentProfile};
pub use types::*;
