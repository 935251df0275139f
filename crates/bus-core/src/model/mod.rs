pub mod aliases;
pub mod client;
pub mod types;

pub use aliases::resolve_model_alias;
pub use client::ModelClient;
pub use types::{
    ModelCapabilities, ProviderKind, RunRequest, RunResult, SessionDirective, TokenUsage,
};
