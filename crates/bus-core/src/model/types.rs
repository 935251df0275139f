use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::{AgentId, MessageId};

/// The provider backend used for a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Anthropic,
    Openai,
}

/// Capabilities of a provider, used to decide whether streaming display is
/// worth wiring up for it.
#[derive(Clone, Copy, Debug)]
pub struct ModelCapabilities {
    pub supports_streaming: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

/// How this invocation should handle conversation continuity.
///
/// Resolved by the dispatcher *before* calling the model client: picking a
/// fresh session id means calling `session_store::SessionStore::create`,
/// which the provider adapter has no business doing itself.
#[derive(Clone, Debug)]
pub enum SessionDirective {
    /// Start a brand-new session under this id (reset, or no stored entry).
    New { session_id: String },
    /// Resume a previously stored session.
    Resume { session_id: String },
    /// Legacy fallback for callers with no session key at all: continue
    /// whatever session the CLI last used.
    ContinueLast,
    /// No session flag.
    None,
}

/// Normalized request for a single provider invocation.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub session: SessionDirective,
    pub agent_id: AgentId,
    pub message_id: Option<MessageId>,
    pub config_home: PathBuf,
    /// Path to a temp file holding the agent's memory/system prompt, passed
    /// as `--append-system-prompt-file` when set (Claude only).
    pub append_system_prompt_file: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub is_error: bool,
    pub text: String,
    pub usage: Option<TokenUsage>,
}
