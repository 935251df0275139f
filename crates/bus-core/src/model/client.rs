use async_trait::async_trait;

use crate::Result;

use super::types::{ModelCapabilities, ProviderKind, RunRequest, RunResult};

/// Model client interface, implemented once per CLI backend (`claude`,
/// `codex`).
///
/// Streaming is callback-based rather than `Stream<Item=...>`-based: the
/// adapter invokes `on_partial` with the full accumulated text each time it
/// recognizes new output, and each provider drives its own subprocess loop.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn provider(&self) -> ProviderKind;
    fn capabilities(&self) -> ModelCapabilities;

    async fn run(
        &self,
        req: RunRequest,
        on_partial: &mut (dyn FnMut(&str) -> Result<()> + Send),
    ) -> Result<RunResult>;

    async fn cancel(&self) -> Result<()>;
}
