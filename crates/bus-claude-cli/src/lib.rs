//! `claude` CLI adapter: the streaming-capable `anthropic` provider.
//!
//! Builds the `claude -p ... --output-format stream-json` invocation
//! described in the bus's agent-invocation contract and parses its
//! newline-delimited JSON stream.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Mutex,
    time::{timeout, Duration},
};

use bus_core::{
    errors::Error,
    model::{
        resolve_model_alias, ModelCapabilities, ModelClient, ProviderKind, RunRequest, RunResult,
        SessionDirective, TokenUsage,
    },
    Result,
};

const KILL_GRACE: Duration = Duration::from_secs(5);

/// Matches the stderr text Claude CLI emits when a `--resume <id>` target no
/// longer exists on disk. Narrow by design: any other failure must propagate
/// unchanged rather than destroying the session.
fn session_not_found_pattern() -> Regex {
    Regex::new(r"(?i)session.*not found|no such session").expect("valid regex")
}

pub fn is_session_not_found(message: &str) -> bool {
    session_not_found_pattern().is_match(message)
}

#[derive(Clone, Debug)]
pub struct ClaudeCliConfig {
    pub claude_path: std::path::PathBuf,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            claude_path: std::path::PathBuf::from("claude"),
        }
    }
}

#[derive(Clone)]
pub struct ClaudeCliClient {
    cfg: ClaudeCliConfig,
    child: Arc<Mutex<Option<tokio::process::Child>>>,
}

impl ClaudeCliClient {
    pub fn new(cfg: ClaudeCliConfig) -> Self {
        Self {
            cfg,
            child: Arc::new(Mutex::new(None)),
        }
    }

    fn build_args(&self, req: &RunRequest) -> Vec<String> {
        let mut args: Vec<String> = vec!["--permission-mode".to_string(), "default".to_string()];

        if let Some(model) = &req.model {
            args.push("--model".to_string());
            args.push(resolve_model_alias(model));
        }

        args.push("--output-format".to_string());
        args.push("stream-json".to_string());

        if let Some(path) = &req.append_system_prompt_file {
            args.push("--append-system-prompt-file".to_string());
            args.push(path.display().to_string());
        }

        match &req.session {
            SessionDirective::New { session_id } => {
                args.push("--session-id".to_string());
                args.push(session_id.clone());
            }
            SessionDirective::Resume { session_id } => {
                args.push("--resume".to_string());
                args.push(session_id.clone());
            }
            SessionDirective::ContinueLast => args.push("-c".to_string()),
            SessionDirective::None => {}
        }

        args.push("-p".to_string());
        args.push(req.prompt.clone());
        args
    }

    async fn kill_child_gracefully(&self) -> Result<()> {
        let pid = {
            let guard = self.child.lock().await;
            guard.as_ref().and_then(|c| c.id())
        };
        let Some(pid) = pid else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        let exited = {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                timeout(KILL_GRACE, child.wait()).await.is_ok()
            } else {
                true
            }
        };

        if !exited {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        let mut guard = self.child.lock().await;
        *guard = None;
        Ok(())
    }
}

#[async_trait]
impl ModelClient for ClaudeCliClient {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities {
            supports_streaming: true,
        }
    }

    async fn run(
        &self,
        req: RunRequest,
        on_partial: &mut (dyn FnMut(&str) -> Result<()> + Send),
    ) -> Result<RunResult> {
        let args = self.build_args(&req);

        let mut cmd = Command::new(&self.cfg.claude_path);
        cmd.args(&args)
            .current_dir(&req.cwd)
            .env("TINYCLAW_AGENT_ID", req.agent_id.0.clone())
            .env(
                "TINYCLAW_CONFIG_HOME",
                req.config_home.display().to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(message_id) = &req.message_id {
            cmd.env("TINYCLAW_MESSAGE_ID", message_id.0.clone());
        }

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("claude stdout was not captured".to_string()))?;
        let stderr = child.stderr.take();

        {
            let mut guard = self.child.lock().await;
            *guard = Some(child);
        }

        let stderr_tail = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = stderr {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut guard = tail.lock().await;
                    guard.push_str(&line);
                    guard.push('\n');
                }
            });
        }

        let mut accumulator = String::new();
        let mut final_text: Option<String> = None;
        let mut final_is_error = false;
        let mut final_usage: Option<TokenUsage> = None;

        let stdout_result: Result<()> = async {
            let mut reader = BufReader::new(stdout).lines();
            while let Some(line) = reader.next_line().await? {
                let value: serde_json::Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                match value.get("type").and_then(|v| v.as_str()) {
                    Some("assistant") => {
                        if let Some(blocks) = value
                            .get("message")
                            .and_then(|m| m.get("content"))
                            .and_then(|c| c.as_array())
                        {
                            for block in blocks {
                                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                                    if let Some(text) = block.get("text").and_then(|t| t.as_str())
                                    {
                                        accumulator.push_str(text);
                                    }
                                }
                            }
                            on_partial(&accumulator)?;
                        }
                    }
                    Some("content_block_delta") => {
                        if let Some(text) = value
                            .get("delta")
                            .and_then(|d| d.get("text"))
                            .and_then(|t| t.as_str())
                        {
                            accumulator.push_str(text);
                            on_partial(&accumulator)?;
                        }
                    }
                    Some("result") => {
                        if let Some(result) = value.get("result").and_then(|v| v.as_str()) {
                            final_text = Some(result.to_string());
                        }
                        if let Some(is_error) = value.get("is_error").and_then(|v| v.as_bool()) {
                            final_is_error = is_error;
                        }
                        if let Some(usage) = value.get("usage") {
                            final_usage = parse_usage(usage);
                        }
                    }
                    _ => {}
                }
            }
            Ok(())
        }
        .await;

        let status = {
            let mut guard = self.child.lock().await;
            match guard.take() {
                Some(mut child) => child.wait().await?,
                None => return Err(Error::External("claude process missing".to_string())),
            }
        };

        stdout_result?;

        let text = final_text.unwrap_or(accumulator);

        if !status.success() && !final_is_error {
            let stderr_text = stderr_tail.lock().await.clone();
            return Err(Error::External(if stderr_text.trim().is_empty() {
                format!("claude exited with status {status}")
            } else {
                stderr_text.trim().to_string()
            }));
        }

        Ok(RunResult {
            is_error: final_is_error,
            text,
            usage: final_usage,
        })
    }

    async fn cancel(&self) -> Result<()> {
        self.kill_child_gracefully().await
    }
}

fn parse_usage(v: &serde_json::Value) -> Option<TokenUsage> {
    let get = |k: &str| v.get(k).and_then(|x| x.as_u64()).unwrap_or(0);
    Some(TokenUsage {
        input_tokens: get("input_tokens"),
        output_tokens: get("output_tokens"),
        cache_read_input_tokens: get("cache_read_input_tokens"),
        cache_creation_input_tokens: get("cache_creation_input_tokens"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_core::domain::AgentId;

    fn req(session: SessionDirective) -> RunRequest {
        RunRequest {
            prompt: "hi".to_string(),
            cwd: std::path::PathBuf::from("/tmp"),
            model: None,
            session,
            agent_id: AgentId("default".to_string()),
            message_id: None,
            config_home: std::path::PathBuf::from("/tmp/.tinyclaw"),
            append_system_prompt_file: None,
        }
    }

    fn client() -> ClaudeCliClient {
        ClaudeCliClient::new(ClaudeCliConfig::default())
    }

    #[test]
    fn new_session_uses_session_id_flag() {
        let args = client().build_args(&req(SessionDirective::New {
            session_id: "abc".to_string(),
        }));
        assert!(args.windows(2).any(|w| w == ["--session-id", "abc"]));
    }

    #[test]
    fn resume_uses_resume_flag() {
        let args = client().build_args(&req(SessionDirective::Resume {
            session_id: "abc".to_string(),
        }));
        assert!(args.windows(2).any(|w| w == ["--resume", "abc"]));
    }

    #[test]
    fn continue_last_uses_legacy_flag() {
        let args = client().build_args(&req(SessionDirective::ContinueLast));
        assert!(args.iter().any(|a| a == "-c"));
    }

    #[test]
    fn none_directive_has_no_session_flag() {
        let args = client().build_args(&req(SessionDirective::None));
        assert!(!args.iter().any(|a| a == "-c" || a == "--resume" || a == "--session-id"));
    }

    #[test]
    fn prompt_is_last_positional_argument() {
        let args = client().build_args(&req(SessionDirective::None));
        assert_eq!(args.last().map(String::as_str), Some("hi"));
        assert_eq!(args[args.len() - 2], "-p");
    }

    #[test]
    fn detects_session_not_found_variants() {
        assert!(is_session_not_found("Error: Session abc123 not found"));
        assert!(is_session_not_found("no such session: abc123"));
        assert!(!is_session_not_found("permission denied"));
    }
}
