//! `codex` CLI adapter: the non-streaming `openai` provider.
//!
//! Builds the `codex exec ... --json` invocation described in the bus's
//! agent-invocation contract. Codex has no partial-output stream; the final
//! text is the last `item.completed` / `agent_message` event.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
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
        SessionDirective,
    },
    Result,
};

const KILL_GRACE: Duration = Duration::from_secs(5);
const FALLBACK_TEXT: &str = "(codex returned no response)";

#[derive(Clone, Debug)]
pub struct CodexCliConfig {
    pub codex_path: std::path::PathBuf,
}

impl Default for CodexCliConfig {
    fn default() -> Self {
        Self {
            codex_path: std::path::PathBuf::from("codex"),
        }
    }
}

#[derive(Clone)]
pub struct CodexCliClient {
    cfg: CodexCliConfig,
    child: Arc<Mutex<Option<tokio::process::Child>>>,
}

impl CodexCliClient {
    pub fn new(cfg: CodexCliConfig) -> Self {
        Self {
            cfg,
            child: Arc::new(Mutex::new(None)),
        }
    }

    fn build_args(&self, req: &RunRequest) -> Vec<String> {
        let mut args: Vec<String> = vec!["exec".to_string()];

        if !matches!(req.session, SessionDirective::New { .. } | SessionDirective::None) {
            args.push("resume".to_string());
            args.push("--last".to_string());
        }

        if let Some(model) = &req.model {
            args.push("--model".to_string());
            args.push(resolve_model_alias(model));
        }

        args.push("--skip-git-repo-check".to_string());
        args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
        args.push("--json".to_string());
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
impl ModelClient for CodexCliClient {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Openai
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities {
            supports_streaming: false,
        }
    }

    async fn run(
        &self,
        req: RunRequest,
        _on_partial: &mut (dyn FnMut(&str) -> Result<()> + Send),
    ) -> Result<RunResult> {
        let args = self.build_args(&req);

        let mut cmd = Command::new(&self.cfg.codex_path);
        cmd.args(&args)
            .current_dir(&req.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("codex stdout was not captured".to_string()))?;
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

        let mut final_text: Option<String> = None;
        let stdout_result: Result<()> = async {
            let mut reader = BufReader::new(stdout).lines();
            while let Some(line) = reader.next_line().await? {
                let value: serde_json::Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if value.get("type").and_then(|v| v.as_str()) == Some("item.completed") {
                    let item = value.get("item");
                    let is_agent_message =
                        item.and_then(|i| i.get("type")).and_then(|t| t.as_str())
                            == Some("agent_message");
                    if is_agent_message {
                        if let Some(text) = item.and_then(|i| i.get("text")).and_then(|t| t.as_str())
                        {
                            final_text = Some(text.to_string());
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        let status = {
            let mut guard = self.child.lock().await;
            match guard.take() {
                Some(mut child) => child.wait().await?,
                None => return Err(Error::External("codex process missing".to_string())),
            }
        };

        stdout_result?;

        if !status.success() && final_text.is_none() {
            let stderr_text = stderr_tail.lock().await.clone();
            return Err(Error::External(if stderr_text.trim().is_empty() {
                format!("codex exited with status {status}")
            } else {
                stderr_text.trim().to_string()
            }));
        }

        Ok(RunResult {
            is_error: false,
            text: final_text.unwrap_or_else(|| FALLBACK_TEXT.to_string()),
            usage: None,
        })
    }

    async fn cancel(&self) -> Result<()> {
        self.kill_child_gracefully().await
    }
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

    fn client() -> CodexCliClient {
        CodexCliClient::new(CodexCliConfig::default())
    }

    #[test]
    fn resume_adds_resume_last() {
        let args = client().build_args(&req(SessionDirective::Resume {
            session_id: "ignored".to_string(),
        }));
        assert!(args.windows(2).any(|w| w == ["resume", "--last"]));
    }

    #[test]
    fn new_session_omits_resume() {
        let args = client().build_args(&req(SessionDirective::New {
            session_id: "abc".to_string(),
        }));
        assert!(!args.iter().any(|a| a == "resume"));
    }

    #[test]
    fn prompt_is_last_positional_argument() {
        let args = client().build_args(&req(SessionDirective::None));
        assert_eq!(args.last().map(String::as_str), Some("hi"));
    }

    #[test]
    fn exec_is_first_argument() {
        let args = client().build_args(&req(SessionDirective::None));
        assert_eq!(args.first().map(String::as_str), Some("exec"));
    }
}
