use std::{
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    domain::{AgentId, TeamId},
    errors::Error,
    Result,
};

/// Typed configuration for the bus. Every process (dispatcher, channel
/// adapter, approval hook) loads its own `Config` from the environment —
/// there is no shared in-memory cache, since these are separate OS processes
/// coordinating only through the filesystem.
#[derive(Clone, Debug)]
pub struct Config {
    // Channel credentials
    pub discord_bot_token: String,
    pub admin_user_id: u64,
    pub allowed_user_ids: Vec<u64>,

    // Directory layout
    pub config_home: PathBuf,
    pub config_workspace: PathBuf,
    pub memory_home: Option<PathBuf>,

    // Agent CLI binaries
    pub claude_cli_path: PathBuf,
    pub codex_cli_path: PathBuf,

    // Queue bus timing
    pub queue_poll_interval: Duration,
    pub stuck_processing_threshold: Duration,
    pub max_retry_count: u32,

    // Approval protocol timing
    pub approval_poll_interval: Duration,
    pub approval_timeout: Duration,

    // Session store
    pub session_stale_threshold: Duration,

    // Channel adapter timing
    pub pending_message_ttl: Duration,
    pub typing_refresh_interval: Duration,
    pub streaming_edit_interval: Duration,

    // Agent invocation
    pub cli_timeout: Duration,

    // Output shaping
    pub message_chunk_limit: usize,
    pub response_truncate_limit: usize,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        inject_extra_paths();

        let discord_bot_token = env_str("DISCORD_BOT_TOKEN").unwrap_or_default();
        if discord_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "DISCORD_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let admin_user_id = env_u64("TINYCLAW_ADMIN_USER_ID").ok_or_else(|| {
            Error::Config("TINYCLAW_ADMIN_USER_ID environment variable is required".to_string())
        })?;
        let allowed_user_ids = parse_csv_u64(env_str("TINYCLAW_ALLOWED_USER_IDS"));

        let home = home_dir().ok_or_else(|| Error::Config("HOME is not set".to_string()))?;
        let config_home =
            env_path("TINYCLAW_CONFIG_HOME").unwrap_or_else(|| home.join(".tinyclaw"));
        let config_workspace = env_path("TINYCLAW_CONFIG_WORKSPACE")
            .unwrap_or_else(|| config_home.join("workspace"));
        let memory_home = env_path("TINYCLAW_MEMORY_HOME");

        let claude_cli_path = env_path("CLAUDE_CLI_PATH")
            .or_else(|| which_in_path("claude"))
            .unwrap_or_else(|| PathBuf::from("claude"));
        let codex_cli_path = env_path("CODEX_CLI_PATH")
            .or_else(|| which_in_path("codex"))
            .unwrap_or_else(|| PathBuf::from("codex"));

        let queue_poll_interval =
            Duration::from_millis(env_u64("TINYCLAW_QUEUE_POLL_MS").unwrap_or(1_000));
        let stuck_processing_threshold =
            Duration::from_secs(env_u64("TINYCLAW_STUCK_THRESHOLD_SECS").unwrap_or(15 * 60));
        let max_retry_count = env_u32("TINYCLAW_MAX_RETRY_COUNT").unwrap_or(3);

        let approval_poll_interval =
            Duration::from_millis(env_u64("TINYCLAW_APPROVAL_POLL_MS").unwrap_or(2_000));
        let approval_timeout =
            Duration::from_secs(env_u64("TINYCLAW_APPROVAL_TIMEOUT_SECS").unwrap_or(300));

        let session_stale_threshold = Duration::from_secs(
            env_u64("TINYCLAW_SESSION_STALE_SECS").unwrap_or(30 * 24 * 3600),
        );

        let pending_message_ttl =
            Duration::from_secs(env_u64("TINYCLAW_PENDING_TTL_SECS").unwrap_or(3 * 24 * 3600));
        let typing_refresh_interval =
            Duration::from_secs(env_u64("TINYCLAW_TYPING_REFRESH_SECS").unwrap_or(8));
        let streaming_edit_interval =
            Duration::from_millis(env_u64("TINYCLAW_STREAM_EDIT_MS").unwrap_or(1_000));

        let cli_timeout = Duration::from_secs(env_u64("TINYCLAW_CLI_TIMEOUT_SECS").unwrap_or(600));

        let message_chunk_limit = env_usize("TINYCLAW_MESSAGE_CHUNK_LIMIT").unwrap_or(2_000);
        let response_truncate_limit =
            env_usize("TINYCLAW_RESPONSE_TRUNCATE_LIMIT").unwrap_or(4_000);

        let audit_log_path = env_path("TINYCLAW_AUDIT_LOG_PATH")
            .unwrap_or_else(|| config_home.join("logs").join("audit.log"));
        let audit_log_json = env_bool("TINYCLAW_AUDIT_LOG_JSON").unwrap_or(true);

        let rate_limit_enabled = env_bool("TINYCLAW_RATE_LIMIT_ENABLED").unwrap_or(true);
        let rate_limit_requests = env_u32("TINYCLAW_RATE_LIMIT_REQUESTS").unwrap_or(20);
        let rate_limit_window =
            Duration::from_secs(env_u64("TINYCLAW_RATE_LIMIT_WINDOW_SECS").unwrap_or(60));

        let cfg = Self {
            discord_bot_token,
            admin_user_id,
            allowed_user_ids,
            config_home,
            config_workspace,
            memory_home,
            claude_cli_path,
            codex_cli_path,
            queue_poll_interval,
            stuck_processing_threshold,
            max_retry_count,
            approval_poll_interval,
            approval_timeout,
            session_stale_threshold,
            pending_message_ttl,
            typing_refresh_interval,
            streaming_edit_interval,
            cli_timeout,
            message_chunk_limit,
            response_truncate_limit,
            audit_log_path,
            audit_log_json,
            rate_limit_enabled,
            rate_limit_requests,
            rate_limit_window,
        };
        cfg.ensure_layout()?;
        Ok(cfg)
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.incoming_dir(),
            self.processing_dir(),
            self.outgoing_dir(),
            self.dead_letter_dir(),
            self.cancel_dir(),
            self.tmp_dir(),
            self.approvals_pending_dir(),
            self.approvals_decisions_dir(),
            self.events_dir(),
            self.chats_dir(),
            self.logs_dir(),
            self.files_dir(),
            self.config_workspace.clone(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.config_home.join("queue")
    }
    pub fn incoming_dir(&self) -> PathBuf {
        self.queue_dir().join("incoming")
    }
    pub fn processing_dir(&self) -> PathBuf {
        self.queue_dir().join("processing")
    }
    pub fn outgoing_dir(&self) -> PathBuf {
        self.queue_dir().join("outgoing")
    }
    pub fn dead_letter_dir(&self) -> PathBuf {
        self.queue_dir().join("dead-letter")
    }
    pub fn cancel_dir(&self) -> PathBuf {
        self.queue_dir().join("cancel")
    }
    /// Staging directory for atomic write-then-rename enqueue, kept on the
    /// same filesystem as the other queue directories.
    pub fn tmp_dir(&self) -> PathBuf {
        self.queue_dir().join("tmp")
    }
    pub fn approvals_dir(&self) -> PathBuf {
        self.config_home.join("approvals")
    }
    pub fn approvals_pending_dir(&self) -> PathBuf {
        self.approvals_dir().join("pending")
    }
    pub fn approvals_decisions_dir(&self) -> PathBuf {
        self.approvals_dir().join("decisions")
    }
    pub fn events_dir(&self) -> PathBuf {
        self.config_home.join("events")
    }
    pub fn chats_dir(&self) -> PathBuf {
        self.config_home.join("chats")
    }
    pub fn logs_dir(&self) -> PathBuf {
        self.config_home.join("logs")
    }
    pub fn files_dir(&self) -> PathBuf {
        self.config_home.join("files")
    }
    pub fn settings_path(&self) -> PathBuf {
        self.config_home.join("settings.json")
    }
    pub fn credentials_path(&self) -> PathBuf {
        self.config_home.join("credentials.json")
    }
    pub fn session_store_path(&self) -> PathBuf {
        self.config_home.join("thread-sessions.json")
    }
    pub fn bot_threads_path(&self) -> PathBuf {
        self.config_home.join("bot-threads.json")
    }
    pub fn pending_messages_path(&self) -> PathBuf {
        self.config_home.join("pending-messages.json")
    }
    pub fn global_reset_flag_path(&self) -> PathBuf {
        self.config_home.join("reset_flag")
    }
    pub fn agent_reset_flag_path(&self, agent_id: &AgentId) -> PathBuf {
        self.config_workspace.join(&agent_id.0).join("reset_flag")
    }
    pub fn agent_working_dir(&self, agent_id: &AgentId) -> PathBuf {
        self.config_workspace.join(&agent_id.0)
    }
}

/// An agent's fixed invocation configuration, read from `settings.json`.
#[derive(Clone, Debug, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub provider: Provider,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub permissions: Option<AgentPermissions>,
    #[serde(default)]
    pub memory: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Openai,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AgentPermissions {
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

/// A named set of agents plus a designated leader, enabling chained routing.
#[derive(Clone, Debug, Deserialize)]
pub struct TeamConfig {
    pub id: String,
    pub name: String,
    pub agents: Vec<String>,
    pub leader_agent: String,
}

/// Read-only view over agent/team definitions and the global tool allow-list.
/// Re-read on demand; never cached, consistent with the rest of the bus.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub teams: Vec<TeamConfig>,
    #[serde(default)]
    pub default_agent: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

impl Registry {
    pub fn load(cfg: &Config) -> Result<Self> {
        let path = cfg.settings_path();
        let Ok(contents) = fs::read_to_string(&path) else {
            return Ok(Self::default());
        };
        serde_json::from_str(&contents).map_err(Error::Json)
    }

    pub fn find_agent(&self, id: &AgentId) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id.0)
    }

    pub fn find_agent_by_name_or_id(&self, token: &str) -> Option<&AgentConfig> {
        let lower = token.to_lowercase();
        self.agents
            .iter()
            .find(|a| a.id.to_lowercase() == lower || a.name.to_lowercase() == lower)
    }

    pub fn find_team(&self, token: &str) -> Option<&TeamConfig> {
        let lower = token.to_lowercase();
        self.teams.iter().find(|t| t.id.to_lowercase() == lower)
    }

    /// The team (if any) that the given agent belongs to, when it belongs to
    /// exactly one.
    pub fn team_of(&self, agent_id: &AgentId) -> Option<&TeamConfig> {
        let mut found = None;
        for team in &self.teams {
            if team.agents.iter().any(|a| a == &agent_id.0) {
                if found.is_some() {
                    return None;
                }
                found = Some(team);
            }
        }
        found
    }

    pub fn default_agent(&self) -> Option<AgentId> {
        if let Some(id) = &self.default_agent {
            if self.agents.iter().any(|a| &a.id == id) {
                return Some(AgentId(id.clone()));
            }
        }
        self.agents.first().map(|a| AgentId(a.id.clone()))
    }

    pub fn team_id_of(&self, team: &TeamConfig) -> TeamId {
        TeamId(team.id.clone())
    }
}

fn inject_extra_paths() {
    let Some(home) = home_dir() else {
        return;
    };

    let extras = [
        home.join(".local/bin"),
        home.join(".bun/bin"),
        PathBuf::from("/opt/homebrew/bin"),
        PathBuf::from("/opt/homebrew/sbin"),
        PathBuf::from("/usr/local/bin"),
    ];

    let current = env::var_os("PATH").unwrap_or_else(|| OsString::from(""));
    let mut parts: Vec<OsString> = env::split_paths(&current)
        .map(|p| p.into_os_string())
        .collect();

    for extra in extras.into_iter().rev() {
        let extra_os = extra.into_os_string();
        if !parts.iter().any(|p| p == &extra_os) {
            parts.insert(0, extra_os);
        }
    }

    let joined = env::join_paths(parts.into_iter().map(PathBuf::from).collect::<Vec<_>>())
        .unwrap_or(current);
    env::set_var("PATH", joined);
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_csv_u64(v: Option<String>) -> Vec<u64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<u64>().ok())
        .collect()
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn home_dir() -> Option<PathBuf> {
    dirs::home_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_defaults_to_empty() {
        let reg = Registry::default();
        assert!(reg.agents.is_empty());
        assert!(reg.default_agent().is_none());
    }

    #[test]
    fn registry_finds_agent_by_name_case_insensitively() {
        let reg = Registry {
            agents: vec![AgentConfig {
                id: "coder".into(),
                name: "Coder".into(),
                provider: Provider::Anthropic,
                model: None,
                working_directory: None,
                permissions: None,
                memory: None,
            }],
            ..Default::default()
        };
        assert!(reg.find_agent_by_name_or_id("CODER").is_some());
        assert!(reg.find_agent_by_name_or_id("coder").is_some());
    }

    #[test]
    fn team_of_is_none_when_ambiguous() {
        let reg = Registry {
            agents: vec![],
            teams: vec![
                TeamConfig {
                    id: "a".into(),
                    name: "A".into(),
                    agents: vec!["x".into()],
                    leader_agent: "x".into(),
                },
                TeamConfig {
                    id: "b".into(),
                    name: "B".into(),
                    agents: vec!["x".into()],
                    leader_agent: "x".into(),
                },
            ],
            default_agent: None,
            allowed_tools: vec![],
        };
        assert!(reg.team_of(&AgentId("x".into())).is_none());
    }
}
