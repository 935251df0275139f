//! The approval protocol: pattern computation for a prospective tool use,
//! policy checks against configured allowlists, and the on-disk
//! pending/decision file schema shared between the approval hook and the
//! channel adapter.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    config::{AgentConfig, Registry},
    domain::{AgentId, MessageId, RequestId},
    errors::Error,
    Result,
};

const SUBCOMMAND_TOOLS: &[&str] = &[
    "git", "gh", "npm", "npx", "docker", "kubectl", "cargo", "make", "yarn", "pnpm", "bun",
    "brew", "pip", "pip3", "conda",
];

/// Compute the allowlist pattern for a prospective tool use.
///
/// `Bash` commands whose first word is a known subcommand tool (`git`,
/// `npm`, ...) and whose second token isn't a flag get a two-word pattern;
/// other `Bash` uses get a one-word pattern. Every other tool is matched by
/// name alone.
pub fn compute_pattern(tool_name: &str, tool_input: &serde_json::Value) -> String {
    if tool_name != "Bash" {
        return tool_name.to_string();
    }

    let command = tool_input
        .get("command")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let mut words = command.split_whitespace();
    let Some(w1) = words.next() else {
        return "Bash(:*)".to_string();
    };
    let w2 = words.next();

    if let Some(w2) = w2 {
        if SUBCOMMAND_TOOLS.contains(&w1) && !w2.starts_with('-') {
            return format!("Bash({w1} {w2}:*)");
        }
    }
    format!("Bash({w1}:*)")
}

/// Does `pattern` (as produced by [`compute_pattern`]) match a prospective
/// use of `tool_name` with the given `tool_input`?
pub fn pattern_matches(pattern: &str, tool_name: &str, tool_input: &serde_json::Value) -> bool {
    if tool_name != "Bash" {
        return pattern == tool_name;
    }
    let Some(prefix) = pattern
        .strip_prefix("Bash(")
        .and_then(|rest| rest.strip_suffix(":*)"))
    else {
        return false;
    };
    let command = tool_input
        .get("command")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    command.starts_with(prefix)
}

/// Check the three policy layers in order (§4.5). `agent_dir` is the
/// working directory whose `.claude/settings.json` holds the per-agent
/// on-disk allowlist. Returns `true` when no layer denies — either an
/// allowlist entry matches, or no allowlist is configured anywhere at all
/// (opt-in model).
pub fn is_preapproved(
    tool_name: &str,
    tool_input: &serde_json::Value,
    agent: Option<&AgentConfig>,
    registry: &Registry,
    agent_dir: &Path,
) -> bool {
    let pattern = compute_pattern(tool_name, tool_input);

    let per_agent_allow = agent
        .and_then(|a| a.permissions.as_ref())
        .map(|p| p.allowed_tools.as_slice())
        .unwrap_or(&[]);
    let global_allow = registry.allowed_tools.as_slice();
    let on_disk_allow = read_on_disk_allow(agent_dir);

    if per_agent_allow.is_empty() && global_allow.is_empty() && on_disk_allow.is_empty() {
        return true;
    }

    [per_agent_allow, global_allow, on_disk_allow.as_slice()]
        .into_iter()
        .any(|list| {
            list.iter()
                .any(|p| p == &pattern || pattern_matches(p, tool_name, tool_input))
        })
}

fn on_disk_settings_path(agent_dir: &Path) -> PathBuf {
    agent_dir.join(".claude").join("settings.json")
}

#[derive(Default, Deserialize, Serialize)]
struct OnDiskSettings {
    #[serde(default)]
    permissions: OnDiskPermissions,
}

#[derive(Default, Deserialize, Serialize)]
struct OnDiskPermissions {
    #[serde(default)]
    allow: Vec<String>,
}

fn read_on_disk_allow(agent_dir: &Path) -> Vec<String> {
    let path = on_disk_settings_path(agent_dir);
    let Ok(contents) = fs::read_to_string(&path) else {
        return Vec::new();
    };
    serde_json::from_str::<OnDiskSettings>(&contents)
        .map(|s| s.permissions.allow)
        .unwrap_or_default()
}

/// Append `pattern` to the per-agent on-disk allowlist, creating the file
/// and its parent directory if needed.
pub fn always_allow_agent(agent_dir: &Path, pattern: &str) -> Result<()> {
    let path = on_disk_settings_path(agent_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut settings = fs::read_to_string(&path)
        .ok()
        .and_then(|s| serde_json::from_str::<OnDiskSettings>(&s).ok())
        .unwrap_or_default();
    if !settings.permissions.allow.iter().any(|p| p == pattern) {
        settings.permissions.allow.push(pattern.to_string());
    }
    let bytes = serde_json::to_vec_pretty(&settings)?;
    fs::write(&path, bytes)?;
    Ok(())
}

/// Append `pattern` to the global settings' `allowedTools`, preserving
/// every other field already present in the document.
pub fn always_allow_globally(settings_path: &Path, pattern: &str) -> Result<()> {
    let mut doc: serde_json::Value = fs::read_to_string(settings_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| serde_json::json!({}));

    let entry = doc
        .as_object_mut()
        .ok_or_else(|| Error::Config("settings.json is not a JSON object".to_string()))?
        .entry("allowedTools")
        .or_insert_with(|| serde_json::json!([]));

    let list = entry
        .as_array_mut()
        .ok_or_else(|| Error::Config("allowedTools is not a JSON array".to_string()))?;
    if !list.iter().any(|v| v.as_str() == Some(pattern)) {
        list.push(serde_json::Value::String(pattern.to_string()));
    }

    let bytes = serde_json::to_vec_pretty(&doc)?;
    fs::write(settings_path, bytes)?;
    Ok(())
}

/// A tool-use awaiting a human decision, persisted at
/// `approvals/pending/<requestId>.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub request_id: RequestId,
    pub tool_name: String,
    pub tool_pattern: String,
    pub tool_input_summary: String,
    pub agent_id: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    pub timestamp: String,
    pub notified: bool,
}

impl PendingApproval {
    pub fn new(
        request_id: RequestId,
        tool_name: String,
        tool_input: &serde_json::Value,
        agent_id: AgentId,
        message_id: Option<MessageId>,
    ) -> Self {
        let tool_pattern = compute_pattern(&tool_name, tool_input);
        Self {
            request_id,
            tool_pattern,
            tool_input_summary: summarize_tool_input(tool_input),
            tool_name,
            agent_id,
            message_id,
            timestamp: crate::utils::iso_timestamp_utc(),
            notified: false,
        }
    }
}

fn summarize_tool_input(tool_input: &serde_json::Value) -> String {
    let rendered = tool_input.to_string();
    const MAX: usize = 500;
    if rendered.chars().count() > MAX {
        let truncated: String = rendered.chars().take(MAX).collect();
        format!("{truncated}…")
    } else {
        rendered
    }
}

/// The decision for a given pending approval, persisted at
/// `approvals/decisions/<requestId>.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Allow,
    AlwaysAllow,
    AlwaysAllowAll,
    Deny,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decision {
    pub decision: DecisionKind,
}

/// `requestId = "<epoch>_<pid>"`.
pub fn request_id(epoch_millis: u128, pid: u32) -> RequestId {
    RequestId(format!("{epoch_millis}_{pid}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(command: &str) -> serde_json::Value {
        serde_json::json!({ "command": command })
    }

    #[test]
    fn subcommand_tool_gets_two_word_pattern() {
        assert_eq!(
            compute_pattern("Bash", &input("git status")),
            "Bash(git status:*)"
        );
    }

    #[test]
    fn subcommand_tool_with_flag_second_token_gets_one_word_pattern() {
        assert_eq!(
            compute_pattern("Bash", &input("git -C /tmp status")),
            "Bash(git:*)"
        );
    }

    #[test]
    fn non_subcommand_tool_gets_one_word_pattern() {
        assert_eq!(compute_pattern("Bash", &input("ls -la")), "Bash(ls:*)");
    }

    #[test]
    fn non_bash_tool_uses_tool_name_verbatim() {
        assert_eq!(compute_pattern("Read", &serde_json::json!({})), "Read");
    }

    #[test]
    fn pattern_matches_checks_tool_name_and_command_prefix() {
        let pattern = "Bash(git push:*)";
        assert!(pattern_matches(
            pattern,
            "Bash",
            &input("git push origin main")
        ));
        assert!(!pattern_matches(pattern, "Bash", &input("git status")));
        assert!(!pattern_matches("Read", "Bash", &input("git push")));
    }

    #[test]
    fn no_allowlist_anywhere_is_opt_in_allow() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::default();
        assert!(is_preapproved(
            "Bash",
            &input("rm -rf /"),
            None,
            &registry,
            dir.path()
        ));
    }

    #[test]
    fn per_agent_allowlist_gates_other_commands() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::default();
        let agent = AgentConfig {
            id: "coder".into(),
            name: "Coder".into(),
            provider: crate::config::Provider::Anthropic,
            model: None,
            working_directory: None,
            permissions: Some(crate::config::AgentPermissions {
                allowed_tools: vec!["Bash(git:*)".to_string()],
            }),
            memory: None,
        };
        assert!(is_preapproved(
            "Bash",
            &input("git status"),
            Some(&agent),
            &registry,
            dir.path()
        ));
        assert!(!is_preapproved(
            "Bash",
            &input("rm -rf /"),
            Some(&agent),
            &registry,
            dir.path()
        ));
    }

    #[test]
    fn always_allow_agent_persists_pattern_for_future_checks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::default();
        let agent = AgentConfig {
            id: "coder".into(),
            name: "Coder".into(),
            provider: crate::config::Provider::Anthropic,
            model: None,
            working_directory: None,
            permissions: Some(crate::config::AgentPermissions {
                allowed_tools: vec![],
            }),
            memory: None,
        };

        always_allow_agent(dir.path(), "Bash(git push:*)").unwrap();
        assert!(is_preapproved(
            "Bash",
            &input("git push origin main"),
            Some(&agent),
            &registry,
            dir.path()
        ));
    }

    #[test]
    fn always_allow_globally_preserves_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"defaultAgent":"coder"}"#).unwrap();

        always_allow_globally(&path, "Bash(npm test:*)").unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["defaultAgent"], "coder");
        assert_eq!(doc["allowedTools"][0], "Bash(npm test:*)");
    }
}
