//! Tool-approval hook: invoked synchronously by the agent CLI before each
//! tool use (`PreToolUse`). Reads `{tool_name, tool_input}` on stdin and
//! writes a permission decision on stdout. When no configured allowlist
//! covers the use, blocks on a human decision relayed through
//! `approvals/pending/` and `approvals/decisions/`.

use std::{
    io::Read,
    time::{SystemTime, UNIX_EPOCH},
};

use bus_core::{
    approval::{self, Decision, DecisionKind, PendingApproval},
    config::{Config, Registry},
    domain::{AgentId, MessageId},
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct HookInput {
    tool_name: String,
    #[serde(default)]
    tool_input: serde_json::Value,
}

fn decision_output(decision: &str, reason: Option<&str>) -> serde_json::Value {
    let mut hook_specific = json!({
        "hookEventName": "PreToolUse",
        "permissionDecision": decision,
    });
    if let Some(reason) = reason {
        hook_specific["permissionDecisionReason"] = json!(reason);
    }
    json!({ "hookSpecificOutput": hook_specific })
}

fn emit(decision: &str, reason: Option<&str>) {
    println!("{}", decision_output(decision, reason));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;

    let input: HookInput = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(_) => {
            emit("allow", None);
            return Ok(());
        }
    };

    let cfg = Config::load()?;
    let registry = Registry::load(&cfg)?;

    let agent_id = AgentId(std::env::var("TINYCLAW_AGENT_ID").unwrap_or_else(|_| "default".to_string()));
    let agent = registry.find_agent(&agent_id).cloned();
    let agent_dir = cfg.agent_working_dir(&agent_id);

    if approval::is_preapproved(
        &input.tool_name,
        &input.tool_input,
        agent.as_ref(),
        &registry,
        &agent_dir,
    ) {
        emit("allow", None);
        return Ok(());
    }

    let pattern = approval::compute_pattern(&input.tool_name, &input.tool_input);
    let message_id = std::env::var("TINYCLAW_MESSAGE_ID").ok().map(MessageId);
    let epoch_millis = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
    let request_id = approval::request_id(epoch_millis, std::process::id());

    let pending = PendingApproval::new(
        request_id.clone(),
        input.tool_name.clone(),
        &input.tool_input,
        agent_id,
        message_id,
    );

    let pending_path = cfg
        .approvals_pending_dir()
        .join(format!("{request_id}.json"));
    std::fs::write(&pending_path, serde_json::to_vec_pretty(&pending)?)?;

    let decision_path = cfg
        .approvals_decisions_dir()
        .join(format!("{request_id}.json"));
    let deadline = SystemTime::now() + cfg.approval_timeout;

    loop {
        if decision_path.exists() {
            let contents = std::fs::read_to_string(&decision_path)?;
            let decision: Decision = serde_json::from_str(&contents)?;
            let _ = std::fs::remove_file(&decision_path);
            let _ = std::fs::remove_file(&pending_path);

            match decision.decision {
                DecisionKind::Allow => emit("allow", None),
                DecisionKind::AlwaysAllow => {
                    approval::always_allow_agent(&agent_dir, &pattern)?;
                    emit("allow", None);
                }
                DecisionKind::AlwaysAllowAll => {
                    approval::always_allow_globally(&cfg.settings_path(), &pattern)?;
                    emit("allow", None);
                }
                DecisionKind::Deny => emit("deny", Some("denied by operator")),
            }
            return Ok(());
        }

        if SystemTime::now() >= deadline {
            let _ = std::fs::remove_file(&pending_path);
            emit("deny", Some("approval request timed out"));
            return Ok(());
        }

        tokio::time::sleep(cfg.approval_poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_output_has_no_reason_field() {
        let out = decision_output("allow", None);
        assert_eq!(out["hookSpecificOutput"]["permissionDecision"], "allow");
        assert!(out["hookSpecificOutput"]
            .get("permissionDecisionReason")
            .is_none());
    }

    #[test]
    fn deny_output_carries_reason() {
        let out = decision_output("deny", Some("denied by operator"));
        assert_eq!(out["hookSpecificOutput"]["permissionDecision"], "deny");
        assert_eq!(
            out["hookSpecificOutput"]["permissionDecisionReason"],
            "denied by operator"
        );
    }

    #[test]
    fn hook_input_defaults_tool_input_to_null_when_absent() {
        let input: HookInput = serde_json::from_str(r#"{"tool_name":"Read"}"#).unwrap();
        assert_eq!(input.tool_name, "Read");
        assert!(input.tool_input.is_null());
    }
}
