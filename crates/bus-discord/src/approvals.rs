//! Channel side of the approval protocol: poll `approvals/pending/` for
//! requests the hook side is blocked on, post a four-button prompt into the
//! originating thread (or a DM to the admin), and turn button clicks into
//! `approvals/decisions/<requestId>.json`.

use std::{sync::Arc, time::Duration};

use serenity::all::{ButtonStyle, ChannelId, CreateActionRow, CreateButton, CreateMessage, Http, UserId as DiscordUserId};
use tokio::sync::Mutex;

use bus_core::{
    approval::{Decision, DecisionKind, PendingApproval},
    config::Config,
};

use crate::state::PendingMessages;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// `custom_id` prefix for approval buttons, followed by the decision kind
/// and the request id: `approve:<kind>:<requestId>`.
const APPROVE_PREFIX: &str = "approve:";

pub struct ApprovalContext {
    pub http: Arc<Http>,
    pub cfg: Arc<Config>,
    pub pending: Arc<Mutex<PendingMessages>>,
}

/// Poll `approvals/pending/` once per second, prompting for any request the
/// adapter hasn't notified a human about yet.
pub async fn run(ctx: ApprovalContext) {
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    loop {
        tick.tick().await;
        if let Err(e) = poll_once(&ctx).await {
            tracing_info(&format!("approval poll failed: {e}"));
        }
    }
}

async fn poll_once(ctx: &ApprovalContext) -> bus_core::Result<()> {
    let dir = ctx.cfg.approvals_pending_dir();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Err(e) = notify_one(ctx, &path).await {
            tracing_info(&format!("approval notify failed for {path:?}: {e}"));
        }
    }
    Ok(())
}

async fn notify_one(ctx: &ApprovalContext, path: &std::path::Path) -> bus_core::Result<()> {
    let bytes = tokio::fs::read(path).await?;
    let mut pending: PendingApproval = serde_json::from_slice(&bytes)?;
    if pending.notified {
        return Ok(());
    }

    let channel_id = destination_channel(ctx, &pending).await;
    let prompt = format!(
        "**Approval needed** — `{}` wants to use `{}`\n```\n{}\n```",
        pending.agent_id, pending.tool_pattern, pending.tool_input_summary
    );

    let create = CreateMessage::new()
        .content(prompt)
        .components(vec![approval_row(&pending.request_id)]);

    match channel_id {
        Some(channel_id) => {
            channel_id
                .send_message(&ctx.http, create)
                .await
                .map_err(|e| bus_core::Error::External(format!("discord send failed: {e}")))?;
        }
        None => {
            let dm = DiscordUserId::new(ctx.cfg.admin_user_id)
                .create_dm_channel(&ctx.http)
                .await
                .map_err(|e| bus_core::Error::External(format!("discord dm open failed: {e}")))?;
            dm.id
                .send_message(&ctx.http, create)
                .await
                .map_err(|e| bus_core::Error::External(format!("discord send failed: {e}")))?;
        }
    }

    pending.notified = true;
    tokio::fs::write(path, serde_json::to_vec_pretty(&pending)?).await?;
    Ok(())
}

/// The thread matching the request's originating message, if one has
/// already been created; `None` falls back to a DM to the admin.
async fn destination_channel(ctx: &ApprovalContext, pending: &PendingApproval) -> Option<ChannelId> {
    let message_id = pending.message_id.as_ref()?;
    let guard = ctx.pending.lock().await;
    let entry = guard.get(&message_id.0)?;
    Some(ChannelId::new(entry.thread_id.unwrap_or(entry.channel_id)))
}

fn approval_row(request_id: &bus_core::domain::RequestId) -> CreateActionRow {
    let custom_id = |kind: &str| format!("{APPROVE_PREFIX}{kind}:{request_id}");
    CreateActionRow::Buttons(vec![
        CreateButton::new(custom_id("allow"))
            .label("Allow this time")
            .style(ButtonStyle::Success),
        CreateButton::new(custom_id("always"))
            .label("Always allow")
            .style(ButtonStyle::Primary),
        CreateButton::new(custom_id("global"))
            .label("Always allow globally")
            .style(ButtonStyle::Primary),
        CreateButton::new(custom_id("deny"))
            .label("Deny")
            .style(ButtonStyle::Danger),
    ])
}

/// Parse an approval button's `custom_id` into the decision it records and
/// the request id it belongs to.
pub fn parse_custom_id(custom_id: &str) -> Option<(Decision, String)> {
    let rest = custom_id.strip_prefix(APPROVE_PREFIX)?;
    let (kind, request_id) = rest.split_once(':')?;
    let decision = match kind {
        "allow" => DecisionKind::Allow,
        "always" => DecisionKind::AlwaysAllow,
        "global" => DecisionKind::AlwaysAllowAll,
        "deny" => DecisionKind::Deny,
        _ => return None,
    };
    Some((Decision { decision }, request_id.to_string()))
}

pub fn decision_label(decision: &DecisionKind) -> &'static str {
    match decision {
        DecisionKind::Allow => "Allowed this time.",
        DecisionKind::AlwaysAllow => "Always allowed for this agent.",
        DecisionKind::AlwaysAllowAll => "Always allowed globally.",
        DecisionKind::Deny => "Denied.",
    }
}

fn tracing_info(msg: &str) {
    #[cfg(feature = "tracing")]
    tracing::info!("{msg}");
    #[cfg(not(feature = "tracing"))]
    let _ = msg;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_custom_id_recognizes_all_four_decisions() {
        let (d, id) = parse_custom_id("approve:allow:123_45").unwrap();
        assert_eq!(d.decision, DecisionKind::Allow);
        assert_eq!(id, "123_45");

        assert_eq!(parse_custom_id("approve:always:1").unwrap().0.decision, DecisionKind::AlwaysAllow);
        assert_eq!(parse_custom_id("approve:global:1").unwrap().0.decision, DecisionKind::AlwaysAllowAll);
        assert_eq!(parse_custom_id("approve:deny:1").unwrap().0.decision, DecisionKind::Deny);
    }

    #[test]
    fn parse_custom_id_rejects_other_prefixes() {
        assert!(parse_custom_id("cancel:abc").is_none());
        assert!(parse_custom_id("approve:bogus:1").is_none());
    }
}
