//! Team-chain execution: repeatedly invoke agents following teammate
//! mentions in their responses, until the chain runs dry or fans out.

use std::path::PathBuf;
use std::sync::Arc;

use bus_core::{
    config::{Config, Registry, TeamConfig},
    domain::{AgentId, MessageId, SessionKey},
    model::{ModelClient, ProviderKind, RunRequest},
    queue::Queue,
    routing::{self, Mention},
    session_store::SessionStore,
    Result,
};

use crate::invoke;

/// Everything needed to build a `RunRequest` and pick a client for one
/// step, shared across every agent invoked in a chain.
pub struct ChainContext<'a> {
    pub cfg: &'a Config,
    pub registry: &'a Registry,
    pub session_store: &'a SessionStore,
    pub queue: &'a Queue,
    pub channel: &'a str,
    pub sender: &'a str,
    pub session_key: Option<SessionKey>,
    pub message_id: Option<MessageId>,
    pub clients: &'a dyn Fn(ProviderKind) -> Arc<dyn ModelClient>,
}

/// Drive a team chain to completion starting from `initial_agent` with
/// `initial_message`, returning the aggregated response text and the union
/// of `[send_file: ...]` paths collected across every step.
pub async fn run_chain(
    ctx: &ChainContext<'_>,
    team: &TeamConfig,
    initial_agent: AgentId,
    initial_message: String,
) -> Result<(String, Vec<String>)> {
    let mut steps: Vec<(AgentId, String)> = Vec::new();
    let mut files: Vec<String> = Vec::new();

    let mut current_agent = initial_agent;
    let mut current_message = initial_message;

    loop {
        let output = run_step(ctx, &current_agent, &current_message).await;
        let (text, step_files) = invoke::postprocess(&output);
        for f in step_files {
            if !files.contains(&f) {
                files.push(f);
            }
        }
        steps.push((current_agent.clone(), text.clone()));

        let mentions = routing::parse_team_mentions(&text, team, &current_agent, ctx.registry);

        match mentions.as_slice() {
            [] => break,
            [one] => {
                current_message = routing::handoff_message(&current_agent, &one.handoff);
                current_agent = one.teammate_id.clone();
            }
            many => {
                let fanned = fan_out(ctx, team, &current_agent, many).await;
                for (agent_id, text, step_files) in fanned {
                    for f in step_files {
                        if !files.contains(&f) {
                            files.push(f);
                        }
                    }
                    steps.push((agent_id, text));
                }
                break;
            }
        }
    }

    Ok((routing::format_chain_response(&steps), files))
}

/// Invoke every mentioned teammate concurrently, preserving mention order
/// in the returned vec regardless of which step finishes first.
async fn fan_out(
    ctx: &ChainContext<'_>,
    team: &TeamConfig,
    from: &AgentId,
    mentions: &[Mention],
) -> Vec<(AgentId, String, Vec<String>)> {
    let _ = team;
    let futures = mentions.iter().map(|mention| async move {
        let message = routing::handoff_message(from, &mention.handoff);
        let agent_id = mention.teammate_id.clone();
        let output = run_step(ctx, &agent_id, &message).await;
        let (text, files) = invoke::postprocess(&output);
        (agent_id, text, files)
    });
    futures::future::join_all(futures).await
}

/// Invoke one agent in the chain, converting any invocation error into a
/// per-step error message rather than aborting already-completed steps.
async fn run_step(ctx: &ChainContext<'_>, agent_id: &AgentId, message: &str) -> String {
    match run_step_inner(ctx, agent_id, message).await {
        Ok(result) => {
            if result.is_error {
                invoke::error_response(&bus_core::Error::External(result.text))
            } else {
                result.text
            }
        }
        Err(e) => invoke::error_response(&e),
    }
}

async fn run_step_inner(
    ctx: &ChainContext<'_>,
    agent_id: &AgentId,
    message: &str,
) -> Result<bus_core::model::RunResult> {
    let agent = ctx.registry.find_agent(agent_id).ok_or_else(|| {
        bus_core::Error::Config(format!("team chain references unknown agent {agent_id}"))
    })?;

    let provider = match agent.provider {
        bus_core::config::Provider::Anthropic => ProviderKind::Anthropic,
        bus_core::config::Provider::Openai => ProviderKind::Openai,
    };
    let client = (ctx.clients)(provider);

    let session = invoke::resolve_session_directive(
        ctx.session_store,
        ctx.cfg,
        ctx.session_key.as_ref(),
        agent_id,
    )
    .await?;

    let cwd = agent_working_dir(ctx.cfg, agent);
    let req = RunRequest {
        prompt: message.to_string(),
        cwd,
        model: agent.model.clone(),
        session,
        agent_id: agent_id.clone(),
        message_id: ctx.message_id.clone(),
        config_home: ctx.cfg.config_home.clone(),
        append_system_prompt_file: agent
            .memory
            .as_ref()
            .map(|_| ctx.cfg.agent_working_dir(agent_id).join("MEMORY.md")),
    };

    invoke::invoke(
        client,
        req,
        ctx.session_store,
        ctx.session_key.as_ref(),
        ctx.queue,
        ctx.channel,
        ctx.sender,
    )
    .await
}

fn agent_working_dir(cfg: &Config, agent: &bus_core::config::AgentConfig) -> PathBuf {
    match &agent.working_directory {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => cfg.config_workspace.join(dir),
        None => cfg.agent_working_dir(&AgentId(agent.id.clone())),
    }
}
