//! The dispatcher's main loop: claim one message at a time from `incoming/`,
//! route it, run it (as a single invocation or a team chain), write the
//! response, and cooperatively sweep stuck files and drain cancel signals
//! on the same timer.

use std::{
    sync::{atomic::AtomicBool, atomic::Ordering, Arc},
    time::Duration,
};

use bus_claude_cli::{ClaudeCliClient, ClaudeCliConfig};
use bus_codex_cli::{CodexCliClient, CodexCliConfig};
use tokio::sync::Mutex;

use bus_core::{
    config::{Config, Registry},
    domain::{AgentId, MessageId, SessionKey},
    model::{ModelClient, ProviderKind, RunRequest},
    queue::{OutgoingResponse, Queue},
    routing::{self, RouteOutcome},
    session_store::SessionStore,
    Result,
};

use crate::{chain, invoke};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type CurrentInvocation = Arc<Mutex<Option<(MessageId, Arc<dyn ModelClient>)>>>;

/// Claiming and processing one message can block on a slow subprocess for
/// minutes, so each tick that finds work spawns it rather than awaiting it
/// inline — otherwise the sweep and cancel-signal timers below would starve
/// for the whole invocation.
pub async fn run(cfg: Arc<Config>) -> Result<()> {
    let queue = Queue::from_config(&cfg);
    let session_store = SessionStore::new(cfg.session_store_path());

    let busy = Arc::new(AtomicBool::new(false));
    let current: CurrentInvocation = Arc::new(Mutex::new(None));

    let mut poll_interval = tokio::time::interval(cfg.queue_poll_interval);
    let mut sweep_interval = tokio::time::interval(SWEEP_INTERVAL);
    let mut cancel_interval = tokio::time::interval(cfg.queue_poll_interval);

    if let Ok(recovered) = queue.sweep_stuck().await {
        if recovered > 0 {
            tracing_info(&format!("recovered {recovered} stuck message(s) on startup"));
        }
    }

    loop {
        tokio::select! {
            _ = poll_interval.tick() => {
                if busy.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let cfg = cfg.clone();
                let queue = queue.clone();
                let session_store = session_store.clone();
                let current = current.clone();
                let busy = busy.clone();
                tokio::spawn(async move {
                    if let Err(e) = process_one(&cfg, &queue, &session_store, &current).await {
                        tracing_info(&format!("dispatcher tick failed: {e}"));
                    }
                    busy.store(false, Ordering::SeqCst);
                });
            }
            _ = sweep_interval.tick() => {
                let queue = queue.clone();
                tokio::spawn(async move {
                    if let Ok(recovered) = queue.sweep_stuck().await {
                        if recovered > 0 {
                            tracing_info(&format!("swept {recovered} stuck message(s)"));
                        }
                    }
                });
            }
            _ = cancel_interval.tick() => {
                let queue = queue.clone();
                let current = current.clone();
                tokio::spawn(async move {
                    if let Ok(ids) = queue.poll_cancel().await {
                        for id in ids {
                            let guard = current.lock().await;
                            if let Some((current_id, client)) = guard.as_ref() {
                                if *current_id == id {
                                    let client = client.clone();
                                    drop(guard);
                                    let _ = client.cancel().await;
                                }
                            }
                        }
                    }
                });
            }
        }
    }
}

fn tracing_info(msg: &str) {
    #[cfg(feature = "tracing")]
    tracing::info!("{msg}");
    #[cfg(not(feature = "tracing"))]
    let _ = msg;
}

fn client_factory(cfg: &Config) -> impl Fn(ProviderKind) -> Arc<dyn ModelClient> + '_ {
    move |provider| -> Arc<dyn ModelClient> {
        match provider {
            ProviderKind::Anthropic => Arc::new(ClaudeCliClient::new(ClaudeCliConfig {
                claude_path: cfg.claude_cli_path.clone(),
            })),
            ProviderKind::Openai => Arc::new(CodexCliClient::new(CodexCliConfig {
                codex_path: cfg.codex_cli_path.clone(),
            })),
        }
    }
}

async fn process_one(
    cfg: &Arc<Config>,
    queue: &Queue,
    session_store: &SessionStore,
    current: &Mutex<Option<(MessageId, Arc<dyn ModelClient>)>>,
) -> Result<()> {
    let Some((processing_path, msg)) = queue.claim_next().await? else {
        return Ok(());
    };

    let registry = Registry::load(cfg)?;
    let outcome = routing::route(&msg.message, msg.agent.as_ref(), &registry);

    // `Ok` carries a response to deliver normally; `Err` carries the
    // user-facing apology for an invocation that failed and whose
    // processing file must go through the retry/dead-letter rule instead
    // of being completed outright.
    let invocation: std::result::Result<(String, Vec<String>), String> = match outcome {
        RouteOutcome::RoutingError => Ok((routing::ROUTING_ERROR_TEXT.to_string(), Vec::new())),
        RouteOutcome::Routed(routed) => {
            let session_key = msg
                .session_key
                .clone()
                .or_else(|| msg.sender_id.as_deref().map(SessionKey::dm));

            match registry.team_of(&routed.agent_id) {
                Some(team) if team.agents.len() > 1 => {
                    let clients = client_factory(cfg);
                    let ctx = chain::ChainContext {
                        cfg,
                        registry: &registry,
                        session_store,
                        queue,
                        channel: &msg.channel,
                        sender: &msg.sender,
                        session_key,
                        message_id: Some(msg.message_id.clone()),
                        clients: &clients,
                    };
                    // Per-step failures inside a chain already resolve to a
                    // per-step error message (see chain::run_step) without
                    // aborting completed steps, so a chain that returns at
                    // all is a delivered response, not a failed invocation.
                    Ok(chain::run_chain(&ctx, team, routed.agent_id, routed.message).await?)
                }
                _ => {
                    run_single(
                        cfg,
                        &registry,
                        queue,
                        session_store,
                        current,
                        &msg.channel,
                        &msg.sender,
                        msg.message_id.clone(),
                        session_key,
                        routed.agent_id,
                        routed.message,
                    )
                    .await
                }
            }
        }
    };

    match invocation {
        Ok((response_text, files)) => {
            let resp = OutgoingResponse {
                channel: msg.channel.clone(),
                sender: msg.sender.clone(),
                message: response_text,
                original_message: msg.message.clone(),
                timestamp: bus_core::utils::iso_timestamp_utc(),
                message_id: msg.message_id.clone(),
                agent: msg.agent.clone(),
                files,
            };
            queue.complete(&processing_path, &resp).await?;
        }
        Err(apology) => {
            let resp = OutgoingResponse {
                channel: msg.channel.clone(),
                sender: msg.sender.clone(),
                message: apology,
                original_message: msg.message.clone(),
                timestamp: bus_core::utils::iso_timestamp_utc(),
                message_id: msg.message_id.clone(),
                agent: msg.agent.clone(),
                files: Vec::new(),
            };
            queue.write_response(&resp).await?;
            queue.fail_processing(&processing_path, msg).await?;
        }
    }

    let mut guard = current.lock().await;
    *guard = None;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_single(
    cfg: &Arc<Config>,
    registry: &Registry,
    queue: &Queue,
    session_store: &SessionStore,
    current: &Mutex<Option<(MessageId, Arc<dyn ModelClient>)>>,
    channel: &str,
    sender: &str,
    message_id: MessageId,
    session_key: Option<SessionKey>,
    agent_id: AgentId,
    message: String,
) -> std::result::Result<(String, Vec<String>), String> {
    let Some(agent) = registry.find_agent(&agent_id) else {
        return Err(format!("Sorry, I encountered an error: unknown agent {agent_id}"));
    };

    let provider = match agent.provider {
        bus_core::config::Provider::Anthropic => ProviderKind::Anthropic,
        bus_core::config::Provider::Openai => ProviderKind::Openai,
    };
    let client = client_factory(cfg)(provider);

    {
        let mut guard = current.lock().await;
        *guard = Some((message_id.clone(), client.clone()));
    }

    let session = match invoke::resolve_session_directive(
        session_store,
        cfg,
        session_key.as_ref(),
        &agent_id,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => return Err(invoke::error_response(&e)),
    };

    let cwd = match &agent.working_directory {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => cfg.config_workspace.join(dir),
        None => cfg.agent_working_dir(&agent_id),
    };

    let req = RunRequest {
        prompt: message,
        cwd,
        model: agent.model.clone(),
        session,
        agent_id: agent_id.clone(),
        message_id: Some(message_id),
        config_home: cfg.config_home.clone(),
        append_system_prompt_file: agent
            .memory
            .as_ref()
            .map(|_| cfg.agent_working_dir(&agent_id).join("MEMORY.md")),
    };

    match invoke::invoke(
        client,
        req,
        session_store,
        session_key.as_ref(),
        queue,
        channel,
        sender,
    )
    .await
    {
        Ok(result) if result.is_error => {
            Err(invoke::error_response(&bus_core::Error::External(result.text)))
        }
        Ok(result) => Ok(invoke::postprocess(&result.text)),
        Err(e) => Err(invoke::error_response(&e)),
    }
}
