//! Single-agent invocation: session-directive resolution, streaming-partial
//! plumbing, the session-not-found retry, and output post-processing.

use std::sync::Arc;

use bus_core::{
    config::Config,
    domain::{AgentId, SessionKey},
    model::{ModelClient, RunRequest, RunResult, SessionDirective},
    queue::{Queue, StreamingPartial},
    session_store::SessionStore,
    Error, Result,
};

const RESPONSE_TRUNCATE_LIMIT: usize = 4_000;

/// Resolve the session-continuity directive for one invocation (§4.3),
/// consuming the global/per-agent reset flags in the process.
pub async fn resolve_session_directive(
    session_store: &SessionStore,
    cfg: &Config,
    session_key: Option<&SessionKey>,
    agent_id: &AgentId,
) -> Result<SessionDirective> {
    let reset = consume_reset_flags(cfg, agent_id);

    match (session_key, reset) {
        (Some(key), true) => {
            let id = session_store.create(key, agent_id).await?;
            Ok(SessionDirective::New { session_id: id.0 })
        }
        (Some(key), false) => match session_store.get(key).await? {
            Some(entry) => Ok(SessionDirective::Resume {
                session_id: entry.session_id.0,
            }),
            None => {
                let id = session_store.create(key, agent_id).await?;
                Ok(SessionDirective::New { session_id: id.0 })
            }
        },
        (None, false) => Ok(SessionDirective::ContinueLast),
        (None, true) => Ok(SessionDirective::None),
    }
}

fn consume_reset_flags(cfg: &Config, agent_id: &AgentId) -> bool {
    let global = cfg.global_reset_flag_path();
    let per_agent = cfg.agent_reset_flag_path(agent_id);
    let global_hit = std::fs::remove_file(&global).is_ok();
    let agent_hit = std::fs::remove_file(&per_agent).is_ok();
    global_hit || agent_hit
}

/// Run one agent invocation end to end: streams partials into `outgoing/`
/// as they arrive, retries once on a detected session-not-found error (only
/// meaningful for the `anthropic` provider), and deletes the streaming file
/// once the run settles.
pub async fn invoke(
    client: Arc<dyn ModelClient>,
    mut req: RunRequest,
    session_store: &SessionStore,
    session_key: Option<&SessionKey>,
    queue: &Queue,
    channel: &str,
    sender: &str,
) -> Result<RunResult> {
    let message_id = req.message_id.clone();

    let first = run_with_streaming(client.clone(), req.clone(), queue, channel, sender).await;

    let result = match (&first, &req.session) {
        (Err(e), SessionDirective::Resume { .. })
            if bus_claude_cli::is_session_not_found(&e.to_string()) =>
        {
            if let Some(key) = session_key {
                let new_id = session_store.create(key, &req.agent_id).await?;
                req.session = SessionDirective::New {
                    session_id: new_id.0,
                };
                run_with_streaming(client, req, queue, channel, sender).await
            } else {
                first
            }
        }
        _ => first,
    };

    if let Some(message_id) = &message_id {
        let _ = queue.delete_streaming_partial(message_id).await;
    }

    result
}

async fn run_with_streaming(
    client: Arc<dyn ModelClient>,
    req: RunRequest,
    queue: &Queue,
    channel: &str,
    sender: &str,
) -> Result<RunResult> {
    let Some(message_id) = req.message_id.clone() else {
        let mut no_op = |_: &str| -> Result<()> { Ok(()) };
        return client.run(req, &mut no_op).await;
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let agent_id = req.agent_id.clone();

    let writer_queue = queue.clone();
    let writer_channel = channel.to_string();
    let writer_sender = sender.to_string();
    let writer_message_id = message_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            let mut partial = StreamingPartial::new(
                &writer_channel,
                &writer_sender,
                writer_message_id.clone(),
                text,
            );
            partial.agent = Some(agent_id.clone());
            let _ = writer_queue.write_streaming_partial(&partial).await;
        }
    });

    let mut on_partial = move |text: &str| -> Result<()> {
        let _ = tx.send(text.to_string());
        Ok(())
    };

    let result = client.run(req, &mut on_partial).await;
    drop(on_partial);
    let _ = writer.await;
    result
}

/// Strip `[send_file: ...]` tags, returning the cleaned and truncated text
/// plus the referenced file paths that actually exist on disk — a tag
/// naming a path the agent never wrote is dropped rather than forwarded as
/// an attachment.
pub fn postprocess(text: &str) -> (String, Vec<String>) {
    let (cleaned, files) = bus_core::formatting::extract_send_file_tags(text.trim());
    let files = files
        .into_iter()
        .filter(|f| std::path::Path::new(f).exists())
        .collect();
    (
        bus_core::formatting::truncate_response(&cleaned, RESPONSE_TRUNCATE_LIMIT),
        files,
    )
}

pub fn error_response(e: &Error) -> String {
    format!("Sorry, I encountered an error: {e}")
}
