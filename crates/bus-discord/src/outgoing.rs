//! Outbound side of the adapter: poll `outgoing/` for streaming partials and
//! final responses, chunk/throttle them onto Discord, create threads on
//! demand, and refresh the typing indicator for work still in flight.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use serenity::all::{
    ButtonStyle, ChannelId, ChannelType, CreateActionRow, CreateButton, CreateMessage,
    CreateThread, EditMessage, Http, MessageId as DiscordMessageId,
};
use tokio::sync::Mutex;

use bus_core::{
    config::Config,
    domain::{MessageId, SessionKey},
    formatting::chunk_text,
    queue::Queue,
    session_store::SessionStore,
};

use crate::state::{BotThreads, PendingMessages};

const STREAM_DISPLAY_LIMIT: usize = 1950;
const DISCORD_HARD_LIMIT: usize = 2000;
const STREAMING_MARKER: &str = "\n\n*[streaming...]*";

pub struct OutgoingContext {
    pub http: Arc<Http>,
    pub cfg: Arc<Config>,
    pub queue: Queue,
    pub session_store: SessionStore,
    pub bot_threads: Arc<Mutex<BotThreads>>,
    pub pending: Arc<Mutex<PendingMessages>>,
}

/// Poll `outgoing/` once per tick, handling whatever `.streaming`/`.json`
/// files are present. Per-message edit throttling lives in `last_edit`,
/// which outlives any single tick.
pub async fn run(ctx: OutgoingContext) {
    let mut tick = tokio::time::interval(ctx.cfg.queue_poll_interval);
    let mut last_edit: HashMap<String, Instant> = HashMap::new();

    loop {
        tick.tick().await;
        if let Err(e) = poll_once(&ctx, &mut last_edit).await {
            tracing_info(&format!("outgoing poll failed: {e}"));
        }
    }
}

async fn poll_once(ctx: &OutgoingContext, last_edit: &mut HashMap<String, Instant>) -> bus_core::Result<()> {
    let dir = ctx.cfg.outgoing_dir();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("streaming") => {
                if let Err(e) = handle_streaming(ctx, &path, last_edit).await {
                    tracing_info(&format!("streaming partial handling failed: {e}"));
                }
            }
            Some("json") => {
                if let Err(e) = handle_final(ctx, &path).await {
                    tracing_info(&format!("final response handling failed: {e}"));
                }
                let _ = tokio::fs::remove_file(&path).await;
                last_edit.remove(&path.to_string_lossy().to_string());
            }
            _ => {}
        }
    }
    Ok(())
}

async fn handle_streaming(
    ctx: &OutgoingContext,
    path: &std::path::Path,
    last_edit: &mut HashMap<String, Instant>,
) -> bus_core::Result<()> {
    let bytes = tokio::fs::read(path).await?;
    let partial: bus_core::queue::StreamingPartial = serde_json::from_slice(&bytes)?;
    let key = partial.message_id.0.clone();

    if let Some(last) = last_edit.get(&key) {
        if last.elapsed() < ctx.cfg.streaming_edit_interval {
            return Ok(());
        }
    }

    let mut pending = ctx.pending.lock().await;
    let Some(entry) = pending.get_mut(&partial.message_id.0) else {
        return Ok(());
    };

    let channel_id = match entry.thread_id {
        Some(id) => ChannelId::new(id),
        None => ChannelId::new(entry.channel_id),
    };

    let display = streaming_display(&partial.partial, partial.cancelable.unwrap_or(false), &partial.message_id);

    if let Some(discord_id) = entry.streaming_message_id {
        channel_id
            .edit_message(&ctx.http, DiscordMessageId::new(discord_id), EditMessage::new().content(display))
            .await
            .map_err(|e| bus_core::Error::External(format!("discord edit failed: {e}")))?;
    } else {
        let mut create = CreateMessage::new().content(display);
        if partial.cancelable.unwrap_or(false) {
            create = create.components(vec![cancel_row(&partial.message_id)]);
        }
        let posted = channel_id
            .send_message(&ctx.http, create)
            .await
            .map_err(|e| bus_core::Error::External(format!("discord send failed: {e}")))?;
        entry.streaming_message_id = Some(posted.id.get());

        if entry.needs_thread && entry.thread_id.is_none() {
            maybe_create_thread(ctx, entry, &partial.message_id).await?;
        }
    }

    let _ = pending.save(&ctx.cfg.pending_messages_path());
    last_edit.insert(key, Instant::now());
    Ok(())
}

async fn handle_final(ctx: &OutgoingContext, path: &std::path::Path) -> bus_core::Result<()> {
    let bytes = tokio::fs::read(path).await?;
    let resp: bus_core::queue::OutgoingResponse = serde_json::from_slice(&bytes)?;

    let mut pending = ctx.pending.lock().await;
    let Some(mut entry) = pending.remove(&resp.message_id.0) else {
        return Ok(());
    };

    if entry.needs_thread && entry.thread_id.is_none() {
        maybe_create_thread(ctx, &mut entry, &resp.message_id).await?;
    }

    let channel_id = match entry.thread_id {
        Some(id) => ChannelId::new(id),
        None => ChannelId::new(entry.channel_id),
    };

    let chunks = chunk_text(&resp.message, ctx.cfg.message_chunk_limit);
    let mut chunks_iter = chunks.into_iter();

    if let Some(first) = chunks_iter.next() {
        if let Some(discord_id) = entry.streaming_message_id {
            channel_id
                .edit_message(
                    &ctx.http,
                    DiscordMessageId::new(discord_id),
                    EditMessage::new().content(first).components(vec![]),
                )
                .await
                .map_err(|e| bus_core::Error::External(format!("discord edit failed: {e}")))?;
        } else {
            channel_id
                .send_message(&ctx.http, CreateMessage::new().content(first))
                .await
                .map_err(|e| bus_core::Error::External(format!("discord send failed: {e}")))?;
        }
    }

    for chunk in chunks_iter {
        channel_id
            .send_message(&ctx.http, CreateMessage::new().content(chunk))
            .await
            .map_err(|e| bus_core::Error::External(format!("discord send failed: {e}")))?;
    }

    let _ = ctx.queue.delete_streaming_partial(&resp.message_id).await;
    let _ = pending.save(&ctx.cfg.pending_messages_path());
    Ok(())
}

/// Create a thread off the original channel message and remap the bus
/// message id's session entry onto the new thread id, so conversation
/// continuity follows the thread rather than the message that birthed it.
async fn maybe_create_thread(
    ctx: &OutgoingContext,
    entry: &mut crate::state::PendingEntry,
    bus_message_id: &MessageId,
) -> bus_core::Result<()> {
    let channel_id = ChannelId::new(entry.channel_id);
    let original = DiscordMessageId::new(entry.original_message_id);

    let thread = channel_id
        .create_thread_from_message(
            &ctx.http,
            original,
            CreateThread::new(thread_title(bus_message_id)).kind(ChannelType::PublicThread),
        )
        .await
        .map_err(|e| bus_core::Error::External(format!("discord thread creation failed: {e}")))?;

    entry.thread_id = Some(thread.id.get());

    ctx.session_store
        .remap(
            &SessionKey(bus_message_id.0.clone()),
            &SessionKey(thread.id.get().to_string()),
        )
        .await?;

    let mut threads = ctx.bot_threads.lock().await;
    threads.insert(thread.id.get(), None);
    let _ = threads.save(&ctx.cfg.bot_threads_path());

    Ok(())
}

fn thread_title(bus_message_id: &MessageId) -> String {
    format!("Conversation {}", &bus_message_id.0[..bus_message_id.0.len().min(8)])
}

fn streaming_display(text: &str, cancelable: bool, _message_id: &MessageId) -> String {
    let _ = cancelable;
    if text.chars().count() > DISCORD_HARD_LIMIT {
        let truncated: String = text.chars().take(STREAM_DISPLAY_LIMIT).collect();
        format!("{truncated}{STREAMING_MARKER}")
    } else {
        text.to_string()
    }
}

/// Build the cancel button attached to a fresh streaming message.
fn cancel_row(message_id: &MessageId) -> CreateActionRow {
    CreateActionRow::Buttons(vec![CreateButton::new(format!("cancel:{}", message_id.0))
        .label("Cancel")
        .style(ButtonStyle::Danger)])
}

/// Refresh the typing indicator every `typing_refresh_interval` for pending
/// messages that haven't started streaming yet.
pub async fn run_typing(ctx: OutgoingContext) {
    let mut tick = tokio::time::interval(ctx.cfg.typing_refresh_interval);
    loop {
        tick.tick().await;
        let pending = ctx.pending.lock().await;
        for (_, entry) in pending.iter() {
            if entry.streaming_message_id.is_some() {
                continue;
            }
            let channel_id = match entry.thread_id {
                Some(id) => ChannelId::new(id),
                None => ChannelId::new(entry.channel_id),
            };
            let _ = channel_id.broadcast_typing(&ctx.http).await;
        }
    }
}

/// Drop pending entries older than the configured TTL. Run on the same
/// cadence as the typing refresh; cheap enough not to warrant its own timer.
pub async fn run_pending_cleanup(ctx: OutgoingContext) {
    let mut tick = tokio::time::interval(Duration::from_secs(3600));
    loop {
        tick.tick().await;
        let mut pending = ctx.pending.lock().await;
        let removed = pending.prune_expired(ctx.cfg.pending_message_ttl);
        if removed > 0 {
            let _ = pending.save(&ctx.cfg.pending_messages_path());
            tracing_info(&format!("pruned {removed} expired pending message(s)"));
        }
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
    fn streaming_display_truncates_over_hard_limit() {
        let long = "a".repeat(2500);
        let display = streaming_display(&long, true, &MessageId("m1".to_string()));
        assert!(display.ends_with(STREAMING_MARKER));
        assert_eq!(
            display.chars().count(),
            STREAM_DISPLAY_LIMIT + STREAMING_MARKER.chars().count()
        );
    }

    #[test]
    fn streaming_display_passes_short_text_through() {
        assert_eq!(streaming_display("hi", false, &MessageId("m1".to_string())), "hi");
    }

    #[test]
    fn cancel_row_embeds_message_id_in_custom_id() {
        let row = cancel_row(&MessageId("abc123".to_string()));
        match row {
            CreateActionRow::Buttons(buttons) => assert_eq!(buttons.len(), 1),
            _ => panic!("expected a button row"),
        }
    }

    #[test]
    fn thread_title_truncates_long_message_ids() {
        assert_eq!(thread_title(&MessageId("1234567890123".to_string())), "Conversation 12345678");
        assert_eq!(thread_title(&MessageId("abc".to_string())), "Conversation abc");
    }
}
