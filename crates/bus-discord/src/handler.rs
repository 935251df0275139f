//! Inbound side of the adapter: filter Discord events down to messages the
//! bus should see, download attachments, and enqueue. Also drains cancel
//! button presses into `cancel/` signal files.

use std::sync::Arc;

use chrono::Utc;
use serenity::all::{
    ComponentInteractionDataKind, Context, CreateInteractionResponse,
    CreateInteractionResponseMessage, EventHandler, Interaction, Message, Ready,
};
use tokio::sync::Mutex;

use bus_core::{
    config::Config,
    domain::{AgentId, MessageId, SessionKey, UserId},
    queue::{IncomingMessage, Queue},
    security::{is_authorized, RateLimiter},
    utils::{AuditEvent, AuditLogger},
};

use crate::approvals;
use crate::state::{BotThreads, PendingEntry, PendingMessages};

pub struct Handler {
    pub cfg: Arc<Config>,
    pub queue: Queue,
    pub bot_threads: Arc<Mutex<BotThreads>>,
    pub pending: Arc<Mutex<PendingMessages>>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
    pub audit: Arc<AuditLogger>,
}

/// `custom_id` prefix for the streaming-cancel button, followed by the bus
/// message id it cancels.
const CANCEL_PREFIX: &str = "cancel:";

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing_info(&format!("connected to discord as {}", ready.user.name));
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        if !self.should_handle(&ctx, &msg).await {
            return;
        }

        let user_id = UserId(msg.author.id.get());
        let authorized = is_authorized(Some(user_id), &self.cfg.allowed_user_ids);
        let _ = self.audit.write(AuditEvent::auth(
            user_id.0,
            &msg.author.name,
            authorized,
        ));
        if !authorized {
            return;
        }

        if self.cfg.rate_limit_enabled {
            let (allowed, retry_after) = self.rate_limiter.lock().await.check(user_id);
            if !allowed {
                let wait = retry_after.unwrap_or_default().as_secs_f64();
                let _ = self
                    .audit
                    .write(AuditEvent::rate_limit(user_id.0, &msg.author.name, wait));
                let _ = msg
                    .channel_id
                    .say(&ctx.http, "Slow down a bit — try again shortly.")
                    .await;
                return;
            }
        }

        let files_dir = self.cfg.files_dir();
        let mut files = Vec::new();
        for attachment in &msg.attachments {
            match crate::attachments::download(&ctx.http, &files_dir, attachment).await {
                Ok(path) => files.push(path.to_string_lossy().to_string()),
                Err(e) => tracing_info(&format!("attachment download failed: {e}")),
            }
        }

        let thread_id = in_owned_thread(&self.bot_threads, msg.channel_id.get()).await;
        let is_dm = msg.guild_id.is_none();

        let (session_key, needs_thread, agent) = if let Some(thread_id) = thread_id {
            let prefix = self
                .bot_threads
                .lock()
                .await
                .default_agent(thread_id)
                .map(AgentId);
            (SessionKey(thread_id.to_string()), false, prefix)
        } else if is_dm {
            (SessionKey::dm(&msg.author.id.to_string()), false, None)
        } else {
            // A fresh channel message: the bus message id stands in for the
            // session key until the adapter creates a thread and remaps it.
            (SessionKey(msg.id.to_string()), true, None)
        };

        let bus_message_id = MessageId(msg.id.to_string());
        let incoming = IncomingMessage {
            channel: "discord".to_string(),
            sender: msg.author.name.clone(),
            sender_id: Some(msg.author.id.to_string()),
            message: msg.content.clone(),
            timestamp: bus_core::utils::iso_timestamp_utc(),
            message_id: bus_message_id.clone(),
            agent,
            files,
            session_key: Some(session_key),
            retry_count: 0,
        };

        let _ = self.audit.write(AuditEvent::message(
            user_id.0,
            &msg.author.name,
            "text",
            &msg.content,
            None,
        ));

        if let Err(e) = self.queue.enqueue_incoming(&incoming).await {
            tracing_info(&format!("failed to enqueue incoming message: {e}"));
            return;
        }

        let mut pending = self.pending.lock().await;
        pending.insert(
            bus_message_id.0.clone(),
            PendingEntry {
                channel_id: msg.channel_id.get(),
                original_message_id: msg.id.get(),
                thread_id,
                needs_thread,
                streaming_message_id: None,
                created_at: Utc::now(),
            },
        );
        let _ = pending.save(&self.cfg.pending_messages_path());
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Some(component) = interaction.as_message_component() else {
            return;
        };
        if !matches!(component.data.kind, ComponentInteractionDataKind::Button) {
            return;
        }

        if let Some(raw_id) = component.data.custom_id.strip_prefix(CANCEL_PREFIX) {
            let message_id = MessageId(raw_id.to_string());
            let _ = self.queue.publish_cancel(&message_id).await;

            let _ = component
                .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
                .await;
            return;
        }

        if let Some((decision, request_id)) = approvals::parse_custom_id(&component.data.custom_id) {
            let path = self
                .cfg
                .approvals_decisions_dir()
                .join(format!("{request_id}.json"));
            if let Ok(bytes) = serde_json::to_vec_pretty(&decision) {
                let _ = tokio::fs::write(&path, bytes).await;
            }

            let label = approvals::decision_label(&decision.decision);
            let original = component.message.content.clone();
            let _ = component
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::UpdateMessage(
                        CreateInteractionResponseMessage::new()
                            .content(format!("{original}\n\n*{label}*"))
                            .components(vec![]),
                    ),
                )
                .await;
        }
    }
}

async fn in_owned_thread(bot_threads: &Mutex<BotThreads>, channel_id: u64) -> Option<u64> {
    let threads = bot_threads.lock().await;
    threads.owns(channel_id).then_some(channel_id)
}

impl Handler {
    /// A message is handled when it's a DM, arrives in a thread the bot
    /// already owns, or explicitly @-mentions the bot in a guild channel.
    async fn should_handle(&self, ctx: &Context, msg: &Message) -> bool {
        if msg.guild_id.is_none() {
            return true;
        }
        if in_owned_thread(&self.bot_threads, msg.channel_id.get())
            .await
            .is_some()
        {
            return true;
        }
        let Ok(me) = ctx.http.get_current_user().await else {
            return false;
        };
        msg.mentions_user_id(me.id)
    }
}

fn tracing_info(msg: &str) {
    #[cfg(feature = "tracing")]
    tracing::info!("{msg}");
    #[cfg(not(feature = "tracing"))]
    let _ = msg;
}
