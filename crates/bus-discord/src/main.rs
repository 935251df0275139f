use std::sync::Arc;

use serenity::all::{Client, GatewayIntents};
use tokio::sync::Mutex;

use bus_core::{
    config::Config,
    queue::Queue,
    security::RateLimiter,
    session_store::SessionStore,
    utils::AuditLogger,
};

mod approvals;
mod attachments;
mod handler;
mod outgoing;
mod state;

use approvals::ApprovalContext;
use handler::Handler;
use outgoing::OutgoingContext;
use state::{BotThreads, PendingMessages};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bus_core::logging::init("bus-discord")?;

    let cfg = Arc::new(Config::load()?);
    let queue = Queue::from_config(&cfg);
    let session_store = SessionStore::new(cfg.session_store_path());

    let bot_threads = Arc::new(Mutex::new(BotThreads::load(&cfg.bot_threads_path())));
    let pending = Arc::new(Mutex::new(PendingMessages::load(&cfg.pending_messages_path())));
    let rate_limiter = Arc::new(Mutex::new(RateLimiter::new(
        cfg.rate_limit_enabled,
        cfg.rate_limit_requests,
        cfg.rate_limit_window,
    )));
    let audit = Arc::new(AuditLogger::new(cfg.audit_log_path.clone(), cfg.audit_log_json));

    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILDS;

    let handler = Handler {
        cfg: cfg.clone(),
        queue: queue.clone(),
        bot_threads: bot_threads.clone(),
        pending: pending.clone(),
        rate_limiter,
        audit,
    };

    let mut client = Client::builder(&cfg.discord_bot_token, intents)
        .event_handler(handler)
        .await?;

    let http = client.http.clone();
    let outgoing_ctx = OutgoingContext {
        http: http.clone(),
        cfg: cfg.clone(),
        queue: queue.clone(),
        session_store: session_store.clone(),
        bot_threads: bot_threads.clone(),
        pending: pending.clone(),
    };
    let typing_ctx = OutgoingContext {
        http: http.clone(),
        cfg: cfg.clone(),
        queue: queue.clone(),
        session_store: session_store.clone(),
        bot_threads: bot_threads.clone(),
        pending: pending.clone(),
    };
    let cleanup_ctx = OutgoingContext {
        http: http.clone(),
        cfg: cfg.clone(),
        queue,
        session_store,
        bot_threads,
        pending: pending.clone(),
    };
    let approval_ctx = ApprovalContext {
        http,
        cfg,
        pending,
    };

    tokio::spawn(outgoing::run(outgoing_ctx));
    tokio::spawn(outgoing::run_typing(typing_ctx));
    tokio::spawn(outgoing::run_pending_cleanup(cleanup_ctx));
    tokio::spawn(approvals::run(approval_ctx));

    client.start().await?;
    Ok(())
}
