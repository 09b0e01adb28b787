use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tracing::{info, warn};

use stk_core::{
    config::Config,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    pipeline::{Pipeline, PipelinePorts},
    ports::{MediaTransformer, PackRepository},
    registry::RequestRegistry,
    security::RateLimitQuota,
    store::JsonPackStore,
};

use crate::{handlers, TelegramContentHost, TelegramMessenger, TelegramPackPublisher};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
    pub registry: Arc<RequestRegistry>,
    pub messenger: Arc<dyn MessagingPort>,
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn PackRepository>> {
    let store = match &cfg.pack_store_file {
        Some(path) => JsonPackStore::open(path)?,
        None => {
            warn!("PACK_STORE_FILE not set; pack records are kept in memory only");
            JsonPackStore::in_memory()
        }
    };
    info!(packs = store.len().await, "pack store ready");
    Ok(Arc::new(store))
}

pub async fn run_polling(
    cfg: Arc<Config>,
    transformer: Arc<dyn MediaTransformer>,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => {
            let handle = me.username();
            if !handle.eq_ignore_ascii_case(&cfg.bot_username) {
                warn!(
                    configured = %cfg.bot_username,
                    actual = %handle,
                    "BOT_USERNAME does not match the bot account; new pack links will be rejected"
                );
            }
            info!(bot = %handle, kind = ?cfg.pack_kind, "stk started");
        }
        Err(e) => warn!(error = %e, "get_me failed"),
    }
    info!(
        work_dir = %cfg.work_dir.display(),
        allowed_chats = cfg.allowed_chats.len(),
        "configuration loaded"
    );
    tokio::fs::create_dir_all(&cfg.work_dir).await?;

    // Progress edits are the chattiest traffic; the throttle keeps them under
    // Telegram's per-chat limits. RetryAfter is still retried in the adapter.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let pipeline = Arc::new(Pipeline::new(
        cfg.clone(),
        PipelinePorts {
            messenger: messenger.clone(),
            quota: Arc::new(RateLimitQuota::from_config(&cfg)),
            content_host: Arc::new(TelegramContentHost::new(bot.clone())),
            repository: open_store(&cfg).await?,
            transformer,
            publisher: Arc::new(TelegramPackPublisher::new(bot.clone(), cfg.pack_kind)),
        },
    ));
    let registry = Arc::new(RequestRegistry::new());

    let state = Arc::new(AppState {
        cfg,
        pipeline,
        registry: registry.clone(),
        messenger,
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("dispatcher stopped, cancelling running requests");
    registry.cancel_all();
    Ok(())
}
