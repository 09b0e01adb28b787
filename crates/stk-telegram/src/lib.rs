//! Telegram adapter (teloxide).
//!
//! Implements the `stk-core` messaging, content-host and pack-publisher ports
//! over the Telegram Bot API, plus the update dispatcher.

use std::future::IntoFuture;

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{ParseMode, ReplyParameters},
    RequestError,
};
use tokio::time::sleep;
use tracing::debug;

pub mod content;
pub mod convert;
pub mod handlers;
pub mod publisher;
pub mod router;

use stk_core::{
    domain::{ChatId, Destination, MessageId, MessageRef, ThreadId, UserId},
    errors::Error,
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    Result,
};

pub use content::TelegramContentHost;
pub use publisher::TelegramPackPublisher;

pub(crate) fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
    teloxide::types::ChatId(chat_id.0)
}

pub(crate) fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
    teloxide::types::MessageId(message_id.0)
}

pub(crate) fn tg_thread(thread_id: ThreadId) -> teloxide::types::ThreadId {
    teloxide::types::ThreadId(teloxide::types::MessageId(thread_id.0))
}

pub(crate) fn tg_user(user: UserId) -> teloxide::types::UserId {
    teloxide::types::UserId(user.0 as u64)
}

pub(crate) fn map_err(e: RequestError) -> Error {
    Error::External(format!("telegram error: {e}"))
}

/// Run a Bot API request, retrying once when Telegram asks us to back off.
pub(crate) async fn with_retry<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: IntoFuture<Output = std::result::Result<T, RequestError>>,
    Fut::IntoFuture: Send,
{
    const MAX_RETRIES: usize = 1;
    let mut attempts = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(RequestError::RetryAfter(wait)) if attempts < MAX_RETRIES => {
                attempts += 1;
                debug!(wait_secs = wait.duration().as_secs(), "telegram rate limit, retrying");
                sleep(wait.duration()).await;
            }
            Err(other) => return Err(map_err(other)),
        }
    }
}

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    async fn send_with(&self, dest: Destination, html: &str, silent: bool) -> Result<MessageRef> {
        let msg = with_retry(|| {
            let mut req = self
                .bot
                .send_message(tg_chat(dest.chat_id), html.to_string())
                .parse_mode(ParseMode::Html)
                .disable_notification(silent);
            if let Some(thread) = dest.thread_id {
                req = req.message_thread_id(tg_thread(thread));
            }
            if let Some(reply_to) = dest.reply_to {
                req = req.reply_parameters(
                    ReplyParameters::new(tg_msg_id(reply_to)).allow_sending_without_reply(),
                );
            }
            req
        })
        .await?;

        Ok(MessageRef {
            chat_id: dest.chat_id,
            message_id: MessageId(msg.id.0),
        })
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_edit: true,
            supports_custom_emoji: true,
            max_message_len: 4096,
        }
    }

    async fn send(&self, dest: Destination, html: &str) -> Result<MessageRef> {
        self.send_with(dest, html, false).await
    }

    async fn send_progress(&self, dest: Destination, html: &str) -> Result<MessageRef> {
        self.send_with(dest, html, true).await
    }

    async fn update_progress(&self, handle: MessageRef, html: &str) -> Result<()> {
        with_retry(|| {
            self.bot
                .edit_message_text(
                    tg_chat(handle.chat_id),
                    tg_msg_id(handle.message_id),
                    html.to_string(),
                )
                .parse_mode(ParseMode::Html)
        })
        .await?;
        Ok(())
    }

    async fn delete_progress(&self, handle: MessageRef) -> Result<()> {
        with_retry(|| {
            self.bot
                .delete_message(tg_chat(handle.chat_id), tg_msg_id(handle.message_id))
        })
        .await?;
        Ok(())
    }
}
