//! Telegram update handlers.
//!
//! Messages from chats outside the allow-list are dropped without a reply.
//! Anything that is not a `/` command (in the text or in a media caption) is
//! ignored.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};
use tracing::debug;

use crate::router::AppState;

mod commands;

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    if !state.cfg.is_chat_allowed(chat_id) {
        debug!(chat_id, "message from chat outside the allow-list");
        return Ok(());
    }

    let command = msg.text().or(msg.caption()).map(str::trim_start);
    match command {
        Some(text) if text.starts_with('/') => commands::handle_command(msg, state).await,
        _ => Ok(()),
    }
}
