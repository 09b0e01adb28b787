use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{debug, info, warn};

use stk_core::{config::PackKind, formatting::escape_html};

use crate::{convert::source_message, router::AppState};

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn usage(kind: PackKind, bot_username: &str, default_width: u32, max_width: u32) -> String {
    let noun = match kind {
        PackKind::CustomEmoji => "emoji",
        PackKind::Sticker => "sticker",
    };
    format!(
        "<b>Pack generator</b>\n\n\
         Send a video, GIF, photo or sticker with the caption <code>/emoji</code>, \
         or reply to one with it. The media is cut into a grid of {noun} tiles and \
         published as a {noun} pack.\n\n\
         <code>/emoji [link] [w=N] [title]</code>\n\
         • <code>link</code>: a pack made by @{bot} to add to; omit to create a new one\n\
         • <code>w=N</code>: grid width in tiles (default {default_width}, max {max_width})\n\
         • <code>title</code>: title for a new pack\n\n\
         /stop cancels your running requests in this chat.",
        bot = escape_html(bot_username),
    )
}

pub async fn handle_command(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text().or(msg.caption()) else {
        return Ok(());
    };
    let (cmd, _rest) = parse_command(text);
    let src = source_message(&msg);

    match cmd.as_str() {
        "start" | "help" => {
            let cfg = &state.cfg;
            let html = usage(
                cfg.pack_kind,
                &cfg.bot_username,
                cfg.default_width,
                cfg.max_width,
            );
            if let Err(e) = state.messenger.send(src.reply_destination(), &html).await {
                warn!(chat_id = src.chat_id.0, error = %e, "failed to send usage");
            }
        }
        "emoji" => {
            let registration = state.registry.register(src.chat_id, src.user_id);
            let pipeline = state.pipeline.clone();
            info!(
                chat_id = src.chat_id.0,
                user_id = src.user_id.0,
                "generation requested"
            );
            tokio::spawn(async move {
                let cancel = registration.token().clone();
                pipeline.handle(src, cancel).await;
                drop(registration);
            });
        }
        "stop" => {
            let cancelled = state.registry.cancel(src.chat_id, src.user_id);
            info!(
                chat_id = src.chat_id.0,
                user_id = src.user_id.0,
                cancelled,
                "stop requested"
            );
            let html = stop_reply(cancelled);
            if let Err(e) = state.messenger.send(src.reply_destination(), html).await {
                warn!(chat_id = src.chat_id.0, error = %e, "failed to send stop reply");
            }
        }
        other => {
            debug!(command = other, "ignoring unknown command");
        }
    }

    Ok(())
}

fn stop_reply(cancelled: usize) -> &'static str {
    match cancelled {
        0 => "Nothing to stop.",
        1 => "🛑 Stopping your request.",
        _ => "🛑 Stopping your requests.",
    }
}
