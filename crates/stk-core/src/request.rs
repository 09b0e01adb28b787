//! Inbound message model and `/emoji` command parsing.

use std::path::PathBuf;

use crate::{
    domain::{ChatId, Destination, MessageId, ThreadId, UserId},
    errors::PipelineError,
    ports::FileRef,
};

/// Platform-neutral view of an inbound chat message.
///
/// The Telegram adapter builds this from a teloxide `Message`; `reply_to` is
/// the message this one replies to, if any (one level deep).
#[derive(Clone, Debug, Default)]
pub struct SourceMessage {
    pub chat_id: ChatId,
    pub thread_id: Option<ThreadId>,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub username: Option<String>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media: Option<MediaAttachment>,
    pub reply_to: Option<Box<SourceMessage>>,
}

impl SourceMessage {
    /// Command text: the message text, or the caption of a media message.
    pub fn command_text(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }

    /// Where replies to this message go (same chat and topic).
    pub fn reply_destination(&self) -> Destination {
        Destination {
            chat_id: self.chat_id,
            thread_id: self.thread_id,
            reply_to: Some(self.message_id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StickerKind {
    Static,
    Animated,
    Video,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhotoSize {
    pub file: FileRef,
    pub width: u32,
    pub height: u32,
}

/// Media attached to a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaAttachment {
    Video {
        file: FileRef,
        mime_type: Option<String>,
    },
    /// GIFs, delivered by Telegram as silent MP4.
    Animation {
        file: FileRef,
        mime_type: Option<String>,
    },
    Photo {
        sizes: Vec<PhotoSize>,
    },
    Document {
        file: FileRef,
        file_name: Option<String>,
        mime_type: Option<String>,
    },
    Sticker {
        file: FileRef,
        kind: StickerKind,
    },
}

/// Parsed `/emoji` arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandArgs {
    /// Requested pack link; empty means "create a new pack".
    pub pack_link: String,
    pub width: u32,
    pub title: String,
}

/// Bounds applied while parsing.
#[derive(Clone, Copy, Debug)]
pub struct ArgLimits {
    pub default_width: u32,
    pub max_width: u32,
}

pub const GENERATE_COMMAND: &str = "emoji";

/// Parse `/emoji[@bot] [link] [w=N|width=N] [title...]`.
///
/// A token counts as a link when it mentions `t.me/` or contains `_by_`.
/// Remaining free words form the title.
pub fn parse_command(text: &str, limits: ArgLimits) -> Result<CommandArgs, PipelineError> {
    let mut tokens = text.split_whitespace();
    let head = tokens
        .next()
        .ok_or_else(|| PipelineError::ArgsInvalid("empty command".to_string()))?;

    let name = head
        .strip_prefix('/')
        .map(|s| s.split('@').next().unwrap_or(""))
        .unwrap_or("");
    if !name.eq_ignore_ascii_case(GENERATE_COMMAND) {
        return Err(PipelineError::ArgsInvalid(format!(
            "expected /{GENERATE_COMMAND}, got `{head}`"
        )));
    }

    let mut pack_link = String::new();
    let mut width: Option<u32> = None;
    let mut title_words: Vec<&str> = Vec::new();

    for tok in tokens {
        // Links may carry `?a=b` query strings, so they are checked first.
        if pack_link.is_empty() && looks_like_link(tok) {
            pack_link = tok.to_string();
            continue;
        }

        if let Some((key, value)) = tok.split_once('=') {
            match key.to_ascii_lowercase().as_str() {
                "w" | "width" => {
                    if width.is_some() {
                        return Err(PipelineError::ArgsInvalid(
                            "width given twice".to_string(),
                        ));
                    }
                    let w = value.parse::<u32>().map_err(|_| {
                        PipelineError::ArgsInvalid(format!("width `{value}` is not a number"))
                    })?;
                    if w == 0 || w > limits.max_width {
                        return Err(PipelineError::ArgsInvalid(format!(
                            "width must be between 1 and {}",
                            limits.max_width
                        )));
                    }
                    width = Some(w);
                }
                _ => {
                    return Err(PipelineError::ArgsInvalid(format!(
                        "unknown option `{key}`"
                    )))
                }
            }
            continue;
        }

        title_words.push(tok);
    }

    Ok(CommandArgs {
        pack_link,
        width: width.unwrap_or(limits.default_width),
        title: title_words.join(" "),
    })
}

fn looks_like_link(tok: &str) -> bool {
    let lower = tok.to_ascii_lowercase();
    lower.contains("t.me/") || lower.contains("_by_")
}

/// Immutable input of one pipeline run, assembled once media is on disk.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub chat_id: ChatId,
    pub thread_id: Option<ThreadId>,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub username: Option<String>,
    pub command_text: String,
    pub work_dir: PathBuf,
    pub media_path: PathBuf,
    /// Requested link as typed by the user; empty means "create new".
    pub pack_link: String,
    pub width: u32,
    pub title: String,
}
