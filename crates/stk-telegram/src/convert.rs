//! teloxide `Message` → platform-neutral [`SourceMessage`].

use teloxide::types::Message;

use stk_core::{
    domain::{ChatId, MessageId, ThreadId, UserId},
    ports::FileRef,
    request::{MediaAttachment, PhotoSize, SourceMessage, StickerKind},
};

fn file_ref(meta: &teloxide::types::FileMeta) -> FileRef {
    FileRef {
        file_id: meta.id.clone(),
        size: Some(u64::from(meta.size)).filter(|s| *s > 0),
    }
}

/// Media carried by `msg` itself, in selection precedence order.
pub fn attachment(msg: &Message) -> Option<MediaAttachment> {
    if let Some(v) = msg.video() {
        return Some(MediaAttachment::Video {
            file: file_ref(&v.file),
            mime_type: v.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(a) = msg.animation() {
        return Some(MediaAttachment::Animation {
            file: file_ref(&a.file),
            mime_type: a.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(sizes) = msg.photo() {
        return Some(MediaAttachment::Photo {
            sizes: sizes
                .iter()
                .map(|p| PhotoSize {
                    file: file_ref(&p.file),
                    width: p.width,
                    height: p.height,
                })
                .collect(),
        });
    }
    if let Some(d) = msg.document() {
        return Some(MediaAttachment::Document {
            file: file_ref(&d.file),
            file_name: d.file_name.clone(),
            mime_type: d.mime_type.as_ref().map(|m| m.to_string()),
        });
    }
    if let Some(s) = msg.sticker() {
        let kind = if s.is_video() {
            StickerKind::Video
        } else if s.is_animated() {
            StickerKind::Animated
        } else {
            StickerKind::Static
        };
        return Some(MediaAttachment::Sticker {
            file: file_ref(&s.file),
            kind,
        });
    }
    None
}

fn convert(msg: &Message) -> SourceMessage {
    let from = msg.from.as_ref();
    SourceMessage {
        chat_id: ChatId(msg.chat.id.0),
        thread_id: msg
            .thread_id
            .filter(|_| msg.is_topic_message)
            .map(|t| ThreadId(t.0 .0)),
        message_id: MessageId(msg.id.0),
        user_id: UserId(from.map(|u| u.id.0 as i64).unwrap_or(0)),
        username: from.and_then(|u| u.username.clone()),
        text: msg.text().map(str::to_string),
        caption: msg.caption().map(str::to_string),
        media: attachment(msg),
        reply_to: None,
    }
}

/// Convert an inbound message, including the message it replies to.
pub fn source_message(msg: &Message) -> SourceMessage {
    let mut out = convert(msg);
    out.reply_to = msg
        .reply_to_message()
        .map(|reply| Box::new(convert(reply)));
    out
}
