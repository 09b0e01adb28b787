/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// Forum topic id inside a supergroup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Where an outgoing message goes: chat, optional topic, optional reply target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Destination {
    pub chat_id: ChatId,
    pub thread_id: Option<ThreadId>,
    pub reply_to: Option<MessageId>,
}

impl Destination {
    pub fn chat(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            thread_id: None,
            reply_to: None,
        }
    }
}
