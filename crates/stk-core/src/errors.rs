use crate::formatting::escape_html;

/// Core error type for collaborator calls.
///
/// Adapter crates map their specific errors into this type. The pipeline then
/// classifies it into a [`PipelineError`] depending on which stage failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classified failure of one generation request.
///
/// Every variant maps to at most one user-facing message, see
/// [`PipelineError::user_message`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid command arguments: {0}")]
    ArgsInvalid(String),

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("no media provided")]
    NoMediaProvided,

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("pack not found: {0}")]
    PackNotFound(String),

    #[error("transformer produced no output")]
    EmptyOutputSequence,

    #[error("pack item limit exceeded: {observed} > {limit}")]
    ItemCountLimitExceeded { observed: usize, limit: usize },

    #[error("failed to open produced file: {0}")]
    FileOpenFailed(String),

    #[error("failed to publish item: {0}")]
    ItemPublishFailed(String),

    #[error("failed to publish placeholder item: {0}")]
    PlaceholderPublishFailed(String),

    #[error("failed to create pack: {0}")]
    ContainerCreateFailed(String),

    #[error("failed to add items to pack: {0}")]
    ContainerAppendFailed(String),

    #[error("failed to read pack state: {0}")]
    ContainerReadFailed(String),

    #[error("transport error: {message}")]
    UnclassifiedTransportError { message: String },

    #[error("aborted")]
    Aborted,
}

impl PipelineError {
    pub fn unclassified(message: impl ToString) -> Self {
        Self::UnclassifiedTransportError {
            message: message.to_string(),
        }
    }

    /// Short stable tag for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ArgsInvalid(_) => "args_invalid",
            Self::QuotaExceeded => "quota_exceeded",
            Self::NoMediaProvided => "no_media_provided",
            Self::UnsupportedMediaType(_) => "unsupported_media_type",
            Self::DownloadFailed(_) => "download_failed",
            Self::PackNotFound(_) => "pack_not_found",
            Self::EmptyOutputSequence => "empty_output_sequence",
            Self::ItemCountLimitExceeded { .. } => "item_count_limit_exceeded",
            Self::FileOpenFailed(_) => "file_open_failed",
            Self::ItemPublishFailed(_) => "item_publish_failed",
            Self::PlaceholderPublishFailed(_) => "placeholder_publish_failed",
            Self::ContainerCreateFailed(_) => "container_create_failed",
            Self::ContainerAppendFailed(_) => "container_append_failed",
            Self::ContainerReadFailed(_) => "container_read_failed",
            Self::UnclassifiedTransportError { .. } => "unclassified_transport_error",
            Self::Aborted => "aborted",
        }
    }

    /// Text shown to the user, or `None` for failures that stay silent.
    ///
    /// `NoMediaProvided` is silent because a message without media is usually
    /// unrelated chatter; `Aborted` is silent because the request was withdrawn.
    pub fn user_message(&self) -> Option<String> {
        let text = match self {
            Self::NoMediaProvided | Self::Aborted => return None,
            Self::ArgsInvalid(reason) => {
                format!(
                    "❌ Invalid arguments: {}\nUsage: /emoji [pack link] [w=width] [title]",
                    escape_html(reason)
                )
            }
            Self::QuotaExceeded => {
                "⏳ You have reached your generation limit. Please try again later.".to_string()
            }
            Self::UnsupportedMediaType(kind) => {
                format!(
                    "❌ This media type is not supported ({}). Send a video, GIF, photo or image.",
                    escape_html(kind)
                )
            }
            Self::DownloadFailed(_) => {
                "❌ Failed to download the media. Please try again.".to_string()
            }
            Self::PackNotFound(link) => {
                format!("❌ Pack <code>{}</code> was not found.", escape_html(link))
            }
            Self::EmptyOutputSequence => {
                "❌ Nothing could be generated from this media.".to_string()
            }
            Self::ItemCountLimitExceeded { observed, limit } => format!(
                "❌ The pack would contain {observed} items, the limit is {limit}. Use a smaller width or a new pack."
            ),
            Self::FileOpenFailed(_) => {
                "❌ Failed to read a generated file. Please try again.".to_string()
            }
            Self::ItemPublishFailed(_) => "❌ Failed to upload an item.".to_string(),
            Self::PlaceholderPublishFailed(_) => {
                "❌ Failed to upload the transparent placeholder item.".to_string()
            }
            Self::ContainerCreateFailed(_) => "❌ Failed to create the pack.".to_string(),
            Self::ContainerAppendFailed(_) => "❌ Failed to add items to the pack.".to_string(),
            Self::ContainerReadFailed(_) => "❌ Failed to read the pack state.".to_string(),
            Self::UnclassifiedTransportError { message } => format!(
                "❌ Error: {}",
                escape_html(&message.chars().take(200).collect::<String>())
            ),
        };
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_failures_have_no_user_message() {
        assert!(PipelineError::NoMediaProvided.user_message().is_none());
        assert!(PipelineError::Aborted.user_message().is_none());
        assert!(PipelineError::QuotaExceeded.user_message().is_some());
    }

    #[test]
    fn limit_message_carries_both_numbers() {
        let msg = PipelineError::ItemCountLimitExceeded {
            observed: 201,
            limit: 200,
        }
        .user_message()
        .unwrap();
        assert!(msg.contains("201"));
        assert!(msg.contains("200"));
    }

    #[test]
    fn user_supplied_text_is_escaped() {
        let args = PipelineError::ArgsInvalid("unknown option `a<b`".to_string())
            .user_message()
            .unwrap();
        assert!(args.contains("`a&lt;b`"));

        let missing = PipelineError::PackNotFound("<i>x_by_stkbot".to_string())
            .user_message()
            .unwrap();
        assert_eq!(missing, "❌ Pack <code>&lt;i&gt;x_by_stkbot</code> was not found.");

        let transport = PipelineError::unclassified("ffmpeg: <stdin> & friends")
            .user_message()
            .unwrap();
        assert!(transport.contains("&lt;stdin&gt; &amp; friends"));
    }

    #[test]
    fn unclassified_message_is_truncated() {
        let msg = PipelineError::unclassified("x".repeat(1000))
            .user_message()
            .unwrap();
        assert!(msg.len() < 300);
    }
}
