//! Source media selection and download.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cancel::abortable,
    errors::PipelineError,
    ports::{ContentHost, FileRef},
    request::{MediaAttachment, SourceMessage, StickerKind},
};

/// MIME types accepted for documents, with the extension used on disk.
const ALLOWED_MIME_TYPES: &[(&str, &str)] = &[
    ("video/mp4", "mp4"),
    ("video/webm", "webm"),
    ("video/quicktime", "mov"),
    ("image/gif", "gif"),
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/webp", "webp"),
];

pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    ALLOWED_MIME_TYPES
        .iter()
        .find(|(m, _)| *m == essence)
        .map(|(_, ext)| *ext)
}

/// The one media source a request will use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedMedia {
    pub file: FileRef,
    pub extension: &'static str,
    /// Short label for logs.
    pub kind: &'static str,
}

/// Pick the media of `msg`, falling back to the message it replies to.
///
/// The first of the two that carries any media decides; an unsupported
/// attachment there is an error rather than a reason to look further.
pub fn select_media(msg: &SourceMessage) -> Result<SelectedMedia, PipelineError> {
    let media = msg
        .media
        .as_ref()
        .or_else(|| msg.reply_to.as_ref().and_then(|r| r.media.as_ref()))
        .ok_or(PipelineError::NoMediaProvided)?;
    classify(media)
}

fn classify(media: &MediaAttachment) -> Result<SelectedMedia, PipelineError> {
    match media {
        MediaAttachment::Video { file, mime_type } => Ok(SelectedMedia {
            file: file.clone(),
            extension: mime_type
                .as_deref()
                .and_then(extension_for_mime)
                .unwrap_or("mp4"),
            kind: "video",
        }),
        MediaAttachment::Animation { file, mime_type } => Ok(SelectedMedia {
            file: file.clone(),
            extension: mime_type
                .as_deref()
                .and_then(extension_for_mime)
                .unwrap_or("mp4"),
            kind: "animation",
        }),
        MediaAttachment::Photo { sizes } => {
            let best = sizes
                .iter()
                .max_by_key(|p| u64::from(p.width) * u64::from(p.height))
                .ok_or(PipelineError::NoMediaProvided)?;
            Ok(SelectedMedia {
                file: best.file.clone(),
                extension: "jpg",
                kind: "photo",
            })
        }
        MediaAttachment::Document {
            file, mime_type, ..
        } => {
            let mime = mime_type.as_deref().unwrap_or("");
            let extension = extension_for_mime(mime).ok_or_else(|| {
                PipelineError::UnsupportedMediaType(if mime.is_empty() {
                    "document without type".to_string()
                } else {
                    mime.to_string()
                })
            })?;
            Ok(SelectedMedia {
                file: file.clone(),
                extension,
                kind: "document",
            })
        }
        MediaAttachment::Sticker { file, kind } => {
            let extension = match kind {
                StickerKind::Static => "webp",
                StickerKind::Video => "webm",
                StickerKind::Animated => {
                    return Err(PipelineError::UnsupportedMediaType(
                        "animated sticker".to_string(),
                    ))
                }
            };
            Ok(SelectedMedia {
                file: file.clone(),
                extension,
                kind: "sticker",
            })
        }
    }
}

/// Downloads the selected media of a message into a working directory.
pub struct MediaAcquirer {
    host: Arc<dyn ContentHost>,
    max_download_bytes: u64,
}

impl MediaAcquirer {
    pub fn new(host: Arc<dyn ContentHost>, max_download_bytes: u64) -> Self {
        Self {
            host,
            max_download_bytes,
        }
    }

    pub async fn acquire(
        &self,
        msg: &SourceMessage,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        let selected = select_media(msg)?;
        self.check_size(selected.file.size)?;

        let remote = abortable(cancel, self.host.fetch(&selected.file))
            .await?
            .map_err(|e| PipelineError::DownloadFailed(e.to_string()))?;
        self.check_size(remote.size)?;

        let dest = work_dir.join(format!("source.{}", selected.extension));
        abortable(cancel, self.host.download(&remote, &dest))
            .await?
            .map_err(|e| PipelineError::DownloadFailed(e.to_string()))?;

        debug!(
            kind = selected.kind,
            path = %dest.display(),
            "downloaded source media"
        );
        Ok(dest)
    }

    fn check_size(&self, size: Option<u64>) -> Result<(), PipelineError> {
        match size {
            Some(n) if n > self.max_download_bytes => Err(PipelineError::DownloadFailed(
                format!("file is {n} bytes, limit is {}", self.max_download_bytes),
            )),
            _ => Ok(()),
        }
    }
}
