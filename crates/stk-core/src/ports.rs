//! Collaborator contracts consumed by the pipeline.
//!
//! One trait per external capability; implementations are injected as
//! `Arc<dyn Trait>` when the [`crate::pipeline::Pipeline`] is built.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::PackKind,
    domain::{ChatId, UserId},
    Result,
};

// ============== Quota ==============

#[async_trait]
pub trait QuotaChecker: Send + Sync {
    async fn can_proceed(&self, user: UserId, chat: ChatId) -> Result<bool>;
}

// ============== Content host ==============

/// Reference to a file stored on the chat platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRef {
    pub file_id: String,
    /// Declared size in bytes, when the platform reports it.
    pub size: Option<u64>,
}

/// Retrievable location of a file, as returned by [`ContentHost::fetch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub size: Option<u64>,
}

#[async_trait]
pub trait ContentHost: Send + Sync {
    async fn fetch(&self, file: &FileRef) -> Result<RemoteFile>;
    async fn download(&self, remote: &RemoteFile, dest: &Path) -> Result<()>;
}

// ============== Pack persistence ==============

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackRecord {
    pub id: i64,
    pub bot_id: i64,
    pub owner: UserId,
    pub title: String,
    pub link: String,
    pub command_text: String,
    pub item_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Fields of a pack record before the repository assigns an id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPack {
    pub bot_id: i64,
    pub owner: UserId,
    pub title: String,
    pub link: String,
    pub command_text: String,
}

#[async_trait]
pub trait PackRepository: Send + Sync {
    /// `Ok(None)` when no record has this link.
    async fn find_by_link(&self, link: &str) -> Result<Option<PackRecord>>;
    async fn create(&self, pack: NewPack) -> Result<PackRecord>;
    async fn update_item_count(&self, id: i64, count: usize) -> Result<()>;
}

// ============== Transformer ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemFormat {
    /// WEBP/PNG image.
    Static,
    /// TGS (Lottie).
    Animated,
    /// VP9 WEBM.
    Video,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemRole {
    Content,
    /// Fully transparent tile, published with the placeholder emoji.
    Placeholder,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducedItem {
    pub path: PathBuf,
    pub format: ItemFormat,
    pub role: ItemRole,
}

/// Output layout requested by the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Number of tiles per row.
    pub width: u32,
}

/// Turns one source media file into an ordered list of pack items.
#[async_trait]
pub trait MediaTransformer: Send + Sync {
    /// Number of items `produce` will yield for this source and layout,
    /// without rendering anything.
    async fn plan(&self, source: &Path, layout: Layout) -> Result<usize>;

    async fn produce(
        &self,
        source: &Path,
        out_dir: &Path,
        layout: Layout,
    ) -> Result<Vec<ProducedItem>>;
}

// ============== Pack publishing backend ==============

/// File bytes handed to [`PackPublisher::upload_item`].
#[derive(Clone, Debug)]
pub struct ItemUpload {
    pub file_name: String,
    pub data: Vec<u8>,
    pub format: ItemFormat,
    pub role: ItemRole,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedItem {
    pub file_id: String,
}

/// An uploaded file plus the metadata the pack needs for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputItem {
    pub file_id: String,
    pub format: ItemFormat,
    pub emoji: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSpec {
    pub owner: UserId,
    pub link: String,
    pub title: String,
    pub kind: PackKind,
    pub items: Vec<InputItem>,
}

/// Item of a remote pack, addressed by a stable reference
/// (custom emoji id for emoji packs, file id for sticker packs).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedItem {
    pub reference: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub link: String,
    pub title: String,
    pub items: Vec<PublishedItem>,
}

#[async_trait]
pub trait PackPublisher: Send + Sync {
    async fn upload_item(&self, owner: UserId, item: &ItemUpload) -> Result<UploadedItem>;
    async fn create_container(&self, spec: ContainerSpec) -> Result<()>;
    async fn append_items(&self, owner: UserId, link: &str, items: Vec<InputItem>) -> Result<()>;
    /// `Ok(None)` when the container does not exist remotely yet.
    async fn get_container(&self, link: &str) -> Result<Option<Container>>;
}
