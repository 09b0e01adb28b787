//! JSON-file pack repository.
//!
//! All records live in memory; when a file is configured the whole table is
//! rewritten after every mutation. Good enough for a single bot process.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    errors::Error,
    ports::{NewPack, PackRecord, PackRepository},
    Result,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreFileData {
    next_id: i64,
    packs: Vec<PackRecord>,
}

pub struct JsonPackStore {
    path: Option<PathBuf>,
    data: Mutex<StoreFileData>,
}

impl JsonPackStore {
    /// Memory-only store.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(StoreFileData::default()),
        }
    }

    /// Open (or start) the store backed by `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = load_store_file(&path)?.unwrap_or_default();
        debug!(path = %path.display(), packs = data.packs.len(), "loaded pack store");
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    pub async fn len(&self) -> usize {
        self.data.lock().await.packs.len()
    }

    async fn persist(&self, data: &StoreFileData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let txt = serde_json::to_string_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, txt).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn load_store_file(path: &Path) -> Result<Option<StoreFileData>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = std::fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&txt)?))
}

#[async_trait]
impl PackRepository for JsonPackStore {
    async fn find_by_link(&self, link: &str) -> Result<Option<PackRecord>> {
        let data = self.data.lock().await;
        Ok(data
            .packs
            .iter()
            .find(|p| p.link.eq_ignore_ascii_case(link))
            .cloned())
    }

    async fn create(&self, pack: NewPack) -> Result<PackRecord> {
        let mut data = self.data.lock().await;
        if data
            .packs
            .iter()
            .any(|p| p.link.eq_ignore_ascii_case(&pack.link))
        {
            return Err(Error::External(format!("pack {} already exists", pack.link)));
        }

        data.next_id += 1;
        let record = PackRecord {
            id: data.next_id,
            bot_id: pack.bot_id,
            owner: pack.owner,
            title: pack.title,
            link: pack.link,
            command_text: pack.command_text,
            item_count: 0,
            created_at: Utc::now(),
        };
        data.packs.push(record.clone());
        self.persist(&data).await?;
        Ok(record)
    }

    async fn update_item_count(&self, id: i64, count: usize) -> Result<()> {
        let mut data = self.data.lock().await;
        let record = data
            .packs
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::NotFound(format!("pack record {id}")))?;
        record.item_count = count;
        self.persist(&data).await
    }
}
