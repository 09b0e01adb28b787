//! In-process fakes of every port, shared by the unit tests.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::{
    domain::{ChatId, Destination, MessageId, MessageRef, UserId},
    errors::Error,
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    ports::{
        Container, ContainerSpec, ContentHost, FileRef, InputItem, ItemFormat, ItemRole,
        ItemUpload, Layout, MediaTransformer, NewPack, PackPublisher, PackRecord,
        PackRepository, ProducedItem, PublishedItem, QuotaChecker, RemoteFile, UploadedItem,
    },
    Result,
};

// ============== Messenger ==============

#[derive(Default)]
pub struct FakeMessenger {
    next_id: AtomicUsize,
    pub sends: Mutex<Vec<(Destination, String)>>,
    pub progress: Mutex<Vec<(Destination, String)>>,
    pub updates: Mutex<Vec<(MessageRef, String)>>,
    pub deletes: Mutex<Vec<MessageRef>>,
    /// Every call fails after being recorded.
    pub fail: bool,
}

impl FakeMessenger {
    fn alloc(&self, chat_id: ChatId) -> MessageRef {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i32 + 1;
        MessageRef {
            chat_id,
            message_id: MessageId(id),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn outcome<T>(&self, value: T) -> Result<T> {
        if self.fail {
            return Err(Error::External("chat unavailable".to_string()));
        }
        Ok(value)
    }

    pub fn sent_html(&self) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn progress_html(&self) -> Vec<String> {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .map(|(_, s)| s.clone())
            .collect()
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_edit: true,
            supports_custom_emoji: true,
            max_message_len: 4096,
        }
    }

    async fn send(&self, dest: Destination, html: &str) -> Result<MessageRef> {
        self.sends.lock().unwrap().push((dest, html.to_string()));
        self.outcome(self.alloc(dest.chat_id))
    }

    async fn send_progress(&self, dest: Destination, html: &str) -> Result<MessageRef> {
        self.progress.lock().unwrap().push((dest, html.to_string()));
        self.outcome(self.alloc(dest.chat_id))
    }

    async fn update_progress(&self, handle: MessageRef, html: &str) -> Result<()> {
        self.updates.lock().unwrap().push((handle, html.to_string()));
        self.outcome(())
    }

    async fn delete_progress(&self, handle: MessageRef) -> Result<()> {
        self.deletes.lock().unwrap().push(handle);
        self.outcome(())
    }
}

// ============== Quota ==============

pub struct FakeQuota {
    pub allow: bool,
    /// The quota backend itself is unreachable.
    pub fail: bool,
}

#[async_trait]
impl QuotaChecker for FakeQuota {
    async fn can_proceed(&self, _user: UserId, _chat: ChatId) -> Result<bool> {
        if self.fail {
            return Err(Error::External("quota service timed out".to_string()));
        }
        Ok(self.allow)
    }
}

// ============== Content host ==============

#[derive(Default)]
pub struct FakeContentHost {
    pub fetches: Mutex<Vec<FileRef>>,
    pub downloads: Mutex<Vec<PathBuf>>,
    pub fail_fetch: bool,
    pub fail_download: bool,
}

impl FakeContentHost {
    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }
}

#[async_trait]
impl ContentHost for FakeContentHost {
    async fn fetch(&self, file: &FileRef) -> Result<RemoteFile> {
        self.fetches.lock().unwrap().push(file.clone());
        if self.fail_fetch {
            return Err(Error::External("file is temporarily unavailable".to_string()));
        }
        Ok(RemoteFile {
            path: format!("remote/{}", file.file_id),
            size: file.size,
        })
    }

    async fn download(&self, _remote: &RemoteFile, dest: &Path) -> Result<()> {
        self.downloads.lock().unwrap().push(dest.to_path_buf());
        if self.fail_download {
            return Err(Error::External("connection reset".to_string()));
        }
        tokio::fs::write(dest, b"media").await?;
        Ok(())
    }
}

// ============== Repository ==============

#[derive(Default)]
pub struct FakeRepository {
    pub records: Mutex<Vec<PackRecord>>,
    pub create_calls: AtomicUsize,
    pub fail_update: bool,
}

impl FakeRepository {
    pub fn with_record(link: &str, item_count: usize) -> Self {
        let repo = Self::default();
        repo.records.lock().unwrap().push(PackRecord {
            id: 1,
            bot_id: 1,
            owner: UserId(1),
            title: "Existing".to_string(),
            link: link.to_string(),
            command_text: "/emoji".to_string(),
            item_count,
            created_at: Utc::now(),
        });
        repo
    }

    pub fn item_count(&self, link: &str) -> Option<usize> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.link == link)
            .map(|r| r.item_count)
    }
}

#[async_trait]
impl PackRepository for FakeRepository {
    async fn find_by_link(&self, link: &str) -> Result<Option<PackRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.link == link)
            .cloned())
    }

    async fn create(&self, pack: NewPack) -> Result<PackRecord> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().unwrap();
        let record = PackRecord {
            id: records.len() as i64 + 1,
            bot_id: pack.bot_id,
            owner: pack.owner,
            title: pack.title,
            link: pack.link,
            command_text: pack.command_text,
            item_count: 0,
            created_at: Utc::now(),
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn update_item_count(&self, id: i64, count: usize) -> Result<()> {
        if self.fail_update {
            return Err(Error::External("database is locked".to_string()));
        }
        let mut records = self.records.lock().unwrap();
        let rec = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("pack {id}")))?;
        rec.item_count = count;
        Ok(())
    }
}

// ============== Transformer ==============

pub struct FakeTransformer {
    pub items: usize,
    pub placeholders: usize,
    /// Overrides what `plan` announces; defaults to what `produce` yields.
    pub planned: Option<usize>,
    /// `produce` fails with this message.
    pub fail: Option<&'static str>,
    pub plans: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FakeTransformer {
    pub fn producing(items: usize) -> Self {
        Self {
            items,
            placeholders: 0,
            planned: None,
            fail: None,
            plans: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MediaTransformer for FakeTransformer {
    async fn plan(&self, _source: &Path, _layout: Layout) -> Result<usize> {
        self.plans.fetch_add(1, Ordering::SeqCst);
        Ok(self.planned.unwrap_or(self.items + self.placeholders))
    }

    async fn produce(
        &self,
        _source: &Path,
        out_dir: &Path,
        _layout: Layout,
    ) -> Result<Vec<ProducedItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail {
            return Err(Error::External(message.to_string()));
        }
        let mut out = Vec::new();
        for i in 0..self.items + self.placeholders {
            let path = out_dir.join(format!("tile_{i:03}.webm"));
            tokio::fs::write(&path, format!("tile {i}")).await?;
            let role = if i >= self.items {
                ItemRole::Placeholder
            } else {
                ItemRole::Content
            };
            out.push(ProducedItem {
                path,
                format: ItemFormat::Video,
                role,
            });
        }
        Ok(out)
    }
}

// ============== Publisher ==============

#[derive(Clone, Debug)]
pub struct PublishCall {
    pub owner: UserId,
    pub op: &'static str,
    pub start: Instant,
    pub end: Instant,
}

#[derive(Default)]
pub struct FakePublisher {
    pub containers: Mutex<HashMap<String, Vec<PublishedItem>>>,
    pub calls: Mutex<Vec<PublishCall>>,
    /// Operation name that fails (`upload`, `upload_placeholder`, `create`, `append`, `get`).
    pub fail_on: Mutex<Option<&'static str>>,
    /// Artificial latency per call, to expose interleaving.
    pub delay: Duration,
    uploads: AtomicUsize,
}

impl FakePublisher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn with_container(link: &str, items: usize) -> Self {
        let publisher = Self::default();
        let existing = (0..items)
            .map(|i| PublishedItem {
                reference: format!("old-{i}"),
            })
            .collect();
        publisher
            .containers
            .lock()
            .unwrap()
            .insert(link.to_string(), existing);
        publisher
    }

    pub fn fail(&self, op: &'static str) {
        *self.fail_on.lock().unwrap() = Some(op);
    }

    pub fn ops(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(|c| c.op).collect()
    }

    pub fn items(&self, link: &str) -> usize {
        self.containers
            .lock()
            .unwrap()
            .get(link)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    async fn call(&self, owner: UserId, op: &'static str) -> Result<()> {
        let start = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.lock().unwrap().push(PublishCall {
            owner,
            op,
            start,
            end: Instant::now(),
        });
        if *self.fail_on.lock().unwrap() == Some(op) {
            return Err(Error::External(format!("{op} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl PackPublisher for FakePublisher {
    async fn upload_item(&self, owner: UserId, item: &ItemUpload) -> Result<UploadedItem> {
        let op = if item.role == ItemRole::Placeholder {
            "upload_placeholder"
        } else {
            "upload"
        };
        self.call(owner, op).await?;
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(UploadedItem {
            file_id: format!("file-{n}"),
        })
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<()> {
        self.call(spec.owner, "create").await?;
        let items = spec.items.iter().map(published).collect();
        self.containers.lock().unwrap().insert(spec.link, items);
        Ok(())
    }

    async fn append_items(&self, owner: UserId, link: &str, items: Vec<InputItem>) -> Result<()> {
        self.call(owner, "append").await?;
        let mut containers = self.containers.lock().unwrap();
        let existing = containers
            .get_mut(link)
            .ok_or_else(|| Error::NotFound(link.to_string()))?;
        existing.extend(items.iter().map(published));
        Ok(())
    }

    async fn get_container(&self, link: &str) -> Result<Option<Container>> {
        self.call(UserId(0), "get").await?;
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(link)
            .map(|items| Container {
                link: link.to_string(),
                title: "t".to_string(),
                items: items.clone(),
            }))
    }
}

fn published(item: &InputItem) -> PublishedItem {
    PublishedItem {
        reference: format!("emoji-{}", item.file_id),
    }
}
