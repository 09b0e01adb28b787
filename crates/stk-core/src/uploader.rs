//! Transform the source media and publish the result into a pack.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cancel::abortable,
    config::{Config, PackKind},
    errors::PipelineError,
    ports::{
        Container, ContainerSpec, InputItem, ItemRole, ItemUpload, Layout, MediaTransformer,
        PackPublisher, PackRecord, ProducedItem,
    },
    request::GenerationRequest,
};

/// Result of a successful publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishOutcome {
    /// References of the items added by this run, in grid order.
    pub references: Vec<String>,
    pub count: usize,
    /// Items in the pack after this run.
    pub total: usize,
}

pub struct TransformUploader {
    transformer: Arc<dyn MediaTransformer>,
    publisher: Arc<dyn PackPublisher>,
    kind: PackKind,
    item_limit: usize,
    create_batch_limit: usize,
    default_emoji: String,
    placeholder_emoji: String,
}

impl TransformUploader {
    pub fn new(
        transformer: Arc<dyn MediaTransformer>,
        publisher: Arc<dyn PackPublisher>,
        cfg: &Config,
    ) -> Self {
        Self {
            transformer,
            publisher,
            kind: cfg.pack_kind,
            item_limit: cfg.pack_limit(),
            create_batch_limit: cfg.create_batch_limit.max(1),
            default_emoji: cfg.default_emoji.clone(),
            placeholder_emoji: cfg.placeholder_emoji.clone(),
        }
    }

    /// Must be called while holding the queue ticket for `pack.link`.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        req: &GenerationRequest,
        pack: &PackRecord,
    ) -> Result<PublishOutcome, PipelineError> {
        let out_dir = req.work_dir.join("out");
        abortable(cancel, tokio::fs::create_dir_all(&out_dir))
            .await?
            .map_err(PipelineError::unclassified)?;

        let existing = self.read_container(cancel, &pack.link).await?;
        let existing_count = existing.as_ref().map(|c| c.items.len()).unwrap_or(0);

        // Rendering is the expensive part and runs under the pack ticket, so
        // the limit is checked against the planned grid first.
        let layout = Layout { width: req.width };
        let planned = abortable(cancel, self.transformer.plan(&req.media_path, layout))
            .await?
            .map_err(PipelineError::unclassified)?;
        self.check_limit(existing_count + planned)?;

        let produced = abortable(
            cancel,
            self.transformer.produce(&req.media_path, &out_dir, layout),
        )
        .await?
        .map_err(PipelineError::unclassified)?;
        if produced.is_empty() {
            return Err(PipelineError::EmptyOutputSequence);
        }
        debug!(link = %pack.link, planned, items = produced.len(), "transformer finished");
        self.check_limit(existing_count + produced.len())?;

        let mut inputs = Vec::with_capacity(produced.len());
        for item in &produced {
            inputs.push(self.upload(cancel, req, item).await?);
        }

        if existing.is_some() {
            self.append(cancel, req, &pack.link, inputs).await?;
        } else {
            let rest = inputs.split_off(inputs.len().min(self.create_batch_limit));
            let spec = ContainerSpec {
                owner: req.user_id,
                link: pack.link.clone(),
                title: pack.title.clone(),
                kind: self.kind,
                items: inputs,
            };
            abortable(cancel, self.publisher.create_container(spec))
                .await?
                .map_err(|e| PipelineError::ContainerCreateFailed(e.to_string()))?;
            if !rest.is_empty() {
                self.append(cancel, req, &pack.link, rest).await?;
            }
        }

        let container = self
            .read_container(cancel, &pack.link)
            .await?
            .ok_or_else(|| {
                PipelineError::ContainerReadFailed(format!("{} missing after publish", pack.link))
            })?;

        let total = container.items.len();
        let skip = total.saturating_sub(produced.len());
        let references: Vec<String> = container
            .items
            .into_iter()
            .skip(skip)
            .map(|i| i.reference)
            .collect();

        info!(
            link = %pack.link,
            added = references.len(),
            total,
            "published items"
        );
        Ok(PublishOutcome {
            count: references.len(),
            references,
            total,
        })
    }

    fn check_limit(&self, observed: usize) -> Result<(), PipelineError> {
        if observed > self.item_limit {
            return Err(PipelineError::ItemCountLimitExceeded {
                observed,
                limit: self.item_limit,
            });
        }
        Ok(())
    }

    async fn read_container(
        &self,
        cancel: &CancellationToken,
        link: &str,
    ) -> Result<Option<Container>, PipelineError> {
        abortable(cancel, self.publisher.get_container(link))
            .await?
            .map_err(|e| PipelineError::ContainerReadFailed(e.to_string()))
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        req: &GenerationRequest,
        item: &ProducedItem,
    ) -> Result<InputItem, PipelineError> {
        let data = abortable(cancel, tokio::fs::read(&item.path))
            .await?
            .map_err(|e| PipelineError::FileOpenFailed(format!("{}: {e}", item.path.display())))?;

        let file_name = item
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "item".to_string());
        let upload = ItemUpload {
            file_name,
            data,
            format: item.format,
            role: item.role,
        };

        let uploaded = abortable(cancel, self.publisher.upload_item(req.user_id, &upload))
            .await?
            .map_err(|e| match item.role {
                ItemRole::Content => PipelineError::ItemPublishFailed(e.to_string()),
                ItemRole::Placeholder => PipelineError::PlaceholderPublishFailed(e.to_string()),
            })?;

        let emoji = match item.role {
            ItemRole::Content => self.default_emoji.clone(),
            ItemRole::Placeholder => self.placeholder_emoji.clone(),
        };
        Ok(InputItem {
            file_id: uploaded.file_id,
            format: item.format,
            emoji,
        })
    }

    async fn append(
        &self,
        cancel: &CancellationToken,
        req: &GenerationRequest,
        link: &str,
        items: Vec<InputItem>,
    ) -> Result<(), PipelineError> {
        abortable(cancel, self.publisher.append_items(req.user_id, link, items))
            .await?
            .map_err(|e| PipelineError::ContainerAppendFailed(e.to_string()))
    }
}
