//! Per-request generation pipeline.
//!
//! `Intake → Eligibility → MediaAcquire → PackResolve → QueueWait → Transform
//! → Persist → Notify`, ending in exactly one of `Done`, `Failed` or
//! `Aborted`. The working directory and the queue ticket are scoped to the
//! run and released on every exit path.

use std::{sync::Arc, time::Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cancel::abortable,
    config::{Config, PackKind},
    domain::Destination,
    errors::PipelineError,
    formatting::{fit_preview, render_grid, render_result},
    media::MediaAcquirer,
    messaging::port::MessagingPort,
    pack::PackResolver,
    ports::{ContentHost, MediaTransformer, PackPublisher, PackRecord, PackRepository, QuotaChecker},
    progress::ProgressNotifier,
    queue::KeyedSerializationQueue,
    request::{parse_command, ArgLimits, GenerationRequest, SourceMessage},
    uploader::{PublishOutcome, TransformUploader},
};

/// Collaborators injected into a [`Pipeline`].
pub struct PipelinePorts {
    pub messenger: Arc<dyn MessagingPort>,
    pub quota: Arc<dyn QuotaChecker>,
    pub content_host: Arc<dyn ContentHost>,
    pub repository: Arc<dyn PackRepository>,
    pub transformer: Arc<dyn MediaTransformer>,
    pub publisher: Arc<dyn PackPublisher>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishSummary {
    pub link: String,
    pub title: String,
    pub references: Vec<String>,
    pub added: usize,
    pub total: usize,
}

/// Terminal state of one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done(PublishSummary),
    Failed(PipelineError),
    Aborted,
}

pub struct Pipeline {
    cfg: Arc<Config>,
    messenger: Arc<dyn MessagingPort>,
    quota: Arc<dyn QuotaChecker>,
    repository: Arc<dyn PackRepository>,
    acquirer: MediaAcquirer,
    resolver: PackResolver,
    uploader: TransformUploader,
    queue: Arc<KeyedSerializationQueue>,
}

impl Pipeline {
    pub fn new(cfg: Arc<Config>, ports: PipelinePorts) -> Self {
        let resolver = PackResolver::new(
            ports.repository.clone(),
            cfg.bot_id,
            &cfg.bot_username,
            cfg.default_pack_title.clone(),
        );
        Self {
            acquirer: MediaAcquirer::new(ports.content_host, cfg.max_download_bytes),
            uploader: TransformUploader::new(ports.transformer, ports.publisher, &cfg),
            resolver,
            messenger: ports.messenger,
            quota: ports.quota,
            repository: ports.repository,
            queue: Arc::new(KeyedSerializationQueue::new()),
            cfg,
        }
    }

    pub fn queue(&self) -> &Arc<KeyedSerializationQueue> {
        &self.queue
    }

    /// Fire-and-forget entry point; every outcome is reported through the
    /// messenger.
    pub async fn handle(&self, msg: SourceMessage, cancel: CancellationToken) {
        let _ = self.execute(&msg, &cancel).await;
    }

    pub async fn execute(&self, msg: &SourceMessage, cancel: &CancellationToken) -> Outcome {
        let started = Instant::now();
        let result = self.run(msg, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(summary) => {
                info!(
                    chat_id = msg.chat_id.0,
                    user_id = msg.user_id.0,
                    link = %summary.link,
                    added = summary.added,
                    total = summary.total,
                    elapsed_ms,
                    state = "done",
                    "generation finished"
                );
                Outcome::Done(summary)
            }
            Err(_) if cancel.is_cancelled() => {
                info!(
                    chat_id = msg.chat_id.0,
                    user_id = msg.user_id.0,
                    elapsed_ms,
                    state = "aborted",
                    "generation aborted"
                );
                Outcome::Aborted
            }
            Err(err) => {
                if err == PipelineError::NoMediaProvided {
                    debug!(chat_id = msg.chat_id.0, user_id = msg.user_id.0, "no media in request");
                } else {
                    warn!(
                        chat_id = msg.chat_id.0,
                        user_id = msg.user_id.0,
                        error_kind = err.kind(),
                        error = %err,
                        elapsed_ms,
                        state = "failed",
                        "generation failed"
                    );
                }
                if let Some(text) = err.user_message() {
                    self.deliver(msg.reply_destination(), &text).await;
                }
                Outcome::Failed(err)
            }
        }
    }

    async fn run(
        &self,
        msg: &SourceMessage,
        cancel: &CancellationToken,
    ) -> Result<PublishSummary, PipelineError> {
        // Intake
        let command_text = msg.command_text().unwrap_or_default();
        let args = parse_command(
            command_text,
            ArgLimits {
                default_width: self.cfg.default_width,
                max_width: self.cfg.max_width,
            },
        )?;

        // Eligibility
        let allowed = abortable(cancel, self.quota.can_proceed(msg.user_id, msg.chat_id))
            .await?
            .map_err(PipelineError::unclassified)?;
        if !allowed {
            return Err(PipelineError::QuotaExceeded);
        }

        // MediaAcquire; the directory is removed when `work_dir` drops.
        let work_dir = tempfile::Builder::new()
            .prefix("req-")
            .tempdir_in(&self.cfg.work_dir)
            .map_err(PipelineError::unclassified)?;
        let media_path = self.acquirer.acquire(msg, work_dir.path(), cancel).await?;

        // PackResolve
        let pack = abortable(
            cancel,
            self.resolver
                .resolve(&args.pack_link, msg.user_id, &args.title, command_text),
        )
        .await??;

        let req = GenerationRequest {
            chat_id: msg.chat_id,
            thread_id: msg.thread_id,
            message_id: msg.message_id,
            user_id: msg.user_id,
            username: msg.username.clone(),
            command_text: command_text.to_string(),
            work_dir: work_dir.path().to_path_buf(),
            media_path,
            pack_link: args.pack_link,
            width: args.width,
            title: args.title,
        };

        let mut progress = ProgressNotifier::new(self.messenger.clone(), msg.reply_destination());
        let result = self.publish_exclusive(cancel, &req, &pack, &mut progress).await;
        progress.finish().await;
        result
    }

    /// QueueWait through Notify, with the ticket for `pack.link` held.
    async fn publish_exclusive(
        &self,
        cancel: &CancellationToken,
        req: &GenerationRequest,
        pack: &PackRecord,
        progress: &mut ProgressNotifier,
    ) -> Result<PublishSummary, PipelineError> {
        let acq = self.queue.acquire(&pack.link);
        if !acq.acquired {
            debug!(link = %pack.link, "waiting for pack ticket");
            progress.queued(self.queue.waiting(&pack.link)).await;
        }
        let _ticket = self
            .queue
            .wait_for(&pack.link, acq, cancel)
            .await
            .map_err(|_| PipelineError::Aborted)?;

        progress.processing("Generating").await;
        let outcome = self.uploader.run(cancel, req, pack).await?;

        // Persist
        if let Err(e) = abortable(
            cancel,
            self.repository.update_item_count(pack.id, outcome.total),
        )
        .await?
        {
            warn!(link = %pack.link, error = %e, "failed to persist item count");
        }

        // Notify
        let dest = Destination {
            chat_id: req.chat_id,
            thread_id: req.thread_id,
            reply_to: Some(req.message_id),
        };
        self.deliver(dest, &self.render_summary(pack, req.width, &outcome))
            .await;

        Ok(PublishSummary {
            link: pack.link.clone(),
            title: pack.title.clone(),
            references: outcome.references,
            added: outcome.count,
            total: outcome.total,
        })
    }

    fn render_summary(&self, pack: &PackRecord, width: u32, outcome: &PublishOutcome) -> String {
        let caps = self.messenger.capabilities();
        let inline = self.cfg.pack_kind == PackKind::CustomEmoji && caps.supports_custom_emoji;
        let items = outcome.references.len().min(self.cfg.preview_max_items);
        fit_preview(items, width, caps.max_message_len, |shown| {
            let grid = render_grid(
                &outcome.references,
                width,
                shown,
                inline,
                &self.cfg.default_emoji,
            );
            render_result(
                self.cfg.pack_kind,
                &pack.link,
                &pack.title,
                &grid,
                outcome.count,
                outcome.total,
            )
        })
    }

    async fn deliver(&self, dest: Destination, html: &str) {
        if let Err(e) = self.messenger.send(dest, html).await {
            warn!(chat_id = dest.chat_id.0, error = %e, "failed to deliver message");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use super::*;
    use crate::{
        domain::{ChatId, MessageId, UserId},
        fakes::{
            FakeContentHost, FakeMessenger, FakePublisher, FakeQuota, FakeRepository,
            FakeTransformer,
        },
        ports::FileRef,
        request::MediaAttachment,
    };

    const LINK: &str = "cats_by_stkbot";

    struct Harness {
        root: tempfile::TempDir,
        messenger: Arc<FakeMessenger>,
        host: Arc<FakeContentHost>,
        repo: Arc<FakeRepository>,
        transformer: Arc<FakeTransformer>,
        publisher: Arc<FakePublisher>,
        allow: bool,
        quota_fails: bool,
    }

    impl Harness {
        fn new(repo: FakeRepository, transformer: FakeTransformer, publisher: FakePublisher) -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                messenger: Arc::new(FakeMessenger::default()),
                host: Arc::new(FakeContentHost::default()),
                repo: Arc::new(repo),
                transformer: Arc::new(transformer),
                publisher: Arc::new(publisher),
                allow: true,
                quota_fails: false,
            }
        }

        fn pipeline(&self) -> Pipeline {
            Pipeline::new(
                Arc::new(Config::for_tests(self.root.path())),
                PipelinePorts {
                    messenger: self.messenger.clone(),
                    quota: Arc::new(FakeQuota {
                        allow: self.allow,
                        fail: self.quota_fails,
                    }),
                    content_host: self.host.clone(),
                    repository: self.repo.clone(),
                    transformer: self.transformer.clone(),
                    publisher: self.publisher.clone(),
                },
            )
        }

        fn leftover_dirs(&self) -> usize {
            std::fs::read_dir(self.root.path()).unwrap().count()
        }
    }

    fn video_message(user: i64, text: &str) -> SourceMessage {
        SourceMessage {
            chat_id: ChatId(-100),
            message_id: MessageId(user as i32 * 10),
            user_id: UserId(user),
            caption: Some(text.to_string()),
            media: Some(MediaAttachment::Video {
                file: FileRef {
                    file_id: format!("video-{user}"),
                    size: Some(2048),
                },
                mime_type: Some("video/mp4".to_string()),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn new_pack_is_published_persisted_and_announced_once() {
        let h = Harness::new(
            FakeRepository::default(),
            FakeTransformer::producing(2),
            FakePublisher::default(),
        );

        let outcome = h
            .pipeline()
            .execute(&video_message(1, "/emoji My cats"), &CancellationToken::new())
            .await;

        let Outcome::Done(summary) = outcome else {
            panic!("expected Done, got {outcome:?}");
        };
        assert_eq!(summary.added, 2);
        assert!(summary.link.ends_with("_by_stkbot"));
        assert_eq!(summary.title, "My cats");
        assert_eq!(h.repo.item_count(&summary.link), Some(2));

        let sent = h.messenger.sent_html();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("emoji-file-0"));
        assert!(sent[0].contains("emoji-file-1"));
        assert!(sent[0].contains(&summary.link));

        assert_eq!(h.leftover_dirs(), 0);
        assert_eq!(h.messenger.deletes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn full_pack_fails_with_limit_and_releases_everything() {
        let h = Harness::new(
            FakeRepository::with_record(LINK, 200),
            FakeTransformer::producing(1),
            FakePublisher::with_container(LINK, 200),
        );
        let pipeline = h.pipeline();

        let outcome = pipeline
            .execute(
                &video_message(1, "/emoji https://t.me/addemoji/cats_by_stkbot"),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(
            outcome,
            Outcome::Failed(PipelineError::ItemCountLimitExceeded {
                observed: 201,
                limit: 200
            })
        );
        assert!(pipeline.queue().is_empty());
        assert_eq!(h.leftover_dirs(), 0);
        assert_eq!(h.repo.item_count(LINK), Some(200));
        assert_eq!(h.messenger.sent_html().len(), 1);
        assert!(h.messenger.sent_html()[0].contains("201"));
        assert_eq!(h.transformer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_pack_never_interleave() {
        let h = Harness::new(
            FakeRepository::with_record(LINK, 0),
            FakeTransformer::producing(2),
            FakePublisher::with_delay(Duration::from_millis(5)),
        );
        let pipeline = Arc::new(h.pipeline());

        let mut tasks = Vec::new();
        for user in [1, 2] {
            let pipeline = pipeline.clone();
            tasks.push(tokio::spawn(async move {
                let msg = video_message(user, "/emoji cats_by_stkbot");
                pipeline.execute(&msg, &CancellationToken::new()).await
            }));
        }
        for task in tasks {
            assert!(matches!(task.await.unwrap(), Outcome::Done(_)));
        }

        assert_eq!(h.repo.item_count(LINK), Some(4));
        assert_eq!(h.publisher.items(LINK), 4);
        assert_eq!(
            h.publisher.ops(),
            vec![
                "get", "upload", "upload", "create", "get", //
                "get", "upload", "upload", "append", "get",
            ]
        );

        // Owner-attributed calls of one request form a span the other never enters.
        let calls = h.publisher.calls.lock().unwrap().clone();
        let span = |owner: UserId| {
            let mine: Vec<_> = calls.iter().filter(|c| c.owner == owner).collect();
            let start = mine.iter().map(|c| c.start).min().unwrap();
            let end = mine.iter().map(|c| c.end).max().unwrap();
            (start, end)
        };
        let (a_start, a_end) = span(UserId(1));
        let (b_start, b_end) = span(UserId(2));
        assert!(a_end <= b_start || b_end <= a_start);
        assert!(pipeline.queue().is_empty());
        assert_eq!(h.leftover_dirs(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_its_place_and_directory_silently() {
        let h = Harness::new(
            FakeRepository::with_record(LINK, 0),
            FakeTransformer::producing(1),
            FakePublisher::default(),
        );
        let pipeline = Arc::new(h.pipeline());

        // Somebody else holds the pack.
        assert!(pipeline.queue().acquire(LINK).acquired);

        let cancel = CancellationToken::new();
        let task = {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let msg = video_message(1, "/emoji cats_by_stkbot");
                pipeline.execute(&msg, &cancel).await
            })
        };

        while pipeline.queue().waiting(LINK) == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        assert_eq!(task.await.unwrap(), Outcome::Aborted);

        assert_eq!(pipeline.queue().waiting(LINK), 0);
        pipeline.queue().release(LINK);
        assert!(pipeline.queue().is_empty());
        assert_eq!(h.leftover_dirs(), 0);
        assert!(h.messenger.sent_html().is_empty());
        assert_eq!(h.transformer.calls.load(Ordering::SeqCst), 0);
        // The "queued" notice was cleaned up.
        assert_eq!(h.messenger.progress_html().len(), 1);
        assert_eq!(h.messenger.deletes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_arguments_fail_before_any_download() {
        let h = Harness::new(
            FakeRepository::default(),
            FakeTransformer::producing(1),
            FakePublisher::default(),
        );
        let outcome = h
            .pipeline()
            .execute(&video_message(1, "/emoji w=99"), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, Outcome::Failed(PipelineError::ArgsInvalid(_))));
        assert_eq!(h.host.download_count(), 0);
        assert_eq!(h.messenger.sent_html().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_quota_is_reported_without_download() {
        let mut h = Harness::new(
            FakeRepository::default(),
            FakeTransformer::producing(1),
            FakePublisher::default(),
        );
        h.allow = false;
        let outcome = h
            .pipeline()
            .execute(&video_message(1, "/emoji"), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Failed(PipelineError::QuotaExceeded));
        assert_eq!(h.host.download_count(), 0);
        assert_eq!(h.messenger.sent_html().len(), 1);
    }

    #[tokio::test]
    async fn quota_service_failure_is_unclassified_and_skips_download() {
        let mut h = Harness::new(
            FakeRepository::default(),
            FakeTransformer::producing(1),
            FakePublisher::default(),
        );
        h.quota_fails = true;
        let outcome = h
            .pipeline()
            .execute(&video_message(1, "/emoji"), &CancellationToken::new())
            .await;

        let Outcome::Failed(PipelineError::UnclassifiedTransportError { message }) = outcome else {
            panic!("expected an unclassified failure, got {outcome:?}");
        };
        assert!(message.contains("quota service timed out"), "{message}");
        assert_eq!(h.host.download_count(), 0);
        assert_eq!(h.messenger.sent_html().len(), 1);
    }

    #[tokio::test]
    async fn user_text_in_failure_replies_is_escaped() {
        let h = Harness::new(
            FakeRepository::default(),
            FakeTransformer::producing(1),
            FakePublisher::default(),
        );
        let pipeline = h.pipeline();

        for caption in ["/emoji a<b=1", "/emoji <i>x_by_stkbot"] {
            let outcome = pipeline
                .execute(&video_message(1, caption), &CancellationToken::new())
                .await;
            assert!(matches!(outcome, Outcome::Failed(_)), "{caption}: {outcome:?}");
        }

        let sent = h.messenger.sent_html();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("a&lt;b"), "{}", sent[0]);
        assert!(sent[1].contains("&lt;i&gt;x_by_stkbot"), "{}", sent[1]);
        assert!(sent.iter().all(|html| !html.contains("<i>") && !html.contains("a<b")));
    }

    #[tokio::test]
    async fn missing_media_is_silent() {
        let h = Harness::new(
            FakeRepository::default(),
            FakeTransformer::producing(1),
            FakePublisher::default(),
        );
        let msg = SourceMessage {
            media: None,
            ..video_message(1, "/emoji")
        };

        let outcome = h.pipeline().execute(&msg, &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Failed(PipelineError::NoMediaProvided));
        assert!(h.messenger.sent_html().is_empty());
        assert_eq!(h.repo.create_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.leftover_dirs(), 0);
    }

    #[tokio::test]
    async fn unknown_owned_pack_is_not_created() {
        let h = Harness::new(
            FakeRepository::default(),
            FakeTransformer::producing(1),
            FakePublisher::default(),
        );
        let outcome = h
            .pipeline()
            .execute(&video_message(1, "/emoji ghost_by_stkbot"), &CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            Outcome::Failed(PipelineError::PackNotFound("ghost_by_stkbot".to_string()))
        );
        assert_eq!(h.repo.create_calls.load(Ordering::SeqCst), 0);
        assert!(h.publisher.ops().is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_does_not_fail_the_request() {
        let mut repo = FakeRepository::with_record(LINK, 3);
        repo.fail_update = true;
        let h = Harness::new(repo, FakeTransformer::producing(2), FakePublisher::with_container(LINK, 3));

        let outcome = h
            .pipeline()
            .execute(&video_message(1, "/emoji cats_by_stkbot"), &CancellationToken::new())
            .await;

        let Outcome::Done(summary) = outcome else {
            panic!("expected Done, got {outcome:?}");
        };
        assert_eq!(summary.total, 5);
        assert_eq!(h.repo.item_count(LINK), Some(3));
        assert_eq!(h.messenger.sent_html().len(), 1);
    }
}
