//! Ephemeral status message of a running request.
//!
//! Every call is best effort: a failed status update is logged and never
//! changes the outcome of the request.

use std::{sync::Arc, time::Instant};

use tracing::warn;

use crate::{
    domain::{Destination, MessageRef},
    formatting::format_elapsed,
    messaging::port::MessagingPort,
};

pub struct ProgressNotifier {
    api: Arc<dyn MessagingPort>,
    dest: Destination,
    handle: Option<MessageRef>,
    started: Instant,
}

impl ProgressNotifier {
    pub fn new(api: Arc<dyn MessagingPort>, dest: Destination) -> Self {
        Self {
            api,
            dest,
            handle: None,
            started: Instant::now(),
        }
    }

    pub fn handle(&self) -> Option<MessageRef> {
        self.handle
    }

    /// Low-urgency notice that the request waits behind others.
    pub async fn queued(&mut self, position: usize) {
        let text = format!("🕒 Queued, {position} request(s) ahead for this pack…");
        self.show(&text).await;
    }

    /// Show the current processing stage, replacing any previous status.
    pub async fn processing(&mut self, stage: &str) {
        let elapsed = format_elapsed(self.started.elapsed().as_secs());
        let text = format!("⏳ {stage}… ({elapsed})");
        self.show(&text).await;
    }

    /// Remove the status message, if one was posted.
    pub async fn finish(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = self.api.delete_progress(handle).await {
            warn!(chat_id = self.dest.chat_id.0, error = %e, "failed to delete progress message");
        }
    }

    async fn show(&mut self, text: &str) {
        if let Some(handle) = self.handle {
            if self.api.capabilities().supports_edit {
                if let Err(e) = self.api.update_progress(handle, text).await {
                    warn!(chat_id = self.dest.chat_id.0, error = %e, "failed to update progress message");
                }
                return;
            }
            self.finish().await;
        }

        match self.api.send_progress(self.dest, text).await {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                warn!(chat_id = self.dest.chat_id.0, error = %e, "failed to post progress message")
            }
        }
    }
}
