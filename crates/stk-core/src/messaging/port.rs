use async_trait::async_trait;

use crate::{
    domain::{Destination, MessageRef},
    messaging::types::MessagingCapabilities,
    Result,
};

/// Message-delivery port.
///
/// `send` is for final results and errors; the `*_progress` calls manage the
/// ephemeral status message of a running request.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send(&self, dest: Destination, html: &str) -> Result<MessageRef>;

    async fn send_progress(&self, dest: Destination, html: &str) -> Result<MessageRef>;
    async fn update_progress(&self, handle: MessageRef, html: &str) -> Result<()>;
    async fn delete_progress(&self, handle: MessageRef) -> Result<()>;
}
