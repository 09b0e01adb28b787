//! Telegram file storage as a [`ContentHost`].

use std::path::Path;

use async_trait::async_trait;
use teloxide::{net::Download, prelude::*};
use tokio::io::AsyncWriteExt;

use stk_core::{
    errors::Error,
    ports::{ContentHost, FileRef, RemoteFile},
    Result,
};

use crate::with_retry;

#[derive(Clone)]
pub struct TelegramContentHost {
    bot: Bot,
}

impl TelegramContentHost {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ContentHost for TelegramContentHost {
    async fn fetch(&self, file: &FileRef) -> Result<RemoteFile> {
        let tg_file = with_retry(|| self.bot.get_file(file.file_id.clone())).await?;
        Ok(RemoteFile {
            path: tg_file.path.clone(),
            size: Some(u64::from(tg_file.size)),
        })
    }

    async fn download(&self, remote: &RemoteFile, dest: &Path) -> Result<()> {
        let mut out = tokio::fs::File::create(dest).await?;
        self.bot
            .download_file(&remote.path, &mut out)
            .await
            .map_err(|e| Error::External(format!("telegram download error: {e}")))?;
        out.flush().await?;
        Ok(())
    }
}
