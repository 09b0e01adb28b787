use std::sync::Arc;

use anyhow::Context;

use stk_core::config::Config;
use stk_ffmpeg::{FfmpegConfig, FfmpegTransformer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stk_core::logging::init("stk")?;

    let cfg = Arc::new(Config::load()?);
    let transformer = Arc::new(FfmpegTransformer::new(FfmpegConfig::from_config(&cfg)));

    stk_telegram::router::run_polling(cfg, transformer)
        .await
        .context("telegram bot failed")?;

    tracing::info!("stk stopped");
    Ok(())
}
