use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Platform maximum for a pack link (sticker set `name`).
pub const MAX_LINK_LEN: usize = 64;
/// Platform maximum for a pack title.
pub const MAX_TITLE_LEN: usize = 64;

/// Which kind of pack the bot publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackKind {
    CustomEmoji,
    Sticker,
}

impl PackKind {
    /// Public URL prefix for a pack of this kind.
    pub fn share_prefix(self) -> &'static str {
        match self {
            PackKind::CustomEmoji => "https://t.me/addemoji/",
            PackKind::Sticker => "https://t.me/addstickers/",
        }
    }
}

/// Typed configuration, loaded from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    /// Bot handle without `@`; used as the `_by_<handle>` pack link suffix.
    pub bot_username: String,
    /// Numeric id of the bot account, stored on every pack record.
    pub bot_id: i64,
    /// Chats the bot answers in; empty means all chats.
    pub allowed_chats: Vec<i64>,

    // Storage
    pub work_dir: PathBuf,
    pub pack_store_file: Option<PathBuf>,

    // Packs
    pub pack_kind: PackKind,
    pub emoji_pack_limit: usize,
    pub sticker_pack_limit: usize,
    pub create_batch_limit: usize,
    pub default_width: u32,
    pub max_width: u32,
    pub default_pack_title: String,
    pub default_emoji: String,
    pub placeholder_emoji: String,
    pub preview_max_items: usize,
    pub max_download_bytes: u64,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,

    // Transformer
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub tile_size: u32,
    pub clip_seconds: u32,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let bot_username = env_str("BOT_USERNAME")
            .map(|s| s.trim().trim_start_matches('@').to_string())
            .unwrap_or_default();
        if bot_username.is_empty() {
            return Err(Error::Config(
                "BOT_USERNAME environment variable is required".to_string(),
            ));
        }
        // The token is `<bot id>:<secret>`.
        let bot_id = telegram_bot_token
            .split(':')
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);

        let allowed_chats = parse_csv_i64(env_str("TELEGRAM_ALLOWED_CHATS"));

        let work_dir = PathBuf::from(env_str("WORK_DIR").unwrap_or("/tmp/stk-work".to_string()));
        fs::create_dir_all(&work_dir)?;
        let pack_store_file = Some(PathBuf::from(
            env_str("PACK_STORE_FILE").unwrap_or("/tmp/stk-packs.json".to_string()),
        ));

        let pack_kind = match env_str("PACK_KIND")
            .unwrap_or_default()
            .trim()
            .to_lowercase()
            .as_str()
        {
            "" | "emoji" | "custom_emoji" => PackKind::CustomEmoji,
            "sticker" | "stickers" => PackKind::Sticker,
            other => {
                return Err(Error::Config(format!(
                    "PACK_KIND must be `emoji` or `sticker`, got `{other}`"
                )))
            }
        };

        let emoji_pack_limit = env_usize("EMOJI_PACK_LIMIT").unwrap_or(200);
        let sticker_pack_limit = env_usize("STICKER_PACK_LIMIT").unwrap_or(120);
        let default_width = env_u32("DEFAULT_WIDTH").unwrap_or(8).max(1);
        let max_width = env_u32("MAX_WIDTH").unwrap_or(16).max(default_width);
        let default_pack_title =
            env_str("DEFAULT_PACK_TITLE").unwrap_or(format!("Pack by @{bot_username}"));

        Ok(Self {
            telegram_bot_token,
            bot_username,
            bot_id,
            allowed_chats,
            work_dir,
            pack_store_file,
            pack_kind,
            emoji_pack_limit,
            sticker_pack_limit,
            create_batch_limit: 50,
            default_width,
            max_width,
            default_pack_title,
            default_emoji: env_str("DEFAULT_EMOJI").unwrap_or("⭐".to_string()),
            placeholder_emoji: env_str("PLACEHOLDER_EMOJI").unwrap_or("▫️".to_string()),
            preview_max_items: env_usize("PREVIEW_MAX_ITEMS").unwrap_or(100),
            max_download_bytes: env_u64("MAX_DOWNLOAD_BYTES").unwrap_or(20 * 1024 * 1024),
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED").unwrap_or(true),
            rate_limit_requests: env_u32("RATE_LIMIT_REQUESTS").unwrap_or(5),
            rate_limit_window: Duration::from_secs(env_u64("RATE_LIMIT_WINDOW").unwrap_or(60)),
            ffmpeg_path: env_path("FFMPEG_PATH").unwrap_or_else(|| PathBuf::from("ffmpeg")),
            ffprobe_path: env_path("FFPROBE_PATH").unwrap_or_else(|| PathBuf::from("ffprobe")),
            tile_size: env_u32("TILE_SIZE").unwrap_or(100),
            clip_seconds: env_u32("CLIP_SECONDS").unwrap_or(3),
        })
    }

    /// Maximum number of items a single pack may hold.
    pub fn pack_limit(&self) -> usize {
        match self.pack_kind {
            PackKind::CustomEmoji => self.emoji_pack_limit,
            PackKind::Sticker => self.sticker_pack_limit,
        }
    }

    pub fn is_chat_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chats.is_empty() || self.allowed_chats.contains(&chat_id)
    }

    /// Config for tests, with no environment dependency.
    #[doc(hidden)]
    pub fn for_tests(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            telegram_bot_token: "1:x".to_string(),
            bot_username: "stkbot".to_string(),
            bot_id: 1,
            allowed_chats: vec![],
            work_dir: work_dir.into(),
            pack_store_file: None,
            pack_kind: PackKind::CustomEmoji,
            emoji_pack_limit: 200,
            sticker_pack_limit: 120,
            create_batch_limit: 50,
            default_width: 8,
            max_width: 16,
            default_pack_title: "Pack by @stkbot".to_string(),
            default_emoji: "⭐".to_string(),
            placeholder_emoji: "▫️".to_string(),
            preview_max_items: 100,
            max_download_bytes: 20 * 1024 * 1024,
            rate_limit_enabled: false,
            rate_limit_requests: 5,
            rate_limit_window: Duration::from_secs(60),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            tile_size: 100,
            clip_seconds: 3,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}
