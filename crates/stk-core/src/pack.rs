//! New-vs-existing pack resolution.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::info;

use crate::{
    config::{MAX_LINK_LEN, MAX_TITLE_LEN},
    domain::UserId,
    errors::PipelineError,
    ports::{NewPack, PackRecord, PackRepository},
};

/// Host prefixes stripped from user-supplied links (after the scheme).
const LINK_PREFIXES: &[&str] = &[
    "t.me/addemoji/",
    "t.me/addstickers/",
    "telegram.me/addemoji/",
    "telegram.me/addstickers/",
];

/// Source of link timestamps; swapped out in tests.
pub type Clock = Arc<dyn Fn() -> u128 + Send + Sync>;

fn system_clock() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Reduce a user-supplied link to the bare, lowercase pack slug.
///
/// Pure: equal inputs always yield the same key.
pub fn normalize_link(raw: &str) -> String {
    let mut s = raw.trim().to_ascii_lowercase();

    for scheme in ["https://", "http://"] {
        if let Some(rest) = s.strip_prefix(scheme) {
            s = rest.to_string();
            break;
        }
    }
    if let Some(rest) = s.strip_prefix("www.") {
        s = rest.to_string();
    }
    for prefix in LINK_PREFIXES {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.to_string();
            break;
        }
    }
    if let Some(idx) = s.find(['?', '#']) {
        s.truncate(idx);
    }
    s.trim_end_matches('/').to_string()
}

pub struct PackResolver {
    repo: Arc<dyn PackRepository>,
    bot_id: i64,
    /// `_by_<bot>` in lowercase.
    handle_suffix: String,
    default_title: String,
    clock: Clock,
    seq: AtomicU64,
}

impl PackResolver {
    pub fn new(
        repo: Arc<dyn PackRepository>,
        bot_id: i64,
        bot_username: &str,
        default_title: impl Into<String>,
    ) -> Self {
        Self::with_clock(
            repo,
            bot_id,
            bot_username,
            default_title,
            Arc::new(system_clock),
        )
    }

    pub fn with_clock(
        repo: Arc<dyn PackRepository>,
        bot_id: i64,
        bot_username: &str,
        default_title: impl Into<String>,
        clock: Clock,
    ) -> Self {
        Self {
            repo,
            bot_id,
            handle_suffix: format!(
                "_by_{}",
                bot_username.trim_start_matches('@').to_ascii_lowercase()
            ),
            default_title: default_title.into(),
            clock,
            seq: AtomicU64::new(0),
        }
    }

    /// Whether a normalized link names a pack created by this bot.
    pub fn is_owned(&self, link: &str) -> bool {
        link.ends_with(&self.handle_suffix)
    }

    pub async fn resolve(
        &self,
        requested_link: &str,
        creator: UserId,
        proposed_title: &str,
        command_text: &str,
    ) -> Result<PackRecord, PipelineError> {
        let link = normalize_link(requested_link);

        if !link.is_empty() && self.is_owned(&link) {
            return match self.repo.find_by_link(&link).await {
                Ok(Some(record)) => Ok(record),
                Ok(None) => Err(PipelineError::PackNotFound(link)),
                Err(e) => Err(PipelineError::unclassified(e)),
            };
        }

        let link = self.new_link();
        let record = self
            .repo
            .create(NewPack {
                bot_id: self.bot_id,
                owner: creator,
                title: self.title_for(proposed_title),
                link,
                command_text: command_text.to_string(),
            })
            .await
            .map_err(PipelineError::unclassified)?;

        info!(link = %record.link, owner = creator.0, "created pack record");
        Ok(record)
    }

    /// `p<timestamp>_<seq>_by_<bot>`, trimmed from the front of the generated
    /// part when it would exceed the platform limit.
    fn new_link(&self) -> String {
        let ts = (self.clock)();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let body = format!("{ts}_{seq}");

        // One byte for the leading letter.
        let avail = MAX_LINK_LEN.saturating_sub(self.handle_suffix.len() + 1);
        let body = if body.len() > avail {
            &body[body.len() - avail..]
        } else {
            body.as_str()
        };
        format!("p{body}{}", self.handle_suffix)
    }

    fn title_for(&self, proposed: &str) -> String {
        let proposed = proposed.trim();
        let title = if proposed.is_empty() {
            self.default_title.as_str()
        } else {
            proposed
        };
        title.chars().take(MAX_TITLE_LEN).collect()
    }
}
