//! HTML helpers for chat replies.

use crate::config::PackKind;

/// Escape text for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Public URL of a pack.
pub fn share_url(kind: PackKind, link: &str) -> String {
    format!("{}{link}", kind.share_prefix())
}

/// Grid of published items, `width` per row, at most `max_items` shown.
///
/// Custom emoji render inline through `<tg-emoji>`; other packs fall back to
/// the fallback emoji since regular stickers cannot be inlined in text.
pub fn render_grid(
    references: &[String],
    width: u32,
    max_items: usize,
    custom_emoji: bool,
    fallback: &str,
) -> String {
    let width = width.max(1) as usize;
    let shown = &references[..references.len().min(max_items)];

    let rows: Vec<String> = shown
        .chunks(width)
        .map(|row| {
            row.iter()
                .map(|r| {
                    if custom_emoji {
                        format!(
                            "<tg-emoji emoji-id=\"{}\">{}</tg-emoji>",
                            escape_html(r),
                            escape_html(fallback)
                        )
                    } else {
                        escape_html(fallback)
                    }
                })
                .collect::<String>()
        })
        .collect();
    rows.join("\n")
}

/// Final success message of a run.
pub fn render_result(
    kind: PackKind,
    link: &str,
    title: &str,
    grid: &str,
    added: usize,
    total: usize,
) -> String {
    let mut out = String::new();
    if !grid.is_empty() {
        out.push_str(grid);
        out.push_str("\n\n");
    }
    out.push_str(&format!(
        "✅ Added {added} item(s) to <a href=\"{}\">{}</a> ({total} total)",
        share_url(kind, link),
        escape_html(title)
    ));
    out
}

/// Renders a message with the largest preview that keeps it within
/// `max_len` characters.
///
/// `render` builds the whole message for a given preview item count. The
/// count is halved and kept to whole rows of `width`; a message that does not
/// fit even without a preview is returned as rendered with none.
pub fn fit_preview(
    items: usize,
    width: u32,
    max_len: usize,
    render: impl Fn(usize) -> String,
) -> String {
    let width = width.max(1) as usize;
    let mut shown = items;
    loop {
        let html = render(shown);
        if shown == 0 || html.chars().count() <= max_len {
            return html;
        }
        shown = shown / 2 / width * width;
    }
}

pub fn format_elapsed(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}
