#![forbid(unsafe_code)]

//! Directory naming for downloaded items: `<date>_<title>_<item_id>`.

use chrono::NaiveDate;

pub const DEFAULT_TITLE_LIMIT: usize = 50;
const FALLBACK_TITLE: &str = "untitled";

/// Characters that are unsafe in directory names on at least one platform.
const RESERVED: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Replaces reserved characters with `_`, trims surrounding whitespace,
/// collapses `_` runs, and caps the result at `max_chars` characters.
pub fn sanitize_title(title: &str, max_chars: usize) -> String {
    let replaced: String = title
        .trim()
        .chars()
        .map(|c| if RESERVED.contains(&c) || c.is_control() { '_' } else { c })
        .collect();

    let mut collapsed = String::with_capacity(replaced.len());
    for c in replaced.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }

    let truncated: String = collapsed.chars().take(max_chars).collect();
    let cleaned = truncated.trim().trim_matches('_').trim();
    if cleaned.is_empty() {
        FALLBACK_TITLE.to_owned()
    } else {
        cleaned.to_owned()
    }
}

/// Builds the per-item directory name used under a playlist's download root.
pub fn item_directory_name(date: NaiveDate, title: &str, item_id: &str, max_chars: usize) -> String {
    format!(
        "{}_{}_{}",
        date.format("%Y-%m-%d"),
        sanitize_title(title, max_chars),
        item_id
    )
}

/// Canonical watch URL handed to the media fetcher.
pub fn watch_url(item_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={item_id}")
}
