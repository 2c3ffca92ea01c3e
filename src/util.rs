//! Small helpers shared across the gateway core.

use std::time::{SystemTime, UNIX_EPOCH};

/// Character cap for approval-card previews.
pub const PREVIEW_MAX_CHARS: usize = 200;

/// Build the one-line excerpt of write content shown on an approval card.
///
/// Whitespace runs (newlines included) collapse to a single space so the
/// card renders as one line, and anything past [`PREVIEW_MAX_CHARS`]
/// characters is cut with a trailing ellipsis. Counts characters, not
/// bytes, so multi-byte content never splits.
pub fn preview_excerpt(content: &str) -> String {
    let content = content.trim();
    let mut out = String::with_capacity(content.len().min(PREVIEW_MAX_CHARS + 3));
    let mut kept = 0usize;
    let mut in_space = false;

    for c in content.chars() {
        if kept == PREVIEW_MAX_CHARS {
            while out.ends_with(' ') {
                out.pop();
            }
            out.push_str("...");
            return out;
        }
        if c.is_whitespace() {
            if in_space {
                continue;
            }
            in_space = true;
            out.push(' ');
        } else {
            in_space = false;
            out.push(c);
        }
        kept += 1;
    }
    out
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
