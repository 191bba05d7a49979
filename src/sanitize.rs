#![forbid(unsafe_code)]

//! Turns untrusted video titles into safe leaf filenames.

/// Characters that never survive sanitization. Covers path separators on
/// every platform plus the Windows reserved set.
const FORBIDDEN: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

const MAX_LEN_CHARS: usize = 100;

/// Produces a filesystem-safe basename from a raw video title.
///
/// Removes the forbidden character set, maps whitespace to underscores, and
/// truncates to 100 characters without splitting a multi-byte sequence. The
/// function is idempotent, and a title that sanitizes to nothing falls back
/// to `audio` so the result is always a usable leaf name.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !FORBIDDEN.contains(c))
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .take(MAX_LEN_CHARS)
        .collect();

    if cleaned.is_empty() {
        "audio".to_string()
    } else {
        cleaned
    }
}
