#![forbid(unsafe_code)]

//! Lexical validation of incoming video URLs.
//!
//! Only the two canonical YouTube shapes are accepted: a `watch?v=` URL on
//! `youtube.com` or a `youtu.be` short link, both with an exact 11-character
//! video id. Anything looser (substring domain matches, embed paths, bare
//! ids) is rejected before it can reach a subprocess.

/// Returns true when the string is a recognized video URL.
///
/// Pure and infallible: never panics, performs no I/O.
pub fn is_valid_media_url(url: &str) -> bool {
    extract_video_id(url).is_some()
}

/// Extracts the anchored 11-character video id, or `None` when the URL does
/// not match a recognized shape.
pub fn extract_video_id(url: &str) -> Option<&str> {
    let rest = url.trim();
    let rest = rest
        .strip_prefix("https://")
        .or_else(|| rest.strip_prefix("http://"))
        .unwrap_or(rest);
    let rest = rest.strip_prefix("www.").unwrap_or(rest);

    let tail = if let Some(tail) = rest.strip_prefix("youtube.com/watch?v=") {
        tail
    } else if let Some(tail) = rest.strip_prefix("youtu.be/") {
        tail
    } else {
        return None;
    };

    // `get` rather than slicing: a multi-byte character inside the first 11
    // bytes means this cannot be a valid id.
    let id = tail.get(..11)?;
    if !id.chars().all(is_id_char) {
        return None;
    }

    // The id must be anchored: nothing may follow except an extra query
    // string or fragment.
    match tail[11..].chars().next() {
        None | Some('&') | Some('?') | Some('#') => Some(id),
        _ => None,
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}
