#![forbid(unsafe_code)]

//! Security helpers shared by the server handlers.

use std::path::{Component, Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. Downloads land in a plain
/// directory owned by the invoking user; running unprivileged keeps a
/// misconfigured DOWNLOADS_ROOT from writing into system paths.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Returns true when a client-supplied filename is a single normal path
/// component, so joining it onto the downloads directory can never escape it.
pub fn is_safe_leaf(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn safe_leaf_accepts_plain_filenames() {
        assert!(is_safe_leaf("song.mp3"));
        assert!(is_safe_leaf("My_Cool_Song_dQw4w9WgXcQ.mp3"));
    }

    #[test]
    fn safe_leaf_rejects_traversal_and_absolute_paths() {
        assert!(!is_safe_leaf(""));
        assert!(!is_safe_leaf(".."));
        assert!(!is_safe_leaf("../secret.mp3"));
        assert!(!is_safe_leaf("a/b.mp3"));
        assert!(!is_safe_leaf("/etc/passwd"));
        assert!(!is_safe_leaf("./song.mp3"));
    }
}
