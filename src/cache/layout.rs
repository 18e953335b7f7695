//! Content-addressed cache layout
//!
//! `<root>/<h[0:2]>/<h[2:4]>/<h[4:]>-<name>` where `h` is the hex SHA-1 of the
//! logical remote path. Two levels of 256-way sharding keep directories small.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

/// Prefix of in-progress download files in a shard directory
pub const TEMP_PREFIX: &str = ".tmp";

/// Cache file path for a remote file
pub fn content_path(root: &Path, logical_path: &str, name: &str) -> PathBuf {
    let hash = format!("{:x}", Sha1::digest(logical_path.as_bytes()));
    root.join(&hash[..2])
        .join(&hash[2..4])
        .join(format!("{}-{}", &hash[4..], sanitize(name)))
}

/// Whether a file in the cache tree is a leftover partial download
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(TEMP_PREFIX))
}

/// Make a remote file name safe as a path component
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let path = content_path(Path::new("cache"), "abc", "abc");
        assert_eq!(
            path,
            PathBuf::from("cache/a9/99/3e364706816aba3e25717850c26c9cd0d89d-abc")
        );
    }

    #[test]
    fn test_same_name_different_folders() {
        let root = Path::new("cache");
        let a = content_path(root, "/music/readme.md", "readme.md");
        let b = content_path(root, "/video/readme.md", "readme.md");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with("-readme.md"));
        assert_eq!(a, content_path(root, "/music/readme.md", "readme.md"));
    }

    #[test]
    fn test_unsafe_names() {
        let path = content_path(Path::new("c"), "/x/a:b", "../a:b\\c");
        let file = path.file_name().unwrap().to_str().unwrap();
        assert!(file.ends_with("-.._a_b_c"));
        assert_eq!(path.components().count(), 4);
    }

    #[test]
    fn test_temp_detection() {
        assert!(is_temp_file(Path::new("cache/aa/bb/.tmpXyZ12")));
        assert!(!is_temp_file(Path::new("cache/aa/bb/3e36-song.mp3")));
    }
}
