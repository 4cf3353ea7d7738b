use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// One immutable backup part stored under a backend root.
///
/// `path` is relative to the root and forward-slash separated. The
/// fingerprint is opaque: parts built from content carry a BLAKE3 hex digest,
/// parts produced by listing carry whatever version tag the store reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Part {
    pub path: String,
    pub size: u64,
    pub fingerprint: String,
}

impl Part {
    pub fn new(path: impl Into<String>, size: u64, fingerprint: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size,
            fingerprint: fingerprint.into(),
        }
    }

    /// Builds a part for in-memory content, fingerprinted with BLAKE3.
    pub fn from_data(path: impl Into<String>, data: &[u8]) -> Self {
        Self::new(path, data.len() as u64, blake3::hash(data).to_hex().to_string())
    }

    /// Rejects paths that would escape the root or produce ambiguous keys.
    pub fn validate(&self) -> Result<()> {
        validate_path(&self.path)
    }
}

impl std::fmt::Display for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} bytes)", self.path, self.size)
    }
}

pub fn validate_path(path: &str) -> Result<()> {
    let invalid = |reason| {
        Err(BackendError::InvalidPath {
            path: path.to_string(),
            reason,
        })
    };
    if path.is_empty() {
        return invalid("empty path");
    }
    if path.starts_with('/') {
        return invalid("leading separator");
    }
    if path.contains('\\') {
        return invalid("backslash in path");
    }
    for segment in path.split('/') {
        match segment {
            "" => return invalid("empty segment"),
            "." | ".." => return invalid("relative segment"),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_covers_every_field() {
        let a = Part::new("data/1", 10, "abc");
        assert_eq!(a, Part::new("data/1", 10, "abc"));
        assert_ne!(a, Part::new("data/1", 11, "abc"));
        assert_ne!(a, Part::new("data/1", 10, "abd"));
        assert_ne!(a, Part::new("data/2", 10, "abc"));
    }

    #[test]
    fn from_data_fingerprints_content() {
        let p = Part::from_data("x", b"hello");
        assert_eq!(p.size, 5);
        assert_eq!(p.fingerprint, blake3::hash(b"hello").to_hex().to_string());
        assert_eq!(Part::from_data("x", b""), Part::from_data("x", b""));
    }

    #[test]
    fn path_validation() {
        assert!(validate_path("a/b/c.bin").is_ok());
        assert!(validate_path("part").is_ok());
        for bad in ["", "/abs", "a//b", "a/../b", "./a", "a/", "a\\b"] {
            assert!(
                matches!(validate_path(bad), Err(BackendError::InvalidPath { .. })),
                "{bad:?} accepted"
            );
        }
    }
}
