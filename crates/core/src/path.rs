/// Separator used in every object key.
pub const SEPARATOR: char = '/';

/// Canonical form of a configured root directory: no leading separator and
/// exactly one trailing separator. The bare root normalizes to `"/"`.
pub fn normalize_dir(dir: &str) -> String {
    let trimmed = dir
        .trim_start_matches(SEPARATOR)
        .trim_end_matches(SEPARATOR);
    format!("{trimmed}{SEPARATOR}")
}

/// Normalized root directory that object keys are built under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDir(String);

impl RootDir {
    pub fn new(dir: &str) -> Self {
        Self(normalize_dir(dir))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// Key prefix prepended to part paths; empty for the bare root.
    pub fn prefix(&self) -> &str {
        if self.is_root() { "" } else { &self.0 }
    }

    pub fn key(&self, path: &str) -> String {
        format!("{}{path}", self.prefix())
    }

    /// Part path for an object key listed under this root.
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix())
    }
}

impl std::fmt::Display for RootDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
