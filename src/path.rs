use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SyncError};

/// Identity of an entry within a synchronized root: a normalized relative
/// path, stored with forward slashes so it is stable across platforms and
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathKey(String);

impl PathKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Build a key from a path relative to the root. Rejects absolute paths
    /// and any component that would escape the root.
    pub fn from_relative(rel: &Path, fold_case: bool) -> Result<Self> {
        let mut parts = Vec::new();
        for comp in rel.components() {
            match comp {
                Component::Normal(c) => {
                    let s = c.to_str().ok_or_else(|| SyncError::InvalidPath {
                        path: rel.to_path_buf(),
                    })?;
                    parts.push(s.to_string());
                }
                Component::CurDir => {}
                _ => {
                    return Err(SyncError::InvalidPath {
                        path: rel.to_path_buf(),
                    })
                }
            }
        }
        if parts.is_empty() {
            return Err(SyncError::InvalidPath {
                path: rel.to_path_buf(),
            });
        }
        let mut joined = parts.join("/");
        if fold_case {
            joined = joined.to_lowercase();
        }
        Ok(Self(joined))
    }

    /// Build a key from an absolute path under `root`.
    pub fn from_absolute(abs: &Path, root: &Path, fold_case: bool) -> Result<Self> {
        let rel = abs.strip_prefix(root).map_err(|_| SyncError::InvalidPath {
            path: abs.to_path_buf(),
        })?;
        Self::from_relative(rel, fold_case)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Materialize the key as a filesystem path under `root`.
    pub fn to_absolute(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for part in self.0.split('/') {
            out.push(part);
        }
        out
    }

    /// Number of components; used for parent-before-child ordering.
    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }

    pub fn parent(&self) -> Option<PathKey> {
        self.0.rfind('/').map(|i| PathKey(self.0[..i].to_string()))
    }

    /// True if `self` is a strict ancestor directory of `other`.
    pub fn is_ancestor_of(&self, other: &PathKey) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the peer's tree lives: a remote daemon or a local path (used for
/// same-machine testing).
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Local(PathBuf),
    Remote {
        host: String,
        user: Option<String>,
        path: PathBuf,
    },
}

impl Endpoint {
    /// Parse an endpoint string.
    ///
    /// Supported formats:
    /// - Local: `/path/to/dir`, `./relative/path`, `relative/path`
    /// - Remote: `user@host:/path`, `host:/path`
    pub fn parse(s: &str) -> Self {
        if let Some(colon_pos) = s.find(':') {
            let before_colon = &s[..colon_pos];

            // Windows drive letters are local paths, not hosts
            if before_colon.len() == 1 && before_colon.chars().next().unwrap().is_ascii_alphabetic()
            {
                return Endpoint::Local(PathBuf::from(s));
            }

            if !before_colon.contains('/') && !before_colon.is_empty() {
                let path_part = &s[colon_pos + 1..];
                if let Some(at_pos) = before_colon.find('@') {
                    let user = before_colon[..at_pos].to_string();
                    let host = before_colon[at_pos + 1..].to_string();
                    return Endpoint::Remote {
                        host,
                        user: Some(user),
                        path: PathBuf::from(path_part),
                    };
                }
                return Endpoint::Remote {
                    host: before_colon.to_string(),
                    user: None,
                    path: PathBuf::from(path_part),
                };
            }
        }

        Endpoint::Local(PathBuf::from(s))
    }

    pub fn path(&self) -> &Path {
        match self {
            Endpoint::Local(path) => path,
            Endpoint::Remote { path, .. } => path,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Endpoint::Remote { .. })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Local(path) => write!(f, "{}", path.display()),
            Endpoint::Remote { host, user, path } => {
                if let Some(u) = user {
                    write!(f, "{}@{}:{}", u, host, path.display())
                } else {
                    write!(f, "{}:{}", host, path.display())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_relative() {
        let key = PathKey::from_relative(Path::new("a/b/c.txt"), false).unwrap();
        assert_eq!(key.as_str(), "a/b/c.txt");
        assert_eq!(key.depth(), 3);
        assert_eq!(key.parent().unwrap().as_str(), "a/b");
    }

    #[test]
    fn test_key_rejects_escape() {
        assert!(PathKey::from_relative(Path::new("../evil"), false).is_err());
        assert!(PathKey::from_relative(Path::new("/abs"), false).is_err());
        assert!(PathKey::from_relative(Path::new(""), false).is_err());
    }

    #[test]
    fn test_key_case_folding() {
        let key = PathKey::from_relative(Path::new("Docs/Notes.TXT"), true).unwrap();
        assert_eq!(key.as_str(), "docs/notes.txt");
    }

    #[test]
    fn test_key_roundtrip_absolute() {
        let root = Path::new("/data/root");
        let key = PathKey::from_absolute(Path::new("/data/root/x/y"), root, false).unwrap();
        assert_eq!(key.as_str(), "x/y");
        assert_eq!(key.to_absolute(root), PathBuf::from("/data/root/x/y"));
    }

    #[test]
    fn test_ancestor() {
        let a = PathKey::new("a");
        let ab = PathKey::new("a/b");
        let abc = PathKey::new("a/b/c");
        let ax = PathKey::new("a-other");
        assert!(a.is_ancestor_of(&ab));
        assert!(a.is_ancestor_of(&abc));
        assert!(ab.is_ancestor_of(&abc));
        assert!(!ab.is_ancestor_of(&a));
        assert!(!a.is_ancestor_of(&ax));
        assert!(!a.is_ancestor_of(&a));
    }

    #[test]
    fn test_parse_local_absolute() {
        let ep = Endpoint::parse("/home/user/docs");
        assert!(!ep.is_remote());
        assert_eq!(ep.path(), Path::new("/home/user/docs"));
    }

    #[test]
    fn test_parse_remote_with_user() {
        let ep = Endpoint::parse("nick@server:/home/nick/docs");
        assert!(ep.is_remote());
        match ep {
            Endpoint::Remote { host, user, path } => {
                assert_eq!(host, "server");
                assert_eq!(user, Some("nick".to_string()));
                assert_eq!(path, PathBuf::from("/home/nick/docs"));
            }
            _ => panic!("Expected remote endpoint"),
        }
    }

    #[test]
    fn test_parse_remote_without_user() {
        let ep = Endpoint::parse("server:/srv/share");
        match ep {
            Endpoint::Remote { host, user, .. } => {
                assert_eq!(host, "server");
                assert_eq!(user, None);
            }
            _ => panic!("Expected remote endpoint"),
        }
    }

    #[test]
    fn test_parse_windows_drive_letter() {
        let ep = Endpoint::parse("C:/Users/nick");
        assert!(!ep.is_remote());
    }

    #[test]
    fn test_display_roundtrip() {
        let ep = Endpoint::parse("nick@server:/home/nick/docs");
        assert_eq!(ep.to_string(), "nick@server:/home/nick/docs");
    }
}
