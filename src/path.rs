//! Namespace paths.
//!
//! A [`NamespacePath`] is an absolute, normalized, `/`-separated path inside
//! the namespace. Normalization collapses repeated separators and `.`
//! components and rejects `..` escapes above the root.
//!
//! ```
//! use canopy::path::NamespacePath;
//!
//! let path = NamespacePath::new("/data//logs/./today.log").unwrap();
//! assert_eq!(path.as_str(), "/data/logs/today.log");
//! assert_eq!(path.name(), "today.log");
//! assert_eq!(path.parent().unwrap().as_str(), "/data/logs");
//! assert_eq!(path.depth(), 3);
//! ```

use crate::error::{CanopyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator used by namespace paths.
pub const SEPARATOR: char = '/';

/// An absolute path within the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacePath(String);

impl NamespacePath {
    /// The root path.
    pub fn root() -> Self {
        NamespacePath(SEPARATOR.to_string())
    }

    /// Parse and normalize a path.
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let raw = path.as_ref();
        if !raw.starts_with(SEPARATOR) {
            return Err(CanopyError::InvalidPath(format!(
                "Path {} is not absolute",
                raw
            )));
        }
        if raw.bytes().any(|b| b == 0 || b < 32) {
            return Err(CanopyError::InvalidPath(format!(
                "Path {:?} contains control characters",
                raw
            )));
        }

        let mut components: Vec<&str> = Vec::new();
        for component in raw.split(SEPARATOR) {
            match component {
                "" | "." => {}
                ".." => {
                    if components.pop().is_none() {
                        return Err(CanopyError::InvalidPath(format!(
                            "Path {} escapes the root",
                            raw
                        )));
                    }
                }
                name => components.push(name),
            }
        }

        if components.is_empty() {
            return Ok(Self::root());
        }
        Ok(NamespacePath(format!("/{}", components.join("/"))))
    }

    /// Whether this is the root path.
    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// The path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path components below the root, in order.
    pub fn components(&self) -> Vec<&str> {
        if self.is_root() {
            return Vec::new();
        }
        self.0[1..].split(SEPARATOR).collect()
    }

    /// Number of components below the root.
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches(SEPARATOR).count()
        }
    }

    /// Final component; empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind(SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => "",
        }
    }

    /// Parent path, or `None` for the root.
    pub fn parent(&self) -> Option<NamespacePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(SEPARATOR) {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(NamespacePath(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Append one component.
    pub fn join(&self, name: &str) -> Result<NamespacePath> {
        if name.is_empty() || name.contains(SEPARATOR) || name == "." || name == ".." {
            return Err(CanopyError::InvalidPath(format!(
                "Invalid path component {:?}",
                name
            )));
        }
        if self.is_root() {
            Ok(NamespacePath(format!("/{}", name)))
        } else {
            Ok(NamespacePath(format!("{}/{}", self.0, name)))
        }
    }

    /// Prefix of the first `depth` components.
    pub fn prefix(&self, depth: usize) -> NamespacePath {
        let components = self.components();
        if depth == 0 || components.is_empty() {
            return Self::root();
        }
        let take = depth.min(components.len());
        NamespacePath(format!("/{}", components[..take].join("/")))
    }

    /// Whether `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &NamespacePath) -> bool {
        if self == other {
            return false;
        }
        if self.is_root() {
            return true;
        }
        other.0.starts_with(&self.0) && other.0.as_bytes().get(self.0.len()) == Some(&b'/')
    }

    /// Whether `self` equals `other` or is an ancestor of it.
    pub fn is_prefix_of(&self, other: &NamespacePath) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    /// Remainder of `self` below `ancestor`, without a leading separator.
    ///
    /// Returns `None` when `ancestor` is not a prefix of `self`.
    pub fn strip_prefix(&self, ancestor: &NamespacePath) -> Option<&str> {
        if ancestor == self {
            return Some("");
        }
        if !ancestor.is_ancestor_of(self) {
            return None;
        }
        if ancestor.is_root() {
            Some(&self.0[1..])
        } else {
            Some(&self.0[ancestor.0.len() + 1..])
        }
    }

    /// Depth of the deepest common ancestor with `other`.
    pub fn common_depth(&self, other: &NamespacePath) -> usize {
        self.components()
            .iter()
            .zip(other.components().iter())
            .take_while(|(a, b)| a == b)
            .count()
    }
}

impl fmt::Display for NamespacePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NamespacePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Join an under storage base path with a relative suffix.
pub fn join_ufs_path(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches(SEPARATOR);
    if relative.is_empty() {
        return base.to_string();
    }
    if base.ends_with(SEPARATOR) {
        format!("{}{}", base, relative)
    } else {
        format!("{}/{}", base, relative)
    }
}

/// Parent of an under storage path, if it has one below the scheme root.
pub fn ufs_parent(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches(SEPARATOR);
    let idx = trimmed.rfind(SEPARATOR)?;
    let parent = &trimmed[..idx];
    if parent.is_empty() {
        return Some(SEPARATOR.to_string());
    }
    if parent.ends_with(':') || parent.ends_with(":/") {
        return None;
    }
    Some(parent.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(NamespacePath::new("/").unwrap(), NamespacePath::root());
        assert_eq!(NamespacePath::new("//a///b/").unwrap().as_str(), "/a/b");
        assert_eq!(NamespacePath::new("/a/../b").unwrap().as_str(), "/b");
        assert!(NamespacePath::new("a/b").is_err());
        assert!(NamespacePath::new("/..").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        let path = NamespacePath::new("/a/b/c").unwrap();
        assert_eq!(path.name(), "c");
        assert_eq!(path.parent().unwrap().as_str(), "/a/b");
        assert_eq!(NamespacePath::new("/a").unwrap().parent().unwrap(), NamespacePath::root());
        assert!(NamespacePath::root().parent().is_none());
        assert_eq!(NamespacePath::root().name(), "");
    }

    #[test]
    fn test_ancestry() {
        let a = NamespacePath::new("/a").unwrap();
        let ab = NamespacePath::new("/a/b").unwrap();
        let abc = NamespacePath::new("/abc").unwrap();
        assert!(a.is_ancestor_of(&ab));
        assert!(!a.is_ancestor_of(&abc));
        assert!(!a.is_ancestor_of(&a));
        assert!(a.is_prefix_of(&a));
        assert!(NamespacePath::root().is_ancestor_of(&a));
        assert_eq!(ab.strip_prefix(&a), Some("b"));
        assert_eq!(ab.strip_prefix(&NamespacePath::root()), Some("a/b"));
        assert_eq!(abc.strip_prefix(&a), None);
    }

    #[test]
    fn test_prefix_and_common_depth() {
        let path = NamespacePath::new("/a/b/c").unwrap();
        assert_eq!(path.prefix(0), NamespacePath::root());
        assert_eq!(path.prefix(2).as_str(), "/a/b");
        assert_eq!(path.depth(), 3);
        let other = NamespacePath::new("/a/b/d/e").unwrap();
        assert_eq!(path.common_depth(&other), 2);
    }

    #[test]
    fn test_join() {
        let root = NamespacePath::root();
        assert_eq!(root.join("x").unwrap().as_str(), "/x");
        assert!(root.join("a/b").is_err());
        assert!(root.join("..").is_err());
    }

    #[test]
    fn test_ufs_helpers() {
        assert_eq!(join_ufs_path("mem://bucket", "a/b"), "mem://bucket/a/b");
        assert_eq!(join_ufs_path("mem://bucket/", "/a"), "mem://bucket/a");
        assert_eq!(join_ufs_path("/tmp/root", ""), "/tmp/root");
        assert_eq!(ufs_parent("mem://bucket/a/b").as_deref(), Some("mem://bucket/a"));
        assert_eq!(ufs_parent("/tmp/a").as_deref(), Some("/tmp"));
        assert_eq!(ufs_parent("/tmp").as_deref(), Some("/"));
    }
}
