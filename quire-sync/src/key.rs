//! Hierarchical storage keys.
//!
//! A key is an ordered list of path segments, e.g. `[doc_id, "snapshot", chunk_id]`.
//! Keys are flattened to a single string with [`SEPARATOR`] for the backend
//! and for cache indexing:
//!
//! ```text
//! ["3f9c…", "incremental", "a1b2…"]  ──►  "3f9c…/incremental/a1b2…"
//! ```
//!
//! Joining is only reversible if no segment contains the separator, so such
//! segments (and empty ones) are rejected when the key is built.

use std::fmt;

/// Separator used when joining segments.
pub const SEPARATOR: char = '/';

/// Key construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("storage key segment {index} is empty")]
    EmptySegment { index: usize },
    #[error("storage key segment {index} contains the separator: {segment:?}")]
    ContainsSeparator { index: usize, segment: String },
}

/// An ordered sequence of path segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StorageKey {
    segments: Vec<String>,
}

impl StorageKey {
    /// Build a key from its segments.
    pub fn new<I, S>(segments: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for (index, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(KeyError::EmptySegment { index });
            }
            if segment.contains(SEPARATOR) {
                return Err(KeyError::ContainsSeparator {
                    index,
                    segment: segment.clone(),
                });
            }
        }
        Ok(Self { segments })
    }

    /// The empty key, a prefix of every key.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a joined key string back into segments.
    pub fn parse(joined: &str) -> Result<Self, KeyError> {
        if joined.is_empty() {
            return Ok(Self::root());
        }
        Self::new(joined.split(SEPARATOR))
    }

    /// Append a segment, returning the extended key.
    pub fn child(&self, segment: impl Into<String>) -> Result<Self, KeyError> {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self::new(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Flatten to the backend/cache representation.
    pub fn join(&self) -> String {
        let mut out = String::new();
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            out.push_str(segment);
        }
        out
    }

    /// Whether `self`'s segments are a prefix of `other`'s.
    ///
    /// A key is a prefix of itself.
    pub fn is_prefix_of(&self, other: &StorageKey) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.join())
    }
}

/// String form of the "children of `prefix`" scan used against backends.
///
/// Returns `""` for the root key so a scan covers everything.
pub(crate) fn descendant_prefix(prefix: &StorageKey) -> String {
    if prefix.is_empty() {
        String::new()
    } else {
        let mut joined = prefix.join();
        joined.push(SEPARATOR);
        joined
    }
}

/// Whether a joined key string lies under `prefix` (segment-aware).
pub(crate) fn joined_is_under(joined: &str, prefix: &StorageKey) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let head = prefix.join();
    match joined.strip_prefix(head.as_str()) {
        Some(rest) => rest.is_empty() || rest.starts_with(SEPARATOR),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_parse() {
        let key = StorageKey::new(["doc1", "incremental", "abc"]).unwrap();
        assert_eq!(key.join(), "doc1/incremental/abc");
        assert_eq!(StorageKey::parse("doc1/incremental/abc").unwrap(), key);
        assert_eq!(key.to_string(), "doc1/incremental/abc");
    }

    #[test]
    fn test_rejects_separator_in_segment() {
        let err = StorageKey::new(["doc/1", "snapshot"]).unwrap_err();
        assert_eq!(
            err,
            KeyError::ContainsSeparator { index: 0, segment: "doc/1".into() }
        );
    }

    #[test]
    fn test_rejects_empty_segment() {
        let err = StorageKey::new(["doc", ""]).unwrap_err();
        assert_eq!(err, KeyError::EmptySegment { index: 1 });
        assert!(StorageKey::parse("doc//x").is_err());
    }

    #[test]
    fn test_prefix_is_segment_aware() {
        let prefix = StorageKey::new(["ab"]).unwrap();
        let child = StorageKey::new(["ab", "snapshot"]).unwrap();
        let sibling = StorageKey::new(["abc", "snapshot"]).unwrap();

        assert!(prefix.is_prefix_of(&child));
        assert!(prefix.is_prefix_of(&prefix));
        assert!(!prefix.is_prefix_of(&sibling));

        assert!(joined_is_under("ab/snapshot", &prefix));
        assert!(joined_is_under("ab", &prefix));
        assert!(!joined_is_under("abc/snapshot", &prefix));
    }

    #[test]
    fn test_root_prefix_matches_everything() {
        let root = StorageKey::root();
        assert!(root.is_prefix_of(&StorageKey::new(["x"]).unwrap()));
        assert!(joined_is_under("anything/at/all", &root));
        assert_eq!(descendant_prefix(&root), "");
        assert_eq!(StorageKey::parse("").unwrap(), root);
    }

    #[test]
    fn test_child() {
        let doc = StorageKey::new(["doc"]).unwrap();
        let snap = doc.child("snapshot").unwrap();
        assert_eq!(snap.segments(), &["doc".to_string(), "snapshot".to_string()]);
        assert!(doc.child("a/b").is_err());
        assert_eq!(descendant_prefix(&doc), "doc/");
    }
}
