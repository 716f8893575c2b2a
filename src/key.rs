//! Query keys.
//!
//! A [`QueryKey`] names one cacheable read. Keys are made of one or more string
//! segments so that related reads can be grouped under a common prefix:
//!
//! ```
//! use querysync::QueryKey;
//!
//! let all = QueryKey::new("friendRequestsSent");
//! let page = QueryKey::new("friendRequestsSent").with("page").with(2);
//!
//! assert!(all.is_prefix_of(&page));
//! assert_eq!(page.to_string(), "friendRequestsSent/page/2");
//! ```

use std::fmt;
use std::sync::Arc;

/// An opaque, comparable identifier for one cacheable read.
///
/// Equal keys must denote semantically identical queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    segments: Arc<[Arc<str>]>,
}

impl QueryKey {
    /// Creates a single-segment key.
    #[must_use]
    pub fn new(root: impl ToString) -> Self {
        let root: Arc<str> = Arc::from(root.to_string());
        Self {
            segments: Arc::from([root]),
        }
    }

    /// Returns a new key with `segment` appended.
    #[must_use]
    pub fn with(&self, segment: impl ToString) -> Self {
        let mut segments: Vec<Arc<str>> = self.segments.to_vec();
        segments.push(Arc::from(segment.to_string()));
        Self {
            segments: segments.into(),
        }
    }

    /// The key's segments, root first.
    #[must_use]
    pub fn segments(&self) -> impl ExactSizeIterator<Item = &str> {
        self.segments.iter().map(AsRef::as_ref)
    }

    /// The first segment.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    /// Returns `true` if every segment of `self` leads the segments of `other`.
    ///
    /// A key is a prefix of itself.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl From<&str> for QueryKey {
    fn from(root: &str) -> Self {
        Self::new(root)
    }
}

impl From<String> for QueryKey {
    fn from(root: String) -> Self {
        Self::new(root)
    }
}

impl From<&Self> for QueryKey {
    fn from(key: &Self) -> Self {
        key.clone()
    }
}
