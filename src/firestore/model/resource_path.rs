use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Slash-separated path to a collection or document, relative to the database root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        if path.contains("//") {
            return Err(invalid_argument(format!(
                "Invalid path ({path}). Paths must not contain // in them."
            )));
        }
        Ok(Self::from_segments(
            path.split('/').filter(|segment| !segment.is_empty()),
        ))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    pub fn first_segment(&self) -> Option<&str> {
        self.segment(0)
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn append(&self, other: &ResourcePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    pub fn without_last(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    pub fn without_first(&self, count: usize) -> Self {
        Self {
            segments: self.segments.iter().skip(count).cloned().collect(),
        }
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.len() <= other.len() && self.segments.iter().zip(&other.segments).all(|(l, r)| l == r)
    }

    /// Whether `other` is exactly one segment longer and starts with `self`.
    pub fn is_immediate_parent_of(&self, other: &Self) -> bool {
        self.len() + 1 == other.len() && self.is_prefix_of(other)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        for (l, r) in self.segments.iter().zip(&other.segments) {
            match l.cmp(r) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        self.len().cmp(&other.len())
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_path() {
        let path = ResourcePath::from_string("cities/sf/neighborhoods/downtown").unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.last_segment(), Some("downtown"));
        assert_eq!(path.canonical_string(), "cities/sf/neighborhoods/downtown");
        assert!(ResourcePath::from_string("").unwrap().is_empty());
    }

    #[test]
    fn rejects_empty_segments() {
        let err = ResourcePath::from_string("cities//sf").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn orders_segment_wise_then_by_length() {
        let a = ResourcePath::from_string("a/b").unwrap();
        let ab = ResourcePath::from_string("a/b/c").unwrap();
        let b = ResourcePath::from_string("a/c").unwrap();
        assert!(a < ab);
        assert!(ab < b);
        assert!(a.is_immediate_parent_of(&ab));
        assert!(!a.is_immediate_parent_of(&b));
    }
}
