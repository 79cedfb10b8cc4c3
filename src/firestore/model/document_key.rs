use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

/// Path to a single document. Always an even, non-zero number of segments,
/// except for the internal empty key used as a lower bound.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(invalid_argument(format!(
                "Invalid document reference. Document references must have an even number of segments, but {path} has {}.",
                path.len()
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    /// Sorts before every real key.
    pub(crate) fn empty() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    /// Key for an arbitrary path, used as a range-scan lower bound.
    pub(crate) fn from_path_unchecked(path: ResourcePath) -> Self {
        Self { path }
    }

    pub fn is_document_key(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// Id of the immediate parent collection.
    pub fn collection_group(&self) -> &str {
        self.path
            .segment(self.path.len().saturating_sub(2))
            .unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.path.len() >= 2 && self.collection_group() == collection_id
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path.canonical_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_even_segments() {
        let err = DocumentKey::from_string("cities").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn parses_valid_path() {
        let key = DocumentKey::from_string("cities/sf/landmarks/bridge").unwrap();
        assert_eq!(key.id(), "bridge");
        assert_eq!(key.collection_group(), "landmarks");
        assert_eq!(key.collection_path().canonical_string(), "cities/sf/landmarks");
        assert!(DocumentKey::empty() < key);
    }
}
