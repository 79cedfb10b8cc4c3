use std::cmp::Ordering;

use crate::firestore::constants::INITIAL_LARGEST_BATCH_ID;
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Ascending,
    Descending,
    /// One entry per array element.
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

/// Client-side index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
}

impl FieldIndex {
    pub fn new(index_id: i32, collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id,
            collection_group: collection_group.into(),
            segments,
        }
    }

    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments.iter().find(|s| s.kind == IndexKind::Contains)
    }

    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments.iter().filter(|s| s.kind != IndexKind::Contains)
    }

    /// Same collection group and segments, ignoring the id.
    pub fn has_same_shape(&self, other: &FieldIndex) -> bool {
        self.collection_group == other.collection_group && self.segments == other.segments
    }
}

/// Position in the remote document cache: documents are ordered by read time,
/// then key, then the largest batch id applied to them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: DocumentKey,
    pub largest_batch_id: i32,
}

impl IndexOffset {
    pub fn min() -> Self {
        Self {
            read_time: SnapshotVersion::min(),
            document_key: DocumentKey::empty(),
            largest_batch_id: INITIAL_LARGEST_BATCH_ID,
        }
    }

    pub fn from_document(doc: &MutableDocument) -> Self {
        Self {
            read_time: doc.read_time(),
            document_key: doc.key().clone(),
            largest_batch_id: INITIAL_LARGEST_BATCH_ID,
        }
    }

    /// Offset that sorts after every document read at `read_time`.
    pub fn successor_of_read_time(read_time: SnapshotVersion, largest_batch_id: i32) -> Self {
        let ts = read_time.timestamp();
        let successor = if ts.nanos == 999_999_999 {
            Timestamp::new(ts.seconds + 1, 0)
        } else {
            Timestamp::new(ts.seconds, ts.nanos + 1)
        };
        Self {
            read_time: SnapshotVersion::new(successor),
            document_key: DocumentKey::empty(),
            largest_batch_id,
        }
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.read_time
            .cmp(&other.read_time)
            .then_with(|| self.document_key.cmp(&other.document_key))
            .then_with(|| self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_sorts_after_documents_at_read_time() {
        let read_time = SnapshotVersion::new(Timestamp::new(5, 999_999_999));
        let doc = MutableDocument::new_no_document(DocumentKey::from_string("c/z").unwrap(), read_time);
        let mut doc = doc;
        doc.set_read_time(read_time);

        let successor = IndexOffset::successor_of_read_time(read_time, -1);
        assert_eq!(successor.read_time.timestamp(), Timestamp::new(6, 0));
        assert!(IndexOffset::from_document(&doc) < successor);
        assert!(IndexOffset::min() < IndexOffset::from_document(&doc));
    }
}
