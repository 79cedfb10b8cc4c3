use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::firestore::core::query::{DocumentComparator, Query};
use crate::firestore::model::{DocumentKey, MutableDocument};

/// Documents of a view, kept in query order and indexed by key.
///
/// The comparator must be total over distinct keys; query comparators end
/// with the document key so this always holds.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Empty set ordered like `query`.
    pub fn for_query(query: &Query) -> Self {
        Self::new(query.comparator())
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let doc = self.by_key.get(key)?;
        self.position(doc).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    /// Inserts `doc`, replacing any document with the same key.
    pub fn insert(&mut self, doc: MutableDocument) {
        self.remove(doc.key());
        let index = match self.position(&doc) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(doc.key().clone(), doc.clone());
        self.sorted.insert(index, doc);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let existing = self.by_key.remove(key)?;
        if let Ok(index) = self.position(&existing) {
            self.sorted.remove(index);
        }
        Some(existing)
    }

    fn position(&self, doc: &MutableDocument) -> Result<usize, usize> {
        self.sorted.binary_search_by(|probe| self.compare(probe, doc))
    }

    fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        (self.comparator)(left, right).then_with(|| left.key().cmp(right.key()))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Direction;
    use crate::firestore::model::{FieldPath, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn doc(path: &str, sort: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("sort").unwrap(), FirestoreValue::from_integer(sort));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        )
    }

    #[test]
    fn keeps_query_order_across_updates() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by(FieldPath::from_dot_separated("sort").unwrap(), Direction::Descending);
        let mut set = DocumentSet::for_query(&query);
        set.insert(doc("rooms/a", 1));
        set.insert(doc("rooms/b", 3));
        set.insert(doc("rooms/c", 2));
        let order: Vec<String> = set.keys().map(ToString::to_string).collect();
        assert_eq!(order, vec!["rooms/b", "rooms/c", "rooms/a"]);

        set.insert(doc("rooms/a", 5));
        assert_eq!(set.first().unwrap().key().to_string(), "rooms/a");
        assert_eq!(set.len(), 3);
        assert_eq!(set.index_of(&DocumentKey::from_string("rooms/c").unwrap()), Some(2));

        assert!(set.remove(&DocumentKey::from_string("rooms/b").unwrap()).is_some());
        assert_eq!(set.len(), 2);
        assert!(!set.contains(&DocumentKey::from_string("rooms/b").unwrap()));
    }
}
