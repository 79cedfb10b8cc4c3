use std::collections::BTreeSet;

use crate::firestore::model::DocumentKey;

/// Bidirectional index of (document, id) references, where the id is a target
/// id or a mutation batch id.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references(&mut self, keys: impl IntoIterator<Item = DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key, id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&(key.clone(), id));
    }

    pub fn remove_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the affected keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> BTreeSet<DocumentKey> {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) -> BTreeSet<DocumentKey> {
        self.by_id.clear();
        std::mem::take(&mut self.by_key)
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(ref_id, _)| *ref_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .next()
            .is_some_and(|(found, _)| found == key)
    }
}
