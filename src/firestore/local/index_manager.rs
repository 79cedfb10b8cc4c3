use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound as RangeBound;

use crate::firestore::core::query::{Direction, FilterOperator};
use crate::firestore::core::target::{IndexType, Target};
use crate::firestore::model::{
    DocumentKey, FieldIndex, FieldPath, IndexKind, IndexSegment, MutableDocument, ResourcePath,
};
use crate::firestore::value::{compare_values, FirestoreValue};

/// Indexed value ordered with the Firestore value ordering.
#[derive(Clone, Debug)]
struct IndexValue(FirestoreValue);

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(&self.0, &other.0)
    }
}

type IndexEntry = (IndexValue, DocumentKey);

#[derive(Debug)]
struct IndexState {
    index: FieldIndex,
    entries: BTreeSet<IndexEntry>,
    values_by_key: BTreeMap<DocumentKey, Vec<IndexValue>>,
}

impl IndexState {
    fn leading_segment(&self) -> Option<&IndexSegment> {
        self.index.segments.first()
    }

    fn remove_document(&mut self, key: &DocumentKey) {
        if let Some(values) = self.values_by_key.remove(key) {
            for value in values {
                self.entries.remove(&(value, key.clone()));
            }
        }
    }

    fn add_document(&mut self, doc: &MutableDocument) {
        let Some(segment) = self.leading_segment() else {
            return;
        };
        if !doc.is_found_document() {
            return;
        }
        let Some(value) = doc.field(&segment.field_path) else {
            return;
        };
        let values: Vec<IndexValue> = match segment.kind {
            IndexKind::Contains => match value.as_array() {
                Some(array) => array.values().iter().cloned().map(IndexValue).collect(),
                None => return,
            },
            IndexKind::Ascending | IndexKind::Descending => vec![IndexValue(value.clone())],
        };
        for value in &values {
            self.entries.insert((value.clone(), doc.key().clone()));
        }
        self.values_by_key.insert(doc.key().clone(), values);
    }

    fn keys_equal_to(&self, value: &FirestoreValue) -> impl Iterator<Item = &DocumentKey> {
        let lower = (IndexValue(value.clone()), DocumentKey::empty());
        let probe = IndexValue(value.clone());
        self.entries
            .range((RangeBound::Included(lower), RangeBound::Unbounded))
            .take_while(move |(candidate, _)| *candidate == probe)
            .map(|(_, key)| key)
    }

    /// Candidate keys for one filter on the leading segment.
    fn scan(&self, op: FilterOperator, value: &FirestoreValue) -> BTreeSet<DocumentKey> {
        let probe = IndexValue(value.clone());
        match op {
            FilterOperator::Equal | FilterOperator::ArrayContains => self.keys_equal_to(value).cloned().collect(),
            FilterOperator::In | FilterOperator::ArrayContainsAny => value
                .as_array()
                .map(|array| {
                    array
                        .values()
                        .iter()
                        .flat_map(|element| self.keys_equal_to(element).cloned().collect::<Vec<_>>())
                        .collect()
                })
                .unwrap_or_default(),
            FilterOperator::GreaterThan | FilterOperator::GreaterThanOrEqual => {
                let lower = (probe.clone(), DocumentKey::empty());
                self.entries
                    .range((RangeBound::Included(lower), RangeBound::Unbounded))
                    .filter(|(candidate, _)| op == FilterOperator::GreaterThanOrEqual || *candidate != probe)
                    .map(|(_, key)| key.clone())
                    .collect()
            }
            FilterOperator::LessThan | FilterOperator::LessThanOrEqual => self
                .entries
                .iter()
                .take_while(|(candidate, _)| match candidate.cmp(&probe) {
                    Ordering::Less => true,
                    Ordering::Equal => op == FilterOperator::LessThanOrEqual,
                    Ordering::Greater => false,
                })
                .map(|(_, key)| key.clone())
                .collect(),
            FilterOperator::NotEqual | FilterOperator::NotIn => {
                self.entries.iter().map(|(_, key)| key.clone()).collect()
            }
        }
    }
}

/// Collection-parent index plus client-side field indexes.
///
/// Field indexes cover remote documents only and are kept current as documents
/// enter or leave the remote cache. Only the leading segment narrows candidates;
/// results are always re-matched against the query.
#[derive(Debug, Default)]
pub struct IndexManager {
    collection_parents: BTreeMap<String, BTreeSet<ResourcePath>>,
    indexes: BTreeMap<i32, IndexState>,
    next_index_id: i32,
}

impl IndexManager {
    pub fn new() -> Self {
        Self {
            next_index_id: 1,
            ..Self::default()
        }
    }

    /// Records the parent of `collection_path` so collection-group queries can
    /// enumerate it.
    pub fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) {
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        self.collection_parents
            .entry(collection_id.to_string())
            .or_default()
            .insert(collection_path.without_last());
    }

    /// Drops every collection parent and index entry, then re-indexes
    /// `documents`. Field index definitions are kept.
    pub fn rebuild<'a>(&mut self, documents: impl IntoIterator<Item = &'a MutableDocument>) {
        self.collection_parents.clear();
        for state in self.indexes.values_mut() {
            state.entries.clear();
            state.values_by_key.clear();
        }
        for doc in documents {
            self.add_to_collection_parent_index(&doc.key().collection_path());
            for state in self.indexes.values_mut() {
                if state.index.collection_group == doc.key().collection_group() {
                    state.add_document(doc);
                }
            }
        }
    }

    pub fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers `index`, assigning an id when it carries none. Returns the id,
    /// or `None` when an index of the same shape already exists.
    pub fn add_field_index(&mut self, mut index: FieldIndex) -> Option<i32> {
        if self.indexes.values().any(|state| state.index.has_same_shape(&index)) {
            return None;
        }
        if index.index_id <= 0 || self.indexes.contains_key(&index.index_id) {
            index.index_id = self.next_index_id;
        }
        self.next_index_id = self.next_index_id.max(index.index_id + 1);
        let id = index.index_id;
        log::debug!("adding field index {id} on {}", index.collection_group);
        self.indexes.insert(
            id,
            IndexState {
                index,
                entries: BTreeSet::new(),
                values_by_key: BTreeMap::new(),
            },
        );
        Some(id)
    }

    pub fn delete_field_index(&mut self, index_id: i32) {
        self.indexes.remove(&index_id);
    }

    pub fn delete_all_field_indexes(&mut self) {
        self.indexes.clear();
    }

    pub fn get_field_indexes(&self, collection_group: &str) -> Vec<FieldIndex> {
        self.indexes
            .values()
            .filter(|state| state.index.collection_group == collection_group)
            .map(|state| state.index.clone())
            .collect()
    }

    pub fn field_index_count(&self) -> usize {
        self.indexes.len()
    }

    /// Index that would serve `target` from the client, built from its
    /// array-contains filter, equality filters and order-bys.
    pub fn index_for_target(target: &Target) -> Option<FieldIndex> {
        let mut segments: Vec<IndexSegment> = Vec::new();
        let mut seen: BTreeSet<FieldPath> = BTreeSet::new();
        let mut push = |segments: &mut Vec<IndexSegment>, field: &FieldPath, kind: IndexKind| {
            if !field.is_key_field() && seen.insert(field.clone()) {
                segments.push(IndexSegment {
                    field_path: field.clone(),
                    kind,
                });
            }
        };
        for filter in &target.filters {
            if matches!(filter.op, FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny) {
                push(&mut segments, &filter.field, IndexKind::Contains);
            }
        }
        for filter in &target.filters {
            if matches!(filter.op, FilterOperator::Equal | FilterOperator::In) {
                push(&mut segments, &filter.field, IndexKind::Ascending);
            }
        }
        for order in &target.order_by {
            let kind = match order.direction {
                Direction::Ascending => IndexKind::Ascending,
                Direction::Descending => IndexKind::Descending,
            };
            push(&mut segments, &order.field, kind);
        }
        if segments.is_empty() {
            return None;
        }
        Some(FieldIndex::new(0, target.collection_group_id(), segments))
    }

    /// Creates an index covering `target` unless one of the same shape exists.
    pub fn create_target_indexes(&mut self, target: &Target) -> Option<i32> {
        let index = Self::index_for_target(target)?;
        self.add_field_index(index)
    }

    pub fn get_index_type(&self, target: &Target) -> IndexType {
        let Some(state) = self.usable_index(target) else {
            return IndexType::None;
        };
        let covered: BTreeSet<&FieldPath> = state.index.segments.iter().map(|s| &s.field_path).collect();
        let fully_covered = target.filters.iter().all(|f| covered.contains(&f.field))
            && target
                .order_by
                .iter()
                .all(|o| o.field.is_key_field() || covered.contains(&o.field));
        if fully_covered {
            IndexType::Full
        } else {
            IndexType::Partial
        }
    }

    /// Keys of remote documents that may match `target`, or `None` when no
    /// index applies.
    pub fn get_documents_matching_target(&self, target: &Target) -> Option<BTreeSet<DocumentKey>> {
        let state = self.usable_index(target)?;
        let segment = state.leading_segment()?;
        let mut candidates: Option<BTreeSet<DocumentKey>> = None;
        for filter in target.filters.iter().filter(|f| Self::filter_uses_segment(f.op, &f.field, segment)) {
            let keys = state.scan(filter.op, &filter.value);
            candidates = Some(match candidates {
                Some(existing) => existing.intersection(&keys).cloned().collect(),
                None => keys,
            });
        }
        let candidates = candidates?;
        Some(
            candidates
                .into_iter()
                .filter(|key| match &target.collection_group {
                    Some(_) => target.path.is_prefix_of(key.path()),
                    None => target.path.is_immediate_parent_of(key.path()),
                })
                .collect(),
        )
    }

    /// Refreshes index entries for changed remote documents.
    pub fn update_index_entries<'a>(&mut self, documents: impl IntoIterator<Item = &'a MutableDocument>) {
        if self.indexes.is_empty() {
            return;
        }
        for doc in documents {
            let group = doc.key().collection_group().to_string();
            for state in self.indexes.values_mut() {
                if state.index.collection_group != group {
                    continue;
                }
                state.remove_document(doc.key());
                state.add_document(doc);
            }
        }
    }

    pub fn remove_index_entries(&mut self, key: &DocumentKey) {
        for state in self.indexes.values_mut() {
            state.remove_document(key);
        }
    }

    fn usable_index(&self, target: &Target) -> Option<&IndexState> {
        if target.is_document_target() {
            return None;
        }
        let group = target.collection_group_id();
        self.indexes
            .values()
            .filter(|state| state.index.collection_group == group)
            .find(|state| {
                state.leading_segment().is_some_and(|segment| {
                    target
                        .filters
                        .iter()
                        .any(|f| Self::filter_uses_segment(f.op, &f.field, segment))
                })
            })
    }

    fn filter_uses_segment(op: FilterOperator, field: &FieldPath, segment: &IndexSegment) -> bool {
        if &segment.field_path != field {
            return false;
        }
        let array_filter = matches!(op, FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny);
        array_filter == (segment.kind == IndexKind::Contains)
    }
}
