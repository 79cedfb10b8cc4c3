use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{canonical_id, compare_values, type_order, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn takes_array(&self) -> bool {
        matches!(
            self,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        )
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

/// A single `field op value` constraint.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: FilterOperator,
    pub value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    /// Validated constructor used by the public query builder.
    pub fn try_new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.takes_array() && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "Invalid Query. A non-empty array is required for '{}' filters.",
                op.as_str()
            )));
        }
        if field.is_key_field() {
            let references_ok = match (op.takes_array(), value.as_array()) {
                (true, Some(array)) => array.values().iter().all(|v| key_from_reference(v).is_some()),
                _ => key_from_reference(&value).is_some(),
            };
            if !references_ok || matches!(op, FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny) {
                return Err(invalid_argument(
                    "Invalid Query. Filters on the document id require document reference values.",
                ));
            }
        }
        Ok(Self::new(field, op, value))
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            canonical_id(&self.value)
        )
    }

    pub fn matches(&self, doc: &MutableDocument) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(doc.key());
        }
        let other = doc.field(&self.field);
        match self.op {
            FilterOperator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .is_some_and(|array| array.contains(&self.value)),
            FilterOperator::ArrayContainsAny => {
                let (Some(array), Some(needles)) = (other.and_then(FirestoreValue::as_array), self.value.as_array())
                else {
                    return false;
                };
                needles.values().iter().any(|needle| array.contains(needle))
            }
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => candidates.contains(other),
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                match other {
                    Some(other) => !other.is_null() && !candidates.contains(other),
                    None => false,
                }
            }
            FilterOperator::NotEqual => match other {
                Some(other) => !other.is_null() && self.op.matches_comparison(compare_values(other, &self.value)),
                None => false,
            },
            _ => match other {
                Some(other) => {
                    type_order(other) == type_order(&self.value)
                        && self.op.matches_comparison(compare_values(other, &self.value))
                }
                None => false,
            },
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            FilterOperator::In | FilterOperator::NotIn => {
                let contained = self
                    .value
                    .as_array()
                    .map(|array| array.values().iter().any(|v| key_from_reference(v).as_ref() == Some(key)))
                    .unwrap_or(false);
                if self.op == FilterOperator::In {
                    contained
                } else {
                    !contained
                }
            }
            _ => match key_from_reference(&self.value) {
                Some(other) => self.op.matches_comparison(key.cmp(&other)),
                None => false,
            },
        }
    }
}

/// Extracts the document key from a fully qualified reference value.
pub fn key_from_reference(value: &FirestoreValue) -> Option<DocumentKey> {
    let ValueKind::Reference(name) = value.kind() else {
        return None;
    };
    let (_, path) = name.split_once("/documents/")?;
    DocumentKey::from_string(path).ok()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }

    fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (l, r) => l.is_some().cmp(&r.is_some()),
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

/// Cursor position. `inclusive` start bounds are `startAt`, exclusive ones
/// `startAfter`; for end bounds `endAt` and `endBefore` respectively.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { position, inclusive }
    }

    /// Compares the bound to `doc` under `order_by`.
    pub fn compare_to_document(&self, order_by: &[OrderBy], doc: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_key_field() {
                match key_from_reference(component) {
                    Some(key) => key.cmp(doc.key()),
                    None => Ordering::Equal,
                }
            } else {
                match doc.field(&order.field) {
                    Some(value) => compare_values(component, value),
                    None => Ordering::Greater,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

impl LimitType {
    fn as_str(&self) -> &'static str {
        match self {
            LimitType::First => "F",
            LimitType::Last => "L",
        }
    }
}

pub type DocumentComparator = Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// User-facing query over a collection, a collection group or a single document.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the collection (odd-length path) or document (even-length path) at `path`.
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 == 0 {
            return Err(invalid_argument(
                "Queries must reference a collection (odd number of path segments)",
            ));
        }
        Ok(Self::new(path))
    }

    pub fn collection_group(collection_id: impl Into<String>) -> FirestoreResult<Self> {
        let collection_id = collection_id.into();
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(format!(
                "Invalid collection ID '{collection_id}'. Collection IDs must not contain '/'."
            )));
        }
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id);
        Ok(query)
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    /// Limit-to-first query equivalent to `target`, as a backend evaluates it.
    pub fn from_target(target: &Target) -> Self {
        Self {
            path: target.path.clone(),
            collection_group: target.collection_group.clone(),
            filters: target.filters.clone(),
            explicit_order_by: target.order_by.clone(),
            limit: target.limit,
            limit_type: LimitType::First,
            start_at: target.start_at.clone(),
            end_at: target.end_at.clone(),
        }
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: FieldPath, direction: Direction) -> Self {
        self.explicit_order_by.push(OrderBy::new(field, direction));
        self
    }

    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn without_limit(mut self) -> Self {
        self.limit = None;
        self.limit_type = LimitType::First;
        self
    }

    pub fn start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Re-roots a collection group query at one concrete collection.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    /// True when the query returns every document of its collection unordered.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1 && self.explicit_order_by[0].field.is_key_field()))
    }

    pub fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .filter(|f| f.op.is_inequality())
            .map(|f| f.field.clone())
            .collect()
    }

    /// Explicit order-bys, then inequality fields not yet ordered, then the key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|o| o.field.clone()).collect();
        let last_direction = result.last().map(|o| o.direction).unwrap_or(Direction::Ascending);
        for field in self.inequality_fields() {
            if !seen.contains(&field) && !field.is_key_field() {
                seen.insert(field.clone());
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::key_field()) {
            result.push(OrderBy::new(FieldPath::key_field(), last_direction));
        }
        result
    }

    pub fn matches(&self, doc: &MutableDocument) -> bool {
        doc.is_found_document()
            && self.matches_path(doc.key())
            && self.matches_order_by(doc)
            && self.filters.iter().all(|f| f.matches(doc))
            && self.to_target().matches_bounds(doc)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        let doc_path = key.path();
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, doc: &MutableDocument) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|o| o.field.is_key_field() || doc.field(&o.field).is_some())
    }

    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left, right| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|o| OrderBy::new(o.field, o.direction.flipped()))
                    .collect(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        format!("{}|lt:{}", self.to_target().canonical_id(), self.limit_type.as_str())
    }
}
