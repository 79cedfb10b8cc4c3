use std::cmp::Ordering;

use crate::firestore::core::query::{Bound, FieldFilter, OrderBy};
use crate::firestore::model::{DocumentKey, MutableDocument, ResourcePath};
use crate::firestore::value::canonical_id;

/// Normalized query as seen by the backend: order-bys are explicit and
/// limit-to-last has been rewritten as a reversed limit-to-first.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<FieldFilter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Target listening to a single document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Collection group the target reads from.
    pub fn collection_group_id(&self) -> &str {
        match &self.collection_group {
            Some(group) => group,
            None => self.path.last_segment().unwrap_or_default(),
        }
    }

    /// Cache key shared by every equivalent target.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(
            &self
                .filters
                .iter()
                .map(FieldFilter::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        id.push_str("|ob:");
        id.push_str(
            &self
                .order_by
                .iter()
                .map(|o| format!("{}{}", o.field.canonical_string(), o.direction.as_str()))
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(if bound.inclusive { "b:" } else { "a:" });
            id.push_str(&canonical_position(bound));
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(if bound.inclusive { "a:" } else { "b:" });
            id.push_str(&canonical_position(bound));
        }
        id
    }

    /// Whether `doc` lies within the target's cursors.
    pub fn matches_bounds(&self, doc: &MutableDocument) -> bool {
        if let Some(start) = &self.start_at {
            let comparison = start.compare_to_document(&self.order_by, doc);
            let before = if start.inclusive {
                comparison != Ordering::Greater
            } else {
                comparison == Ordering::Less
            };
            if !before {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            let comparison = end.compare_to_document(&self.order_by, doc);
            let after = if end.inclusive {
                comparison != Ordering::Less
            } else {
                comparison == Ordering::Greater
            };
            if !after {
                return false;
            }
        }
        true
    }
}

fn canonical_position(bound: &Bound) -> String {
    bound
        .position
        .iter()
        .map(canonical_id)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    None,
    Partial,
    Full,
}
