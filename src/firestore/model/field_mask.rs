use std::collections::BTreeSet;

use crate::firestore::model::FieldPath;

/// Set of field paths touched by a patch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether `path` equals or lies below one of the mask's fields.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with(mut self, extra: impl IntoIterator<Item = FieldPath>) -> Self {
        self.fields.extend(extra);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
