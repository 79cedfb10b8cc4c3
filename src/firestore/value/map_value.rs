use std::collections::BTreeMap;

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// A map of field values. Also serves as the payload of a document, with
/// path-based accessors for nested fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value at `path`, descending through nested maps.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = self;
        for segment in parents {
            current = current.fields.get(segment)?.as_map()?;
        }
        current.fields.get(last)
    }

    /// Writes `value` at `path`, creating (or replacing non-map) intermediate
    /// values as needed.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            let entry = current
                .fields
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map_value(MapValue::empty()));
            if entry.as_map().is_none() {
                *entry = FirestoreValue::from_map_value(MapValue::empty());
            }
            current = match entry.as_map_mut() {
                Some(map) => map,
                None => return,
            };
        }
        current.fields.insert(last.clone(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            current = match current.fields.get_mut(segment).and_then(FirestoreValue::as_map_mut) {
                Some(map) => map,
                None => return,
            };
        }
        current.fields.remove(last);
    }

    /// Applies every entry in order; `None` deletes the field.
    pub fn set_all(&mut self, values: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in values {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Paths of every leaf field. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(self, &mut Vec::new(), &mut paths);
        FieldMask::new(paths)
    }
}

fn collect_leaf_paths(map: &MapValue, prefix: &mut Vec<String>, out: &mut Vec<FieldPath>) {
    for (key, value) in &map.fields {
        prefix.push(key.clone());
        match value.kind() {
            ValueKind::Map(nested) if !nested.is_empty() => collect_leaf_paths(nested, prefix, out),
            _ => {
                if let Ok(path) = FieldPath::new(prefix.iter().cloned()) {
                    out.push(path);
                }
            }
        }
        prefix.pop();
    }
}
