use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::order::{compare_values, values_equal};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

/// A typed document field value.
#[derive(Clone, Debug)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    /// Locally pending server timestamp. Never sent over the wire; replaced by the
    /// server-assigned time once the write is acknowledged.
    ServerTimestamp {
        local_write_time: Timestamp,
        previous: Option<Box<FirestoreValue>>,
    },
    String(String),
    Bytes(BytesValue),
    /// Fully-qualified document name (`projects/{p}/databases/{d}/documents/...`).
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn from_kind(kind: ValueKind) -> Self {
        Self { kind }
    }

    pub fn null() -> Self {
        Self::from_kind(ValueKind::Null)
    }

    pub fn from_bool(value: bool) -> Self {
        Self::from_kind(ValueKind::Boolean(value))
    }

    pub fn from_integer(value: i64) -> Self {
        Self::from_kind(ValueKind::Integer(value))
    }

    pub fn from_double(value: f64) -> Self {
        Self::from_kind(ValueKind::Double(value))
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self::from_kind(ValueKind::Timestamp(value))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::String(value.into()))
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self::from_kind(ValueKind::Bytes(value))
    }

    pub fn from_reference(name: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::Reference(name.into()))
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self::from_kind(ValueKind::GeoPoint(value))
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Array(ArrayValue::new(values)))
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Map(MapValue::new(map)))
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self::from_kind(ValueKind::Map(map))
    }

    /// Placeholder written locally for a pending `serverTimestamp()` transform.
    pub fn server_timestamp(local_write_time: Timestamp, previous: Option<FirestoreValue>) -> Self {
        // Chained server timestamps keep the oldest non-pending value.
        let previous = match previous {
            Some(value) => match value.kind {
                ValueKind::ServerTimestamp { previous, .. } => previous,
                _ => Some(Box::new(value)),
            },
            None => None,
        };
        Self::from_kind(ValueKind::ServerTimestamp {
            local_write_time,
            previous,
        })
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value as f64),
            ValueKind::Double(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut MapValue> {
        match &mut self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other)
    }
}

impl Eq for FirestoreValue {}

impl PartialOrd for FirestoreValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(compare_values(self, other))
    }
}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        Self::from_double(value)
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_basic_values() {
        let v = FirestoreValue::from_string("hello");
        match v.kind() {
            ValueKind::String(value) => assert_eq!(value, "hello"),
            _ => panic!("unexpected kind"),
        }
        assert_eq!(FirestoreValue::from(3i64).as_f64(), Some(3.0));
    }

    #[test]
    fn nested_server_timestamps_keep_original_previous_value() {
        let original = FirestoreValue::from_integer(1);
        let first = FirestoreValue::server_timestamp(Timestamp::new(1, 0), Some(original.clone()));
        let second = FirestoreValue::server_timestamp(Timestamp::new(2, 0), Some(first));
        match second.kind() {
            ValueKind::ServerTimestamp {
                local_write_time,
                previous,
            } => {
                assert_eq!(*local_write_time, Timestamp::new(2, 0));
                assert_eq!(previous.as_deref(), Some(&original));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }
}
