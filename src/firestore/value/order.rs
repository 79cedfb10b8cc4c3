//! Cross-type ordering, equality and canonical encoding of field values.

use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, ValueKind};

/// Type rank used before any per-type comparison.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp { .. } => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Map(_) => 10,
    }
}

pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (
            ValueKind::ServerTimestamp {
                local_write_time: l, ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r, ..
            },
        ) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.as_slice().cmp(r.as_slice()),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => compare_doubles(l.latitude(), r.latitude())
            .then_with(|| compare_doubles(l.longitude(), r.longitude())),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (lv, rv) in l.values().iter().zip(r.values()) {
                let ordering = compare_values(lv, rv);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.values().len().cmp(&r.values().len())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            for ((lk, lv), (rk, rv)) in l.fields().iter().zip(r.fields()) {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.fields().len().cmp(&r.fields().len())
        }
        _ => {
            let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                return Ordering::Equal;
            };
            compare_doubles(l, r)
        }
    }
}

/// NaN sorts before every other number and equals itself.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments = left.split('/');
    let right_segments = right.split('/');
    for (l, r) in left_segments.clone().zip(right_segments.clone()) {
        let ordering = l.cmp(r);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left_segments.count().cmp(&right_segments.count())
}

/// Strict equality. Integers never equal doubles, `NaN` equals `NaN`, and
/// `-0.0` differs from `0.0`.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            if l.is_nan() && r.is_nan() {
                true
            } else {
                l == r && l.is_sign_negative() == r.is_sign_negative()
            }
        }
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
        (
            ValueKind::ServerTimestamp {
                local_write_time: l, ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r, ..
            },
        ) => l == r,
        (ValueKind::String(l), ValueKind::String(r)) => l == r,
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
        (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l == r,
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.values().len() == r.values().len()
                && l.values().iter().zip(r.values()).all(|(a, b)| values_equal(a, b))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l.fields()
                    .iter()
                    .zip(r.fields())
                    .all(|((lk, lv), (rk, rv))| lk == rk && values_equal(lv, rv))
        }
        _ => false,
    }
}

/// Stable textual form used in target canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(value) => out.push_str(if *value { "true" } else { "false" }),
        ValueKind::Integer(value) => out.push_str(&value.to_string()),
        ValueKind::Double(value) => out.push_str(&value.to_string()),
        ValueKind::Timestamp(ts) => out.push_str(&format!("time({},{})", ts.seconds, ts.nanos)),
        ValueKind::ServerTimestamp {
            local_write_time, ..
        } => out.push_str(&format!(
            "serverTimestamp({},{})",
            local_write_time.seconds, local_write_time.nanos
        )),
        ValueKind::String(value) => out.push_str(value),
        ValueKind::Bytes(bytes) => out.push_str(&bytes.to_base64()),
        ValueKind::Reference(name) => out.push_str(name),
        ValueKind::GeoPoint(point) => {
            out.push_str(&format!("geo({},{})", point.latitude(), point.longitude()))
        }
        ValueKind::Array(array) => {
            out.push('[');
            for (index, element) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(element, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, element)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(element, out);
            }
            out.push('}');
        }
    }
}

/// Approximate in-memory footprint, used for cache size accounting.
pub fn estimate_byte_size(value: &FirestoreValue) -> usize {
    match value.kind() {
        ValueKind::Null | ValueKind::Boolean(_) => 4,
        ValueKind::Integer(_) | ValueKind::Double(_) => 8,
        ValueKind::Timestamp(_) | ValueKind::ServerTimestamp { .. } | ValueKind::GeoPoint(_) => 16,
        ValueKind::String(value) => value.len() * 2,
        ValueKind::Bytes(bytes) => bytes.as_slice().len(),
        ValueKind::Reference(name) => name.len(),
        ValueKind::Array(array) => array.values().iter().map(estimate_byte_size).sum(),
        ValueKind::Map(map) => map
            .fields()
            .iter()
            .map(|(key, value)| key.len() * 2 + estimate_byte_size(value))
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use std::collections::BTreeMap;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-1),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_integer(1),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::server_timestamp(Timestamp::new(0, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
    }

    #[test]
    fn mixed_numbers_compare_but_are_not_equal() {
        let int = FirestoreValue::from_integer(1);
        let double = FirestoreValue::from_double(1.0);
        assert_eq!(compare_values(&int, &double), Ordering::Equal);
        assert!(!values_equal(&int, &double));
        assert!(values_equal(
            &FirestoreValue::from_double(f64::NAN),
            &FirestoreValue::from_double(f64::NAN)
        ));
        assert!(!values_equal(
            &FirestoreValue::from_double(0.0),
            &FirestoreValue::from_double(-0.0)
        ));
    }

    #[test]
    fn canonical_ids_are_structural() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), FirestoreValue::from_integer(2));
        map.insert(
            "a".to_string(),
            FirestoreValue::from_array(vec![FirestoreValue::from_bool(true), FirestoreValue::null()]),
        );
        assert_eq!(canonical_id(&FirestoreValue::from_map(map)), "{a:[true,null],b:2}");
    }

    #[test]
    fn estimates_nested_sizes() {
        let mut map = BTreeMap::new();
        map.insert("ab".to_string(), FirestoreValue::from_string("xyz"));
        map.insert("n".to_string(), FirestoreValue::from_integer(3));
        assert_eq!(estimate_byte_size(&FirestoreValue::from_map(map)), 4 + 6 + 2 + 8);
    }
}
