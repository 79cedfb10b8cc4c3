use serde_json::{json, Value as JsonValue};

use crate::firestore::core::query::{Bound, Direction, FieldFilter, FilterOperator, OrderBy};
use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::FieldPath;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::value::FirestoreValue;

/// `Target` payload of a listen request or the body of a `RunQuery` call.
pub(crate) fn encode_query_target(serializer: &JsonProtoSerializer, target: &Target) -> JsonValue {
    let (parent, collection_id) = match &target.collection_group {
        Some(group) => (target.path.clone(), group.clone()),
        None => (
            target.path.without_last(),
            target.path.last_segment().unwrap_or_default().to_string(),
        ),
    };
    json!({
        "parent": serializer.resource_name(&parent),
        "structuredQuery": encode_structured_query(serializer, target, &collection_id),
    })
}

pub(crate) fn encode_documents_target(serializer: &JsonProtoSerializer, target: &Target) -> JsonValue {
    json!({ "documents": [serializer.resource_name(&target.path)] })
}

fn encode_structured_query(serializer: &JsonProtoSerializer, target: &Target, collection_id: &str) -> JsonValue {
    let mut structured = serde_json::Map::new();
    structured.insert(
        "from".to_string(),
        json!([{
            "collectionId": collection_id,
            "allDescendants": target.collection_group.is_some(),
        }]),
    );

    if !target.filters.is_empty() {
        structured.insert("where".to_string(), encode_filters(serializer, &target.filters));
    }

    if !target.order_by.is_empty() {
        let orders: Vec<_> = target
            .order_by
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field.canonical_string() },
                    "direction": match order.direction {
                        Direction::Ascending => "ASCENDING",
                        Direction::Descending => "DESCENDING",
                    },
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
    }

    if let Some(limit) = target.limit {
        structured.insert("limit".to_string(), json!(limit));
    }
    if let Some(start) = &target.start_at {
        structured.insert("startAt".to_string(), encode_cursor(serializer, start, true));
    }
    if let Some(end) = &target.end_at {
        structured.insert("endAt".to_string(), encode_cursor(serializer, end, false));
    }

    JsonValue::Object(structured)
}

fn encode_filters(serializer: &JsonProtoSerializer, filters: &[FieldFilter]) -> JsonValue {
    if filters.len() == 1 {
        return encode_field_filter(serializer, &filters[0]);
    }
    let nested: Vec<_> = filters
        .iter()
        .map(|filter| encode_field_filter(serializer, filter))
        .collect();
    json!({
        "compositeFilter": {
            "op": "AND",
            "filters": nested
        }
    })
}

fn encode_field_filter(serializer: &JsonProtoSerializer, filter: &FieldFilter) -> JsonValue {
    json!({
        "fieldFilter": {
            "field": { "fieldPath": filter.field.canonical_string() },
            "op": operator_name(filter.op),
            "value": serializer.encode_value(&filter.value)
        }
    })
}

fn encode_cursor(serializer: &JsonProtoSerializer, bound: &Bound, start: bool) -> JsonValue {
    json!({
        "values": bound
            .position
            .iter()
            .map(|value| serializer.encode_value(value))
            .collect::<Vec<_>>(),
        "before": if start { bound.inclusive } else { !bound.inclusive },
    })
}

fn operator_name(op: FilterOperator) -> &'static str {
    match op {
        FilterOperator::LessThan => "LESS_THAN",
        FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        FilterOperator::Equal => "EQUAL",
        FilterOperator::NotEqual => "NOT_EQUAL",
        FilterOperator::GreaterThan => "GREATER_THAN",
        FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        FilterOperator::ArrayContains => "ARRAY_CONTAINS",
        FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        FilterOperator::In => "IN",
        FilterOperator::NotIn => "NOT_IN",
    }
}

fn operator_from_name(name: &str) -> FirestoreResult<FilterOperator> {
    Ok(match name {
        "LESS_THAN" => FilterOperator::LessThan,
        "LESS_THAN_OR_EQUAL" => FilterOperator::LessThanOrEqual,
        "EQUAL" => FilterOperator::Equal,
        "NOT_EQUAL" => FilterOperator::NotEqual,
        "GREATER_THAN" => FilterOperator::GreaterThan,
        "GREATER_THAN_OR_EQUAL" => FilterOperator::GreaterThanOrEqual,
        "ARRAY_CONTAINS" => FilterOperator::ArrayContains,
        "ARRAY_CONTAINS_ANY" => FilterOperator::ArrayContainsAny,
        "IN" => FilterOperator::In,
        "NOT_IN" => FilterOperator::NotIn,
        other => return Err(invalid_argument(format!("Unknown filter operator '{other}'"))),
    })
}

/// Rebuilds a target from a listen request's `query` or `documents` payload.
pub(crate) fn decode_target(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Target> {
    if let Some(documents) = value.get("documents") {
        let names = documents
            .get("documents")
            .or(Some(documents))
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("documents target must list documents"))?;
        let [name] = names.as_slice() else {
            return Err(invalid_argument(format!(
                "DocumentsTarget contained {} documents, expected 1",
                names.len()
            )));
        };
        let name = name
            .as_str()
            .ok_or_else(|| invalid_argument("document names must be strings"))?;
        return Ok(Target::for_document(&serializer.document_key_from_name(name)?));
    }
    let query = value
        .get("query")
        .ok_or_else(|| invalid_argument("target must carry a query or documents"))?;
    decode_query_target(serializer, query)
}

pub(crate) fn decode_query_target(serializer: &JsonProtoSerializer, query: &JsonValue) -> FirestoreResult<Target> {
    let parent = query
        .get("parent")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("query target missing parent"))?;
    let mut path = serializer.resource_path_from_name(parent)?;
    let structured = query
        .get("structuredQuery")
        .ok_or_else(|| invalid_argument("query target missing structuredQuery"))?;

    let from = structured
        .get("from")
        .and_then(JsonValue::as_array)
        .and_then(|entries| entries.first())
        .ok_or_else(|| invalid_argument("structuredQuery must select exactly one collection"))?;
    let collection_id = from
        .get("collectionId")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("from clause missing collectionId"))?;
    let all_descendants = from
        .get("allDescendants")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    let collection_group = if all_descendants {
        Some(collection_id.to_string())
    } else {
        path = path.child(collection_id);
        None
    };

    let filters = match structured.get("where") {
        Some(filter) => decode_filters(serializer, filter)?,
        None => Vec::new(),
    };
    let order_by = match structured.get("orderBy").and_then(JsonValue::as_array) {
        Some(orders) => orders
            .iter()
            .map(decode_order_by)
            .collect::<FirestoreResult<Vec<_>>>()?,
        None => Vec::new(),
    };
    let limit = structured
        .get("limit")
        .and_then(|limit| limit.as_u64().or_else(|| limit.get("value").and_then(JsonValue::as_u64)))
        .map(|limit| limit as u32);
    let start_at = structured
        .get("startAt")
        .map(|cursor| decode_cursor(serializer, cursor, true))
        .transpose()?;
    let end_at = structured
        .get("endAt")
        .map(|cursor| decode_cursor(serializer, cursor, false))
        .transpose()?;

    Ok(Target {
        path,
        collection_group,
        filters,
        order_by,
        limit,
        start_at,
        end_at,
    })
}

fn decode_filters(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Vec<FieldFilter>> {
    if let Some(composite) = value.get("compositeFilter") {
        if composite.get("op").and_then(JsonValue::as_str) != Some("AND") {
            return Err(invalid_argument("Only AND composite filters are supported"));
        }
        let mut filters = Vec::new();
        for nested in composite
            .get("filters")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            filters.extend(decode_filters(serializer, nested)?);
        }
        return Ok(filters);
    }
    if let Some(field_filter) = value.get("fieldFilter") {
        let field = decode_field_reference(field_filter.get("field"))?;
        let op = operator_from_name(
            field_filter
                .get("op")
                .and_then(JsonValue::as_str)
                .unwrap_or_default(),
        )?;
        let value = serializer.decode_value(
            field_filter
                .get("value")
                .ok_or_else(|| invalid_argument("fieldFilter missing value"))?,
        )?;
        return Ok(vec![FieldFilter::new(field, op, value)]);
    }
    if let Some(unary) = value.get("unaryFilter") {
        let field = decode_field_reference(unary.get("field"))?;
        let (op, value) = match unary.get("op").and_then(JsonValue::as_str).unwrap_or_default() {
            "IS_NULL" => (FilterOperator::Equal, FirestoreValue::null()),
            "IS_NAN" => (FilterOperator::Equal, FirestoreValue::from_double(f64::NAN)),
            "IS_NOT_NULL" => (FilterOperator::NotEqual, FirestoreValue::null()),
            "IS_NOT_NAN" => (FilterOperator::NotEqual, FirestoreValue::from_double(f64::NAN)),
            other => return Err(invalid_argument(format!("Unknown unary operator '{other}'"))),
        };
        return Ok(vec![FieldFilter::new(field, op, value)]);
    }
    Err(invalid_argument("Unknown filter type"))
}

fn decode_field_reference(value: Option<&JsonValue>) -> FirestoreResult<FieldPath> {
    let path = value
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("field reference missing fieldPath"))?;
    FieldPath::from_server_format(path)
}

fn decode_order_by(value: &JsonValue) -> FirestoreResult<OrderBy> {
    let field = decode_field_reference(value.get("field"))?;
    let direction = match value.get("direction").and_then(JsonValue::as_str) {
        Some("DESCENDING") => Direction::Descending,
        _ => Direction::Ascending,
    };
    Ok(OrderBy::new(field, direction))
}

fn decode_cursor(serializer: &JsonProtoSerializer, value: &JsonValue, start: bool) -> FirestoreResult<Bound> {
    let before = value.get("before").and_then(JsonValue::as_bool).unwrap_or(false);
    let position = match value.get("values").and_then(JsonValue::as_array) {
        Some(values) => values
            .iter()
            .map(|value| serializer.decode_value(value))
            .collect::<FirestoreResult<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok(Bound::new(position, if start { before } else { !before }))
}
