use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint, MutableDocument, Mutation,
    MutationKind, MutationResult, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

const SERVER_TIMESTAMP_TYPE: &str = "server_timestamp";
const TYPE_KEY: &str = "__type__";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";

/// Converts between the model and the JSON mapping of the Firestore v1 protos.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    /// Fully qualified name of any path below the database's document root.
    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!("{}/documents/{}", self.database_name(), path.canonical_string())
        }
    }

    pub fn resource_path_from_name(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let root = format!("{}/documents", self.database_name());
        let remainder = name
            .strip_prefix(&root)
            .ok_or_else(|| invalid_argument(format!("Resource name '{name}' is not in database {}", self.database_id)))?;
        match remainder.strip_prefix('/') {
            Some(path) => ResourcePath::from_string(path),
            None if remainder.is_empty() => Ok(ResourcePath::root()),
            None => Err(invalid_argument(format!("Invalid resource name '{name}'"))),
        }
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.resource_path_from_name(name)?)
    }

    pub fn reference_value(&self, key: &DocumentKey) -> FirestoreValue {
        FirestoreValue::from_reference(self.document_name(key))
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_document_fields(&self, map: &MapValue) -> JsonValue {
        encode_map_fields(map)
    }

    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        decode_map_value(value)
    }

    pub fn encode_timestamp(&self, timestamp: &Timestamp) -> String {
        encode_timestamp(timestamp)
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        parse_timestamp(value)
    }

    pub fn encode_version(&self, version: &SnapshotVersion) -> String {
        encode_timestamp(&version.timestamp())
    }

    pub fn decode_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value.and_then(JsonValue::as_str) {
            Some(text) => Ok(SnapshotVersion::new(parse_timestamp(text)?)),
            None => Ok(SnapshotVersion::min()),
        }
    }

    /// `Document` message for a found document.
    pub fn encode_document(&self, doc: &MutableDocument) -> JsonValue {
        json!({
            "name": self.document_name(doc.key()),
            "fields": encode_map_fields(doc.data()),
            "updateTime": self.encode_version(&doc.version()),
        })
    }

    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let version = self.decode_version(value.get("updateTime"))?;
        let data = match value.get("fields") {
            Some(fields) => decode_fields_object(fields)?,
            None => MapValue::empty(),
        };
        Ok(MutableDocument::new_found_document(key, version, data))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        let name = self.document_name(mutation.key());
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert("update".into(), json!({ "name": name, "fields": encode_map_fields(value) }));
            }
            MutationKind::Patch { value, mask } => {
                write.insert("update".into(), json!({ "name": name, "fields": encode_map_fields(value) }));
                write.insert("updateMask".into(), encode_field_mask(mask));
            }
            MutationKind::Delete => {
                write.insert("delete".into(), json!(name));
            }
            MutationKind::Verify => {
                write.insert("verify".into(), json!(name));
            }
        }
        if !mutation.field_transforms().is_empty() {
            let transforms = mutation
                .field_transforms()
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".into(), JsonValue::Array(transforms));
        }
        if let Some(precondition) = self.encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".into(), precondition);
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = match value.get("currentDocument") {
            Some(current) => self.decode_precondition(current)?,
            None => Precondition::None,
        };
        let transforms = match value.get("updateTransforms").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(|entry| self.decode_field_transform(entry))
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        if let Some(update) = value.get("update") {
            let name = update
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("update write missing name"))?;
            let key = self.document_key_from_name(name)?;
            let data = match update.get("fields") {
                Some(fields) => decode_fields_object(fields)?,
                None => MapValue::empty(),
            };
            let kind = match value.get("updateMask") {
                Some(mask) => MutationKind::Patch {
                    value: data,
                    mask: decode_field_mask(mask)?,
                },
                None => MutationKind::Set { value: data },
            };
            return Ok(Mutation::new(key, kind, precondition, transforms));
        }
        if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            let key = self.document_key_from_name(name)?;
            return Ok(Mutation::new(key, MutationKind::Delete, precondition, transforms));
        }
        if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            let key = self.document_key_from_name(name)?;
            return Ok(Mutation::new(key, MutationKind::Verify, precondition, transforms));
        }
        Err(invalid_argument("Unknown mutation type"))
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => Some(json!({ "updateTime": self.encode_version(version) })),
        }
    }

    fn decode_precondition(&self, value: &JsonValue) -> FirestoreResult<Precondition> {
        if let Some(exists) = value.get("exists") {
            let exists = exists
                .as_bool()
                .ok_or_else(|| invalid_argument("currentDocument.exists must be bool"))?;
            return Ok(Precondition::Exists(exists));
        }
        if value.get("updateTime").is_some() {
            return Ok(Precondition::UpdateTime(self.decode_version(value.get("updateTime"))?));
        }
        Ok(Precondition::None)
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field().canonical_string();
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": encode_value(operand)
            }),
        }
    }

    fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let field_path = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("field transform missing fieldPath"))?;
        let field = FieldPath::from_server_format(field_path)?;
        let operation = if let Some(server_value) = value.get("setToServerValue") {
            if server_value.as_str() != Some("REQUEST_TIME") {
                return Err(invalid_argument(format!("Unknown server value: {server_value}")));
            }
            TransformOperation::ServerTimestamp
        } else if let Some(elements) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(decode_array_values(elements)?)
        } else if let Some(elements) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(decode_array_values(elements)?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(decode_value(operand)?)
        } else {
            return Err(invalid_argument("Unknown field transform"));
        };
        Ok(FieldTransform::new(field, operation))
    }

    /// `WriteResult`; an absent update time means the commit time applies.
    pub fn decode_write_result(&self, value: &JsonValue, commit_version: SnapshotVersion) -> FirestoreResult<MutationResult> {
        let version = match value.get("updateTime") {
            Some(update_time) => self.decode_version(Some(update_time))?,
            None => commit_version,
        };
        let transform_results = match value.get("transformResults").and_then(JsonValue::as_array) {
            Some(entries) => entries.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(MutationResult {
            version,
            transform_results,
        })
    }

    pub fn encode_write_result(&self, result: &MutationResult) -> JsonValue {
        let mut entry = serde_json::Map::new();
        if !result.version.is_min() {
            entry.insert("updateTime".into(), json!(self.encode_version(&result.version)));
        }
        if !result.transform_results.is_empty() {
            entry.insert(
                "transformResults".into(),
                JsonValue::Array(result.transform_results.iter().map(encode_value).collect()),
            );
        }
        JsonValue::Object(entry)
    }
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

pub fn decode_bytes(value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
    match value.and_then(JsonValue::as_str) {
        Some(text) => BASE64_STANDARD
            .decode(text)
            .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}"))),
        None => Ok(Vec::new()),
    }
}

fn encode_field_mask(mask: &FieldMask) -> JsonValue {
    json!({ "fieldPaths": mask.iter().map(FieldPath::canonical_string).collect::<Vec<_>>() })
}

fn decode_field_mask(value: &JsonValue) -> FirestoreResult<FieldMask> {
    let paths = match value.get("fieldPaths").and_then(JsonValue::as_array) {
        Some(paths) => paths
            .iter()
            .map(|path| {
                path.as_str()
                    .ok_or_else(|| invalid_argument("fieldPaths entries must be strings"))
                    .and_then(FieldPath::from_server_format)
            })
            .collect::<FirestoreResult<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok(FieldMask::new(paths))
}

fn decode_array_values(value: &JsonValue) -> FirestoreResult<Vec<FirestoreValue>> {
    match value.get("values").and_then(JsonValue::as_array) {
        Some(entries) => entries.iter().map(decode_value).collect(),
        None => Ok(Vec::new()),
    }
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) if double.is_finite() => json!({ "doubleValue": double }),
        ValueKind::Double(double) => {
            let text = if double.is_nan() {
                "NaN"
            } else if *double > 0.0 {
                "Infinity"
            } else {
                "-Infinity"
            };
            json!({ "doubleValue": text })
        }
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        // Pending server timestamps only exist in local views and are persisted in
        // the same reserved map shape the backend never produces.
        ValueKind::ServerTimestamp {
            local_write_time,
            previous,
        } => {
            let mut fields = serde_json::Map::new();
            fields.insert(TYPE_KEY.into(), json!({ "stringValue": SERVER_TIMESTAMP_TYPE }));
            fields.insert(
                LOCAL_WRITE_TIME_KEY.into(),
                json!({ "timestampValue": encode_timestamp(local_write_time) }),
            );
            if let Some(previous) = previous {
                fields.insert(PREVIOUS_VALUE_KEY.into(), encode_value(previous));
            }
            json!({ "mapValue": { "fields": JsonValue::Object(fields) } })
        }
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    match map.get("fields") {
        Some(fields) => decode_fields_object(fields),
        None => Ok(MapValue::empty()),
    }
}

fn decode_fields_object(value: &JsonValue) -> FirestoreResult<MapValue> {
    let fields_object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => {
                i64::from_str(value).map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?
            }
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => match value.as_str() {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                other => other
                    .parse::<f64>()
                    .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            },
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(timestamp_str)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BytesValue::from_base64(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        return Ok(FirestoreValue::from_array(decode_array_values(array_value)?));
    }
    if let Some(map_value) = object.get("mapValue") {
        let map = decode_map_value(map_value)?;
        if let Some(value) = decode_server_timestamp(&map) {
            return Ok(value);
        }
        return Ok(FirestoreValue::from_map_value(map));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

fn decode_server_timestamp(map: &MapValue) -> Option<FirestoreValue> {
    let fields = map.fields();
    if fields.get(TYPE_KEY)?.as_str()? != SERVER_TIMESTAMP_TYPE {
        return None;
    }
    let ValueKind::Timestamp(local_write_time) = fields.get(LOCAL_WRITE_TIME_KEY)?.kind() else {
        return None;
    };
    Some(FirestoreValue::server_timestamp(
        *local_write_time,
        fields.get(PREVIOUS_VALUE_KEY).cloned(),
    ))
}

pub(crate) fn encode_timestamp(timestamp: &Timestamp) -> String {
    Utc.timestamp_opt(timestamp.seconds, timestamp.nanos as u32)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime =
        DateTime::parse_from_rfc3339(value).map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}
