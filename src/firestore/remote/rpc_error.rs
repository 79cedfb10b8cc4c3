use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{FirestoreError, FirestoreErrorCode};

/// `google.rpc.Status` as carried by watch causes and failed responses.
#[derive(Debug, Deserialize)]
pub(crate) struct StatusBody {
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

/// Maps a numeric wire status to an error. Unrecognized codes become `Unknown`.
pub fn map_grpc_status(code: i32, message: Option<String>) -> FirestoreError {
    let code = FirestoreErrorCode::from_rpc_code(code).unwrap_or(FirestoreErrorCode::Unknown);
    let message = message.unwrap_or_else(|| format!("RPC failed with {}", code.as_str()));
    FirestoreError::new(code, message)
}

pub(crate) fn decode_status(value: &JsonValue) -> Option<FirestoreError> {
    serde_json::from_value::<StatusBody>(value.clone())
        .ok()
        .map(|status| map_grpc_status(status.code, status.message))
}

/// Extracts the error of a failed response, `{"error": {"code", "message"}}`.
pub(crate) fn decode_error_response(value: &JsonValue) -> Option<FirestoreError> {
    decode_status(value.get("error")?)
}

pub(crate) fn encode_status(error: &FirestoreError) -> JsonValue {
    json!({
        "code": error.code.rpc_code(),
        "message": error.message(),
    })
}

pub(crate) fn encode_error_response(error: &FirestoreError) -> JsonValue {
    json!({ "error": encode_status(error) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::aborted;

    #[test]
    fn maps_known_and_unknown_codes() {
        assert_eq!(map_grpc_status(10, None).code, FirestoreErrorCode::Aborted);
        assert_eq!(map_grpc_status(14, Some("down".into())).message(), "down");
        assert_eq!(map_grpc_status(99, None).code, FirestoreErrorCode::Unknown);
    }

    #[test]
    fn error_responses_round_trip() {
        let error = aborted("Transaction contention");
        let decoded = decode_error_response(&encode_error_response(&error)).unwrap();
        assert_eq!(decoded, error);
        assert!(decode_error_response(&json!({ "writeResults": [] })).is_none());
    }
}
