//! Shape-tolerant JSON decoding: upstream responses may arrive as a bare
//! JSON string, a JSON list, or a JSON object wrapping a list — every
//! operation's decoder must accept all the shapes it documents and
//! normalize to one internal type before returning (spec §4.3(iv), §6,
//! §9 "duck-typed HTTP responses").
//!
//! Pattern grounded on `aa-rs/src/paymaster.rs::parse_v06_paymaster_and_data`,
//! which is liberal about whether a field is top-level or nested.

use crate::errors::UpstreamError;
use serde_json::Value;

/// Unquotes a JSON-encoded string body (`"\"[]\""` -> `"[]"`), re-parsing it
/// as JSON. A body that is already a list/object is returned unchanged.
pub fn unwrap_quoted_json(value: Value) -> Result<Value, UpstreamError> {
    match value {
        Value::String(s) => {
            serde_json::from_str(&s).map_err(|e| UpstreamError::Decode(e.to_string()))
        }
        other => Ok(other),
    }
}

/// Accepts either a bare JSON array of base64 strings, or an object
/// carrying that array under `"Xmls"`.
pub fn extract_blob_list(value: Value) -> Result<Vec<String>, UpstreamError> {
    let value = unwrap_quoted_json(value)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(UpstreamError::Decode(format!(
                    "expected string blob, got {other}"
                ))),
            })
            .collect(),
        Value::Object(mut obj) => {
            check_status_field(&obj)?;
            match obj.remove("Xmls") {
                Some(Value::Array(items)) => items
                    .into_iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(s),
                        other => Err(UpstreamError::Decode(format!(
                            "expected string blob, got {other}"
                        ))),
                    })
                    .collect(),
                Some(Value::Null) | None => Ok(Vec::new()),
                Some(other) => Err(UpstreamError::Decode(format!(
                    "expected array under 'Xmls', got {other}"
                ))),
            }
        }
        Value::Null => Ok(Vec::new()),
        other => Err(UpstreamError::Decode(format!(
            "unexpected response shape: {other}"
        ))),
    }
}

/// A dict body carrying a non-empty `Status` list is an API error (spec
/// §4.3(v)).
pub fn check_status_field(obj: &serde_json::Map<String, Value>) -> Result<(), UpstreamError> {
    if let Some(Value::Array(statuses)) = obj.get("Status") {
        if !statuses.is_empty() {
            return Err(UpstreamError::ApiError {
                message: Value::Array(statuses.clone()).to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_bare_array() {
        let v = json!(["aGVsbG8=", "d29ybGQ="]);
        assert_eq!(extract_blob_list(v).unwrap().len(), 2);
    }

    #[test]
    fn accepts_object_wrapping_xmls() {
        let v = json!({"Xmls": ["aGVsbG8="]});
        assert_eq!(extract_blob_list(v).unwrap(), vec!["aGVsbG8=".to_string()]);
    }

    #[test]
    fn accepts_quoted_json_string() {
        let v = json!("[\"aGVsbG8=\"]");
        assert_eq!(extract_blob_list(v).unwrap(), vec!["aGVsbG8=".to_string()]);
    }

    #[test]
    fn rejects_nonempty_status_as_api_error() {
        let v = json!({"Status": ["invalid api key"], "Xmls": []});
        assert!(matches!(
            extract_blob_list(v),
            Err(UpstreamError::ApiError { .. })
        ));
    }

    #[test]
    fn empty_status_is_not_an_error() {
        let v = json!({"Status": [], "Xmls": ["aGVsbG8="]});
        assert_eq!(extract_blob_list(v).unwrap().len(), 1);
    }
}
