//! Single boundary for the backend's response shapes.
//!
//! List endpoints answer `{ success, data, pagination }`, some legacy
//! endpoints answer `{ data }`, and a few return the bare entity. Everything
//! above this module sees only the unwrapped `data`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default, alias = "total_pages", alias = "pages")]
    pub total_pages: u64,
}

/// Normalised response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unwrapped {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

fn is_envelope(map: &serde_json::Map<String, Value>) -> bool {
    // A bare entity can legitimately carry a `data` field (e.g. a settings
    // blob), so only treat objects made of envelope keys as envelopes.
    const ENVELOPE_KEYS: &[&str] = &["success", "data", "pagination", "message", "error", "meta"];
    map.contains_key("data") && map.keys().all(|k| ENVELOPE_KEYS.contains(&k.as_str()))
}

fn envelope_error(map: &serde_json::Map<String, Value>) -> String {
    map.get("error")
        .or_else(|| map.get("message"))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Object(o) => o
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| v.to_string()),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "request reported success=false".to_string())
}

/// Strip the response envelope, if any.
pub fn unwrap_envelope(body: Value) -> Result<Unwrapped, ApiError> {
    let Value::Object(mut map) = body else {
        return Ok(Unwrapped {
            data: body,
            pagination: None,
        });
    };

    if map.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(ApiError::InvalidResponse(envelope_error(&map)));
    }

    if !is_envelope(&map) {
        return Ok(Unwrapped {
            data: Value::Object(map),
            pagination: None,
        });
    }

    let pagination = map
        .remove("pagination")
        .or_else(|| map.remove("meta"))
        .and_then(|p| serde_json::from_value::<Pagination>(p).ok());
    let data = map.remove("data").unwrap_or(Value::Null);
    Ok(Unwrapped { data, pagination })
}

/// Server-assigned identifier of an entity record.
pub fn extract_server_id(record: &Value) -> Option<String> {
    ["id", "_id", "uuid"].iter().find_map(|key| match record.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope_with_pagination() {
        let body = json!({
            "success": true,
            "data": [{ "id": "p1" }],
            "pagination": { "page": 2, "limit": 20, "total": 41, "totalPages": 3 }
        });
        let out = unwrap_envelope(body).unwrap();
        assert_eq!(out.data, json!([{ "id": "p1" }]));
        assert_eq!(
            out.pagination,
            Some(Pagination {
                page: 2,
                limit: 20,
                total: 41,
                total_pages: 3
            })
        );
    }

    #[test]
    fn test_bare_data_envelope() {
        let out = unwrap_envelope(json!({ "data": { "id": "c1" } })).unwrap();
        assert_eq!(out.data, json!({ "id": "c1" }));
        assert!(out.pagination.is_none());
    }

    #[test]
    fn test_raw_entity_passes_through() {
        let raw = json!({ "id": "o1", "status": "pending", "data": "kept" });
        assert_eq!(unwrap_envelope(raw.clone()).unwrap().data, raw);
        assert_eq!(unwrap_envelope(json!([1, 2])).unwrap().data, json!([1, 2]));
    }

    #[test]
    fn test_failed_envelope_is_an_error() {
        let err = unwrap_envelope(json!({ "success": false, "error": "SKU taken" })).unwrap_err();
        assert_eq!(err, ApiError::InvalidResponse("SKU taken".into()));
    }

    #[test]
    fn test_extract_server_id_variants() {
        assert_eq!(extract_server_id(&json!({ "id": "srv-1" })), Some("srv-1".into()));
        assert_eq!(extract_server_id(&json!({ "id": 42 })), Some("42".into()));
        assert_eq!(extract_server_id(&json!({ "_id": "m1" })), Some("m1".into()));
        assert_eq!(extract_server_id(&json!({ "name": "x" })), None);
        assert_eq!(extract_server_id(&Value::Null), None);
    }
}
