//! Temporary identifiers for entities created while offline.
//!
//! A local id is the fixed [`LOCAL_ID_PREFIX`] followed by a UUID v4, so it
//! can never collide with a server-assigned identifier. Local ids may appear
//! anywhere inside a queued payload (an order line pointing at an offline
//! product, a coupon scoped to an offline category) and must all be
//! rewritten before that payload leaves the device.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub const LOCAL_ID_PREFIX: &str = "local_";

/// Fresh local identifier, e.g. `local_6f1c0d...`.
pub fn generate_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4().simple())
}

pub fn is_local_id(value: &str) -> bool {
    value.len() > LOCAL_ID_PREFIX.len() && value.starts_with(LOCAL_ID_PREFIX)
}

/// Every local id referenced by `value`, in document order, without
/// duplicates. Object keys are not inspected, only string values.
pub fn collect_local_ids(value: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    collect_into(value, &mut seen, &mut out);
    out
}

fn collect_into(value: &Value, seen: &mut HashSet<String>, out: &mut Vec<String>) {
    match value {
        Value::String(s) if is_local_id(s) => {
            if seen.insert(s.clone()) {
                out.push(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, seen, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_into(v, seen, out);
            }
        }
        _ => {}
    }
}

/// Replace every string equal to a mapped local id with its server id.
/// Returns the number of replacements made.
pub fn rewrite_local_ids(value: &mut Value, mappings: &HashMap<String, String>) -> usize {
    if mappings.is_empty() {
        return 0;
    }
    match value {
        Value::String(s) => match mappings.get(s.as_str()) {
            Some(server_id) => {
                *s = server_id.clone();
                1
            }
            None => 0,
        },
        Value::Array(items) => items
            .iter_mut()
            .map(|item| rewrite_local_ids(item, mappings))
            .sum(),
        Value::Object(map) => map
            .values_mut()
            .map(|v| rewrite_local_ids(v, mappings))
            .sum(),
        _ => 0,
    }
}
