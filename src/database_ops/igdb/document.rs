//! Helpers for reading ids out of IGDB JSON bodies.
//!
//! Upstream encodes references either as bare integers (`"genres": [4, 12]`) or as
//! expanded objects (`"genres": [{"id": 4, "name": "Fighting"}]`) depending on the
//! requested fields; every reader here accepts both.

use serde_json::Value;

/// The one capability every mirrored body exposes.
pub trait ExternalId {
    fn external_id(&self) -> Option<u64>;
}

impl ExternalId for Value {
    fn external_id(&self) -> Option<u64> {
        self.get("id").and_then(Value::as_u64).filter(|id| *id != 0)
    }
}

/// Reads a single reference.
pub fn ref_id(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::Object(map) => map.get("id").and_then(Value::as_u64),
        _ => None,
    }
}

/// Reads a reference list, keeping upstream order and dropping unreadable entries.
pub fn ref_ids(v: Option<&Value>) -> Vec<u64> {
    match v {
        Some(Value::Array(items)) => items.iter().filter_map(ref_id).collect(),
        Some(other) => ref_id(other).into_iter().collect(),
        None => Vec::new(),
    }
}
