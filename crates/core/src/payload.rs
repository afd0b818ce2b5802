use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("failed to serialize payload: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Re-serializes a JSON document with object keys sorted at every depth, so
/// that sender and receiver sign identical bytes regardless of key order or
/// whitespace in transit.
pub fn canonical_json(raw: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let value: Value = serde_json::from_slice(raw).map_err(PayloadError::Parse)?;
    serde_json::to_vec(&sort_keys(value)).map_err(PayloadError::Serialize)
}

// Insertion order is what `Map` preserves when serde_json's `preserve_order`
// feature is enabled anywhere in the build, so keys are inserted sorted.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));
            let sorted: Map<String, Value> = entries
                .into_iter()
                .map(|(key, value)| (key, sort_keys(value)))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
