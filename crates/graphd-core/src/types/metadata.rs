//! Metadata helpers shared by the search filters.

use serde_json::{Map, Value};

/// Opaque metadata mapping attached to assistants, threads, and runs.
pub type JsonMap = Map<String, Value>;

/// Check whether `haystack` contains every key/value pair of `needle`,
/// recursing into nested objects (JSON containment).
///
/// A scalar or array value matches only on equality; an object value matches
/// when the haystack value is an object containing it.
pub fn contains_subset(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(hay), Value::Object(sub)) => sub.iter().all(|(key, expected)| {
            hay.get(key)
                .map(|actual| contains_subset(actual, expected))
                .unwrap_or(false)
        }),
        (actual, expected) => actual == expected,
    }
}

/// Containment check over plain metadata maps.
pub fn map_contains_subset(haystack: &JsonMap, needle: &JsonMap) -> bool {
    needle.iter().all(|(key, expected)| {
        haystack
            .get(key)
            .map(|actual| contains_subset(actual, expected))
            .unwrap_or(false)
    })
}
