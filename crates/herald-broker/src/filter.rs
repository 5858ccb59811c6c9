//! Subscriber filter matching.
//!
//! A filter is a flat map of payload keys to expected values. Every key must
//! be present on the payload with an equal value; a missing key never matches.

use serde_json::{Map, Value};

/// Flat key/value equality filter.
pub type Filter = Map<String, Value>;

/// Whether `payload` satisfies `filter`.
///
/// `None` and an empty filter match everything. A non-object payload only
/// matches when there is nothing to check.
pub fn matches(payload: &Value, filter: Option<&Filter>) -> bool {
    let Some(filter) = filter else { return true };
    if filter.is_empty() {
        return true;
    }
    let Some(fields) = payload.as_object() else {
        return false;
    };
    filter
        .iter()
        .all(|(key, expected)| fields.get(key).is_some_and(|actual| actual == expected))
}
