//! Array stabilization shared by fingerprinting and diffing
//!
//! Both use the same rule so a configuration the diff engine calls
//! identical also fingerprints identically. Objects are always key-sorted
//! because `serde_json::Map` is a `BTreeMap`.

use serde_json::Value;
use std::cmp::Ordering;

/// Keys tried, in order, to find a sort key for an object element.
pub const SORT_KEY_PRIORITY: [&str; 5] = ["id", "name", "address", "type", "key"];

/// Sort array elements into a stable order.
///
/// Arrays of objects sort by the first available key from
/// [`SORT_KEY_PRIORITY`]; everything else sorts by its compact JSON text.
/// The sort is stable, so elements with equal keys keep their input order.
pub fn stabilize(items: &mut [Value]) {
    if items.len() < 2 {
        return;
    }
    if items.iter().all(Value::is_object) {
        items.sort_by(|a, b| compare_objects(a, b));
    } else {
        items.sort_by_cached_key(canonical_text);
    }
}

/// Compact JSON text with sorted object keys.
pub fn canonical_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn compare_objects(a: &Value, b: &Value) -> Ordering {
    match (object_sort_key(a), object_sort_key(b)) {
        (Some(ka), Some(kb)) => ka.cmp(&kb),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => canonical_text(a).cmp(&canonical_text(b)),
    }
}

fn object_sort_key(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    SORT_KEY_PRIORITY.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(canonical_text(other)),
    })
}
