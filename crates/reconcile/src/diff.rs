//! Field-level diffing of configuration snapshots
//!
//! Both sides are cleaned first: server-managed fields (ids, timestamps,
//! pagination, `metadata`, `_private` keys, `etag`, `version`) are dropped
//! and arrays are stabilized so a server-side reorder is not a change.
//! The cleaned trees are then walked in parallel.

use crate::canonical::stabilize;
use crate::types::{FieldChangeType, FieldDiff};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Replacement for sensitive values when redaction is on.
pub const REDACTED: &str = "[REDACTED]";

/// Fields the remote service manages; never part of a diff.
pub const SERVER_MANAGED_FIELDS: [&str; 17] = [
    "id",
    "created_at",
    "updated_at",
    "last_execution",
    "next_execution",
    "execution_count",
    "error_count",
    "last_error",
    "request_id",
    "metadata",
    "etag",
    "version",
    "page",
    "page_size",
    "total_count",
    "next_page_token",
    "cursor",
];

static SENSITIVE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(password|passwd|passphrase|secret|token|api_?key|private_?key|key|auth|credential|signature|webhook_url)",
    )
    .expect("Invalid sensitive field pattern")
});

/// Options for [`deep_compare`]
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Depth past which subtrees are compared as opaque values
    pub max_depth: usize,
    /// Replace sensitive values with [`REDACTED`]
    pub redact_secrets: bool,
    /// Extra field names (or full dot paths) to skip
    pub ignore_fields: Vec<String>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            max_depth: 10,
            redact_secrets: true,
            ignore_fields: Vec::new(),
        }
    }
}

/// Counts by change type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub total: usize,
}

/// Result of comparing two configurations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub has_differences: bool,
    pub field_diffs: Vec<FieldDiff>,
    pub summary: DiffSummary,
}

/// Whether a field name looks like it holds a credential.
pub fn is_sensitive_field(name: &str) -> bool {
    SENSITIVE_FIELD.is_match(name)
}

/// Compare two configuration snapshots field by field.
pub fn deep_compare(old: &Value, new: &Value, options: &DiffOptions) -> DiffResult {
    let old = clean(old);
    let new = clean(new);

    let mut walker = Walker {
        options,
        diffs: Vec::new(),
    };
    walker.compare("", old.as_ref(), new.as_ref(), 0, false);

    let mut summary = DiffSummary::default();
    for diff in &walker.diffs {
        match diff.change_type {
            FieldChangeType::Added => summary.added += 1,
            FieldChangeType::Removed => summary.removed += 1,
            FieldChangeType::Changed => summary.changed += 1,
        }
    }
    summary.total = walker.diffs.len();

    DiffResult {
        has_differences: !walker.diffs.is_empty(),
        field_diffs: walker.diffs,
        summary,
    }
}

struct Walker<'a> {
    options: &'a DiffOptions,
    diffs: Vec<FieldDiff>,
}

impl Walker<'_> {
    fn compare(
        &mut self,
        path: &str,
        old: Option<&Value>,
        new: Option<&Value>,
        depth: usize,
        sensitive: bool,
    ) {
        let old = old.filter(|v| !v.is_null());
        let new = new.filter(|v| !v.is_null());

        match (old, new) {
            (None, None) => {}
            (None, Some(n)) => self.push(path, None, Some(n), FieldChangeType::Added, sensitive),
            (Some(o), None) => self.push(path, Some(o), None, FieldChangeType::Removed, sensitive),
            (Some(o), Some(n)) if depth >= self.options.max_depth => {
                if o != n {
                    self.push(path, Some(o), Some(n), FieldChangeType::Changed, sensitive);
                }
            }
            (Some(Value::Object(o)), Some(Value::Object(n))) => {
                let keys: BTreeSet<&String> = o.keys().chain(n.keys()).collect();
                for key in keys {
                    let child = join(path, key);
                    if self.is_ignored(key, &child) {
                        continue;
                    }
                    let child_sensitive = sensitive || is_sensitive_field(key);
                    self.compare(&child, o.get(key), n.get(key), depth + 1, child_sensitive);
                }
            }
            (Some(Value::Array(o)), Some(Value::Array(n))) if is_simple(o) && is_simple(n) => {
                for i in 0..o.len().max(n.len()) {
                    let child = format!("{path}[{i}]");
                    self.compare(&child, o.get(i), n.get(i), depth + 1, sensitive);
                }
            }
            (Some(o), Some(n)) => {
                if o != n {
                    self.push(path, Some(o), Some(n), FieldChangeType::Changed, sensitive);
                }
            }
        }
    }

    fn is_ignored(&self, key: &str, path: &str) -> bool {
        self.options
            .ignore_fields
            .iter()
            .any(|f| f == key || f == path)
    }

    fn push(
        &mut self,
        path: &str,
        old: Option<&Value>,
        new: Option<&Value>,
        change_type: FieldChangeType,
        sensitive: bool,
    ) {
        let shown = |v: Option<&Value>| {
            v.map(|v| {
                if sensitive && self.options.redact_secrets {
                    Value::String(REDACTED.to_string())
                } else {
                    v.clone()
                }
            })
        };
        self.diffs.push(FieldDiff {
            path: path.to_string(),
            old_value: shown(old),
            new_value: shown(new),
            change_type,
            is_sensitive: sensitive,
        });
    }
}

/// An array is walked element by element only when it holds records.
fn is_simple(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(Value::is_object)
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn clean(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => {
            let mut cleaned: Vec<Value> = items.iter().filter_map(clean).collect();
            stabilize(&mut cleaned);
            Some(Value::Array(cleaned))
        }
        Value::Object(obj) => {
            let cleaned: Map<String, Value> = obj
                .iter()
                .filter(|(k, _)| !is_server_managed(k))
                .filter_map(|(k, v)| clean(v).map(|v| (k.clone(), v)))
                .collect();
            Some(Value::Object(cleaned))
        }
        other => Some(other.clone()),
    }
}

fn is_server_managed(key: &str) -> bool {
    key.starts_with('_') || SERVER_MANAGED_FIELDS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compare(old: Value, new: Value) -> DiffResult {
        deep_compare(&old, &new, &DiffOptions::default())
    }

    #[test]
    fn test_identical_has_no_differences() {
        let v = json!({"name": "w", "targets": [{"address": "a"}, {"address": "b"}], "n": 1});
        let result = compare(v.clone(), v);
        assert!(!result.has_differences);
        assert_eq!(result.summary.total, 0);
    }

    #[test]
    fn test_added_removed_changed() {
        let result = compare(
            json!({"a": 1, "b": "x", "nested": {"keep": true}}),
            json!({"a": 2, "c": "y", "nested": {"keep": true}}),
        );
        assert!(result.has_differences);
        assert_eq!(result.summary.added, 1);
        assert_eq!(result.summary.removed, 1);
        assert_eq!(result.summary.changed, 1);
        let paths: Vec<_> = result.field_diffs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_server_fields_and_reordering_ignored() {
        let result = compare(
            json!({"id": "r-1", "etag": "x", "_links": {}, "metadata": {"a": 1},
                   "hosts": [{"name": "b"}, {"name": "a"}], "tags": ["y", "x"]}),
            json!({"hosts": [{"name": "a"}, {"name": "b"}], "tags": ["x", "y"],
                   "updated_at": "now"}),
        );
        assert!(!result.has_differences, "{:?}", result.field_diffs);
    }

    #[test]
    fn test_record_arrays_compared_by_index() {
        let result = compare(
            json!({"hosts": [{"name": "a", "port": 1}]}),
            json!({"hosts": [{"name": "a", "port": 2}, {"name": "b", "port": 3}]}),
        );
        let paths: Vec<_> = result.field_diffs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["hosts[0].port", "hosts[1]"]);
        assert_eq!(result.field_diffs[1].change_type, FieldChangeType::Added);
    }

    #[test]
    fn test_primitive_arrays_are_one_change() {
        let result = compare(json!({"channels": ["a"]}), json!({"channels": ["a", "b"]}));
        assert_eq!(result.field_diffs.len(), 1);
        assert_eq!(result.field_diffs[0].path, "channels");
        assert_eq!(result.field_diffs[0].new_value, Some(json!(["a", "b"])));
    }

    #[test]
    fn test_secrets_redacted_and_flagged() {
        let result = compare(
            json!({"config": {"api_token": "old", "channel": "#a"}}),
            json!({"config": {"api_token": "new", "channel": "#b"}}),
        );
        let token = &result.field_diffs[0];
        assert_eq!(token.path, "config.api_token");
        assert!(token.is_sensitive);
        assert_eq!(token.old_value, Some(json!(REDACTED)));
        assert_eq!(token.new_value, Some(json!(REDACTED)));
        assert!(!result.field_diffs[1].is_sensitive);
    }

    #[test]
    fn test_secrets_flagged_without_redaction() {
        let options = DiffOptions {
            redact_secrets: false,
            ..Default::default()
        };
        let result = deep_compare(&json!({"password": "a"}), &json!({"password": "b"}), &options);
        assert!(result.field_diffs[0].is_sensitive);
        assert_eq!(result.field_diffs[0].new_value, Some(json!("b")));
    }

    #[test]
    fn test_nested_under_sensitive_parent() {
        let result = compare(
            json!({"credentials": {"user": "a"}}),
            json!({"credentials": {"user": "b"}}),
        );
        assert!(result.field_diffs[0].is_sensitive);
    }

    #[test]
    fn test_max_depth_bounds_recursion() {
        let options = DiffOptions {
            max_depth: 1,
            ..Default::default()
        };
        let result = deep_compare(
            &json!({"a": {"b": {"c": 1}}}),
            &json!({"a": {"b": {"c": 2}}}),
            &options,
        );
        assert_eq!(result.field_diffs.len(), 1);
        assert_eq!(result.field_diffs[0].path, "a");
    }

    #[test]
    fn test_ignore_fields() {
        let options = DiffOptions {
            ignore_fields: vec!["schedule".into(), "alert_config.threshold".into()],
            ..Default::default()
        };
        let result = deep_compare(
            &json!({"schedule": "a", "alert_config": {"threshold": 1, "window": 5}}),
            &json!({"schedule": "b", "alert_config": {"threshold": 2, "window": 5}}),
            &options,
        );
        assert!(!result.has_differences);
    }
}
