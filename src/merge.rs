//! JSON Merger (spec §4.5).
//!
//! The original's function-valued `MergeOptions` (mutually exclusive
//! `RootIsArray`/`CollisionFn`, `ArraySortFn` requiring `RootIsArray`) is
//! replaced by a tagged variant (spec §9 Design Notes) so the illegal
//! combinations are unrepresentable rather than runtime-checked.

use serde_json::Value;
use std::cmp::Ordering;

use crate::json_tree::{merge_values, CollisionFn};

pub enum MergeMode<'a> {
    /// Concatenate each response's top-level array, optionally stable-sort
    /// by a dotted path, optionally strip fields from every entry.
    Array {
        sort_by: Option<&'a str>,
        remove_fields: &'a [String],
    },
    /// Recursive object merge, optionally with a collision resolver for
    /// scalar/array conflicts.
    Object { collision: Option<&'a CollisionFn> },
}

pub fn merge(bodies: Vec<Value>, mode: MergeMode<'_>) -> Value {
    match mode {
        MergeMode::Array { sort_by, remove_fields } => merge_array(bodies, sort_by, remove_fields),
        MergeMode::Object { collision } => merge_object(bodies, collision),
    }
}

fn merge_array(bodies: Vec<Value>, sort_by: Option<&str>, remove_fields: &[String]) -> Value {
    let mut entries: Vec<Value> = Vec::new();
    for body in bodies {
        if let Value::Array(items) = body {
            entries.extend(items);
        }
    }

    if let Some(key) = sort_by {
        entries.sort_by(|a, b| compare_by_path(a, b, key));
    }

    if !remove_fields.is_empty() {
        for entry in entries.iter_mut() {
            if let Value::Object(obj) = entry {
                for field in remove_fields {
                    remove_path(obj, field);
                }
            }
        }
    }

    Value::Array(entries)
}

fn merge_object(bodies: Vec<Value>, collision: Option<&CollisionFn>) -> Value {
    let mut output = Value::Object(serde_json::Map::new());
    for body in bodies {
        merge_values(&mut output, body, collision);
    }
    output
}

/// Stable comparison by a dotted path, numeric-aware so integer timestamps
/// like `added_on` sort by value rather than lexically.
fn compare_by_path(a: &Value, b: &Value, path: &str) -> Ordering {
    let av = crate::json_tree::get_path(a, path);
    let bv = crate::json_tree::get_path(b, path);
    match (av, bv) {
        (Some(Value::Number(na)), Some(Value::Number(nb))) => na
            .as_f64()
            .zip(nb.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// Deletes a (possibly nested, dot-separated) field directly on a
/// `serde_json::Map`, used for the per-entry field strip in array mode.
fn remove_path(obj: &mut serde_json::Map<String, Value>, path: &str) {
    let mut segs = path.splitn(2, '.');
    let Some(head) = segs.next() else { return };
    match segs.next() {
        None => {
            obj.remove(head);
        }
        Some(rest) => {
            if let Some(Value::Object(child)) = obj.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_tree::collision_replace;
    use serde_json::json;

    #[test]
    fn array_mode_concatenates_and_sorts_stably_by_key() {
        let a = json!([{"hash": "aa", "added_on": 2}]);
        let b = json!([{"hash": "bb", "added_on": 1}]);
        let merged = merge(
            vec![a, b],
            MergeMode::Array { sort_by: Some("added_on"), remove_fields: &[] },
        );
        assert_eq!(
            merged,
            json!([{"hash": "bb", "added_on": 1}, {"hash": "aa", "added_on": 2}])
        );
    }

    #[test]
    fn array_mode_sort_is_stable_for_equal_keys() {
        let a = json!([{"hash": "aa", "added_on": 1, "src": "A"}]);
        let b = json!([{"hash": "bb", "added_on": 1, "src": "B"}]);
        let merged = merge(
            vec![a, b],
            MergeMode::Array { sort_by: Some("added_on"), remove_fields: &[] },
        );
        let Value::Array(items) = merged else { panic!("expected array") };
        assert_eq!(items[0]["src"], json!("A"));
        assert_eq!(items[1]["src"], json!("B"));
    }

    #[test]
    fn array_mode_strips_configured_fields() {
        let a = json!([{"hash": "aa", "tracker": "secret"}]);
        let merged = merge(
            vec![a],
            MergeMode::Array { sort_by: None, remove_fields: &["tracker".to_string()] },
        );
        assert_eq!(merged, json!([{"hash": "aa"}]));
    }

    #[test]
    fn object_mode_default_policy_merges_identical_responses_idempotently() {
        let body = json!({"server_state": {"dl_info_speed": 100}});
        let merged = merge(
            vec![body.clone(), body.clone(), body],
            MergeMode::Object { collision: None },
        );
        assert_eq!(merged, json!({"server_state": {"dl_info_speed": 100}}));
    }

    #[test]
    fn object_mode_with_collision_replace_concatenates_conflicting_arrays() {
        let a = json!({"tags": ["x"]});
        let b = json!({"tags": ["y"]});
        let merged = merge(vec![a, b], MergeMode::Object { collision: Some(&collision_replace) });
        assert_eq!(merged, json!({"tags": ["x", "y"]}));
    }
}
