//! Path-addressed JSON tree abstraction (spec §9 Design Notes).
//!
//! Stands in for the original's dynamic `gabs` container with a thin wrapper
//! around `serde_json::Value`: `children`, `get`, `set`, `delete`, `merge`.
//! Paths are dot-separated (`server_state.dl_info_speed`).

use serde_json::{Map, Value};

/// A collision resolver invoked on every scalar/array merge conflict
/// (spec §4.5). Object-vs-object conflicts always recurse and never reach
/// this hook.
pub type CollisionFn = dyn Fn(Value, Value) -> Value + Send + Sync;

/// The canonical collision policy: concatenate arrays (promoting a scalar
/// to a one-element array when only one side is an array), otherwise keep
/// the source.
pub fn collision_replace(dest: Value, source: Value) -> Value {
    match (dest, source) {
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Value::Array(a)
        }
        (Value::Array(mut a), scalar) => {
            a.push(scalar);
            Value::Array(a)
        }
        (scalar, Value::Array(b)) => {
            let mut out = Vec::with_capacity(b.len() + 1);
            out.push(scalar);
            out.extend(b);
            Value::Array(out)
        }
        (_, source) => source,
    }
}

#[derive(Debug, Clone)]
pub struct JsonTree(Value);

impl JsonTree {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> Value {
        self.0
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Top-level array children, empty if the root isn't an array.
    pub fn children(&self) -> Vec<&Value> {
        match &self.0 {
            Value::Array(items) => items.iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path(&self.0, path)
    }

    pub fn set(&mut self, path: &str, new_value: Value) {
        let segs: Vec<&str> = path.split('.').collect();
        set_at(&mut self.0, &segs, new_value);
    }

    pub fn delete(&mut self, path: &str) {
        let segs: Vec<&str> = path.split('.').collect();
        delete_at(&mut self.0, &segs);
    }

    /// Merge `other` into this tree. With no collision function: recursive
    /// merge for objects, concatenation for arrays, last-writer-wins for
    /// scalars. With one: it is invoked on every scalar/array conflict.
    pub fn merge(&mut self, other: Value, collision: Option<&CollisionFn>) {
        merge_values(&mut self.0, other, collision);
    }
}

pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |cur, seg| cur.get(seg))
}

fn set_at(root: &mut Value, segs: &[&str], new_value: Value) {
    if segs.is_empty() {
        *root = new_value;
        return;
    }
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let obj = root.as_object_mut().expect("just normalized to object");
    if segs.len() == 1 {
        obj.insert(segs[0].to_string(), new_value);
    } else {
        let child = obj
            .entry(segs[0].to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        set_at(child, &segs[1..], new_value);
    }
}

fn delete_at(root: &mut Value, segs: &[&str]) {
    if segs.is_empty() {
        return;
    }
    if let Value::Object(obj) = root {
        if segs.len() == 1 {
            obj.remove(segs[0]);
        } else if let Some(child) = obj.get_mut(segs[0]) {
            delete_at(child, &segs[1..]);
        }
    }
}

/// Merge `source` into `dest` in place.
pub fn merge_values(dest: &mut Value, source: Value, collision: Option<&CollisionFn>) {
    if dest.is_object() && source.is_object() {
        let dest_map = dest.as_object_mut().expect("checked is_object");
        if let Value::Object(src_map) = source {
            for (key, value) in src_map {
                match dest_map.remove(&key) {
                    Some(existing) => {
                        dest_map.insert(key, merge_entry(existing, value, collision));
                    }
                    None => {
                        dest_map.insert(key, value);
                    }
                }
            }
        }
    } else {
        *dest = source;
    }
}

fn merge_entry(dest: Value, source: Value, collision: Option<&CollisionFn>) -> Value {
    if dest.is_object() && source.is_object() {
        let mut merged = dest;
        merge_values(&mut merged, source, collision);
        return merged;
    }
    match collision {
        Some(resolve) => resolve(dest, source),
        None => match (&dest, &source) {
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.clone());
                Value::Array(out)
            }
            _ => source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_path_walks_nested_objects() {
        let tree = JsonTree::new(json!({"server_state": {"dl_info_speed": 300}}));
        assert_eq!(tree.get("server_state.dl_info_speed"), Some(&json!(300)));
        assert_eq!(tree.get("server_state.missing"), None);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut tree = JsonTree::new(json!({}));
        tree.set("server_state.alltime_dl", json!(1500));
        assert_eq!(tree.get("server_state.alltime_dl"), Some(&json!(1500)));
    }

    #[test]
    fn set_overwrites_existing_value() {
        let mut tree = JsonTree::new(json!({"server_state": {"alltime_dl": 100}}));
        tree.set("server_state.alltime_dl", json!(200));
        assert_eq!(tree.get("server_state.alltime_dl"), Some(&json!(200)));
    }

    #[test]
    fn delete_removes_leaf_field() {
        let mut tree = JsonTree::new(json!({"hash": "aa", "tracker": "x"}));
        tree.delete("tracker");
        assert_eq!(tree.get("tracker"), None);
        assert_eq!(tree.get("hash"), Some(&json!("aa")));
    }

    #[test]
    fn default_merge_concatenates_arrays_and_recurses_objects() {
        let mut dest = json!({"a": [1, 2], "nested": {"x": 1}});
        merge_values(&mut dest, json!({"a": [3], "nested": {"y": 2}}), None);
        assert_eq!(dest, json!({"a": [1, 2, 3], "nested": {"x": 1, "y": 2}}));
    }

    #[test]
    fn default_merge_scalar_conflict_is_last_writer_wins() {
        let mut dest = json!({"count": 1});
        merge_values(&mut dest, json!({"count": 2}), None);
        assert_eq!(dest, json!({"count": 2}));
    }

    #[test]
    fn collision_replace_promotes_scalar_to_array() {
        let merged = collision_replace(json!(1), json!([2, 3]));
        assert_eq!(merged, json!([1, 2, 3]));
    }

    #[test]
    fn collision_replace_otherwise_returns_source() {
        let merged = collision_replace(json!("old"), json!("new"));
        assert_eq!(merged, json!("new"));
    }

    #[test]
    fn merge_with_collision_fn_applies_only_to_conflicts() {
        let mut dest = json!({"server_state": {"dl_info_speed": 100}});
        merge_values(
            &mut dest,
            json!({"server_state": {"dl_info_speed": 200}}),
            Some(&collision_replace),
        );
        assert_eq!(dest, json!({"server_state": {"dl_info_speed": [100, 200]}}));
    }
}
