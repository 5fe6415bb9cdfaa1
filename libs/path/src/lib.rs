//! # mp-path
//!
//! Slash-delimited addressing into `serde_json::Value` documents.
//!
//! The same accessor is used by the rule engine (predicate targets, metadata
//! rewrites) and by the admin surface (reading and writing nested fields of
//! rules, routes and sessions).
//!
//! ## Path grammar
//!
//! - A leading `/` is optional, a single trailing `/` is ignored.
//! - `""` and `"/"` address the whole document.
//! - Every other segment is an object key, or an index when the container is
//!   an array.
//!
//! Reads never fail: a missing intermediate yields `None`. Writes never fail
//! either: missing intermediates are created as empty objects and scalars in
//! the way are replaced.

use serde_json::{Map, Value};

/// Arrays are never padded by more than this many `null` slots in one write.
/// A larger index re-keys the array into an object instead.
pub const MAX_ARRAY_PADDING: usize = 4096;

/// Splits a path into its segments.
///
/// ```
/// assert_eq!(mp_path::split("/a/b/"), vec!["a", "b"]);
/// assert!(mp_path::split("/").is_empty());
/// ```
pub fn split(path: &str) -> Vec<&str> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    }
}

/// Returns true if the path addresses the whole document.
pub fn is_root(path: &str) -> bool {
    split(path).is_empty()
}

/// Reads the value at `path`.
pub fn get<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    split(path)
        .into_iter()
        .try_fold(document, |node, segment| child(node, segment))
}

/// Mutable variant of [`get`]. Never creates structure.
pub fn get_mut<'a>(document: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    split(path)
        .into_iter()
        .try_fold(document, |node, segment| child_mut(node, segment))
}

/// Writes a deep copy of `value` at `path`, creating intermediates as needed.
///
/// Writing at the root replaces the whole document.
pub fn set(document: &mut Value, path: &str, value: &Value) {
    let segments = split(path);
    let Some((last, parents)) = segments.split_last() else {
        *document = value.clone();
        return;
    };

    let mut node = document;
    for segment in parents {
        node = slot(node, segment);
    }
    *slot(node, last) = value.clone();
}

/// Owned variant of [`set`]: consumes the document and returns the new root.
#[must_use]
pub fn with(mut document: Value, path: &str, value: &Value) -> Value {
    set(&mut document, path, value);
    document
}

/// Removes and returns the value at `path`.
///
/// The root itself cannot be removed; `remove(doc, "/")` returns `None`.
pub fn remove(document: &mut Value, path: &str) -> Option<Value> {
    let segments = split(path);
    let (last, parents) = segments.split_last()?;
    let parent = parents
        .iter()
        .try_fold(document, |node, segment| child_mut(node, segment))?;

    match parent {
        Value::Object(map) => {
            let key = object_key(map, last);
            map.remove(&key)
        }
        Value::Array(items) => {
            let index = array_index(last)?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

fn child<'a>(node: &'a Value, segment: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(&object_key(map, segment)),
        Value::Array(items) => items.get(array_index(segment)?),
        _ => None,
    }
}

fn child_mut<'a>(node: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => {
            let key = object_key(map, segment);
            map.get_mut(&key)
        }
        Value::Array(items) => items.get_mut(array_index(segment)?),
        _ => None,
    }
}

/// Returns the child slot for `segment`, reshaping `node` into a container
/// that can hold it.
fn slot<'a>(node: &'a mut Value, segment: &str) -> &'a mut Value {
    let index = array_index(segment);
    normalize_container(node, index);

    match node {
        Value::Array(items) => {
            // normalize_container guarantees a usable index for arrays
            let index = index.unwrap_or(items.len());
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            &mut items[index]
        }
        Value::Object(map) => {
            let key = object_key(map, segment);
            map.entry(key).or_insert(Value::Null)
        }
        other => other,
    }
}

fn normalize_container(node: &mut Value, index: Option<usize>) {
    match node {
        Value::Object(_) => {}
        Value::Array(items) => {
            let fits = index.is_some_and(|i| i <= items.len() + MAX_ARRAY_PADDING);
            if !fits {
                let map: Map<String, Value> = std::mem::take(items)
                    .into_iter()
                    .enumerate()
                    .map(|(i, value)| (i.to_string(), value))
                    .collect();
                *node = Value::Object(map);
            }
        }
        _ => *node = Value::Object(Map::new()),
    }
}

/// Object key for a segment. An exact key wins; otherwise integer segments
/// are canonicalized (`"007"` addresses key `"7"`).
fn object_key(map: &Map<String, Value>, segment: &str) -> String {
    if map.contains_key(segment) {
        return segment.to_string();
    }
    match segment.parse::<i64>() {
        Ok(number) => number.to_string(),
        Err(_) => segment.to_string(),
    }
}

fn array_index(segment: &str) -> Option<usize> {
    segment.parse::<usize>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_split_normalizes_slashes() {
        assert_eq!(split("a/b"), vec!["a", "b"]);
        assert_eq!(split("/a/b"), vec!["a", "b"]);
        assert_eq!(split("/a/b/"), vec!["a", "b"]);
        assert!(split("").is_empty());
        assert!(split("/").is_empty());
        assert!(is_root("/"));
        assert!(!is_root("/a"));
    }

    #[test]
    fn test_get_walks_objects_and_arrays() {
        let doc = json!({"TCP": {"dst_port": 80}, "hosts": ["a", "b"]});

        assert_eq!(get(&doc, "/TCP/dst_port"), Some(&json!(80)));
        assert_eq!(get(&doc, "TCP/dst_port/"), Some(&json!(80)));
        assert_eq!(get(&doc, "/hosts/1"), Some(&json!("b")));
        assert_eq!(get(&doc, "/"), Some(&doc));
        assert_eq!(get(&doc, ""), Some(&doc));
    }

    #[test]
    fn test_get_missing_is_none() {
        let doc = json!({"a": {"b": 1}, "list": [1]});

        assert_eq!(get(&doc, "/a/c"), None);
        assert_eq!(get(&doc, "/x/y/z"), None);
        assert_eq!(get(&doc, "/a/b/c"), None);
        assert_eq!(get(&doc, "/list/5"), None);
        assert_eq!(get(&doc, "/list/first"), None);
    }

    #[test]
    fn test_numeric_segment_on_object_is_a_key() {
        let doc = json!({"7": "seven", "007": "literal"});

        assert_eq!(get(&doc, "/7"), Some(&json!("seven")));
        assert_eq!(get(&doc, "/007"), Some(&json!("literal")));

        let mut doc = json!({});
        set(&mut doc, "/a/0", &json!(true));
        assert_eq!(doc, json!({"a": {"0": true}}));
    }

    #[test]
    fn test_set_creates_structure() {
        let mut doc = json!({});
        set(&mut doc, "/a/b/c", &json!(1));
        assert_eq!(doc, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_set_replaces_scalar_intermediate() {
        let mut doc = json!({"a": 5});
        set(&mut doc, "/a/b", &json!("x"));
        assert_eq!(doc, json!({"a": {"b": "x"}}));
    }

    #[test]
    fn test_set_root_replaces_document() {
        let mut doc = json!({"old": true});
        set(&mut doc, "/", &json!([1, 2]));
        assert_eq!(doc, json!([1, 2]));

        let doc = with(json!(null), "", &json!({"new": 1}));
        assert_eq!(doc, json!({"new": 1}));
    }

    #[test]
    fn test_set_array_index() {
        let mut doc = json!({"list": [1, 2, 3]});
        set(&mut doc, "/list/1", &json!("two"));
        assert_eq!(doc, json!({"list": [1, "two", 3]}));

        set(&mut doc, "/list/5", &json!(6));
        assert_eq!(doc, json!({"list": [1, "two", 3, null, null, 6]}));
    }

    #[test]
    fn test_set_named_segment_rekeys_array() {
        let mut doc = json!({"list": ["a"]});
        set(&mut doc, "/list/tail", &json!("b"));
        assert_eq!(doc, json!({"list": {"0": "a", "tail": "b"}}));
    }

    #[test]
    fn test_set_huge_index_does_not_pad() {
        let mut doc = json!([]);
        set(&mut doc, "/100000", &json!(1));
        assert_eq!(doc, json!({"100000": 1}));
    }

    #[test]
    fn test_set_deep_copies_value() {
        let mut value = json!({"nested": [1]});
        let mut doc = json!({});
        set(&mut doc, "/copy", &value);

        set(&mut value, "/nested/0", &json!(99));
        assert_eq!(get(&doc, "/copy/nested/0"), Some(&json!(1)));
    }

    #[test]
    fn test_get_mut_does_not_create() {
        let mut doc = json!({"a": {"b": 1}});
        if let Some(node) = get_mut(&mut doc, "/a/b") {
            *node = json!(2);
        }
        assert!(get_mut(&mut doc, "/a/missing").is_none());
        assert_eq!(doc, json!({"a": {"b": 2}}));
    }

    #[test]
    fn test_remove() {
        let mut doc = json!({"a": {"b": 1, "c": 2}, "list": [1, 2, 3]});

        assert_eq!(remove(&mut doc, "/a/b"), Some(json!(1)));
        assert_eq!(remove(&mut doc, "/list/0"), Some(json!(1)));
        assert_eq!(remove(&mut doc, "/list/9"), None);
        assert_eq!(remove(&mut doc, "/missing/x"), None);
        assert_eq!(remove(&mut doc, "/"), None);
        assert_eq!(doc, json!({"a": {"c": 2}, "list": [2, 3]}));
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,6}"
    }

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,12}".prop_map(Value::from),
        ]
    }

    proptest! {
        #[test]
        fn prop_set_then_get_roundtrips(
            segments in prop::collection::vec(segment(), 1..5),
            value in scalar(),
            seed in scalar(),
        ) {
            let path = format!("/{}", segments.join("/"));
            let mut doc = json!({"seed": seed});
            set(&mut doc, &path, &value);
            prop_assert_eq!(get(&doc, &path), Some(&value));
        }

        #[test]
        fn prop_set_leaves_siblings_alone(
            segments in prop::collection::vec(segment(), 1..4),
            value in scalar(),
        ) {
            let path = format!("/branch/{}", segments.join("/"));
            let mut doc = json!({"sibling": {"x": 1}});
            set(&mut doc, &path, &value);
            prop_assert_eq!(get(&doc, "/sibling/x"), Some(&json!(1)));
        }
    }
}
