//! Left-fold merging of config patches.
//!
//! Nested objects merge key-wise; scalars and lists from the more specific patch replace the
//! inherited value wholesale. `null` in a patch counts as "not set".

use serde_json::{Map, Value};

/// Merge `patch` into `base` in place.
pub fn merge_into(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_into(existing, patch_value),
                    None => {
                        if !patch_value.is_null() {
                            base_map.insert(key.clone(), patch_value.clone());
                        }
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Return `base` merged with `patch`.
pub fn merged(base: &Value, patch: &Value) -> Value {
    let mut out = base.clone();
    merge_into(&mut out, patch);
    out
}

/// Fold a chain of patches, least specific first.
pub fn fold<'a>(patches: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut out = Value::Object(Map::new());
    for p in patches {
        merge_into(&mut out, p);
    }
    out
}

/// Every combination of an inherited config with a local document.
///
/// An empty side behaves like a single empty patch, so a node without config files simply
/// inherits its parent's configs.
pub fn combine(bases: &[Value], patches: &[Value]) -> Vec<Value> {
    let empty = [Value::Object(Map::new())];
    let bases = if bases.is_empty() { &empty[..] } else { bases };
    let patches = if patches.is_empty() { &empty[..] } else { patches };
    bases
        .iter()
        .flat_map(|b| patches.iter().map(move |p| merged(b, p)))
        .collect()
}

/// Set `value` at a dotted path (e.g. `source.url`), creating objects along the way.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let mut cur = root;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let Value::Object(map) = cur else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        cur = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Read a string at a dotted path.
pub fn get_str<'a>(root: &'a Value, path: &str) -> Option<&'a str> {
    let mut cur = root;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    cur.as_str()
}

/// Build a patch holding a single dotted-path value.
pub fn patch(path: &str, value: Value) -> Value {
    let mut out = Value::Object(Map::new());
    set_path(&mut out, path, value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_merge_and_scalars_replace() {
        let base = json!({"source": {"url": "a.csv", "options": {"delimiter": ";"}}, "transform": [1, 2]});
        let out = merged(
            &base,
            &json!({"source": {"options": {"header": false}}, "transform": [3]}),
        );
        assert_eq!(
            out,
            json!({"source": {"url": "a.csv", "options": {"delimiter": ";", "header": false}}, "transform": [3]})
        );
    }

    #[test]
    fn later_patches_win() {
        let root = json!({"target": {"if_exists": "fail", "url": "r"}});
        let dir = json!({"target": {"if_exists": "append"}});
        let leaf = json!({"target": {"if_exists": "replace"}});
        assert_eq!(fold([&root, &dir, &leaf])["target"]["if_exists"], "replace");
        assert_eq!(fold([&root, &dir])["target"]["if_exists"], "append");
        assert_eq!(fold([&root, &dir])["target"]["url"], "r");
    }

    #[test]
    fn null_does_not_unset() {
        let out = merged(&json!({"a": 1}), &json!({"a": null, "b": null}));
        assert_eq!(out, json!({"a": 1}));
    }

    #[test]
    fn combine_is_a_cartesian_product() {
        let out = combine(&[json!({"a": 1}), json!({"a": 2})], &[json!({"b": 1}), json!({"b": 2})]);
        assert_eq!(out.len(), 4);
        assert_eq!(combine(&[], &[]), vec![json!({})]);
    }

    #[test]
    fn set_and_get_dotted_paths() {
        let mut v = json!({});
        set_path(&mut v, "source.url", json!("x.csv"));
        assert_eq!(get_str(&v, "source.url"), Some("x.csv"));
        assert_eq!(patch("target.table", json!("t")), json!({"target": {"table": "t"}}));
    }
}
