use serde_json::{Map, Value as JsonValue};

/// Resolves a dot path (`user.profile.age`, `items.0.name`) against a
/// document. Numeric segments index into arrays.
pub fn get_path<'a>(doc: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = doc;
    for segment in path.split('.') {
        match current {
            JsonValue::Object(map) => {
                current = map.get(segment)?;
            }
            JsonValue::Array(items) => {
                let index: usize = segment.parse().ok()?;
                current = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// True when every segment of the path exists, even if the terminal value
/// is an explicit `null`. Distinguishes `{"a": null}` from `{}` for
/// `$exists`.
pub fn path_exists(doc: &JsonValue, path: &str) -> bool {
    get_path(doc, path).is_some()
}

/// Sets `path` to `value`, materializing intermediate objects. A numeric
/// segment writes into an array when one is already present, padding with
/// nulls past the end.
pub fn set_path(doc: &mut JsonValue, path: &str, value: JsonValue) {
    let segments: Vec<&str> = path.split('.').collect();
    set_path_segments(doc, &segments, value);
}

fn set_path_segments(doc: &mut JsonValue, segments: &[&str], value: JsonValue) {
    let Some((head, rest)) = segments.split_first() else {
        *doc = value;
        return;
    };

    if let JsonValue::Array(items) = doc {
        if let Ok(index) = head.parse::<usize>() {
            while items.len() <= index {
                items.push(JsonValue::Null);
            }
            return set_path_segments(&mut items[index], rest, value);
        }
    }

    if !doc.is_object() {
        *doc = JsonValue::Object(Map::new());
    }
    let JsonValue::Object(map) = &mut *doc else {
        return;
    };
    let slot = map.entry(head.to_string()).or_insert(JsonValue::Null);
    set_path_segments(slot, rest, value);
}

/// Removes the value at `path` and returns it. Missing paths return None
/// and leave the document untouched.
pub fn remove_path(doc: &mut JsonValue, path: &str) -> Option<JsonValue> {
    let segments: Vec<&str> = path.split('.').collect();
    remove_path_segments(doc, &segments)
}

fn remove_path_segments(doc: &mut JsonValue, segments: &[&str]) -> Option<JsonValue> {
    let (head, rest) = segments.split_first()?;
    if rest.is_empty() {
        return match doc {
            JsonValue::Object(map) => map.remove(*head),
            JsonValue::Array(items) => {
                let index: usize = head.parse().ok()?;
                if index < items.len() {
                    Some(items.remove(index))
                } else {
                    None
                }
            }
            _ => None,
        };
    }
    match doc {
        JsonValue::Object(map) => remove_path_segments(map.get_mut(*head)?, rest),
        JsonValue::Array(items) => {
            let index: usize = head.parse().ok()?;
            remove_path_segments(items.get_mut(index)?, rest)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{get_path, path_exists, remove_path, set_path};
    use serde_json::json;

    #[test]
    fn get_path_walks_objects_and_arrays() {
        let doc = json!({"user": {"posts": [{"title": "first"}, {"title": "second"}]}});
        assert_eq!(get_path(&doc, "user.posts.1.title"), Some(&json!("second")));
        assert_eq!(get_path(&doc, "user.posts.2.title"), None);
        assert_eq!(get_path(&doc, "user.missing"), None);
    }

    #[test]
    fn set_path_materializes_intermediate_objects() {
        let mut doc = json!({});
        set_path(&mut doc, "a.b.c", json!(1));
        assert_eq!(doc, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn set_path_pads_arrays_with_nulls() {
        let mut doc = json!({"items": [1]});
        set_path(&mut doc, "items.3", json!(4));
        assert_eq!(doc, json!({"items": [1, null, null, 4]}));
    }

    #[test]
    fn remove_path_returns_removed_value() {
        let mut doc = json!({"a": {"b": 2}, "keep": true});
        assert_eq!(remove_path(&mut doc, "a.b"), Some(json!(2)));
        assert_eq!(doc, json!({"a": {}, "keep": true}));
        assert_eq!(remove_path(&mut doc, "a.b"), None);
    }

    #[test]
    fn explicit_null_exists_but_missing_does_not() {
        let doc = json!({"a": null});
        assert!(path_exists(&doc, "a"));
        assert!(!path_exists(&doc, "b"));
    }
}
