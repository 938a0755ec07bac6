use regex::RegexBuilder;
use serde_json::Value as JsonValue;

use super::path::{get_path, path_exists};
use super::{compare_ordered, deep_eq, kind_of, parse_date, ValueKind, RESERVED_ROOT_KEYS};

/// Decides whether a document satisfies a filter. Empty or non-object
/// filters match everything; unknown operators match nothing.
pub fn matches_filter(doc: &JsonValue, filter: &JsonValue) -> bool {
    let Some(conditions) = filter.as_object() else {
        return true;
    };

    conditions.iter().all(|(key, condition)| match key.as_str() {
        "$and" => condition
            .as_array()
            .is_some_and(|clauses| clauses.iter().all(|clause| matches_filter(doc, clause))),
        "$or" => condition
            .as_array()
            .is_some_and(|clauses| clauses.iter().any(|clause| matches_filter(doc, clause))),
        "$nor" => condition
            .as_array()
            .is_some_and(|clauses| !clauses.iter().any(|clause| matches_filter(doc, clause))),
        "$not" => !matches_filter(doc, condition),
        _ if RESERVED_ROOT_KEYS.contains(&key.as_str()) => true,
        path => matches_field(get_path(doc, path), path_exists(doc, path), condition),
    })
}

fn matches_field(
    value: Option<&JsonValue>,
    exists: bool,
    condition: &JsonValue,
) -> bool {
    if let Some(operators) = operator_map(condition) {
        let regex_options = operators.get("$options").and_then(JsonValue::as_str);
        return operators
            .iter()
            .all(|(op, operand)| matches_operator(value, exists, regex_options, op, operand));
    }
    direct_eq(value, condition)
}

/// An object condition is an operator map only when every key is a `$`
/// operator; otherwise it is a literal document compared by deep equality.
fn operator_map(condition: &JsonValue) -> Option<&serde_json::Map<String, JsonValue>> {
    let map = condition.as_object()?;
    if !map.is_empty() && map.keys().all(|key| key.starts_with('$')) {
        Some(map)
    } else {
        None
    }
}

/// Direct equality. `null` matches both explicit null and absent keys.
fn direct_eq(value: Option<&JsonValue>, operand: &JsonValue) -> bool {
    match value {
        Some(value) => deep_eq(value, operand),
        None => operand.is_null(),
    }
}

fn matches_operator(
    value: Option<&JsonValue>,
    exists: bool,
    regex_options: Option<&str>,
    op: &str,
    operand: &JsonValue,
) -> bool {
    match op {
        "$eq" => direct_eq(value, operand),
        "$ne" => !direct_eq(value, operand),
        "$gt" => ordered(value, operand, |ord| ord.is_gt()),
        "$gte" => ordered(value, operand, |ord| ord.is_ge()),
        "$lt" => ordered(value, operand, |ord| ord.is_lt()),
        "$lte" => ordered(value, operand, |ord| ord.is_le()),
        "$in" => operand
            .as_array()
            .is_some_and(|choices| choices.iter().any(|choice| in_match(value, choice))),
        "$nin" => operand
            .as_array()
            .is_some_and(|choices| !choices.iter().any(|choice| in_match(value, choice))),
        "$regex" => regex_match(value, regex_options, operand),
        "$options" => true, // consumed by $regex
        "$startsWith" => string_op(value, operand, |field, probe| field.starts_with(probe)),
        "$endsWith" => string_op(value, operand, |field, probe| field.ends_with(probe)),
        "$contains" => string_op(value, operand, |field, probe| field.contains(probe)),
        "$all" => match (value.and_then(JsonValue::as_array), operand.as_array()) {
            (Some(items), Some(required)) => required
                .iter()
                .all(|needle| items.iter().any(|item| deep_eq(item, needle))),
            _ => false,
        },
        "$elemMatch" => value
            .and_then(JsonValue::as_array)
            .is_some_and(|items| items.iter().any(|item| elem_match(item, operand))),
        "$size" => match (value.and_then(JsonValue::as_array), operand.as_u64()) {
            (Some(items), Some(expected)) => items.len() as u64 == expected,
            _ => false,
        },
        "$exists" => operand.as_bool().is_some_and(|expected| exists == expected),
        "$type" => operand
            .as_str()
            .is_some_and(|expected| type_match(value, expected)),
        "$not" => !matches_field(value, exists, operand),
        _ => false,
    }
}

fn ordered(
    value: Option<&JsonValue>,
    operand: &JsonValue,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    value
        .and_then(|value| compare_ordered(value, operand))
        .is_some_and(accept)
}

/// `$in` matches a direct value or any element of an array field.
fn in_match(value: Option<&JsonValue>, choice: &JsonValue) -> bool {
    if direct_eq(value, choice) {
        return true;
    }
    value
        .and_then(JsonValue::as_array)
        .is_some_and(|items| items.iter().any(|item| deep_eq(item, choice)))
}

fn string_op(
    value: Option<&JsonValue>,
    operand: &JsonValue,
    accept: impl Fn(&str, &str) -> bool,
) -> bool {
    match (value.and_then(JsonValue::as_str), operand.as_str()) {
        (Some(field), Some(probe)) => accept(field, probe),
        _ => false,
    }
}

fn regex_match(value: Option<&JsonValue>, options: Option<&str>, operand: &JsonValue) -> bool {
    let Some(field) = value.and_then(JsonValue::as_str) else {
        return false;
    };
    let Some(pattern) = operand.as_str() else {
        return false;
    };
    let mut builder = RegexBuilder::new(pattern);
    if let Some(options) = options {
        builder.case_insensitive(options.contains('i'));
        builder.multi_line(options.contains('m'));
    }
    builder
        .build()
        .map(|regex| regex.is_match(field))
        .unwrap_or(false)
}

fn elem_match(item: &JsonValue, condition: &JsonValue) -> bool {
    matches_element(item, condition)
}

/// Evaluates a per-element condition (`$elemMatch`, `$pull`): an operator
/// map applies directly to the element, a literal object is a sub-filter,
/// anything else compares by deep equality.
pub(crate) fn matches_element(item: &JsonValue, condition: &JsonValue) -> bool {
    if let Some(operators) = operator_map(condition) {
        let regex_options = operators.get("$options").and_then(JsonValue::as_str);
        return operators
            .iter()
            .all(|(op, operand)| matches_operator(Some(item), true, regex_options, op, operand));
    }
    if condition.is_object() {
        return matches_filter(item, condition);
    }
    deep_eq(item, condition)
}

fn type_match(value: Option<&JsonValue>, expected: &str) -> bool {
    let kind = match value {
        None => ValueKind::Null,
        Some(value) => kind_of(value),
    };
    match expected {
        "null" => kind == ValueKind::Null,
        "boolean" => kind == ValueKind::Boolean,
        "number" => kind == ValueKind::Number,
        "string" => kind == ValueKind::String || kind == ValueKind::Date,
        "date" => {
            kind == ValueKind::Date
                || value
                    .and_then(JsonValue::as_str)
                    .is_some_and(|text| parse_date(text).is_some())
        }
        "array" => kind == ValueKind::Array,
        "object" => kind == ValueKind::Object,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::matches_filter;
    use serde_json::json;

    #[test]
    fn empty_filter_matches_all() {
        assert!(matches_filter(&json!({"a": 1}), &json!({})));
        assert!(matches_filter(&json!({"a": 1}), &json!(null)));
    }

    #[test]
    fn direct_equality_is_deep() {
        let doc = json!({"tags": ["a", "b"], "meta": {"x": 1, "y": 2}});
        assert!(matches_filter(&doc, &json!({"tags": ["a", "b"]})));
        assert!(!matches_filter(&doc, &json!({"tags": ["b", "a"]})));
        assert!(matches_filter(&doc, &json!({"meta": {"y": 2, "x": 1}})));
        assert!(!matches_filter(&doc, &json!({"meta": {"x": 1}})));
    }

    #[test]
    fn null_matches_absent_and_explicit_null() {
        assert!(matches_filter(&json!({"a": null}), &json!({"a": null})));
        assert!(matches_filter(&json!({}), &json!({"a": null})));
        assert!(!matches_filter(&json!({"a": 0}), &json!({"a": null})));
    }

    #[test]
    fn comparison_operators_respect_type_boundaries() {
        let doc = json!({"age": 30, "name": "carol"});
        assert!(matches_filter(&doc, &json!({"age": {"$gt": 18, "$lte": 30}})));
        assert!(matches_filter(&doc, &json!({"name": {"$gte": "bob"}})));
        assert!(!matches_filter(&doc, &json!({"age": {"$gt": "18"}})));
        assert!(!matches_filter(&json!({"age": null}), &json!({"age": {"$gt": 0}})));
        assert!(!matches_filter(&json!({}), &json!({"age": {"$gt": 0}})));
    }

    #[test]
    fn in_and_nin_cover_arrays_and_scalars() {
        let doc = json!({"status": "draft", "tags": ["x", "y"]});
        assert!(matches_filter(&doc, &json!({"status": {"$in": ["draft", "live"]}})));
        assert!(matches_filter(&doc, &json!({"tags": {"$in": ["y"]}})));
        assert!(matches_filter(&doc, &json!({"status": {"$nin": ["live"]}})));
        assert!(!matches_filter(&doc, &json!({"tags": {"$nin": ["x"]}})));
    }

    #[test]
    fn logical_operators_compose() {
        let doc = json!({"a": 1, "b": 2});
        assert!(matches_filter(
            &doc,
            &json!({"$and": [{"a": 1}, {"b": {"$gt": 1}}]})
        ));
        assert!(matches_filter(&doc, &json!({"$or": [{"a": 5}, {"b": 2}]})));
        assert!(matches_filter(&doc, &json!({"$nor": [{"a": 5}, {"b": 7}]})));
        assert!(matches_filter(&doc, &json!({"$not": {"a": 5}})));
        assert!(!matches_filter(&doc, &json!({"$not": {"a": 1}})));
    }

    #[test]
    fn string_operators_require_string_operands() {
        let doc = json!({"title": "Streaming row groups"});
        assert!(matches_filter(&doc, &json!({"title": {"$startsWith": "Stream"}})));
        assert!(matches_filter(&doc, &json!({"title": {"$endsWith": "groups"}})));
        assert!(matches_filter(&doc, &json!({"title": {"$contains": "row"}})));
        assert!(!matches_filter(&json!({"title": 7}), &json!({"title": {"$contains": "7"}})));
    }

    #[test]
    fn regex_matches_and_rejects_non_strings() {
        let doc = json!({"slug": "post-2024-03"});
        assert!(matches_filter(&doc, &json!({"slug": {"$regex": "^post-\\d{4}"}})));
        assert!(!matches_filter(&json!({"slug": 9}), &json!({"slug": {"$regex": "9"}})));
    }

    #[test]
    fn regex_options_select_case_insensitive_matching() {
        let doc = json!({"title": "Hello World"});
        assert!(!matches_filter(&doc, &json!({"title": {"$regex": "hello"}})));
        assert!(matches_filter(
            &doc,
            &json!({"title": {"$regex": "hello", "$options": "i"}})
        ));
    }

    #[test]
    fn size_matches_arrays_only() {
        assert!(matches_filter(&json!({"tags": []}), &json!({"tags": {"$size": 0}})));
        assert!(!matches_filter(&json!({"tags": "ab"}), &json!({"tags": {"$size": 2}})));
        assert!(matches_filter(&json!({"tags": [1, 2]}), &json!({"tags": {"$size": 2}})));
    }

    #[test]
    fn elem_match_supports_operators_and_subdocuments() {
        let doc = json!({"scores": [3, 9], "items": [{"qty": 5}, {"qty": 20}]});
        assert!(matches_filter(&doc, &json!({"scores": {"$elemMatch": {"$gt": 8}}})));
        assert!(matches_filter(
            &doc,
            &json!({"items": {"$elemMatch": {"qty": {"$gte": 10}}}})
        ));
        assert!(!matches_filter(&doc, &json!({"scores": {"$elemMatch": {"$gt": 10}}})));
    }

    #[test]
    fn exists_and_type_handle_null_and_absent() {
        let doc = json!({"a": null, "b": 1});
        assert!(matches_filter(&doc, &json!({"a": {"$exists": true}})));
        assert!(matches_filter(&doc, &json!({"c": {"$exists": false}})));
        assert!(matches_filter(&doc, &json!({"a": {"$type": "null"}})));
        assert!(matches_filter(&doc, &json!({"c": {"$type": "null"}})));
        assert!(matches_filter(&doc, &json!({"b": {"$type": "number"}})));
        assert!(matches_filter(
            &json!({"ts": "2024-01-01T00:00:00Z"}),
            &json!({"ts": {"$type": "date"}})
        ));
    }

    #[test]
    fn reserved_root_keys_are_ignored() {
        let doc = json!({"a": 1});
        assert!(matches_filter(
            &doc,
            &json!({"$text": {"$search": "anything"}, "a": 1})
        ));
        assert!(matches_filter(&doc, &json!({"$vector": [0.1], "$geo": {}})));
    }

    #[test]
    fn dot_paths_reach_nested_and_indexed_values() {
        let doc = json!({"user": {"profile": {"age": 44}}, "items": [{"name": "n0"}]});
        assert!(matches_filter(&doc, &json!({"user.profile.age": {"$gte": 44}})));
        assert!(matches_filter(&doc, &json!({"items.0.name": "n0"})));
    }
}
