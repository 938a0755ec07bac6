mod eval;
mod path;
mod update;

pub use eval::matches_filter;
pub use path::{get_path, remove_path, set_path};
pub use update::{
    apply_update, parse_update, validate_update, BitOpKind, CurrentDateKind, PopDirection,
    PushSpec, UpdateContext, UpdateOp, UpdateSpec,
};

use serde_json::Value as JsonValue;

/// Root-level filter keys handled by sibling subsystems, not this engine.
pub(crate) const RESERVED_ROOT_KEYS: &[&str] = &["$text", "$vector", "$geo"];

/// Total type tag used by `$type` and ordered comparison dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Null,
    Boolean,
    Number,
    String,
    Date,
    Array,
    Object,
}

pub(crate) fn kind_of(value: &JsonValue) -> ValueKind {
    match value {
        JsonValue::Null => ValueKind::Null,
        JsonValue::Bool(_) => ValueKind::Boolean,
        JsonValue::Number(_) => ValueKind::Number,
        JsonValue::String(text) => {
            if parse_date(text).is_some() {
                ValueKind::Date
            } else {
                ValueKind::String
            }
        }
        JsonValue::Array(_) => ValueKind::Array,
        JsonValue::Object(_) => ValueKind::Object,
    }
}

pub(crate) fn parse_date(text: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|parsed| parsed.with_timezone(&chrono::Utc))
}

/// Deep equality with the engine's null rules: `null` and absent compare
/// equal, arrays by order and length, objects by key set, date strings by
/// timestamp.
pub(crate) fn deep_eq(left: &JsonValue, right: &JsonValue) -> bool {
    match (left, right) {
        (JsonValue::String(a), JsonValue::String(b)) => {
            match (parse_date(a), parse_date(b)) {
                (Some(da), Some(db)) => da == db,
                _ => a == b,
            }
        }
        (JsonValue::Array(a), JsonValue::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| deep_eq(x, y))
        }
        (JsonValue::Object(a), JsonValue::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, value)| b.get(key).is_some_and(|other| deep_eq(value, other)))
        }
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            }
        }
        _ => left == right,
    }
}

/// Ordered comparison for `$gt`-family operators. Defined for numbers,
/// strings (lexical), dates (timestamp), and booleans (`false < true`);
/// everything else is unordered.
pub(crate) fn compare_ordered(left: &JsonValue, right: &JsonValue) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            a.as_f64().and_then(|x| b.as_f64().and_then(|y| x.partial_cmp(&y)))
        }
        (JsonValue::String(a), JsonValue::String(b)) => match (parse_date(a), parse_date(b)) {
            (Some(da), Some(db)) => Some(da.cmp(&db)),
            _ => Some(a.cmp(b)),
        },
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{compare_ordered, deep_eq, kind_of, ValueKind};
    use serde_json::json;
    use std::cmp::Ordering;

    #[test]
    fn date_strings_compare_by_timestamp() {
        let utc = json!("2024-03-01T00:00:00Z");
        let offset = json!("2024-03-01T01:00:00+01:00");
        assert!(deep_eq(&utc, &offset));
        assert_eq!(compare_ordered(&utc, &offset), Some(Ordering::Equal));
    }

    #[test]
    fn booleans_order_false_before_true() {
        assert_eq!(
            compare_ordered(&json!(false), &json!(true)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn mixed_kinds_are_unordered() {
        assert_eq!(compare_ordered(&json!(1), &json!("1")), None);
        assert_eq!(compare_ordered(&json!(null), &json!(1)), None);
    }

    #[test]
    fn kind_of_distinguishes_dates_from_strings() {
        assert_eq!(kind_of(&json!("2024-03-01T00:00:00Z")), ValueKind::Date);
        assert_eq!(kind_of(&json!("not a date")), ValueKind::String);
    }
}
