use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::{Number, Value as JsonValue};

use super::path::{get_path, remove_path, set_path};
use super::{compare_ordered, deep_eq};
use crate::ParqueError;

/// Context for one `apply_update` call. A single `now` keeps every
/// `$currentDate` target in the update consistent.
#[derive(Debug, Clone)]
pub struct UpdateContext {
    pub is_insert: bool,
    pub now: DateTime<Utc>,
}

impl UpdateContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            is_insert: false,
            now,
        }
    }

    pub fn insert_at(now: DateTime<Utc>) -> Self {
        Self {
            is_insert: true,
            now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopDirection {
    /// `$pop: -1`
    First,
    /// `$pop: 1`
    Last,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushSpec {
    pub each: Vec<JsonValue>,
    pub position: Option<i64>,
    pub slice: Option<i64>,
    pub sort: Option<JsonValue>,
}

impl PushSpec {
    fn single(value: JsonValue) -> Self {
        Self {
            each: vec![value],
            position: None,
            slice: None,
            sort: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentDateKind {
    Date,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOpKind {
    And,
    Or,
    Xor,
}

/// Update operators as a closed sum; adding an operator is a
/// compile-time-checked change everywhere updates are dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set(BTreeMap<String, JsonValue>),
    Unset(Vec<String>),
    Inc(BTreeMap<String, Number>),
    Mul(BTreeMap<String, Number>),
    Min(BTreeMap<String, JsonValue>),
    Max(BTreeMap<String, JsonValue>),
    Push(BTreeMap<String, PushSpec>),
    Pull(BTreeMap<String, JsonValue>),
    PullAll(BTreeMap<String, Vec<JsonValue>>),
    AddToSet(BTreeMap<String, Vec<JsonValue>>),
    Pop(BTreeMap<String, PopDirection>),
    Rename(BTreeMap<String, String>),
    CurrentDate(BTreeMap<String, CurrentDateKind>),
    SetOnInsert(BTreeMap<String, JsonValue>),
    Bit(BTreeMap<String, Vec<(BitOpKind, i64)>>),
}

impl UpdateOp {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Set(_) => "$set",
            Self::Unset(_) => "$unset",
            Self::Inc(_) => "$inc",
            Self::Mul(_) => "$mul",
            Self::Min(_) => "$min",
            Self::Max(_) => "$max",
            Self::Push(_) => "$push",
            Self::Pull(_) => "$pull",
            Self::PullAll(_) => "$pullAll",
            Self::AddToSet(_) => "$addToSet",
            Self::Pop(_) => "$pop",
            Self::Rename(_) => "$rename",
            Self::CurrentDate(_) => "$currentDate",
            Self::SetOnInsert(_) => "$setOnInsert",
            Self::Bit(_) => "$bit",
        }
    }

    /// Fields this operator writes. `$rename` contributes both ends.
    pub fn target_paths(&self) -> Vec<String> {
        match self {
            Self::Set(map) | Self::Min(map) | Self::Max(map) | Self::SetOnInsert(map) => {
                map.keys().cloned().collect()
            }
            Self::Unset(paths) => paths.clone(),
            Self::Inc(map) | Self::Mul(map) => map.keys().cloned().collect(),
            Self::Push(map) => map.keys().cloned().collect(),
            Self::Pull(map) => map.keys().cloned().collect(),
            Self::PullAll(map) => map.keys().cloned().collect(),
            Self::AddToSet(map) => map.keys().cloned().collect(),
            Self::Pop(map) => map.keys().cloned().collect(),
            Self::Rename(map) => map
                .iter()
                .flat_map(|(from, to)| [from.clone(), to.clone()])
                .collect(),
            Self::CurrentDate(map) => map.keys().cloned().collect(),
            Self::Bit(map) => map.keys().cloned().collect(),
        }
    }

    /// Whether two concurrent applications of this operator compose without
    /// a defined order. Used by the merge engine.
    pub fn is_commutative(&self) -> bool {
        matches!(self, Self::Inc(_) | Self::AddToSet(_) | Self::Push(_))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateSpec {
    pub ops: Vec<UpdateOp>,
}

impl UpdateSpec {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn target_paths(&self) -> Vec<String> {
        self.ops.iter().flat_map(UpdateOp::target_paths).collect()
    }

    pub fn is_commutative(&self) -> bool {
        !self.ops.is_empty() && self.ops.iter().all(UpdateOp::is_commutative)
    }
}

/// Parses a JSON update document (`{"$set": {...}, "$inc": {...}}`) into
/// the typed spec. Unknown operators and non-operator root keys fail with
/// `Invariant`.
pub fn parse_update(update: &JsonValue) -> Result<UpdateSpec, ParqueError> {
    let Some(map) = update.as_object() else {
        return Err(ParqueError::invariant("update must be an object"));
    };

    let mut ops = Vec::with_capacity(map.len());
    for (key, operand) in map {
        ops.push(parse_operator(key, operand)?);
    }
    Ok(UpdateSpec { ops })
}

fn parse_operator(key: &str, operand: &JsonValue) -> Result<UpdateOp, ParqueError> {
    let fields = |operand: &JsonValue| -> Result<BTreeMap<String, JsonValue>, ParqueError> {
        operand
            .as_object()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .ok_or_else(|| ParqueError::invariant(format!("{key} requires an object operand")))
    };

    match key {
        "$set" => Ok(UpdateOp::Set(fields(operand)?)),
        "$setOnInsert" => Ok(UpdateOp::SetOnInsert(fields(operand)?)),
        "$unset" => Ok(UpdateOp::Unset(fields(operand)?.into_keys().collect())),
        "$inc" => Ok(UpdateOp::Inc(numeric_fields(key, operand)?)),
        "$mul" => Ok(UpdateOp::Mul(numeric_fields(key, operand)?)),
        "$min" => Ok(UpdateOp::Min(fields(operand)?)),
        "$max" => Ok(UpdateOp::Max(fields(operand)?)),
        "$push" => {
            let mut specs = BTreeMap::new();
            for (field, value) in fields(operand)? {
                specs.insert(field, parse_push_spec(value)?);
            }
            Ok(UpdateOp::Push(specs))
        }
        "$pull" => Ok(UpdateOp::Pull(fields(operand)?)),
        "$pullAll" => {
            let mut lists = BTreeMap::new();
            for (field, value) in fields(operand)? {
                let list = value.as_array().cloned().ok_or_else(|| {
                    ParqueError::invariant(format!("$pullAll.{field} requires an array"))
                })?;
                lists.insert(field, list);
            }
            Ok(UpdateOp::PullAll(lists))
        }
        "$addToSet" => {
            let mut lists = BTreeMap::new();
            for (field, value) in fields(operand)? {
                let each = match value.as_object().and_then(|map| map.get("$each")) {
                    Some(each) => each.as_array().cloned().ok_or_else(|| {
                        ParqueError::invariant(format!("$addToSet.{field}.$each requires an array"))
                    })?,
                    None => vec![value],
                };
                lists.insert(field, each);
            }
            Ok(UpdateOp::AddToSet(lists))
        }
        "$pop" => {
            let mut directions = BTreeMap::new();
            for (field, value) in fields(operand)? {
                let direction = match value.as_i64() {
                    Some(1) => PopDirection::Last,
                    Some(-1) => PopDirection::First,
                    _ => {
                        return Err(ParqueError::invariant(format!(
                            "$pop.{field} requires 1 or -1"
                        )))
                    }
                };
                directions.insert(field, direction);
            }
            Ok(UpdateOp::Pop(directions))
        }
        "$rename" => {
            let mut renames = BTreeMap::new();
            for (field, value) in fields(operand)? {
                let target = value.as_str().ok_or_else(|| {
                    ParqueError::invariant(format!("$rename.{field} requires a string target"))
                })?;
                renames.insert(field, target.to_string());
            }
            Ok(UpdateOp::Rename(renames))
        }
        "$currentDate" => {
            let mut kinds = BTreeMap::new();
            for (field, value) in fields(operand)? {
                let kind = match &value {
                    JsonValue::Bool(true) => CurrentDateKind::Date,
                    JsonValue::Object(map) => match map.get("$type").and_then(JsonValue::as_str) {
                        Some("date") => CurrentDateKind::Date,
                        Some("timestamp") => CurrentDateKind::Timestamp,
                        _ => {
                            return Err(ParqueError::invariant(format!(
                                "$currentDate.{field} requires true or {{$type}}"
                            )))
                        }
                    },
                    _ => {
                        return Err(ParqueError::invariant(format!(
                            "$currentDate.{field} requires true or {{$type}}"
                        )))
                    }
                };
                kinds.insert(field, kind);
            }
            Ok(UpdateOp::CurrentDate(kinds))
        }
        "$bit" => {
            let mut ops = BTreeMap::new();
            for (field, value) in fields(operand)? {
                let map = value.as_object().ok_or_else(|| {
                    ParqueError::invariant(format!("$bit.{field} requires an operation map"))
                })?;
                let mut sequence = Vec::with_capacity(map.len());
                for (op_name, operand) in map {
                    let kind = match op_name.as_str() {
                        "and" => BitOpKind::And,
                        "or" => BitOpKind::Or,
                        "xor" => BitOpKind::Xor,
                        other => {
                            return Err(ParqueError::invariant(format!(
                                "$bit.{field}: unknown operation {other}"
                            )))
                        }
                    };
                    let operand = operand.as_i64().ok_or_else(|| {
                        ParqueError::invariant(format!("$bit.{field}.{op_name} requires an integer"))
                    })?;
                    sequence.push((kind, operand));
                }
                ops.insert(field, sequence);
            }
            Ok(UpdateOp::Bit(ops))
        }
        other => Err(ParqueError::invariant(format!(
            "unknown update operator: {other}"
        ))),
    }
}

fn numeric_fields(key: &str, operand: &JsonValue) -> Result<BTreeMap<String, Number>, ParqueError> {
    let map = operand
        .as_object()
        .ok_or_else(|| ParqueError::invariant(format!("{key} requires an object operand")))?;
    let mut numbers = BTreeMap::new();
    for (field, value) in map {
        let number = value.as_number().cloned().ok_or_else(|| {
            ParqueError::invariant(format!("{key}.{field} requires a numeric operand"))
        })?;
        numbers.insert(field.clone(), number);
    }
    Ok(numbers)
}

fn parse_push_spec(value: JsonValue) -> Result<PushSpec, ParqueError> {
    let Some(map) = value.as_object() else {
        return Ok(PushSpec::single(value));
    };
    if !map.contains_key("$each") {
        return Ok(PushSpec::single(value));
    }

    let each = map
        .get("$each")
        .and_then(JsonValue::as_array)
        .cloned()
        .ok_or_else(|| ParqueError::invariant("$push.$each requires an array"))?;
    Ok(PushSpec {
        each,
        position: map.get("$position").and_then(JsonValue::as_i64),
        slice: map.get("$slice").and_then(JsonValue::as_i64),
        sort: map.get("$sort").cloned(),
    })
}

/// Rejects specs where the same field is targeted by more than one
/// operator, including `$rename` source/target collisions.
pub fn validate_update(spec: &UpdateSpec) -> Result<(), ParqueError> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for op in &spec.ops {
        for path in op.target_paths() {
            if !seen.insert(path.clone()) {
                return Err(ParqueError::conflict(format!(
                    "update targets field '{path}' from multiple operators"
                )));
            }
        }
    }
    Ok(())
}

/// Applies an update spec functionally: the input document is never
/// mutated; a new document is returned.
pub fn apply_update(
    doc: &JsonValue,
    spec: &UpdateSpec,
    ctx: &UpdateContext,
) -> Result<JsonValue, ParqueError> {
    validate_update(spec)?;
    let mut next = doc.clone();
    if !next.is_object() {
        next = JsonValue::Object(serde_json::Map::new());
    }

    for op in &spec.ops {
        apply_op(&mut next, op, ctx)?;
    }
    Ok(next)
}

fn apply_op(doc: &mut JsonValue, op: &UpdateOp, ctx: &UpdateContext) -> Result<(), ParqueError> {
    match op {
        UpdateOp::Set(fields) => {
            for (path, value) in fields {
                set_path(doc, path, value.clone());
            }
        }
        UpdateOp::SetOnInsert(fields) => {
            if ctx.is_insert {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
        }
        UpdateOp::Unset(paths) => {
            for path in paths {
                remove_path(doc, path);
            }
        }
        UpdateOp::Inc(fields) => {
            for (path, delta) in fields {
                let next = arith(doc, path, delta, "$inc", |a, b| a + b, |a, b| a + b)?;
                set_path(doc, path, next);
            }
        }
        UpdateOp::Mul(fields) => {
            for (path, factor) in fields {
                let next = arith(doc, path, factor, "$mul", |a, b| a * b, |a, b| a * b)?;
                set_path(doc, path, next);
            }
        }
        UpdateOp::Min(fields) => {
            for (path, candidate) in fields {
                let replace = match get_path(doc, path) {
                    None => true,
                    Some(current) => compare_ordered(candidate, current)
                        .is_some_and(|ord| ord.is_lt()),
                };
                if replace {
                    set_path(doc, path, candidate.clone());
                }
            }
        }
        UpdateOp::Max(fields) => {
            for (path, candidate) in fields {
                let replace = match get_path(doc, path) {
                    None => true,
                    Some(current) => compare_ordered(candidate, current)
                        .is_some_and(|ord| ord.is_gt()),
                };
                if replace {
                    set_path(doc, path, candidate.clone());
                }
            }
        }
        UpdateOp::Push(fields) => {
            for (path, push) in fields {
                let mut items = take_array(doc, path, "$push")?;
                apply_push(&mut items, push)?;
                set_path(doc, path, JsonValue::Array(items));
            }
        }
        UpdateOp::Pull(fields) => {
            for (path, condition) in fields {
                // $pull on a missing field is a no-op; the field stays absent.
                if get_path(doc, path).is_none() {
                    continue;
                }
                let mut items = take_array(doc, path, "$pull")?;
                items.retain(|item| !pull_matches(item, condition));
                set_path(doc, path, JsonValue::Array(items));
            }
        }
        UpdateOp::PullAll(fields) => {
            for (path, removals) in fields {
                if get_path(doc, path).is_none() {
                    continue;
                }
                let mut items = take_array(doc, path, "$pullAll")?;
                items.retain(|item| !removals.iter().any(|removal| deep_eq(item, removal)));
                set_path(doc, path, JsonValue::Array(items));
            }
        }
        UpdateOp::AddToSet(fields) => {
            for (path, additions) in fields {
                let mut items = take_array(doc, path, "$addToSet")?;
                for addition in additions {
                    if !items.iter().any(|item| deep_eq(item, addition)) {
                        items.push(addition.clone());
                    }
                }
                set_path(doc, path, JsonValue::Array(items));
            }
        }
        UpdateOp::Pop(fields) => {
            for (path, direction) in fields {
                let mut items = take_array(doc, path, "$pop")?;
                match direction {
                    PopDirection::Last => {
                        items.pop();
                    }
                    PopDirection::First => {
                        if !items.is_empty() {
                            items.remove(0);
                        }
                    }
                }
                set_path(doc, path, JsonValue::Array(items));
            }
        }
        UpdateOp::Rename(renames) => {
            for (from, to) in renames {
                if let Some(value) = remove_path(doc, from) {
                    set_path(doc, to, value);
                }
            }
        }
        UpdateOp::CurrentDate(fields) => {
            for (path, kind) in fields {
                let value = match kind {
                    CurrentDateKind::Date => JsonValue::String(ctx.now.to_rfc3339()),
                    CurrentDateKind::Timestamp => JsonValue::from(ctx.now.timestamp_millis()),
                };
                set_path(doc, path, value);
            }
        }
        UpdateOp::Bit(fields) => {
            for (path, sequence) in fields {
                let mut current = match get_path(doc, path) {
                    None => 0,
                    Some(value) => value.as_i64().ok_or_else(|| {
                        ParqueError::invariant(format!("$bit target '{path}' is not an integer"))
                    })?,
                };
                for (kind, operand) in sequence {
                    current = match kind {
                        BitOpKind::And => current & operand,
                        BitOpKind::Or => current | operand,
                        BitOpKind::Xor => current ^ operand,
                    };
                }
                set_path(doc, path, JsonValue::from(current));
            }
        }
    }
    Ok(())
}

/// Reads an array target, defaulting a missing field to `[]`. Non-array
/// targets fail with `Invariant`.
fn take_array(doc: &JsonValue, path: &str, op: &str) -> Result<Vec<JsonValue>, ParqueError> {
    match get_path(doc, path) {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => Ok(items.clone()),
        Some(_) => Err(ParqueError::invariant(format!(
            "{op} target '{path}' is not an array"
        ))),
    }
}

fn arith(
    doc: &JsonValue,
    path: &str,
    operand: &Number,
    op: &str,
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<JsonValue, ParqueError> {
    let current = match get_path(doc, path) {
        None | Some(JsonValue::Null) => Number::from(0),
        Some(JsonValue::Number(number)) => number.clone(),
        Some(_) => {
            return Err(ParqueError::invariant(format!(
                "{op} target '{path}' is not a number"
            )))
        }
    };

    if let (Some(a), Some(b)) = (current.as_i64(), operand.as_i64()) {
        return Ok(JsonValue::from(int_op(a, b)));
    }
    let a = current.as_f64().unwrap_or(0.0);
    let b = operand.as_f64().unwrap_or(0.0);
    Ok(serde_json::Number::from_f64(float_op(a, b))
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null))
}

/// `$push` modifiers apply in order: splice at `$position`, sort, slice.
fn apply_push(items: &mut Vec<JsonValue>, push: &PushSpec) -> Result<(), ParqueError> {
    let position = match push.position {
        None => items.len(),
        Some(position) if position >= 0 => (position as usize).min(items.len()),
        Some(position) => items.len().saturating_sub(position.unsigned_abs() as usize),
    };
    for (offset, value) in push.each.iter().enumerate() {
        items.insert(position + offset, value.clone());
    }

    if let Some(sort) = &push.sort {
        sort_items(items, sort)?;
    }

    if let Some(slice) = push.slice {
        if slice == 0 {
            items.clear();
        } else if slice > 0 {
            items.truncate(slice as usize);
        } else {
            let keep = slice.unsigned_abs() as usize;
            if items.len() > keep {
                items.drain(..items.len() - keep);
            }
        }
    }
    Ok(())
}

fn sort_items(items: &mut [JsonValue], sort: &JsonValue) -> Result<(), ParqueError> {
    match sort {
        JsonValue::Number(direction) => {
            let ascending = direction.as_i64() == Some(1);
            items.sort_by(|a, b| {
                let ord = compare_ordered(a, b).unwrap_or(std::cmp::Ordering::Equal);
                if ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
            Ok(())
        }
        JsonValue::Object(keys) => {
            items.sort_by(|a, b| {
                for (key, direction) in keys {
                    let left = get_path(a, key);
                    let right = get_path(b, key);
                    let ord = match (left, right) {
                        (Some(l), Some(r)) => {
                            compare_ordered(l, r).unwrap_or(std::cmp::Ordering::Equal)
                        }
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (None, None) => std::cmp::Ordering::Equal,
                    };
                    let ord = if direction.as_i64() == Some(-1) {
                        ord.reverse()
                    } else {
                        ord
                    };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
            Ok(())
        }
        _ => Err(ParqueError::invariant(
            "$push.$sort requires 1, -1, or a key map",
        )),
    }
}

/// `$pull` removes by deep equality for literal operands and by condition
/// for operator maps / subdocument filters.
fn pull_matches(item: &JsonValue, condition: &JsonValue) -> bool {
    super::eval::matches_element(item, condition)
}

#[cfg(test)]
mod tests {
    use super::{apply_update, parse_update, validate_update, UpdateContext};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn ctx() -> UpdateContext {
        UpdateContext::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    fn apply(doc: serde_json::Value, update: serde_json::Value) -> serde_json::Value {
        let spec = parse_update(&update).expect("parse update");
        apply_update(&doc, &spec, &ctx()).expect("apply update")
    }

    #[test]
    fn set_and_unset_walk_dot_paths() {
        let next = apply(
            json!({"user": {"name": "ada"}}),
            json!({"$set": {"user.profile.age": 36}}),
        );
        assert_eq!(next, json!({"user": {"name": "ada", "profile": {"age": 36}}}));

        let next = apply(next, json!({"$unset": {"user.profile.age": ""}}));
        assert_eq!(next, json!({"user": {"name": "ada", "profile": {}}}));
    }

    #[test]
    fn apply_never_mutates_the_input() {
        let doc = json!({"count": 1});
        let spec = parse_update(&json!({"$inc": {"count": 5}})).unwrap();
        let next = apply_update(&doc, &spec, &ctx()).unwrap();
        assert_eq!(doc, json!({"count": 1}));
        assert_eq!(next, json!({"count": 6}));
    }

    #[test]
    fn arithmetic_defaults_missing_fields_to_zero() {
        assert_eq!(apply(json!({}), json!({"$inc": {"n": 3}})), json!({"n": 3}));
        assert_eq!(apply(json!({}), json!({"$mul": {"n": 3}})), json!({"n": 0}));
    }

    #[test]
    fn inc_by_zero_and_mul_by_one_are_no_ops() {
        let doc = json!({"n": 42});
        assert_eq!(apply(doc.clone(), json!({"$inc": {"n": 0}})), doc);
        assert_eq!(apply(doc.clone(), json!({"$mul": {"n": 1}})), doc);
    }

    #[test]
    fn min_max_replace_only_when_ordered() {
        assert_eq!(
            apply(json!({"score": 10}), json!({"$min": {"score": 3}})),
            json!({"score": 3})
        );
        assert_eq!(
            apply(json!({"score": 10}), json!({"$max": {"score": 3}})),
            json!({"score": 10})
        );
        assert_eq!(apply(json!({}), json!({"$max": {"score": 3}})), json!({"score": 3}));
    }

    #[test]
    fn push_modifiers_apply_position_sort_slice_in_order() {
        let next = apply(
            json!({"top": [5, 1]}),
            json!({"$push": {"top": {"$each": [4, 2], "$position": 1, "$sort": -1, "$slice": 3}}}),
        );
        assert_eq!(next, json!({"top": [5, 4, 2]}));
    }

    #[test]
    fn push_slice_negative_keeps_tail_and_zero_empties() {
        let next = apply(
            json!({"log": [1, 2, 3]}),
            json!({"$push": {"log": {"$each": [4], "$slice": -2}}}),
        );
        assert_eq!(next, json!({"log": [3, 4]}));

        let next = apply(
            json!({"log": [1]}),
            json!({"$push": {"log": {"$each": [2], "$slice": 0}}}),
        );
        assert_eq!(next, json!({"log": []}));
    }

    #[test]
    fn push_sort_by_key_map() {
        let next = apply(
            json!({"items": [{"score": 2}, {"score": 9}]}),
            json!({"$push": {"items": {"$each": [{"score": 5}], "$sort": {"score": 1}}}}),
        );
        assert_eq!(
            next,
            json!({"items": [{"score": 2}, {"score": 5}, {"score": 9}]})
        );
    }

    #[test]
    fn pull_on_missing_field_is_a_no_op() {
        let doc = json!({"other": 1});
        assert_eq!(apply(doc.clone(), json!({"$pull": {"tags": "x"}})), doc);
    }

    #[test]
    fn pull_removes_by_value_and_by_condition() {
        assert_eq!(
            apply(json!({"tags": ["a", "b", "a"]}), json!({"$pull": {"tags": "a"}})),
            json!({"tags": ["b"]})
        );
        assert_eq!(
            apply(
                json!({"scores": [1, 5, 9]}),
                json!({"$pull": {"scores": {"$gt": 4}}})
            ),
            json!({"scores": [1]})
        );
    }

    #[test]
    fn add_to_set_dedups_by_deep_equality() {
        let next = apply(
            json!({"tags": ["a"]}),
            json!({"$addToSet": {"tags": {"$each": ["a", "b"]}}}),
        );
        assert_eq!(next, json!({"tags": ["a", "b"]}));
    }

    #[test]
    fn pop_on_empty_or_missing_yields_empty_array() {
        assert_eq!(apply(json!({}), json!({"$pop": {"xs": 1}})), json!({"xs": []}));
        assert_eq!(
            apply(json!({"xs": []}), json!({"$pop": {"xs": -1}})),
            json!({"xs": []})
        );
        assert_eq!(
            apply(json!({"xs": [1, 2, 3]}), json!({"$pop": {"xs": 1}})),
            json!({"xs": [1, 2]})
        );
        assert_eq!(
            apply(json!({"xs": [1, 2, 3]}), json!({"$pop": {"xs": -1}})),
            json!({"xs": [2, 3]})
        );
    }

    #[test]
    fn rename_moves_values_and_skips_missing_sources() {
        assert_eq!(
            apply(json!({"old": 7}), json!({"$rename": {"old": "new"}})),
            json!({"new": 7})
        );
        assert_eq!(
            apply(json!({"keep": 1}), json!({"$rename": {"old": "new"}})),
            json!({"keep": 1})
        );
    }

    #[test]
    fn current_date_uses_one_now_for_all_fields() {
        let next = apply(
            json!({}),
            json!({"$currentDate": {"a": true, "b": {"$type": "timestamp"}}}),
        );
        let a = next["a"].as_str().unwrap();
        let b = next["b"].as_i64().unwrap();
        assert!(a.starts_with("2024-03-01T12:00:00"));
        assert_eq!(b, 1709294400000);
    }

    #[test]
    fn set_on_insert_applies_only_in_insert_context() {
        let spec = parse_update(&json!({"$setOnInsert": {"origin": "import"}})).unwrap();
        let updated = apply_update(&json!({}), &spec, &ctx()).unwrap();
        assert_eq!(updated, json!({}));

        let inserted = apply_update(
            &json!({}),
            &spec,
            &UpdateContext::insert_at(ctx().now),
        )
        .unwrap();
        assert_eq!(inserted, json!({"origin": "import"}));
    }

    #[test]
    fn bit_applies_operations_in_sequence() {
        let next = apply(
            json!({"flags": 0b1100}),
            json!({"$bit": {"flags": {"and": 0b1010, "or": 0b0001}}}),
        );
        assert_eq!(next, json!({"flags": 0b1001}));
    }

    #[test]
    fn validation_rejects_same_field_from_two_operators() {
        let spec = parse_update(&json!({"$set": {"a": 1}, "$inc": {"a": 2}})).unwrap();
        let error = validate_update(&spec).unwrap_err();
        assert!(matches!(error, crate::ParqueError::Conflict(_)));
    }

    #[test]
    fn validation_rejects_rename_clashing_with_other_targets() {
        let spec = parse_update(&json!({"$rename": {"a": "b"}, "$set": {"b": 1}})).unwrap();
        assert!(validate_update(&spec).is_err());

        let spec = parse_update(&json!({"$rename": {"a": "b"}, "$unset": {"a": ""}})).unwrap();
        assert!(validate_update(&spec).is_err());
    }

    #[test]
    fn set_and_unset_are_idempotent() {
        let doc = json!({"a": 1});
        let once = apply(doc.clone(), json!({"$set": {"a": 2}}));
        let twice = apply(once.clone(), json!({"$set": {"a": 2}}));
        assert_eq!(once, twice);

        let once = apply(doc.clone(), json!({"$unset": {"a": ""}}));
        let twice = apply(once.clone(), json!({"$unset": {"a": ""}}));
        assert_eq!(once, twice);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        assert!(parse_update(&json!({"$explode": {"a": 1}})).is_err());
        assert!(parse_update(&json!({"plain": 1})).is_err());
    }
}
