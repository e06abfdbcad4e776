//! Filter and aggregation pipeline evaluation
//!
//! Supported stages: `$match`, `$project`, `$sort`, `$skip`, `$limit`,
//! `$count`, `$group`, `$lookup`, `$unwind`.
//! Supported match operators: `$eq $ne $gt $gte $lt $lte $in $nin $exists
//! $regex $size $not $and $or $nor`.
//!
//! Operators that run arbitrary code on a store are rejected by
//! [`validate_pipeline`] / [`validate_filter`] before anything is submitted.

use super::value::{as_number, compare_values, get_path, number_value, sort_order, values_equal};
use regex::RegexBuilder;
use sdk::errors::EngineError;
use sdk::types::Row;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Operators that execute code on the store
pub const FORBIDDEN_OPERATORS: &[&str] = &["$where", "$function", "$accumulator", "$eval"];

/// Reject forbidden operators at any depth of a pipeline
pub fn validate_pipeline(stages: &[Value]) -> Result<(), EngineError> {
    stages.iter().try_for_each(check_value)
}

/// Reject forbidden operators at any depth of a filter document
pub fn validate_filter(filter: &Map<String, Value>) -> Result<(), EngineError> {
    for (key, value) in filter {
        if FORBIDDEN_OPERATORS.contains(&key.as_str()) {
            return Err(EngineError::ForbiddenOperator(key.clone()));
        }
        check_value(value)?;
    }
    Ok(())
}

fn check_value(value: &Value) -> Result<(), EngineError> {
    match value {
        Value::Object(map) => validate_filter(map),
        Value::Array(items) => items.iter().try_for_each(check_value),
        _ => Ok(()),
    }
}

/// Collections a pipeline reads besides its source (`$lookup.from`)
pub fn referenced_collections(stages: &[Value]) -> Vec<String> {
    stages
        .iter()
        .filter_map(|stage| stage.get("$lookup"))
        .filter_map(|lookup| lookup.get("from"))
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::validation("store.read", message)
}

/// Run `stages` over `docs`. `lookup` resolves `$lookup.from` collections.
pub fn run_pipeline(
    mut docs: Vec<Row>,
    stages: &[Value],
    lookup: &dyn Fn(&str) -> Vec<Row>,
) -> Result<Vec<Row>, EngineError> {
    for stage in stages {
        let (op, spec) = single_key(stage)?;
        docs = match op {
            "$match" => filter_docs(docs, as_object(op, spec)?)?,
            "$project" => project(docs, as_object(op, spec)?)?,
            "$sort" => sort(docs, as_object(op, spec)?)?,
            "$skip" => {
                let n = as_count(op, spec)?;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = as_count(op, spec)?;
                docs.truncate(n);
                docs
            }
            "$count" => {
                let name = spec
                    .as_str()
                    .ok_or_else(|| invalid("$count expects a field name"))?;
                let mut row = Row::new();
                row.insert(name.to_string(), Value::from(docs.len() as u64));
                vec![row]
            }
            "$group" => group(docs, as_object(op, spec)?)?,
            "$lookup" => lookup_stage(docs, as_object(op, spec)?, lookup)?,
            "$unwind" => unwind(docs, spec)?,
            other => return Err(invalid(format!("unsupported pipeline stage {}", other))),
        };
    }
    Ok(docs)
}

/// Keep the documents matching `filter`
pub fn filter_docs(docs: Vec<Row>, filter: &Map<String, Value>) -> Result<Vec<Row>, EngineError> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        if matches(&doc, filter)? {
            out.push(doc);
        }
    }
    Ok(out)
}

/// Evaluate a filter document against one row
pub fn matches(doc: &Row, filter: &Map<String, Value>) -> Result<bool, EngineError> {
    for (key, cond) in filter {
        let ok = match key.as_str() {
            "$and" => clauses(doc, cond)?.into_iter().all(|b| b),
            "$or" => clauses(doc, cond)?.into_iter().any(|b| b),
            "$nor" => !clauses(doc, cond)?.into_iter().any(|b| b),
            op if op.starts_with('$') => {
                return Err(invalid(format!("unsupported operator {}", op)))
            }
            path => path_matches(doc, path, cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Dotted paths through arrays of documents match when any element matches
fn path_matches(doc: &Row, path: &str, cond: &Value) -> Result<bool, EngineError> {
    if let Some(value) = get_path(doc, path) {
        return field_matches(Some(value), cond);
    }
    let parts: Vec<&str> = path.split('.').collect();
    let mut hits = Vec::new();
    if let Some(first) = doc.get(parts[0]) {
        fan_out(first, &parts[1..], &mut hits);
    }
    if hits.is_empty() {
        return field_matches(None, cond);
    }
    for hit in hits {
        if field_matches(Some(hit), cond)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn fan_out<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                fan_out(next, rest, out);
            }
        }
        Value::Array(items) => match head.parse::<usize>() {
            Ok(i) => {
                if let Some(next) = items.get(i) {
                    fan_out(next, rest, out);
                }
            }
            Err(_) => {
                for item in items {
                    fan_out(item, parts, out);
                }
            }
        },
        _ => {}
    }
}

fn clauses(doc: &Row, cond: &Value) -> Result<Vec<bool>, EngineError> {
    let items = cond
        .as_array()
        .ok_or_else(|| invalid("logical operators expect an array"))?;
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| invalid("logical operator clauses must be objects"))
                .and_then(|clause| matches(doc, clause))
        })
        .collect()
}

fn is_operator_object(cond: &Value) -> Option<&Map<String, Value>> {
    match cond {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => {
            Some(map)
        }
        _ => None,
    }
}

fn field_matches(value: Option<&Value>, cond: &Value) -> Result<bool, EngineError> {
    let Some(ops) = is_operator_object(cond) else {
        return Ok(eq_match(value, cond));
    };

    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => eq_match(value, arg),
            "$ne" => !eq_match(value, arg),
            "$gt" => ordered(value, arg, |o| o == Ordering::Greater),
            "$gte" => ordered(value, arg, |o| o != Ordering::Less),
            "$lt" => ordered(value, arg, |o| o == Ordering::Less),
            "$lte" => ordered(value, arg, |o| o != Ordering::Greater),
            "$in" => list(op, arg)?.iter().any(|a| eq_match(value, a)),
            "$nin" => !list(op, arg)?.iter().any(|a| eq_match(value, a)),
            "$exists" => value.is_some() == arg.as_bool().unwrap_or(true),
            "$size" => match (value, arg.as_u64()) {
                (Some(Value::Array(items)), Some(n)) => items.len() as u64 == n,
                _ => false,
            },
            "$regex" => regex_match(value, arg, ops.get("$options"))?,
            "$options" => true,
            "$not" => !field_matches(value, arg)?,
            other => return Err(invalid(format!("unsupported operator {}", other))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eq_match(value: Option<&Value>, target: &Value) -> bool {
    match value {
        None => target.is_null(),
        Some(Value::Array(items)) if !target.is_array() => {
            items.iter().any(|item| values_equal(item, target))
        }
        Some(v) => values_equal(v, target),
    }
}

fn ordered(value: Option<&Value>, arg: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    value
        .and_then(|v| compare_values(v, arg))
        .map(pred)
        .unwrap_or(false)
}

fn list<'a>(op: &str, arg: &'a Value) -> Result<&'a Vec<Value>, EngineError> {
    arg.as_array()
        .ok_or_else(|| invalid(format!("{} expects an array", op)))
}

fn regex_match(
    value: Option<&Value>,
    pattern: &Value,
    options: Option<&Value>,
) -> Result<bool, EngineError> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| invalid("$regex expects a string"))?;
    let case_insensitive = options
        .and_then(Value::as_str)
        .is_some_and(|o| o.contains('i'));
    let re = RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .size_limit(1 << 20)
        .build()
        .map_err(|e| invalid(format!("invalid $regex: {}", e)))?;
    Ok(matches!(value, Some(Value::String(s)) if re.is_match(s)))
}

fn single_key(stage: &Value) -> Result<(&str, &Value), EngineError> {
    match stage {
        Value::Object(map) if map.len() == 1 => map
            .iter()
            .next()
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| invalid("empty pipeline stage")),
        _ => Err(invalid("each pipeline stage must be an object with one operator")),
    }
}

fn as_object<'a>(op: &str, spec: &'a Value) -> Result<&'a Map<String, Value>, EngineError> {
    spec.as_object()
        .ok_or_else(|| invalid(format!("{} expects an object", op)))
}

fn as_count(op: &str, spec: &Value) -> Result<usize, EngineError> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| invalid(format!("{} expects a non-negative integer", op)))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|x| x != 0.0),
        Value::Null => false,
        _ => true,
    }
}

fn project(docs: Vec<Row>, spec: &Map<String, Value>) -> Result<Vec<Row>, EngineError> {
    let keep_id = spec.get("_id").map(truthy).unwrap_or(true);
    let inclusion = spec
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .any(|(_, v)| truthy(v));

    let projected = docs
        .into_iter()
        .map(|doc| {
            if inclusion {
                let mut out = Row::new();
                if keep_id {
                    if let Some(id) = doc.get("_id") {
                        out.insert("_id".to_string(), id.clone());
                    }
                }
                for (key, expr) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
                    let value = match expr {
                        Value::String(s) if s.starts_with('$') => get_path(&doc, &s[1..]).cloned(),
                        v if truthy(v) => get_path(&doc, key).cloned(),
                        _ => None,
                    };
                    if let Some(value) = value {
                        out.insert(key.clone(), value);
                    }
                }
                out
            } else {
                let mut out = doc;
                for key in spec.keys() {
                    if key != "_id" || !keep_id {
                        out.remove(key);
                    }
                }
                out
            }
        })
        .collect();
    Ok(projected)
}

fn sort(mut docs: Vec<Row>, spec: &Map<String, Value>) -> Result<Vec<Row>, EngineError> {
    let keys: Vec<(String, bool)> = spec
        .iter()
        .map(|(k, dir)| match dir.as_i64() {
            Some(1) => Ok((k.clone(), true)),
            Some(-1) => Ok((k.clone(), false)),
            _ => Err(invalid(format!("$sort direction for {} must be 1 or -1", k))),
        })
        .collect::<Result<_, _>>()?;

    docs.sort_by(|a, b| {
        for (key, ascending) in &keys {
            let ord = sort_order(get_path(a, key), get_path(b, key));
            if ord != Ordering::Equal {
                return if *ascending { ord } else { ord.reverse() };
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}

fn eval_expr(doc: &Row, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), eval_expr(doc, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn group(docs: Vec<Row>, spec: &Map<String, Value>) -> Result<Vec<Row>, EngineError> {
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| invalid("$group requires an _id"))?;

    let mut keys: Vec<Value> = Vec::new();
    let mut members: Vec<Vec<Row>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for doc in docs {
        let key = eval_expr(&doc, id_expr);
        let slot = *index.entry(key.to_string()).or_insert_with(|| {
            keys.push(key.clone());
            members.push(Vec::new());
            keys.len() - 1
        });
        members[slot].push(doc);
    }

    let mut out = Vec::with_capacity(keys.len());
    for (key, group_docs) in keys.into_iter().zip(members) {
        let mut row = Row::new();
        row.insert("_id".to_string(), key);
        for (field, acc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
            let (op, arg) = single_key(acc)?;
            row.insert(field.clone(), accumulate(op, arg, &group_docs)?);
        }
        out.push(row);
    }
    Ok(out)
}

fn accumulate(op: &str, arg: &Value, docs: &[Row]) -> Result<Value, EngineError> {
    let values = || docs.iter().map(|d| eval_expr(d, arg));
    let value = match op {
        "$sum" => number_value(values().filter_map(|v| as_number(&v)).sum()),
        "$avg" => {
            let nums: Vec<f64> = values().filter_map(|v| as_number(&v)).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                number_value(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        "$min" => values()
            .filter(|v| !v.is_null())
            .min_by(|a, b| sort_order(Some(a), Some(b)))
            .unwrap_or(Value::Null),
        "$max" => values()
            .filter(|v| !v.is_null())
            .max_by(|a, b| sort_order(Some(a), Some(b)))
            .unwrap_or(Value::Null),
        "$first" => values().next().unwrap_or(Value::Null),
        "$last" => values().last().unwrap_or(Value::Null),
        "$push" => Value::Array(values().collect()),
        "$addToSet" => {
            let mut set: Vec<Value> = Vec::new();
            for v in values() {
                if !set.iter().any(|s| values_equal(s, &v)) {
                    set.push(v);
                }
            }
            Value::Array(set)
        }
        "$count" => Value::from(docs.len() as u64),
        other => return Err(invalid(format!("unsupported accumulator {}", other))),
    };
    Ok(value)
}

fn lookup_stage(
    docs: Vec<Row>,
    spec: &Map<String, Value>,
    lookup: &dyn Fn(&str) -> Vec<Row>,
) -> Result<Vec<Row>, EngineError> {
    let from = lookup_field(spec, "from")?;
    let local_field = lookup_field(spec, "localField")?;
    let foreign_field = lookup_field(spec, "foreignField")?;
    let as_field = lookup_field(spec, "as")?.to_string();

    let foreign = lookup(from);
    Ok(docs
        .into_iter()
        .map(|mut doc| {
            let joined: Vec<Value> = match get_path(&doc, local_field) {
                Some(local) => foreign
                    .iter()
                    .filter(|f| get_path(f, foreign_field).is_some_and(|fv| values_equal(local, fv)))
                    .cloned()
                    .map(Value::Object)
                    .collect(),
                None => Vec::new(),
            };
            doc.insert(as_field.clone(), Value::Array(joined));
            doc
        })
        .collect())
}

fn lookup_field<'a>(spec: &'a Map<String, Value>, name: &str) -> Result<&'a str, EngineError> {
    spec.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(format!("$lookup requires {}", name)))
}

fn unwind(docs: Vec<Row>, spec: &Value) -> Result<Vec<Row>, EngineError> {
    let (path, preserve) = match spec {
        Value::String(p) => (p.as_str(), false),
        Value::Object(map) => (
            map.get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("$unwind requires a path"))?,
            map.get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        _ => return Err(invalid("$unwind expects a field path")),
    };
    let field = path
        .strip_prefix('$')
        .ok_or_else(|| invalid("$unwind path must start with $"))?;

    let mut out = Vec::new();
    for doc in docs {
        let items = match doc.get(field) {
            Some(Value::Array(items)) => Some(items.clone()),
            None | Some(Value::Null) => Some(Vec::new()),
            Some(_) => None,
        };
        match items {
            Some(items) if items.is_empty() => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(items) => {
                for item in items {
                    let mut copy = doc.clone();
                    copy.insert(field.to_string(), item);
                    out.push(copy);
                }
            }
            None => out.push(doc),
        }
    }
    Ok(out)
}
