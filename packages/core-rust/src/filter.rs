//! Filter engine: evaluates an operator tree against a document payload.
//!
//! A filter is a JSON object. Plain keys name document fields (dot-paths
//! descend nested objects); `$`-keys are operators. Field conditions are
//! either a literal (equality) or an object of field-level operators.
//! Top-level `$and`/`$or`/`$nor` take arrays of subfilters, `$not` takes
//! one subfilter; all short-circuit left to right.

use serde_json::Value;

use crate::document::{DataMap, Document, ID_FIELD};
use crate::error::{DbError, DbResult};
use crate::value::{is_null, resolve_path, value_cmp, value_eq};

/// Evaluates `filter` against a stored document.
///
/// # Errors
///
/// Returns `FILTER_INVALID` for unknown operators or malformed operator
/// arguments.
pub fn matches_document(filter: &DataMap, doc: &Document) -> DbResult<bool> {
    matches(filter, Some(&doc.id), &doc.data)
}

/// Evaluates `filter` against a payload, with `id` backing the `_id` field
/// when the payload itself carries none.
///
/// An empty filter matches every document.
///
/// # Errors
///
/// Returns `FILTER_INVALID` for unknown operators or malformed operator
/// arguments.
pub fn matches(filter: &DataMap, id: Option<&str>, data: &DataMap) -> DbResult<bool> {
    for (key, condition) in filter {
        let hit = match key.as_str() {
            "$and" => logical_all(condition, id, data, key)?,
            "$or" => logical_any(condition, id, data)?,
            "$nor" => !logical_any(condition, id, data)?,
            "$not" => !matches(as_subfilter(condition, "$not")?, id, data)?,
            k if k.starts_with('$') => {
                return Err(DbError::FilterInvalid(format!("unknown operator {k}")));
            }
            field => field_condition(field, condition, id, data)?,
        };
        if !hit {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_all(condition: &Value, id: Option<&str>, data: &DataMap, op: &str) -> DbResult<bool> {
    for sub in as_subfilter_list(condition, op)? {
        if !matches(sub, id, data)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_any(condition: &Value, id: Option<&str>, data: &DataMap) -> DbResult<bool> {
    for sub in as_subfilter_list(condition, "$or")? {
        if matches(sub, id, data)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn as_subfilter_list<'a>(condition: &'a Value, op: &str) -> DbResult<Vec<&'a DataMap>> {
    let Some(items) = condition.as_array() else {
        return Err(DbError::FilterInvalid(format!(
            "{op} expects an array of subfilters"
        )));
    };
    items
        .iter()
        .map(|item| as_subfilter(item, op))
        .collect::<DbResult<Vec<_>>>()
}

fn as_subfilter<'a>(condition: &'a Value, op: &str) -> DbResult<&'a DataMap> {
    condition
        .as_object()
        .ok_or_else(|| DbError::FilterInvalid(format!("{op} expects an object subfilter")))
}

/// Resolves a field path, letting `_id` fall through to the identity.
fn resolve<'a>(field: &str, id: Option<&'a str>, data: &'a DataMap) -> Option<ResolvedField<'a>> {
    if let Some(value) = resolve_path(data, field) {
        return Some(ResolvedField::Value(value));
    }
    if field == ID_FIELD {
        return id.map(ResolvedField::Id);
    }
    None
}

enum ResolvedField<'a> {
    Value(&'a Value),
    Id(&'a str),
}

impl ResolvedField<'_> {
    fn to_value(&self) -> Value {
        match self {
            Self::Value(v) => (*v).clone(),
            Self::Id(s) => Value::String((*s).to_string()),
        }
    }
}

fn field_condition(
    field: &str,
    condition: &Value,
    id: Option<&str>,
    data: &DataMap,
) -> DbResult<bool> {
    let resolved = resolve(field, id, data).map(|r| r.to_value());
    match condition {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            for (op, arg) in ops {
                if !field_operator(op, resolved.as_ref(), arg)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        literal => Ok(value_eq(resolved.as_ref(), Some(literal))),
    }
}

fn field_operator(op: &str, field: Option<&Value>, arg: &Value) -> DbResult<bool> {
    use std::cmp::Ordering::{Equal, Greater, Less};
    match op {
        "$eq" => Ok(value_eq(field, Some(arg))),
        "$ne" => Ok(!value_eq(field, Some(arg))),
        "$gt" => Ok(value_cmp(field, Some(arg)) == Some(Greater)),
        "$gte" => Ok(matches!(
            value_cmp(field, Some(arg)),
            Some(Greater | Equal)
        )),
        "$lt" => Ok(value_cmp(field, Some(arg)) == Some(Less)),
        "$lte" => Ok(matches!(value_cmp(field, Some(arg)), Some(Less | Equal))),
        "$in" => membership(field, arg, "$in"),
        "$nin" => Ok(!membership(field, arg, "$nin")?),
        "$exists" => {
            let want = arg.as_bool().ok_or_else(|| {
                DbError::FilterInvalid("$exists expects a boolean".into())
            })?;
            Ok(!is_null(field) == want)
        }
        "$regex" => {
            let pattern = arg.as_str().ok_or_else(|| {
                DbError::FilterInvalid("$regex expects a string pattern".into())
            })?;
            match field {
                Some(Value::String(text)) => wildcard_match(pattern, text),
                _ => Ok(false),
            }
        }
        other => Err(DbError::FilterInvalid(format!("unknown operator {other}"))),
    }
}

fn membership(field: Option<&Value>, arg: &Value, op: &str) -> DbResult<bool> {
    let Some(candidates) = arg.as_array() else {
        return Err(DbError::FilterInvalid(format!("{op} expects an array")));
    };
    Ok(candidates.iter().any(|c| value_eq(field, Some(c))))
}

/// Wildcard match: `*` is any substring, `?` a single character, always
/// case-insensitive. Without wildcards the pattern degrades to a
/// case-insensitive substring probe.
fn wildcard_match(pattern: &str, text: &str) -> DbResult<bool> {
    if !pattern.contains('*') && !pattern.contains('?') {
        return Ok(text.to_lowercase().contains(&pattern.to_lowercase()));
    }
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');
    for c in pattern.chars() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    let re = regex::RegexBuilder::new(&translated)
        .case_insensitive(true)
        .build()
        .map_err(|e| DbError::FilterInvalid(format!("bad $regex pattern: {e}")))?;
    Ok(re.is_match(text))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(v: Value) -> Document {
        Document::new("d1".into(), v.as_object().cloned().unwrap(), 0)
    }

    fn filter(v: Value) -> DataMap {
        v.as_object().cloned().unwrap()
    }

    fn check(f: Value, d: &Document) -> bool {
        matches_document(&filter(f), d).unwrap()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let d = doc(json!({"a": 1}));
        assert!(check(json!({}), &d));
    }

    #[test]
    fn bare_value_is_equality() {
        let d = doc(json!({"name": "A", "n": 3}));
        assert!(check(json!({"name": "A"}), &d));
        assert!(check(json!({"n": 3.0}), &d));
        assert!(!check(json!({"name": "B"}), &d));
    }

    #[test]
    fn id_field_matches_document_identity() {
        let d = doc(json!({"a": 1}));
        assert!(check(json!({"_id": "d1"}), &d));
        assert!(!check(json!({"_id": "other"}), &d));
    }

    #[test]
    fn dot_paths_descend() {
        let d = doc(json!({"a": {"b": {"c": 5}}}));
        assert!(check(json!({"a.b.c": 5}), &d));
        assert!(check(json!({"a.b.c": {"$gte": 5}}), &d));
        // Missing intermediate resolves to null.
        assert!(check(json!({"a.x.c": null}), &d));
        assert!(!check(json!({"a.x.c": {"$gt": 0}}), &d));
    }

    #[test]
    fn range_operators_promote_numerics() {
        let d = doc(json!({"age": 50}));
        assert!(check(json!({"age": {"$gte": 50}}), &d));
        assert!(check(json!({"age": {"$gt": 49.5}}), &d));
        assert!(check(json!({"age": {"$lt": 50.5}}), &d));
        assert!(!check(json!({"age": {"$lt": 50}}), &d));
    }

    #[test]
    fn range_operators_reject_null_and_mixed_types() {
        let d = doc(json!({"age": 50, "name": "A"}));
        assert!(!check(json!({"missing": {"$gt": 1}}), &d));
        assert!(!check(json!({"name": {"$gt": 1}}), &d));
        assert!(check(json!({"name": {"$gt": "0"}}), &d));
    }

    #[test]
    fn in_and_nin() {
        let d = doc(json!({"tag": "b"}));
        assert!(check(json!({"tag": {"$in": ["a", "b"]}}), &d));
        assert!(!check(json!({"tag": {"$in": ["x"]}}), &d));
        assert!(check(json!({"tag": {"$nin": ["x"]}}), &d));
        // Membership uses promoted equality.
        let n = doc(json!({"n": 2}));
        assert!(check(json!({"n": {"$in": [1.0, 2.0]}}), &n));
    }

    #[test]
    fn exists_requires_non_null() {
        let d = doc(json!({"a": 1, "b": null}));
        assert!(check(json!({"a": {"$exists": true}}), &d));
        assert!(check(json!({"b": {"$exists": false}}), &d));
        assert!(check(json!({"missing": {"$exists": false}}), &d));
        assert!(!check(json!({"b": {"$exists": true}}), &d));
    }

    #[test]
    fn regex_wildcards() {
        let d = doc(json!({"name": "Alice Smith"}));
        assert!(check(json!({"name": {"$regex": "alice*"}}), &d));
        assert!(check(json!({"name": {"$regex": "*smith"}}), &d));
        assert!(check(json!({"name": {"$regex": "?lice*"}}), &d));
        // A wildcard pattern is anchored: "lice*" must match from the start.
        assert!(!check(json!({"name": {"$regex": "lice*"}}), &d));
        // No wildcard: substring, case-insensitive.
        assert!(check(json!({"name": {"$regex": "SMITH"}}), &d));
        assert!(!check(json!({"name": {"$regex": "bob"}}), &d));
        // Non-string field never matches.
        let n = doc(json!({"n": 5}));
        assert!(!check(json!({"n": {"$regex": "5"}}), &n));
    }

    #[test]
    fn logical_operators() {
        let d = doc(json!({"a": 1, "b": 2}));
        assert!(check(json!({"$and": [{"a": 1}, {"b": 2}]}), &d));
        assert!(!check(json!({"$and": [{"a": 1}, {"b": 3}]}), &d));
        assert!(check(json!({"$or": [{"a": 9}, {"b": 2}]}), &d));
        assert!(check(json!({"$nor": [{"a": 9}, {"b": 9}]}), &d));
        assert!(!check(json!({"$nor": [{"a": 1}]}), &d));
        assert!(check(json!({"$not": {"a": 9}}), &d));
        assert!(!check(json!({"$not": {"a": 1}}), &d));
    }

    #[test]
    fn unknown_operator_is_an_error() {
        let d = doc(json!({"a": 1}));
        let err = matches_document(&filter(json!({"a": {"$almost": 1}})), &d).unwrap_err();
        assert_eq!(err.code(), "FILTER_INVALID");
        let err = matches_document(&filter(json!({"$xor": []})), &d).unwrap_err();
        assert_eq!(err.code(), "FILTER_INVALID");
    }

    #[test]
    fn malformed_arguments_are_errors() {
        let d = doc(json!({"a": 1}));
        assert!(matches_document(&filter(json!({"a": {"$in": 5}})), &d).is_err());
        assert!(matches_document(&filter(json!({"a": {"$exists": "yes"}})), &d).is_err());
        assert!(matches_document(&filter(json!({"$and": {}})), &d).is_err());
    }

    #[test]
    fn null_equality() {
        let d = doc(json!({"a": null}));
        assert!(check(json!({"a": null}), &d));
        assert!(check(json!({"missing": null}), &d));
        assert!(check(json!({"a": {"$eq": null}}), &d));
        assert!(!check(json!({"a": {"$ne": null}}), &d));
    }
}
