//! JSON value algebra shared by the filter engine, sorting, and grouping.
//!
//! Three comparison regimes live here, in increasing strictness of what
//! they accept:
//!
//! - [`value_eq`]: equality with int/float promotion; `null == null`.
//! - [`value_cmp`]: partial ordering for the `$gt`-family — only
//!   numeric↔numeric and string↔string compare, everything else (and any
//!   null) is unordered.
//! - [`sort_cmp`]: total ordering for stable sorts — nulls last, typed
//!   comparison where possible, textual fallback otherwise.

use std::cmp::Ordering;

use serde_json::{Map, Value};

/// Resolves a dot-path (`"a.b.c"`) against a JSON object.
///
/// A missing intermediate or a non-object along the way resolves to
/// `None`, which callers treat as null.
#[must_use]
pub fn resolve_path<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = data.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// True when the value is absent or JSON null.
#[must_use]
pub fn is_null(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// Equality under document semantics.
///
/// Numbers compare numerically with int↔float promotion; strings by code
/// point; arrays and objects element-wise; `null == null` holds, and a
/// missing field (`None`) equals null.
#[must_use]
pub fn value_eq(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => true,
        (Some(x), Some(y)) => concrete_eq(x, y),
        _ => false,
    }
}

fn concrete_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numeric_eq(x, y),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| concrete_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| concrete_eq(x, y)))
        }
        _ => a == b,
    }
}

fn numeric_eq(x: &serde_json::Number, y: &serde_json::Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Partial ordering for range operators.
///
/// Valid pairs: numeric↔numeric (with promotion) and string↔string.
/// Null on either side, or any other type pairing, is unordered.
#[must_use]
pub fn value_cmp(a: Option<&Value>, b: Option<&Value>) -> Option<Ordering> {
    match (a?, b?) {
        (Value::Number(x), Value::Number(y)) => numeric_cmp(x, y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn numeric_cmp(x: &serde_json::Number, y: &serde_json::Number) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return Some(a.cmp(&b));
    }
    x.as_f64()?.partial_cmp(&y.as_f64()?)
}

/// Total ordering for stable sorts: nulls last, typed comparison where
/// [`value_cmp`] applies, textual rendering as the fallback.
#[must_use]
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (is_null(a), is_null(b)) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => value_cmp(a, b).unwrap_or_else(|| {
            let x = render(a.unwrap_or(&Value::Null));
            let y = render(b.unwrap_or(&Value::Null));
            x.cmp(&y)
        }),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn dot_path_descends_objects() {
        let data = obj(json!({"a": {"b": {"c": 7}}, "x": 1}));
        assert_eq!(resolve_path(&data, "a.b.c"), Some(&json!(7)));
        assert_eq!(resolve_path(&data, "x"), Some(&json!(1)));
        assert_eq!(resolve_path(&data, "a.b"), Some(&json!({"c": 7})));
    }

    #[test]
    fn dot_path_missing_intermediate_is_none() {
        let data = obj(json!({"a": {"b": 1}, "s": "str"}));
        assert!(resolve_path(&data, "a.z.c").is_none());
        assert!(resolve_path(&data, "missing").is_none());
        // Descending through a non-object is also a miss.
        assert!(resolve_path(&data, "s.len").is_none());
    }

    #[test]
    fn equality_promotes_numbers() {
        assert!(value_eq(Some(&json!(1)), Some(&json!(1.0))));
        assert!(value_eq(Some(&json!(2.5)), Some(&json!(2.5))));
        assert!(!value_eq(Some(&json!(1)), Some(&json!(2))));
        assert!(!value_eq(Some(&json!(1)), Some(&json!("1"))));
    }

    #[test]
    fn equality_null_semantics() {
        assert!(value_eq(None, Some(&Value::Null)));
        assert!(value_eq(Some(&Value::Null), Some(&Value::Null)));
        assert!(!value_eq(Some(&Value::Null), Some(&json!(0))));
    }

    #[test]
    fn equality_is_structural_for_containers() {
        assert!(value_eq(
            Some(&json!([1, 2.0, "x"])),
            Some(&json!([1.0, 2, "x"]))
        ));
        assert!(value_eq(
            Some(&json!({"a": 1, "b": [true]})),
            Some(&json!({"b": [true], "a": 1.0}))
        ));
        assert!(!value_eq(Some(&json!([1])), Some(&json!([1, 2]))));
    }

    #[test]
    fn ordering_rejects_mixed_and_null() {
        assert!(value_cmp(Some(&json!(1)), Some(&json!("1"))).is_none());
        assert!(value_cmp(Some(&Value::Null), Some(&json!(1))).is_none());
        assert!(value_cmp(None, Some(&json!(1))).is_none());
        assert!(value_cmp(Some(&json!(true)), Some(&json!(false))).is_none());
    }

    #[test]
    fn ordering_promotes_numbers() {
        assert_eq!(
            value_cmp(Some(&json!(2)), Some(&json!(10.5))),
            Some(Ordering::Less)
        );
        assert_eq!(
            value_cmp(Some(&json!(3.0)), Some(&json!(3))),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn ordering_strings_by_code_point() {
        assert_eq!(
            value_cmp(Some(&json!("abc")), Some(&json!("abd"))),
            Some(Ordering::Less)
        );
        assert_eq!(
            value_cmp(Some(&json!("Z")), Some(&json!("a"))),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn sort_cmp_puts_nulls_last() {
        assert_eq!(sort_cmp(None, Some(&json!(1))), Ordering::Greater);
        assert_eq!(sort_cmp(Some(&json!(1)), None), Ordering::Less);
        assert_eq!(sort_cmp(None, Some(&Value::Null)), Ordering::Equal);
    }

    #[test]
    fn sort_cmp_falls_back_to_text() {
        // bool vs number has no typed ordering; text rendering decides.
        let a = json!(true);
        let b = json!(5);
        assert_eq!(sort_cmp(Some(&a), Some(&b)), "true".cmp("5"));
    }
}
