//! Query model: sort specifications, projections, options, and results.
//!
//! The executor lives in the server crate (it needs the store and the
//! indexes); everything here is pure over document vectors so the
//! aggregation pipeline and the cursor manager can reuse it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::{DataMap, Document, ID_FIELD};
use crate::error::{DbError, DbResult};
use crate::value::{is_null, resolve_path, sort_cmp};

/// One sort key: a dot-path and a direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Dot-path into the document payload (`_id` addresses the identity).
    pub path: String,
    /// True for ascending order.
    pub ascending: bool,
}

impl SortSpec {
    /// Parses the wire form: an object of `path -> 1 | -1` entries, in
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_COMMAND` when the value is not an object or a
    /// direction is not a number.
    pub fn parse_list(value: &Value) -> DbResult<Vec<Self>> {
        let Some(map) = value.as_object() else {
            return Err(DbError::InvalidCommand(
                "sort must be an object of path -> direction".into(),
            ));
        };
        map.iter()
            .map(|(path, dir)| {
                let n = dir.as_f64().ok_or_else(|| {
                    DbError::InvalidCommand(format!("sort direction for {path:?} must be 1 or -1"))
                })?;
                Ok(Self {
                    path: path.clone(),
                    ascending: n >= 0.0,
                })
            })
            .collect()
    }
}

/// Resolves a sort/filter path against a document, `_id` included.
#[must_use]
pub fn resolve_document_path<'a>(doc: &'a Document, path: &str) -> Option<ValueRef<'a>> {
    if let Some(value) = resolve_path(&doc.data, path) {
        return Some(ValueRef::Value(value));
    }
    if path == ID_FIELD {
        return Some(ValueRef::Id(&doc.id));
    }
    None
}

/// A resolved field: either a borrowed payload value or the identity.
#[derive(Debug, Clone, Copy)]
pub enum ValueRef<'a> {
    /// Borrowed from the payload.
    Value(&'a Value),
    /// The document id.
    Id(&'a str),
}

impl ValueRef<'_> {
    /// Materializes into an owned JSON value.
    #[must_use]
    pub fn to_value(self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::Id(s) => Value::String(s.to_string()),
        }
    }
}

/// Stable multi-key sort. Nulls (missing fields included) sort last on
/// every key, ties keep prior input order.
pub fn sort_documents(docs: &mut [Document], specs: &[SortSpec]) {
    if specs.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for spec in specs {
            let av = resolve_document_path(a, &spec.path).map(ValueRef::to_value);
            let bv = resolve_document_path(b, &spec.path).map(ValueRef::to_value);
            let ord = sort_cmp(av.as_ref(), bv.as_ref());
            // Direction never applies to the null rule: a missing value
            // stays at the tail in both ascending and descending order.
            let keep = spec.ascending || is_null(av.as_ref()) || is_null(bv.as_ref());
            let ord = if keep { ord } else { ord.reverse() };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

/// Field projection: inclusion XOR exclusion, plus renames.
///
/// Inclusion keeps the listed top-level fields (and `_id`, unless `_id`
/// is explicitly excluded); exclusion removes the listed fields. Renames
/// apply after selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    include: Vec<String>,
    exclude: Vec<String>,
    rename: Vec<(String, String)>,
}

impl Projection {
    /// Builds a projection from explicit parts.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_COMMAND` when inclusion and exclusion are mixed
    /// (excluding only `_id` alongside inclusions is the one exception).
    pub fn new(
        include: Vec<String>,
        exclude: Vec<String>,
        rename: Vec<(String, String)>,
    ) -> DbResult<Self> {
        let real_excludes = exclude.iter().filter(|f| *f != ID_FIELD).count();
        if !include.is_empty() && real_excludes > 0 {
            return Err(DbError::InvalidCommand(
                "projection cannot mix inclusion and exclusion".into(),
            ));
        }
        Ok(Self {
            include,
            exclude,
            rename,
        })
    }

    /// Parses the wire form: `field -> 1` includes, `field -> 0` excludes,
    /// `newName -> "$oldField"` renames.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_COMMAND` on a non-object or a mixed projection.
    pub fn parse(value: &Value) -> DbResult<Self> {
        let Some(map) = value.as_object() else {
            return Err(DbError::InvalidCommand("projection must be an object".into()));
        };
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        let mut rename = Vec::new();
        for (field, spec) in map {
            match spec {
                Value::String(source) if source.starts_with('$') => {
                    let source = source.trim_start_matches('$').to_string();
                    include.push(source.clone());
                    rename.push((source, field.clone()));
                }
                other => {
                    let truthy = match other {
                        Value::Bool(b) => *b,
                        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
                        _ => {
                            return Err(DbError::InvalidCommand(format!(
                                "projection value for {field:?} must be 0, 1, or \"$source\""
                            )));
                        }
                    };
                    if truthy {
                        include.push(field.clone());
                    } else {
                        exclude.push(field.clone());
                    }
                }
            }
        }
        Self::new(include, exclude, rename)
    }

    /// True when no fields are selected or removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty() && self.rename.is_empty()
    }

    /// Applies the projection to a wire object (payload plus `_id`).
    ///
    /// When the payload already carries an `_id` field (group-stage
    /// output), that value wins over the document identity.
    #[must_use]
    pub fn apply(&self, id: &str, data: &DataMap) -> DataMap {
        let id_value = data
            .get(ID_FIELD)
            .cloned()
            .unwrap_or_else(|| Value::String(id.to_string()));
        let keep_id = !self.exclude.iter().any(|f| f == ID_FIELD);
        let mut out = if self.include.is_empty() {
            let mut map = data.clone();
            for field in &self.exclude {
                map.remove(field);
            }
            if keep_id {
                map.insert(ID_FIELD.to_string(), id_value);
            }
            map
        } else {
            let mut map = Map::new();
            if keep_id {
                map.insert(ID_FIELD.to_string(), id_value);
            }
            for field in &self.include {
                if let Some(v) = data.get(field) {
                    map.insert(field.clone(), v.clone());
                }
            }
            map
        };
        for (from, to) in &self.rename {
            if let Some(v) = out.remove(from) {
                out.insert(to.clone(), v);
            }
        }
        out
    }
}

/// Execution options attached to a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryOptions {
    /// Documents to skip after sorting.
    pub skip: usize,
    /// Maximum documents to return; `None` means unbounded.
    pub limit: Option<usize>,
    /// Whether to snapshot the pre-pagination match count.
    pub include_total_count: bool,
    /// Execution budget in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// A complete query against one collection.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Target collection.
    pub collection: String,
    /// Optional filter tree (empty/absent matches everything).
    pub filter: Option<DataMap>,
    /// Sort keys, applied in order.
    pub sort: Vec<SortSpec>,
    /// Optional projection applied to the returned documents.
    pub projection: Option<Projection>,
    /// Pagination and execution options.
    pub options: QueryOptions,
}

/// The result of executing a [`Query`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Matched documents in wire form, post sort/skip/limit/projection.
    pub documents: Vec<Value>,
    /// Pre-pagination match count, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    /// How many documents the `skip` step actually discarded.
    pub skipped: usize,
    /// Wall-clock execution time.
    pub execution_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(id: &str, v: Value) -> Document {
        Document::new(id.to_string(), v.as_object().cloned().unwrap(), 0)
    }

    #[test]
    fn sort_specs_parse_in_declaration_order() {
        let specs = SortSpec::parse_list(&json!({"b": -1, "a": 1})).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].path, "b");
        assert!(!specs[0].ascending);
        assert_eq!(specs[1].path, "a");
        assert!(specs[1].ascending);
    }

    #[test]
    fn sort_is_stable_and_null_last() {
        let mut docs = vec![
            doc("a", json!({"n": 2, "t": "x"})),
            doc("b", json!({"t": "y"})),
            doc("c", json!({"n": 1, "t": "z"})),
            doc("d", json!({"n": 2, "t": "w"})),
        ];
        sort_documents(
            &mut docs,
            &[SortSpec {
                path: "n".into(),
                ascending: true,
            }],
        );
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        // 1, then the two 2s in input order, then the null-n document.
        assert_eq!(ids, ["c", "a", "d", "b"]);
    }

    #[test]
    fn sort_descending_keeps_nulls_last() {
        let mut docs = vec![
            doc("a", json!({})),
            doc("b", json!({"n": 1})),
            doc("c", json!({"n": 3})),
        ];
        sort_documents(
            &mut docs,
            &[SortSpec {
                path: "n".into(),
                ascending: false,
            }],
        );
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["c", "b", "a"]);
    }

    #[test]
    fn sort_by_id() {
        let mut docs = vec![doc("b", json!({})), doc("a", json!({})), doc("c", json!({}))];
        sort_documents(
            &mut docs,
            &[SortSpec {
                path: "_id".into(),
                ascending: true,
            }],
        );
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn projection_inclusion_keeps_id() {
        let p = Projection::parse(&json!({"a": 1})).unwrap();
        let d = doc("k", json!({"a": 1, "b": 2}));
        let out = p.apply(&d.id, &d.data);
        assert_eq!(out.get("a"), Some(&json!(1)));
        assert_eq!(out.get("_id"), Some(&json!("k")));
        assert!(!out.contains_key("b"));
    }

    #[test]
    fn projection_exclusion_removes_fields() {
        let p = Projection::parse(&json!({"b": 0})).unwrap();
        let d = doc("k", json!({"a": 1, "b": 2}));
        let out = p.apply(&d.id, &d.data);
        assert!(out.contains_key("a"));
        assert!(!out.contains_key("b"));
        assert_eq!(out.get("_id"), Some(&json!("k")));
    }

    #[test]
    fn projection_can_drop_id_explicitly() {
        let p = Projection::parse(&json!({"a": 1, "_id": 0})).unwrap();
        let d = doc("k", json!({"a": 1}));
        let out = p.apply(&d.id, &d.data);
        assert!(!out.contains_key("_id"));
        assert!(out.contains_key("a"));
    }

    #[test]
    fn projection_mixing_is_rejected() {
        let err = Projection::parse(&json!({"a": 1, "b": 0})).unwrap_err();
        assert_eq!(err.code(), "INVALID_COMMAND");
    }

    #[test]
    fn projection_renames() {
        let p = Projection::parse(&json!({"total": "$amount"})).unwrap();
        let d = doc("k", json!({"amount": 9, "noise": 1}));
        let out = p.apply(&d.id, &d.data);
        assert_eq!(out.get("total"), Some(&json!(9)));
        assert!(!out.contains_key("amount"));
        assert!(!out.contains_key("noise"));
    }

    #[test]
    fn query_options_deserialize_camel_case() {
        let opts: QueryOptions = serde_json::from_value(json!({
            "skip": 10,
            "limit": 5,
            "includeTotalCount": true,
            "timeoutMs": 2000
        }))
        .unwrap();
        assert_eq!(opts.skip, 10);
        assert_eq!(opts.limit, Some(5));
        assert!(opts.include_total_count);
        assert_eq!(opts.timeout_ms, Some(2000));
    }
}
