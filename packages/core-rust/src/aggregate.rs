//! Aggregation pipeline: an ordered sequence of document-stream stages.
//!
//! Stages are pure `Vec<Document> -> Vec<Document>` transforms executed
//! eagerly in order. `$group` emits synthetic documents carrying the group
//! key in `_id` plus one field per accumulator spec.

use std::collections::HashMap;

use serde_json::{Map, Number, Value};

use crate::document::{now_millis, DataMap, Document, ID_FIELD};
use crate::error::{DbError, DbResult};
use crate::filter::matches_document;
use crate::query::{resolve_document_path, sort_documents, Projection, SortSpec, ValueRef};
use crate::value::{value_cmp, value_eq};

/// One pipeline stage.
#[derive(Debug, Clone)]
pub enum Stage {
    /// Keep documents matching the filter.
    Match(DataMap),
    /// Stable sort by the listed keys.
    Sort(Vec<SortSpec>),
    /// Field selection / renaming.
    Project(Projection),
    /// Drop the first `n` documents.
    Skip(usize),
    /// Keep at most `n` documents.
    Limit(usize),
    /// Group by an optional key path and accumulate.
    Group(GroupStage),
}

/// Accumulator operators for `$group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOp {
    /// Numeric sum (non-numeric values skipped; result is a double).
    Sum,
    /// Numeric average over the numeric values seen.
    Avg,
    /// Minimum among mutually comparable values.
    Min,
    /// Maximum among mutually comparable values.
    Max,
    /// Number of documents in the group.
    Count,
    /// Argument value of the first document.
    First,
    /// Argument value of the last document.
    Last,
    /// All argument values in arrival order.
    Push,
    /// Distinct argument values under promoted equality.
    AddToSet,
}

impl GroupOp {
    fn parse(op: &str) -> DbResult<Self> {
        Ok(match op {
            "$sum" => Self::Sum,
            "$avg" => Self::Avg,
            "$min" => Self::Min,
            "$max" => Self::Max,
            "$count" => Self::Count,
            "$first" => Self::First,
            "$last" => Self::Last,
            "$push" => Self::Push,
            "$addToSet" => Self::AddToSet,
            other => {
                return Err(DbError::InvalidCommand(format!(
                    "unknown group operator {other}"
                )));
            }
        })
    }
}

/// One `$group` output field: `(out_field, operator, arg_path?)`.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    /// Output field name.
    pub out_field: String,
    /// Accumulator operator.
    pub op: GroupOp,
    /// Dot-path supplying the accumulated values, when the operator
    /// takes one (`Count` does not).
    pub arg_path: Option<String>,
}

/// The parsed `$group` stage.
#[derive(Debug, Clone)]
pub struct GroupStage {
    /// Group key path; `None` collapses everything into one group.
    pub key_path: Option<String>,
    /// Accumulator specs, in declaration order.
    pub specs: Vec<GroupSpec>,
}

/// A parsed, executable pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Parses the wire form: an array of single-key stage objects.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_COMMAND` on malformed stages (including a
    /// `$project` that mixes inclusion and exclusion).
    pub fn parse(value: &Value) -> DbResult<Self> {
        let Some(items) = value.as_array() else {
            return Err(DbError::InvalidCommand(
                "pipeline must be an array of stages".into(),
            ));
        };
        let stages = items.iter().map(parse_stage).collect::<DbResult<Vec<_>>>()?;
        Ok(Self { stages })
    }

    /// Builds a pipeline from already-constructed stages.
    #[must_use]
    pub fn from_stages(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// The number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True when the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every stage in order, materializing each intermediate vector.
    ///
    /// # Errors
    ///
    /// Propagates `FILTER_INVALID` from `$match` evaluation.
    pub fn execute(&self, mut docs: Vec<Document>) -> DbResult<Vec<Document>> {
        for stage in &self.stages {
            docs = run_stage(stage, docs)?;
        }
        Ok(docs)
    }
}

fn parse_stage(value: &Value) -> DbResult<Stage> {
    let Some(map) = value.as_object() else {
        return Err(DbError::InvalidCommand("each stage must be an object".into()));
    };
    if map.len() != 1 {
        return Err(DbError::InvalidCommand(
            "each stage must have exactly one operator key".into(),
        ));
    }
    let Some((op, body)) = map.iter().next() else {
        return Err(DbError::InvalidCommand("each stage must be an object".into()));
    };
    match op.as_str() {
        "$match" => {
            let filter = body.as_object().cloned().ok_or_else(|| {
                DbError::InvalidCommand("$match expects a filter object".into())
            })?;
            Ok(Stage::Match(filter))
        }
        "$sort" => Ok(Stage::Sort(SortSpec::parse_list(body)?)),
        "$project" => Ok(Stage::Project(Projection::parse(body)?)),
        "$skip" => Ok(Stage::Skip(parse_count(body, "$skip")?)),
        "$limit" => Ok(Stage::Limit(parse_count(body, "$limit")?)),
        "$group" => Ok(Stage::Group(parse_group(body)?)),
        other => Err(DbError::InvalidCommand(format!(
            "unknown pipeline stage {other}"
        ))),
    }
}

fn parse_count(value: &Value, stage: &str) -> DbResult<usize> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| {
            DbError::InvalidCommand(format!("{stage} expects a non-negative integer"))
        })
}

fn parse_group(body: &Value) -> DbResult<GroupStage> {
    let Some(map) = body.as_object() else {
        return Err(DbError::InvalidCommand("$group expects an object".into()));
    };
    let mut key_path = None;
    let mut specs = Vec::new();
    for (field, spec) in map {
        if field == ID_FIELD {
            key_path = match spec {
                Value::Null => None,
                Value::String(path) => Some(path.trim_start_matches('$').to_string()),
                _ => {
                    return Err(DbError::InvalidCommand(
                        "$group _id must be null or a field path".into(),
                    ));
                }
            };
            continue;
        }
        let Some(op_map) = spec.as_object() else {
            return Err(DbError::InvalidCommand(format!(
                "group spec for {field:?} must be an operator object"
            )));
        };
        if op_map.len() != 1 {
            return Err(DbError::InvalidCommand(format!(
                "group spec for {field:?} must have exactly one operator"
            )));
        }
        let Some((op, arg)) = op_map.iter().next() else {
            continue;
        };
        let op = GroupOp::parse(op)?;
        let arg_path = match arg {
            Value::String(path) => Some(path.trim_start_matches('$').to_string()),
            _ => None,
        };
        if arg_path.is_none() && !matches!(op, GroupOp::Count) {
            return Err(DbError::InvalidCommand(format!(
                "group operator for {field:?} needs a \"$field\" argument"
            )));
        }
        specs.push(GroupSpec {
            out_field: field.clone(),
            op,
            arg_path,
        });
    }
    Ok(GroupStage { key_path, specs })
}

fn run_stage(stage: &Stage, docs: Vec<Document>) -> DbResult<Vec<Document>> {
    match stage {
        Stage::Match(filter) => {
            let mut kept = Vec::with_capacity(docs.len());
            for doc in docs {
                if matches_document(filter, &doc)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        Stage::Sort(specs) => {
            let mut docs = docs;
            sort_documents(&mut docs, specs);
            Ok(docs)
        }
        Stage::Project(projection) => Ok(docs
            .into_iter()
            .map(|doc| {
                let data = projection.apply(&doc.id, &doc.data);
                Document {
                    data,
                    ..doc
                }
            })
            .collect()),
        Stage::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
        Stage::Limit(n) => Ok(docs.into_iter().take(*n).collect()),
        Stage::Group(group) => Ok(run_group(group, &docs)),
    }
}

/// Per-group accumulator state, one slot per spec.
enum Accumulator {
    Sum { total: f64, seen: bool },
    Avg { total: f64, count: u64 },
    MinMax { best: Option<Value>, want_min: bool },
    Count(u64),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
}

impl Accumulator {
    fn new(op: GroupOp) -> Self {
        match op {
            GroupOp::Sum => Self::Sum {
                total: 0.0,
                seen: false,
            },
            GroupOp::Avg => Self::Avg {
                total: 0.0,
                count: 0,
            },
            GroupOp::Min => Self::MinMax {
                best: None,
                want_min: true,
            },
            GroupOp::Max => Self::MinMax {
                best: None,
                want_min: false,
            },
            GroupOp::Count => Self::Count(0),
            GroupOp::First => Self::First(None),
            GroupOp::Last => Self::Last(None),
            GroupOp::Push => Self::Push(Vec::new()),
            GroupOp::AddToSet => Self::AddToSet(Vec::new()),
        }
    }

    fn feed(&mut self, value: Option<&Value>) {
        match self {
            Self::Sum { total, seen } => {
                if let Some(n) = value.and_then(Value::as_f64) {
                    *total += n;
                    *seen = true;
                }
            }
            Self::Avg { total, count } => {
                if let Some(n) = value.and_then(Value::as_f64) {
                    *total += n;
                    *count += 1;
                }
            }
            Self::MinMax { best, want_min } => {
                let Some(candidate) = value else { return };
                if candidate.is_null() {
                    return;
                }
                match best {
                    None => *best = Some(candidate.clone()),
                    Some(current) => {
                        if let Some(ord) = value_cmp(Some(candidate), Some(current)) {
                            let better = if *want_min {
                                ord == std::cmp::Ordering::Less
                            } else {
                                ord == std::cmp::Ordering::Greater
                            };
                            if better {
                                *best = Some(candidate.clone());
                            }
                        }
                    }
                }
            }
            Self::Count(n) => *n += 1,
            Self::First(slot) => {
                if slot.is_none() {
                    slot.replace(value.cloned().unwrap_or(Value::Null));
                }
            }
            Self::Last(slot) => {
                slot.replace(value.cloned().unwrap_or(Value::Null));
            }
            Self::Push(items) => {
                if let Some(v) = value {
                    items.push(v.clone());
                }
            }
            Self::AddToSet(items) => {
                if let Some(v) = value {
                    if !items.iter().any(|seen| value_eq(Some(seen), Some(v))) {
                        items.push(v.clone());
                    }
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Self::Sum { total, seen } => {
                if seen {
                    Number::from_f64(total).map_or(Value::Null, Value::Number)
                } else {
                    Value::Number(0.into())
                }
            }
            Self::Avg { total, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    #[allow(clippy::cast_precision_loss)]
                    let mean = total / count as f64;
                    Number::from_f64(mean).map_or(Value::Null, Value::Number)
                }
            }
            Self::MinMax { best, .. } => best.unwrap_or(Value::Null),
            Self::Count(n) => Value::Number(n.into()),
            Self::First(v) | Self::Last(v) => v.unwrap_or(Value::Null),
            Self::Push(items) | Self::AddToSet(items) => Value::Array(items),
        }
    }
}

fn run_group(stage: &GroupStage, docs: &[Document]) -> Vec<Document> {
    // Group order follows first appearance; the lookup key is the JSON
    // rendering of the group key value.
    let mut order: Vec<(Value, Vec<Accumulator>)> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();

    for doc in docs {
        let key = stage.key_path.as_ref().map_or(Value::Null, |path| {
            resolve_document_path(doc, path).map_or(Value::Null, ValueRef::to_value)
        });
        let rendered = key.to_string();
        let idx = *slots.entry(rendered).or_insert_with(|| {
            let accs = stage
                .specs
                .iter()
                .map(|s| Accumulator::new(s.op))
                .collect();
            order.push((key.clone(), accs));
            order.len() - 1
        });
        let accs = &mut order[idx].1;
        for (acc, spec) in accs.iter_mut().zip(&stage.specs) {
            let arg = spec
                .arg_path
                .as_ref()
                .and_then(|path| resolve_document_path(doc, path).map(ValueRef::to_value));
            acc.feed(arg.as_ref());
        }
    }

    let now = now_millis();
    order
        .into_iter()
        .enumerate()
        .map(|(i, (key, accs))| {
            let mut data = Map::new();
            data.insert(ID_FIELD.to_string(), key);
            for (acc, spec) in accs.into_iter().zip(&stage.specs) {
                data.insert(spec.out_field.clone(), acc.finish());
            }
            Document::new(format!("group_{i}"), data, now)
        })
        .collect()
}
