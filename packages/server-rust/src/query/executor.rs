//! Query planning and execution over the hybrid store.
//!
//! The planner probes the secondary indexes with every top-level equality
//! condition (bare `field: value`, `field: {"$eq": v}`, and the same
//! inside a top-level `$and`); when at least one index matches, the
//! candidate set is the intersection of the matching id-sets, otherwise
//! the whole collection is scanned. Candidates then flow through filter,
//! optional total-count snapshot, stable sort, skip/limit, and projection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nosq_core::query::sort_documents;
use nosq_core::{matches_document, DataMap, DbError, DbResult, Document, Query, QueryResult};
use serde::Serialize;
use serde_json::Value;

use crate::store::HybridStore;

/// How often the filter loop consults the deadline.
const TIMEOUT_CHECK_INTERVAL: usize = 256;

/// One step of an execution plan, as reported by `explain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage")]
pub enum PlanStep {
    /// Candidate acquisition via a secondary index.
    IndexScan {
        /// The chosen index.
        index: String,
    },
    /// Candidate acquisition via a full collection scan.
    CollectionScan,
    /// Filter evaluation over the candidates.
    Filter,
    /// Stable sort.
    Sort,
    /// Skip step.
    Skip,
    /// Limit step.
    Limit,
}

/// Executes queries against one store.
#[derive(Clone)]
pub struct QueryExecutor {
    store: Arc<HybridStore>,
}

struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    fn new(timeout_ms: Option<u64>) -> Self {
        Self {
            started: Instant::now(),
            budget: timeout_ms.map(Duration::from_millis),
        }
    }

    fn check(&self) -> DbResult<()> {
        if let Some(budget) = self.budget {
            if self.started.elapsed() > budget {
                return Err(DbError::QueryTimeout {
                    timeout_ms: budget.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl QueryExecutor {
    /// Creates an executor over `store`.
    #[must_use]
    pub fn new(store: Arc<HybridStore>) -> Self {
        Self { store }
    }

    /// Runs the full pipeline and returns projected wire documents.
    ///
    /// # Errors
    ///
    /// `FILTER_INVALID` from the filter engine, `QUERY_TIMEOUT` when the
    /// budget elapses.
    pub async fn execute(&self, query: &Query) -> DbResult<QueryResult> {
        let deadline = Deadline::new(query.options.timeout_ms);
        let mut docs = self.filtered(query, &deadline).await?;

        let total_count = query
            .options
            .include_total_count
            .then(|| docs.len() as u64);

        deadline.check()?;
        sort_documents(&mut docs, &query.sort);
        deadline.check()?;

        let skipped = query.options.skip.min(docs.len());
        let mut docs: Vec<Document> = docs.into_iter().skip(query.options.skip).collect();
        if let Some(limit) = query.options.limit {
            docs.truncate(limit);
        }

        let documents = docs
            .into_iter()
            .map(|doc| match &query.projection {
                Some(projection) => Value::Object(projection.apply(&doc.id, &doc.data)),
                None => doc.to_wire(),
            })
            .collect();

        Ok(QueryResult {
            documents,
            total_count,
            skipped,
            execution_time_ms: deadline.elapsed_ms(),
        })
    }

    /// The number of documents matching the filter.
    ///
    /// # Errors
    ///
    /// `FILTER_INVALID`, `QUERY_TIMEOUT`.
    pub async fn count(&self, query: &Query) -> DbResult<usize> {
        let deadline = Deadline::new(query.options.timeout_ms);
        Ok(self.filtered(query, &deadline).await?.len())
    }

    /// Whether any document matches, short-circuiting on the first hit.
    ///
    /// # Errors
    ///
    /// `FILTER_INVALID`, `QUERY_TIMEOUT`.
    pub async fn exists(&self, query: &Query) -> DbResult<bool> {
        let deadline = Deadline::new(query.options.timeout_ms);
        let candidates = self.candidates(query).await?;
        let filter = query.filter.clone().unwrap_or_default();
        for (i, doc) in candidates.iter().enumerate() {
            if i % TIMEOUT_CHECK_INTERVAL == 0 {
                deadline.check()?;
            }
            if matches_document(&filter, doc)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Materializes the filtered and sorted result set (no pagination or
    /// projection). The cursor manager builds on this.
    ///
    /// # Errors
    ///
    /// `FILTER_INVALID`, `QUERY_TIMEOUT`.
    pub async fn materialize(&self, query: &Query) -> DbResult<Vec<Document>> {
        let deadline = Deadline::new(query.options.timeout_ms);
        let mut docs = self.filtered(query, &deadline).await?;
        sort_documents(&mut docs, &query.sort);
        Ok(docs)
    }

    /// Describes how the query would run, without running it.
    #[must_use]
    pub fn explain(&self, query: &Query) -> Vec<PlanStep> {
        let mut plan = Vec::new();
        let chosen = self
            .equality_conditions(query)
            .into_iter()
            .find_map(|(field, _)| {
                self.store
                    .indexes()
                    .index_name(&query.collection, &field)
            });
        match chosen {
            Some(index) => plan.push(PlanStep::IndexScan { index }),
            None => plan.push(PlanStep::CollectionScan),
        }
        plan.push(PlanStep::Filter);
        if !query.sort.is_empty() {
            plan.push(PlanStep::Sort);
        }
        if query.options.skip > 0 {
            plan.push(PlanStep::Skip);
        }
        if query.options.limit.is_some() {
            plan.push(PlanStep::Limit);
        }
        plan
    }

    /// Top-level equality conditions usable by the planner.
    fn equality_conditions(&self, query: &Query) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        let Some(filter) = &query.filter else {
            return out;
        };
        collect_equalities(filter, &mut out);
        out
    }

    async fn candidates(&self, query: &Query) -> DbResult<Vec<Document>> {
        let equalities = self.equality_conditions(query);
        let mut id_sets: Vec<Vec<String>> = Vec::new();
        for (field, value) in &equalities {
            if let Some(ids) = self
                .store
                .indexes()
                .lookup_eq(&query.collection, field, value)
            {
                id_sets.push(ids);
            }
        }
        if id_sets.is_empty() {
            return Ok(self.store.get_all(&query.collection));
        }

        // Intersect the id-sets from every usable index.
        let mut iter = id_sets.into_iter();
        let mut ids: HashSet<String> = iter.next().unwrap_or_default().into_iter().collect();
        for set in iter {
            let other: HashSet<String> = set.into_iter().collect();
            ids.retain(|id| other.contains(id));
        }

        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.store.get(&query.collection, &id).await? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn filtered(&self, query: &Query, deadline: &Deadline) -> DbResult<Vec<Document>> {
        deadline.check()?;
        let candidates = self.candidates(query).await?;
        let filter = query.filter.clone().unwrap_or_default();
        let mut kept = Vec::with_capacity(candidates.len().min(1024));
        for (i, doc) in candidates.into_iter().enumerate() {
            if i % TIMEOUT_CHECK_INTERVAL == 0 {
                deadline.check()?;
            }
            if matches_document(&filter, &doc)? {
                kept.push(doc);
            }
        }
        Ok(kept)
    }
}

/// Walks a filter's top level (and one level into `$and`) collecting
/// `field == value` conditions.
fn collect_equalities(filter: &DataMap, out: &mut Vec<(String, Value)>) {
    for (key, condition) in filter {
        if key == "$and" {
            if let Some(subs) = condition.as_array() {
                for sub in subs {
                    if let Some(sub) = sub.as_object() {
                        collect_equalities(sub, out);
                    }
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        match condition {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                if let Some(v) = ops.get("$eq") {
                    out.push((key.clone(), v.clone()));
                }
            }
            Value::Object(_) | Value::Array(_) => {}
            literal => out.push((key.clone(), literal.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use nosq_core::query::{QueryOptions, SortSpec};
    use nosq_core::Projection;
    use serde_json::json;

    use crate::index::IndexManager;

    use super::*;

    async fn seeded(dir: &tempfile::TempDir, n: i64) -> Arc<HybridStore> {
        let store = Arc::new(HybridStore::new(
            dir.path().to_path_buf(),
            Arc::new(IndexManager::new()),
        ));
        for i in 1..=n {
            store
                .insert(
                    "people",
                    &format!("p{i:03}"),
                    json!({"age": i, "tier": if i % 2 == 0 { "even" } else { "odd" }})
                        .as_object()
                        .cloned()
                        .unwrap(),
                )
                .unwrap();
        }
        store
    }

    fn query(filter: serde_json::Value) -> Query {
        Query {
            collection: "people".into(),
            filter: filter.as_object().cloned(),
            ..Query::default()
        }
    }

    #[tokio::test]
    async fn filter_sort_skip_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded(&dir, 100).await;
        let executor = QueryExecutor::new(store.clone());

        let q = Query {
            sort: vec![SortSpec {
                path: "age".into(),
                ascending: true,
            }],
            options: QueryOptions {
                skip: 10,
                limit: Some(5),
                include_total_count: true,
                timeout_ms: None,
            },
            ..query(json!({"age": {"$gte": 50}}))
        };
        let result = executor.execute(&q).await.unwrap();

        let ages: Vec<i64> = result
            .documents
            .iter()
            .map(|d| d["age"].as_i64().unwrap())
            .collect();
        assert_eq!(ages, vec![60, 61, 62, 63, 64]);
        assert_eq!(result.total_count, Some(51));
        assert_eq!(result.skipped, 10);
        store.close().await;
    }

    #[tokio::test]
    async fn projection_applies_last() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded(&dir, 3).await;
        let executor = QueryExecutor::new(store.clone());

        let q = Query {
            projection: Some(Projection::parse(&json!({"age": 1})).unwrap()),
            ..query(json!({}))
        };
        let result = executor.execute(&q).await.unwrap();
        assert_eq!(result.documents.len(), 3);
        for doc in &result.documents {
            assert!(doc.get("age").is_some());
            assert!(doc.get("_id").is_some());
            assert!(doc.get("tier").is_none());
        }
        store.close().await;
    }

    #[tokio::test]
    async fn count_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded(&dir, 20).await;
        let executor = QueryExecutor::new(store.clone());

        assert_eq!(
            executor.count(&query(json!({"tier": "even"}))).await.unwrap(),
            10
        );
        assert!(executor.exists(&query(json!({"age": 7}))).await.unwrap());
        assert!(!executor.exists(&query(json!({"age": 999}))).await.unwrap());
        store.close().await;
    }

    #[tokio::test]
    async fn index_assisted_equality() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded(&dir, 50).await;
        store
            .indexes()
            .create_index("people", "age", false, &store.get_all("people"))
            .unwrap();
        let executor = QueryExecutor::new(store.clone());

        let result = executor.execute(&query(json!({"age": 7}))).await.unwrap();
        assert_eq!(result.documents.len(), 1);
        assert_eq!(result.documents[0]["_id"], json!("p007"));

        // $eq form and $and intersection also use the index.
        let result = executor
            .execute(&query(json!({"age": {"$eq": 8}})))
            .await
            .unwrap();
        assert_eq!(result.documents.len(), 1);

        let result = executor
            .execute(&query(json!({"$and": [{"age": 9}, {"tier": "odd"}]})))
            .await
            .unwrap();
        assert_eq!(result.documents.len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn explain_reports_the_plan() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded(&dir, 10).await;
        let executor = QueryExecutor::new(store.clone());

        let q = Query {
            sort: vec![SortSpec {
                path: "age".into(),
                ascending: true,
            }],
            options: QueryOptions {
                skip: 1,
                limit: Some(2),
                ..QueryOptions::default()
            },
            ..query(json!({"age": 5}))
        };
        assert_eq!(
            executor.explain(&q),
            vec![
                PlanStep::CollectionScan,
                PlanStep::Filter,
                PlanStep::Sort,
                PlanStep::Skip,
                PlanStep::Limit
            ]
        );

        store
            .indexes()
            .create_index("people", "age", false, &store.get_all("people"))
            .unwrap();
        assert_eq!(
            executor.explain(&q)[0],
            PlanStep::IndexScan {
                index: "people_age_idx".into()
            }
        );
        store.close().await;
    }

    #[tokio::test]
    async fn invalid_filter_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded(&dir, 3).await;
        let executor = QueryExecutor::new(store.clone());
        let err = executor
            .execute(&query(json!({"age": {"$within": 5}})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FILTER_INVALID");
        store.close().await;
    }

    #[tokio::test]
    async fn zero_budget_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded(&dir, 10).await;
        let executor = QueryExecutor::new(store.clone());
        let q = Query {
            options: QueryOptions {
                timeout_ms: Some(0),
                ..QueryOptions::default()
            },
            ..query(json!({}))
        };
        // A zero budget expires before the first deadline check.
        let err = executor.execute(&q).await.unwrap_err();
        assert_eq!(err.code(), "QUERY_TIMEOUT");
        store.close().await;
    }
}
