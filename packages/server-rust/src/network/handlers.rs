//! Command routing: JSON command envelopes in, response envelopes out.
//!
//! Single commands arrive in `Command` frames as `{command, collection,
//! ...}`; batches arrive in `BulkOperation` frames. Handlers return the
//! data half of the response envelope; every `DbError` becomes a
//! `{code, message}` error envelope on the same connection.

use std::time::Instant;

use nosq_core::{
    BatchOpType, BatchOperationResult, BatchOperationSpec, BatchRequest, BatchResponse,
    CommandRequest, DataMap, DbError, DbResult, Document, Pipeline, Projection, Query,
    QueryOptions, ResponseBody, SortSpec,
};
use serde_json::{json, Value};

use crate::cursor::CursorOptions;

use super::server::ServerState;

/// The cache key for one document: names cannot contain `/`, so the
/// separator is unambiguous.
fn cache_key(collection: &str, id: &str) -> String {
    format!("{collection}/{id}")
}

/// Parses and executes one `Command` payload.
pub async fn handle_command(state: &ServerState, payload: &[u8]) -> ResponseBody {
    let request: CommandRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(err) => {
            return ResponseBody::error(&DbError::InvalidCommand(format!(
                "command payload is not valid JSON: {err}"
            )));
        }
    };
    match dispatch(state, &request).await {
        Ok(data) => ResponseBody::ok(data),
        Err(err) => {
            tracing::debug!(command = %request.command, code = err.code(), %err, "command failed");
            ResponseBody::error(&err)
        }
    }
}

async fn dispatch(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    match request.command.as_str() {
        "get" => get(state, request).await,
        "set" => set(state, request).await,
        "delete" => delete(state, request),
        "exists" => exists(state, request),
        "count" => count(state, request),
        "listCollections" => Ok(json!({ "collections": state.store.list_collections() })),
        "createCollection" => create_collection(state, request),
        "dropCollection" => drop_collection(state, request).await,
        "clearCollection" => clear_collection(state, request).await,
        "query" => query(state, request).await,
        "explain" => explain(state, request),
        "aggregate" => aggregate(state, request),
        "createIndex" => create_index(state, request),
        "dropIndex" => drop_index(state, request),
        "listIndexes" => list_indexes(state, request),
        "openCursor" => open_cursor(state, request).await,
        "cursorNext" => cursor_next(state, request),
        "closeCursor" => close_cursor(state, request),
        "stats" => Ok(stats(state)),
        "flush" => flush(state).await,
        other => Err(DbError::UnknownCommand(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn require_collection(request: &CommandRequest) -> DbResult<&str> {
    request
        .collection
        .as_deref()
        .ok_or_else(|| DbError::InvalidCommand("missing \"collection\"".into()))
}

fn require_str(args: &DataMap, key: &str) -> DbResult<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DbError::InvalidCommand(format!("missing string field {key:?}")))
}

fn optional_object(args: &DataMap, key: &str) -> DbResult<Option<DataMap>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(DbError::InvalidCommand(format!(
            "field {key:?} must be an object"
        ))),
    }
}

fn parse_query(request: &CommandRequest) -> DbResult<Query> {
    let collection = require_collection(request)?.to_string();
    let filter = optional_object(&request.args, "filter")?;
    let sort = match request.args.get("sort") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => SortSpec::parse_list(value)?,
    };
    let projection = match request.args.get("projection") {
        None | Some(Value::Null) => None,
        Some(value) => Some(Projection::parse(value)?),
    };
    let options = match request.args.get("options") {
        None | Some(Value::Null) => QueryOptions::default(),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| DbError::InvalidCommand(format!("bad query options: {err}")))?,
    };
    Ok(Query {
        collection,
        filter,
        sort,
        projection,
        options,
    })
}

/// Splits a wire document into its id (from `_id`, or freshly generated)
/// and the remaining payload.
fn split_wire_document(document: &Value) -> DbResult<(String, DataMap)> {
    let Some(map) = document.as_object() else {
        return Err(DbError::InvalidCommand("\"document\" must be an object".into()));
    };
    let mut data = map.clone();
    let id = match data.remove(nosq_core::ID_FIELD) {
        None => uuid::Uuid::new_v4().simple().to_string(),
        Some(Value::String(id)) => id,
        Some(_) => {
            return Err(DbError::InvalidCommand("\"_id\" must be a string".into()));
        }
    };
    Ok((id, data))
}

// ---------------------------------------------------------------------------
// Single commands
// ---------------------------------------------------------------------------

async fn get(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    let id = require_str(&request.args, "id")?;
    let key = cache_key(collection, &id);

    if let Ok(Some(doc)) = state.cache.get(&key) {
        return Ok(json!({ "found": true, "value": doc.to_wire() }));
    }
    match state.store.get(collection, &id).await? {
        Some(doc) => {
            let _ = state.cache.set(&key, doc.clone(), None, None);
            Ok(json!({ "found": true, "value": doc.to_wire() }))
        }
        None => Ok(json!({ "found": false, "value": Value::Null })),
    }
}

async fn set(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    let document = request
        .args
        .get("document")
        .ok_or_else(|| DbError::InvalidCommand("missing \"document\"".into()))?;
    let (id, data) = split_wire_document(document)?;

    let doc = upsert(state, collection, &id, data)?;
    let _ = state.cache.set(&cache_key(collection, &id), doc, None, None);
    Ok(json!({ "stored": true, "id": id }))
}

/// Insert-or-update used by `set` and batch updates. An id already in use
/// turns the insert into an update of the same document.
fn upsert(state: &ServerState, collection: &str, id: &str, data: DataMap) -> DbResult<Document> {
    if state.store.exists(collection, id) {
        return state.store.update(collection, id, data);
    }
    match state.store.insert(collection, id, data.clone()) {
        Ok(doc) => Ok(doc),
        // Lost the race against a concurrent insert of the same id.
        Err(DbError::DuplicateKey(_)) if state.store.exists(collection, id) => {
            state.store.update(collection, id, data)
        }
        Err(err) => Err(err),
    }
}

fn delete(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    let id = require_str(&request.args, "id")?;
    let deleted = state.store.delete(collection, &id)?;
    let _ = state.cache.remove(&cache_key(collection, &id));
    Ok(json!({ "deleted": deleted }))
}

fn exists(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    let id = require_str(&request.args, "id")?;
    Ok(json!({ "exists": state.store.exists(collection, &id) }))
}

fn count(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let count = match request.collection.as_deref() {
        Some(collection) => state.store.count(collection),
        None => state.store.total_count(),
    };
    Ok(json!({ "count": count }))
}

fn create_collection(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    state.store.create_collection(collection)?;
    Ok(json!({ "created": true }))
}

async fn drop_collection(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    let removed = state.store.drop_collection(collection).await?;
    state.cursors.close_collection(collection);
    for doc in &removed {
        let _ = state.cache.remove(&cache_key(collection, &doc.id));
    }
    Ok(json!({ "dropped": true, "removed": removed.len() }))
}

async fn clear_collection(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    let removed = state.store.clear_collection(collection).await?;
    state.cursors.close_collection(collection);
    for doc in &removed {
        let _ = state.cache.remove(&cache_key(collection, &doc.id));
    }
    Ok(json!({ "cleared": true, "removed": removed.len() }))
}

async fn query(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let query = parse_query(request)?;
    let result = state.executor.execute(&query).await?;
    serde_json::to_value(result).map_err(|err| DbError::Internal(err.to_string()))
}

fn explain(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let query = parse_query(request)?;
    let plan = state.executor.explain(&query);
    Ok(json!({ "plan": plan }))
}

fn aggregate(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    let stages = request
        .args
        .get("pipeline")
        .ok_or_else(|| DbError::InvalidCommand("missing \"pipeline\"".into()))?;
    let pipeline = Pipeline::parse(stages)?;
    let docs = pipeline.execute(state.store.get_all(collection))?;
    let documents: Vec<Value> = docs.iter().map(Document::to_wire).collect();
    Ok(json!({ "documents": documents, "count": documents.len() }))
}

fn create_index(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    let field = require_str(&request.args, "field")?;
    let unique = request
        .args
        .get("unique")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let docs = state.store.get_all(collection);
    let name = state
        .store
        .indexes()
        .create_index(collection, &field, unique, &docs)?;
    Ok(json!({ "created": true, "name": name }))
}

fn drop_index(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    let field = require_str(&request.args, "field")?;
    Ok(json!({ "dropped": state.store.indexes().drop_index(collection, &field) }))
}

fn list_indexes(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    let indexes = state.store.indexes().list(collection);
    serde_json::to_value(json!({ "indexes": indexes }))
        .map_err(|err| DbError::Internal(err.to_string()))
}

// ---------------------------------------------------------------------------
// Cursor commands
// ---------------------------------------------------------------------------

fn parse_cursor_options(args: &DataMap) -> DbResult<CursorOptions> {
    let mut options = CursorOptions::default();
    let Some(raw) = args.get("options") else {
        return Ok(options);
    };
    let Some(map) = raw.as_object() else {
        return Err(DbError::CursorInvalidOptions("options must be an object".into()));
    };
    if let Some(v) = map.get("batchSize") {
        options.batch_size = v
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                DbError::CursorInvalidOptions("batchSize must be a positive integer".into())
            })?;
    }
    if let Some(v) = map.get("includeTotalCount") {
        options.include_total_count = v.as_bool().unwrap_or(false);
    }
    if let Some(v) = map.get("timeoutMinutes") {
        options.timeout_minutes = v.as_u64().ok_or_else(|| {
            DbError::CursorInvalidOptions("timeoutMinutes must be a positive integer".into())
        })?;
    }
    if let Some(v) = map.get("resumeToken") {
        options.resume_token = v.as_str().map(str::to_string);
    }
    Ok(options)
}

async fn open_cursor(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let collection = require_collection(request)?;
    let filter = optional_object(&request.args, "filter")?;
    let sort = match request.args.get("sort") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => SortSpec::parse_list(value)?,
    };
    let options = parse_cursor_options(&request.args)?;
    options.validate()?;

    let query = Query {
        collection: collection.to_string(),
        filter: filter.clone(),
        sort: sort.clone(),
        ..Query::default()
    };
    let documents = state.executor.materialize(&query).await?;
    let info = state
        .cursors
        .open(collection, filter, &sort, &options, documents)?;
    serde_json::to_value(info).map_err(|err| DbError::Internal(err.to_string()))
}

fn cursor_next(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let cursor_id = require_str(&request.args, "cursorId")?;
    let batch_size = request
        .args
        .get("batchSize")
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok());
    let batch = state.cursors.next(&cursor_id, batch_size)?;
    serde_json::to_value(batch).map_err(|err| DbError::Internal(err.to_string()))
}

fn close_cursor(state: &ServerState, request: &CommandRequest) -> DbResult<Value> {
    let cursor_id = require_str(&request.args, "cursorId")?;
    Ok(json!({ "closed": state.cursors.close(&cursor_id) }))
}

// ---------------------------------------------------------------------------
// Stats and flush
// ---------------------------------------------------------------------------

fn stats(state: &ServerState) -> Value {
    json!({
        "server": {
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeMs": u64::try_from(state.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        },
        "store": state.store.stats(),
        "cache": state.cache.stats(),
        "cursors": state.cursors.stats(),
        "connections": {
            "active": state.registry.count(),
            "totalAccepted": state.registry.total_accepted(),
        },
    })
}

async fn flush(state: &ServerState) -> DbResult<Value> {
    state.store.flush().await;
    Ok(json!({ "flushed": true, "pendingWrites": state.store.pending_writes() }))
}

// ---------------------------------------------------------------------------
// Batch execution
// ---------------------------------------------------------------------------

/// Parses and executes one `BulkOperation` payload.
pub async fn handle_bulk(state: &ServerState, payload: &[u8]) -> ResponseBody {
    let request: BatchRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(err) => {
            return ResponseBody::error(&DbError::InvalidBatch(format!(
                "batch payload is not valid JSON: {err}"
            )));
        }
    };
    let response = execute_batch(state, &request).await;
    match serde_json::to_value(&response) {
        Ok(data) => ResponseBody {
            success: response.success,
            data: Some(data),
            error: None,
        },
        Err(err) => ResponseBody::error(&DbError::Internal(err.to_string())),
    }
}

async fn execute_batch(state: &ServerState, request: &BatchRequest) -> BatchResponse {
    let started = Instant::now();
    let mut results = Vec::with_capacity(request.operations.len());
    let mut inserted = 0_u64;
    let mut updated = 0_u64;
    let mut deleted = 0_u64;

    for (index, op) in request.operations.iter().enumerate() {
        match apply_batch_op(state, &request.collection, op).await {
            Ok(outcome) => {
                match op.operation_type {
                    BatchOpType::Insert => inserted += 1,
                    BatchOpType::Update => updated += 1,
                    BatchOpType::Delete => deleted += 1,
                }
                results.push(BatchOperationResult {
                    index,
                    success: true,
                    document_id: outcome,
                    error_code: None,
                    error_message: None,
                });
            }
            Err(err) => {
                results.push(BatchOperationResult {
                    index,
                    success: false,
                    document_id: op.document_id.clone(),
                    error_code: Some(err.code().to_string()),
                    error_message: Some(err.to_string()),
                });
                if request.stop_on_error {
                    break;
                }
            }
        }
    }

    let failed = results.iter().any(|r| !r.success);
    BatchResponse {
        success: !failed,
        total_processed: results.len() as u64,
        results,
        inserted_count: inserted,
        updated_count: updated,
        deleted_count: deleted,
        processing_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

async fn apply_batch_op(
    state: &ServerState,
    collection: &str,
    op: &BatchOperationSpec,
) -> DbResult<Option<String>> {
    match op.operation_type {
        BatchOpType::Insert => {
            let document = op
                .document
                .as_ref()
                .ok_or_else(|| DbError::InvalidCommand("Insert needs \"document\"".into()))?;
            let (id, data) = split_wire_document(document)?;
            // An explicit documentId wins over the payload's _id.
            let id = op.document_id.clone().unwrap_or(id);
            let doc = state.store.insert(collection, &id, data)?;
            let _ = state.cache.set(&cache_key(collection, &id), doc, None, None);
            Ok(Some(id))
        }
        BatchOpType::Update => {
            let id = match (&op.document_id, &op.document) {
                (Some(id), _) => id.clone(),
                (None, Some(document)) => split_wire_document(document)?.0,
                (None, None) => {
                    return Err(DbError::InvalidCommand(
                        "Update needs \"documentId\" or \"document\"".into(),
                    ));
                }
            };
            let data = if let Some(document) = &op.document {
                split_wire_document(document)?.1
            } else if let Some(fields) = &op.update_fields {
                // Merge the partial fields over the current payload.
                let current = state.store.get(collection, &id).await?.ok_or_else(|| {
                    DbError::NotFound {
                        collection: collection.to_string(),
                        id: id.clone(),
                    }
                })?;
                let mut merged = current.data;
                for (k, v) in fields {
                    merged.insert(k.clone(), v.clone());
                }
                merged
            } else {
                return Err(DbError::InvalidCommand(
                    "Update needs \"document\" or \"updateFields\"".into(),
                ));
            };
            let doc = state.store.update(collection, &id, data)?;
            let _ = state.cache.set(&cache_key(collection, &id), doc, None, None);
            Ok(Some(id))
        }
        BatchOpType::Delete => {
            let id = op
                .document_id
                .clone()
                .ok_or_else(|| DbError::InvalidCommand("Delete needs \"documentId\"".into()))?;
            if !state.store.delete(collection, &id)? {
                return Err(DbError::NotFound {
                    collection: collection.to_string(),
                    id,
                });
            }
            let _ = state.cache.remove(&cache_key(collection, &id));
            Ok(Some(id))
        }
    }
}
