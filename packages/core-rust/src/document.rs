//! Document model and naming rules.
//!
//! A [`Document`] is the unit of storage: an identity, a free-form JSON
//! object, and server-maintained metadata (timestamps + version). The
//! on-disk form uses PascalCase field names; reads accept the common
//! casings via serde aliases.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DbError, DbResult};

/// Free-form document payload: string keys to JSON values.
pub type DataMap = Map<String, Value>;

/// Reserved key carrying the document identity in wire representations.
pub const ID_FIELD: &str = "_id";

/// A stored document with identity, payload, and metadata.
///
/// Invariants maintained by the store:
/// - `created_at` never changes after creation
/// - `updated_at >= created_at`
/// - `version` starts at 1 and increases by exactly one per update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Document {
    /// Identity, unique within the owning collection.
    #[serde(alias = "id", alias = "_id")]
    pub id: String,
    /// The user payload.
    #[serde(alias = "data", default)]
    pub data: DataMap,
    /// UTC epoch milliseconds at creation.
    #[serde(alias = "createdAt", alias = "created_at")]
    pub created_at: i64,
    /// UTC epoch milliseconds of the last successful write.
    #[serde(alias = "updatedAt", alias = "updated_at")]
    pub updated_at: i64,
    /// Monotonic update counter, starting at 1.
    #[serde(alias = "version")]
    pub version: u64,
}

impl Document {
    /// Creates a version-1 document stamped with `now`.
    #[must_use]
    pub fn new(id: String, data: DataMap, now: i64) -> Self {
        Self {
            id,
            data,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Produces the successor document for an update: the payload is
    /// replaced, `created_at` is preserved, `updated_at` is stamped, and
    /// the version advances by one.
    ///
    /// `updated_at` never moves backwards, even across a wall-clock step.
    #[must_use]
    pub fn updated(&self, data: DataMap, now: i64) -> Self {
        Self {
            id: self.id.clone(),
            data,
            created_at: self.created_at,
            updated_at: now.max(self.updated_at),
            version: self.version + 1,
        }
    }

    /// The wire representation: the payload object with `_id` injected.
    ///
    /// A payload that already carries an `_id` field (group-stage output,
    /// where it holds the group key) keeps it; the document identity only
    /// fills the gap.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let mut map = self.data.clone();
        map.entry(ID_FIELD.to_string())
            .or_insert_with(|| Value::String(self.id.clone()));
        Value::Object(map)
    }
}

/// Current UTC time in epoch milliseconds.
///
/// Saturates to `i64::MAX` rather than panicking on a clock far in the
/// future; a clock before the epoch reads as 0.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Validates a collection name: `^[^./\\]+$` (so also no `..`).
///
/// # Errors
///
/// Returns `INVALID_COLLECTION_NAME` when the rule is violated.
pub fn validate_collection_name(name: &str) -> DbResult<()> {
    if name.is_empty() || name.chars().any(|c| matches!(c, '.' | '/' | '\\')) {
        return Err(DbError::InvalidCollectionName(name.to_string()));
    }
    Ok(())
}

/// Validates a document id: non-empty, no path separators, no `..`.
///
/// The id becomes a file name under the collection directory, so anything
/// that could escape the directory is rejected.
///
/// # Errors
///
/// Returns `INVALID_COMMAND` when the rule is violated.
pub fn validate_document_id(id: &str) -> DbResult<()> {
    if id.is_empty() {
        return Err(DbError::InvalidCommand("document id is empty".into()));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(DbError::InvalidCommand(format!(
            "document id {id:?} contains path characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn data(v: Value) -> DataMap {
        match v {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn new_document_starts_at_version_one() {
        let doc = Document::new("d1".into(), data(json!({"n": 1})), 1_000);
        assert_eq!(doc.version, 1);
        assert_eq!(doc.created_at, 1_000);
        assert_eq!(doc.updated_at, 1_000);
    }

    #[test]
    fn updated_preserves_creation_and_bumps_version() {
        let doc = Document::new("d1".into(), data(json!({"n": 1})), 1_000);
        let next = doc.updated(data(json!({"n": 2})), 2_000);
        assert_eq!(next.version, 2);
        assert_eq!(next.created_at, 1_000);
        assert_eq!(next.updated_at, 2_000);
        assert!(next.updated_at >= next.created_at);
        assert_eq!(next.data["n"], json!(2));
    }

    #[test]
    fn updated_never_moves_updated_at_backwards() {
        let doc = Document::new("d1".into(), data(json!({})), 1_000);
        let first = doc.updated(data(json!({"n": 1})), 2_000);
        // A wall-clock step backwards between updates must not regress
        // the timestamp.
        let second = first.updated(data(json!({"n": 2})), 500);
        assert_eq!(second.updated_at, 2_000);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.version, 3);
    }

    #[test]
    fn wire_form_injects_id() {
        let doc = Document::new("k".into(), data(json!({"n": 1})), 0);
        let wire = doc.to_wire();
        assert_eq!(wire["_id"], json!("k"));
        assert_eq!(wire["n"], json!(1));
    }

    #[test]
    fn wire_form_keeps_a_payload_id() {
        // Group-stage output: the payload's _id is the group key and must
        // survive, not the synthetic document identity.
        let doc = Document::new("group_0".into(), data(json!({"_id": "west", "total": 30.0})), 0);
        let wire = doc.to_wire();
        assert_eq!(wire["_id"], json!("west"));
        assert_eq!(wire["total"], json!(30.0));
    }

    #[test]
    fn disk_form_uses_pascal_case() {
        let doc = Document::new("d1".into(), data(json!({"a": true})), 42);
        let text = serde_json::to_string(&doc).unwrap();
        assert!(text.contains("\"Id\""));
        assert!(text.contains("\"CreatedAt\""));
        assert!(text.contains("\"Version\""));
    }

    #[test]
    fn disk_form_reads_other_casings() {
        let doc: Document = serde_json::from_value(json!({
            "id": "d1",
            "data": {"x": 1},
            "createdAt": 5,
            "updatedAt": 6,
            "version": 3
        }))
        .unwrap();
        assert_eq!(doc.id, "d1");
        assert_eq!(doc.version, 3);
        assert_eq!(doc.created_at, 5);
    }

    #[test]
    fn collection_names() {
        assert!(validate_collection_name("users").is_ok());
        assert!(validate_collection_name("users-2024_v1").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("a.b").is_err());
        assert!(validate_collection_name("a/b").is_err());
        assert!(validate_collection_name("a\\b").is_err());
        assert!(validate_collection_name("..").is_err());
    }

    #[test]
    fn document_ids() {
        assert!(validate_document_id("u1").is_ok());
        assert!(validate_document_id("with.dot").is_ok());
        assert!(validate_document_id("").is_err());
        assert!(validate_document_id("a/b").is_err());
        assert!(validate_document_id("a\\b").is_err());
        assert!(validate_document_id("..").is_err());
        assert!(validate_document_id("a..b").is_err());
    }
}
