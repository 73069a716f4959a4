//! JSON payload shapes carried inside `Command`, `Response`, `Error`,
//! `Authentication`, and `BulkOperation` frames.
//!
//! All wire structs use camelCase field names. The response envelope is
//! `{success, data}` on the happy path and `{success, error: {code,
//! message}}` otherwise.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::DataMap;
use crate::error::DbError;

/// A parsed `Command` payload: the command name, the usual collection
/// argument, and everything else kept verbatim for the handler.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    /// Handler selector (`get`, `set`, `query`, ...).
    pub command: String,
    /// Target collection, when the command takes one.
    #[serde(default)]
    pub collection: Option<String>,
    /// Remaining command-specific arguments.
    #[serde(flatten)]
    pub args: DataMap,
}

/// The response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBody {
    /// Whether the command succeeded.
    pub success: bool,
    /// Command-specific result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error detail when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseBody {
    /// A success envelope wrapping `data`.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// An error envelope derived from the error taxonomy.
    #[must_use]
    pub fn error(err: &DbError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// The `{code, message}` error half of a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// A `Handshake` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Client software version, echoed back in the response.
    #[serde(default)]
    pub version: Option<String>,
}

/// Data half of a successful handshake response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeData {
    /// Server software version.
    pub server_version: String,
    /// Wire protocol version (always 1).
    pub protocol_version: u16,
    /// Server time, UTC epoch milliseconds.
    pub timestamp: i64,
    /// Echo of the client's version string, when sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

/// An `Authentication` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthRequest {
    /// The master password, for password authentication.
    #[serde(default)]
    pub password: Option<String>,
    /// An existing token to revalidate.
    #[serde(default)]
    pub token: Option<String>,
}

/// Data half of a successful authentication response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthData {
    /// The issued token.
    pub token: String,
    /// Token expiry, UTC epoch milliseconds.
    pub expires_at: i64,
}

/// Kinds of batched write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOpType {
    /// Create a new document.
    Insert,
    /// Replace or merge into an existing document.
    Update,
    /// Remove a document by id.
    Delete,
}

/// One operation inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperationSpec {
    /// What to do.
    pub operation_type: BatchOpType,
    /// Target document id (required for `Update`/`Delete`).
    #[serde(default)]
    pub document_id: Option<String>,
    /// Full document payload (for `Insert`, or `Update` replacement).
    #[serde(default)]
    pub document: Option<Value>,
    /// Partial fields merged into the existing payload on `Update`.
    #[serde(default)]
    pub update_fields: Option<DataMap>,
    /// Reserved: filter-scoped batch operations.
    #[serde(default)]
    pub filter: Option<DataMap>,
}

/// A `BulkOperation` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    /// Target collection for every operation.
    pub collection: String,
    /// Operations, executed sequentially in order.
    pub operations: Vec<BatchOperationSpec>,
    /// Stop at the first failing operation.
    #[serde(default)]
    pub stop_on_error: bool,
    /// Reserved: transactional batches are not part of the core.
    #[serde(default)]
    pub use_transaction: bool,
    /// Reserved: transaction correlation id.
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// Per-operation outcome inside a batch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperationResult {
    /// Position of the operation in the request.
    pub index: usize,
    /// Whether this operation succeeded.
    pub success: bool,
    /// The affected document id, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Error code for a failed operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Error message for a failed operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// The full batch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    /// True when every attempted operation succeeded.
    pub success: bool,
    /// Per-operation outcomes, in execution order.
    pub results: Vec<BatchOperationResult>,
    /// Number of successful inserts.
    pub inserted_count: u64,
    /// Number of successful updates.
    pub updated_count: u64,
    /// Number of successful deletes.
    pub deleted_count: u64,
    /// Operations attempted (stops early under `stopOnError`).
    pub total_processed: u64,
    /// Wall-clock execution time.
    pub processing_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn command_request_keeps_extra_args() {
        let req: CommandRequest = serde_json::from_value(json!({
            "command": "set",
            "collection": "users",
            "document": {"_id": "u1", "name": "A"}
        }))
        .unwrap();
        assert_eq!(req.command, "set");
        assert_eq!(req.collection.as_deref(), Some("users"));
        assert_eq!(req.args["document"]["_id"], json!("u1"));
    }

    #[test]
    fn response_envelope_shapes() {
        let ok = ResponseBody::ok(json!({"found": true}));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains("\"success\":true"));
        assert!(!text.contains("error"));

        let err = ResponseBody::error(&DbError::UnknownCommand("frobnicate".into()));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"]["code"], json!("UNKNOWN_COMMAND"));
    }

    #[test]
    fn batch_request_round_trip() {
        let req: BatchRequest = serde_json::from_value(json!({
            "collection": "c",
            "stopOnError": true,
            "operations": [
                {"operationType": "Insert", "document": {"_id": "a", "n": 1}},
                {"operationType": "Delete", "documentId": "b"}
            ]
        }))
        .unwrap();
        assert!(req.stop_on_error);
        assert_eq!(req.operations.len(), 2);
        assert_eq!(req.operations[0].operation_type, BatchOpType::Insert);
        assert_eq!(req.operations[1].document_id.as_deref(), Some("b"));
    }

    #[test]
    fn handshake_data_serializes_camel_case() {
        let data = HandshakeData {
            server_version: "0.1.0".into(),
            protocol_version: 1,
            timestamp: 42,
            client_version: Some("1.0.0".into()),
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["protocolVersion"], json!(1));
        assert_eq!(value["serverVersion"], json!("0.1.0"));
        assert_eq!(value["clientVersion"], json!("1.0.0"));
    }
}
