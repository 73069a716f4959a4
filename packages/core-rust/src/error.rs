//! Error taxonomy surfaced to clients as `{code, message}` pairs.
//!
//! Every fallible operation in the engine returns [`DbError`]. The
//! [`DbError::code`] string is part of the wire contract and must stay
//! stable; the `Display` output is the human-readable message half.

use thiserror::Error;

/// Convenience alias used throughout both crates.
pub type DbResult<T> = Result<T, DbError>;

/// All error conditions the engine can report to a client.
///
/// Protocol-level failures (`Protocol`) additionally close the connection;
/// everything else is answered as a command-level error response on the
/// same connection.
#[derive(Debug, Error)]
pub enum DbError {
    /// Frame-level violation: bad magic, version, type, length, or CRC.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A structurally valid frame whose message type this server does not serve.
    #[error("unsupported message type: 0x{0:02x}")]
    UnsupportedMessage(u8),

    /// The server is at `max_concurrent_connections`.
    #[error("server is at connection capacity")]
    Capacity,

    /// The command payload is malformed or missing required fields.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The `command` field names no known handler.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// No document with the given id exists in the collection.
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Insert of an id (or unique index key) that is already present.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// An I/O or serialization failure in the persistence layer.
    #[error("storage error: {0}")]
    Storage(String),

    /// Collection name fails the `^[^./\\]+$` rule.
    #[error("invalid collection name: {0:?}")]
    InvalidCollectionName(String),

    /// Operation attempted on a cache after `close()`.
    #[error("cache is closed")]
    CacheClosed,

    /// The filter tree contains an unknown operator or a malformed argument.
    #[error("invalid filter: {0}")]
    FilterInvalid(String),

    /// Query execution exceeded its `timeout_ms` budget.
    #[error("query timed out after {timeout_ms}ms")]
    QueryTimeout {
        /// The budget that was exceeded.
        timeout_ms: u64,
    },

    /// No cursor with the given id (never created, closed, or reclaimed).
    #[error("cursor not found: {0}")]
    CursorNotFound(String),

    /// The cursor exists but its `expires_at` has passed.
    #[error("cursor expired: {0}")]
    CursorExpired(String),

    /// `batch_size` or `timeout_minutes` outside the allowed ranges.
    #[error("invalid cursor options: {0}")]
    CursorInvalidOptions(String),

    /// Resume token encodes a different filter/sort than the new request.
    #[error("resume token does not match the supplied filter and sort")]
    ResumeMismatch,

    /// Resume position can no longer be located in the current ordering.
    #[error("resume token is stale: {0}")]
    ResumeStale(String),

    /// The batch request itself is malformed.
    #[error("invalid batch request: {0}")]
    InvalidBatch(String),

    /// Batch execution failed as a whole.
    #[error("batch execution failed: {0}")]
    BatchError(String),

    /// Authentication rejected. Intentionally carries no detail.
    #[error("authentication failed")]
    AuthFailed,

    /// Last-resort wrapper for bugs caught at the connection boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// The stable wire code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::UnsupportedMessage(_) => "UNSUPPORTED_MESSAGE",
            Self::Capacity => "CAPACITY",
            Self::InvalidCommand(_) => "INVALID_COMMAND",
            Self::UnknownCommand(_) => "UNKNOWN_COMMAND",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::DuplicateKey(_) => "DUPLICATE_KEY",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::InvalidCollectionName(_) => "INVALID_COLLECTION_NAME",
            Self::CacheClosed => "CACHE_CLOSED",
            Self::FilterInvalid(_) => "FILTER_INVALID",
            Self::QueryTimeout { .. } => "QUERY_TIMEOUT",
            Self::CursorNotFound(_) => "CURSOR_NOT_FOUND",
            Self::CursorExpired(_) => "CURSOR_EXPIRED",
            Self::CursorInvalidOptions(_) => "CURSOR_INVALID_OPTIONS",
            Self::ResumeMismatch => "RESUME_MISMATCH",
            Self::ResumeStale(_) => "RESUME_STALE",
            Self::InvalidBatch(_) => "INVALID_BATCH",
            Self::BatchError(_) => "BATCH_ERROR",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error must tear down the connection after reporting.
    ///
    /// Only framing/CRC failures are fatal to the connection; all other
    /// errors are answered in-band and the connection survives.
    #[must_use]
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
