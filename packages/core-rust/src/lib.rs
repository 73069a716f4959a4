//! `NoSQ` Core -- document model, filter engine, query pipeline, and wire protocol.
//!
//! This crate provides the runtime-free foundation layer for the `NoSQ`
//! document database:
//!
//! - **Document** ([`document`]): the stored unit, naming rules, timestamps
//! - **Value** ([`value`]): JSON value comparison and dot-path resolution
//! - **Filter** ([`filter`]): operator-tree evaluation against documents
//! - **Query** ([`query`]): sort specs, projections, options, results
//! - **Aggregate** ([`aggregate`]): the stage pipeline (`$match` .. `$group`)
//! - **Wire** ([`wire`]): framed binary protocol with CRC-32 trailers
//! - **Messages** ([`messages`]): JSON payload shapes for the wire frames
//! - **Error** ([`error`]): the `{code, message}` taxonomy

pub mod aggregate;
pub mod document;
pub mod error;
pub mod filter;
pub mod messages;
pub mod query;
pub mod value;
pub mod wire;

// Document
pub use document::{
    now_millis, validate_collection_name, validate_document_id, DataMap, Document, ID_FIELD,
};

// Error
pub use error::{DbError, DbResult};

// Filter
pub use filter::{matches, matches_document};

// Query
pub use query::{Projection, Query, QueryOptions, QueryResult, SortSpec};

// Aggregate
pub use aggregate::{GroupOp, GroupSpec, GroupStage, Pipeline, Stage};

// Wire
pub use wire::{decode_frame, Frame, FrameFlags, MessageType, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};

// Messages
pub use messages::{
    AuthData, AuthRequest, BatchOpType, BatchOperationResult, BatchOperationSpec, BatchRequest,
    BatchResponse, CommandRequest, ErrorBody, HandshakeData, HandshakeRequest, ResponseBody,
};
