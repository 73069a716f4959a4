//! `NoSQ` Server -- framed TCP document database with a hybrid
//! memory/disk store.
//!
//! Subsystems:
//!
//! - **Config** ([`config`]): option structs, file + environment overlay
//! - **Cache** ([`cache`]): bounded LRU+TTL read-through layer
//! - **Store** ([`store`]): in-memory tier + async disk writer
//! - **Index** ([`index`]): typed B-tree secondary indexes
//! - **Query** ([`query`]): planning, execution, `explain`
//! - **Cursor** ([`cursor`]): stateful batched iteration + resume tokens
//! - **Auth** ([`auth`]): the authentication collaborator seam
//! - **Network** ([`network`]): listener, connections, command routing,
//!   graceful shutdown

pub mod auth;
pub mod cache;
pub mod config;
pub mod cursor;
pub mod index;
pub mod network;
pub mod query;
pub mod store;

pub use auth::{Authenticator, MasterPasswordAuthenticator};
pub use cache::{CacheConfig, CacheStats, EvictionObserver, EvictionReason, LruTtlCache};
pub use config::{ConfigError, ServerConfig};
pub use cursor::{CursorBatch, CursorInfo, CursorManager, CursorOptions, CursorStats};
pub use index::{BTreeIndex, IndexInfo, IndexKey, IndexManager, RangeBounds};
pub use network::{Server, ServerHandle, ServerState, ShutdownController};
pub use query::{PlanStep, QueryExecutor};
pub use store::{HybridStore, StoreStats};
