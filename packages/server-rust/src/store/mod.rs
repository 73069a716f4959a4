//! Hybrid document store: concurrent in-memory tier, single-writer async
//! persistence queue, and the on-disk `<base>/<collection>/<id>.json`
//! layout.

mod hybrid;
mod memory;
mod writer;

pub use hybrid::{HybridStore, StoreStats};
pub use memory::MemoryTier;
pub use writer::{document_path, DiskWriter, WriteOp};
