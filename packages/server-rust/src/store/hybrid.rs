//! The hybrid document store: in-memory tier + asynchronous disk writer.
//!
//! Reads and writes are served from memory; every successful mutation
//! enqueues a persistence op. A mutation is therefore visible immediately
//! but durable only once the writer has applied it — `flush()` is the
//! barrier. There is no write-ahead log: startup recovers exactly the
//! on-disk state, and writes still queued at a crash are lost.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nosq_core::{
    now_millis, validate_collection_name, validate_document_id, DataMap, DbError, DbResult,
    Document,
};
use serde::Serialize;

use crate::index::IndexManager;

use super::memory::MemoryTier;
use super::writer::{document_path, DiskWriter, WriteOp};

/// How long `close` waits for the writer to drain.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Occupancy counters reported by the `stats` command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Number of collections.
    pub collections: usize,
    /// Total resident documents.
    pub documents: usize,
    /// Enqueued-but-unapplied writes.
    pub pending_writes: u64,
    /// File operations that failed in the background writer.
    pub write_failures: u64,
}

/// The hybrid store.
pub struct HybridStore {
    base: PathBuf,
    memory: MemoryTier,
    writer: DiskWriter,
    indexes: Arc<IndexManager>,
}

impl HybridStore {
    /// Creates a store rooted at `base` and spawns its writer task.
    #[must_use]
    pub fn new(base: PathBuf, indexes: Arc<IndexManager>) -> Self {
        let writer = DiskWriter::spawn(base.clone());
        Self {
            base,
            memory: MemoryTier::new(),
            writer,
            indexes,
        }
    }

    /// The secondary-index registry this store maintains.
    #[must_use]
    pub fn indexes(&self) -> &Arc<IndexManager> {
        &self.indexes
    }

    /// Scans the base directory and loads every readable document into
    /// the in-memory tier. Corrupt or unreadable files are skipped with a
    /// warning. Idempotent: a second call observes the same contents.
    ///
    /// # Errors
    ///
    /// Returns `STORAGE_ERROR` when the base directory cannot be created
    /// or listed.
    pub async fn initialize(&self) -> DbResult<()> {
        tokio::fs::create_dir_all(&self.base).await?;
        let mut loaded = 0_usize;
        let mut dirs = tokio::fs::read_dir(&self.base).await?;
        while let Some(entry) = dirs.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_collection_name(&name).is_err() {
                tracing::warn!(directory = %name, "skipping non-collection directory");
                continue;
            }
            self.memory.create_collection(&name);
            loaded += self.load_collection(&name, entry.path()).await?;
        }
        tracing::info!(
            collections = self.memory.collection_names().len(),
            documents = loaded,
            "store initialized from {}",
            self.base.display()
        );
        Ok(())
    }

    async fn load_collection(&self, collection: &str, dir: PathBuf) -> DbResult<usize> {
        let mut loaded = 0_usize;
        let mut files = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Document>(&bytes) {
                    Ok(doc) => {
                        self.memory.install(collection, doc);
                        loaded += 1;
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), %err, "skipping corrupt document file");
                    }
                },
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping unreadable document file");
                }
            }
        }
        Ok(loaded)
    }

    /// Inserts a new document, stamping metadata (`version = 1`).
    ///
    /// # Errors
    ///
    /// `DUPLICATE_KEY` when the id (or a unique index key) is taken,
    /// `INVALID_COLLECTION_NAME`/`INVALID_COMMAND` on bad names.
    pub fn insert(&self, collection: &str, id: &str, data: DataMap) -> DbResult<Document> {
        validate_collection_name(collection)?;
        validate_document_id(id)?;
        let doc = Document::new(id.to_string(), data, now_millis());
        self.indexes.check_unique(collection, &doc)?;
        self.memory.insert(collection, doc.clone())?;
        self.indexes.on_insert(collection, &doc);
        self.writer.enqueue(WriteOp::Insert {
            collection: collection.to_string(),
            document: doc.clone(),
        });
        Ok(doc)
    }

    /// Replaces an existing document's payload, advancing its version.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` when the id is not resident.
    pub fn update(&self, collection: &str, id: &str, data: DataMap) -> DbResult<Document> {
        validate_collection_name(collection)?;
        validate_document_id(id)?;
        let existing = self
            .memory
            .get(collection, id)
            .ok_or_else(|| DbError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        let doc = existing.updated(data, now_millis());
        self.indexes.check_unique(collection, &doc)?;
        let old = self.memory.replace(collection, doc.clone())?;
        self.indexes.on_update(collection, &old, &doc);
        self.writer.enqueue(WriteOp::Update {
            collection: collection.to_string(),
            document: doc.clone(),
        });
        Ok(doc)
    }

    /// Fetches a document, reading through to disk on a memory miss and
    /// installing what it finds.
    ///
    /// # Errors
    ///
    /// `INVALID_COLLECTION_NAME`/`INVALID_COMMAND` on bad names.
    pub async fn get(&self, collection: &str, id: &str) -> DbResult<Option<Document>> {
        validate_collection_name(collection)?;
        validate_document_id(id)?;
        if let Some(doc) = self.memory.get(collection, id) {
            return Ok(Some(doc));
        }
        let path = document_path(&self.base, collection, id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice::<Document>(&bytes) {
            Ok(doc) => {
                self.memory.install(collection, doc.clone());
                Ok(Some(doc))
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "unreadable document on read-through");
                Ok(None)
            }
        }
    }

    /// Removes a document; returns whether one was resident.
    ///
    /// # Errors
    ///
    /// `INVALID_COLLECTION_NAME`/`INVALID_COMMAND` on bad names.
    pub fn delete(&self, collection: &str, id: &str) -> DbResult<bool> {
        validate_collection_name(collection)?;
        validate_document_id(id)?;
        match self.memory.remove(collection, id) {
            Some(doc) => {
                self.indexes.on_delete(collection, &doc);
                self.writer.enqueue(WriteOp::Delete {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether a document is resident in the in-memory tier.
    #[must_use]
    pub fn exists(&self, collection: &str, id: &str) -> bool {
        self.memory.contains(collection, id)
    }

    /// Resident document count for one collection.
    #[must_use]
    pub fn count(&self, collection: &str) -> usize {
        self.memory.count(collection)
    }

    /// Total resident documents.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.memory.total_count()
    }

    /// A point-in-time snapshot of one collection.
    #[must_use]
    pub fn get_all(&self, collection: &str) -> Vec<Document> {
        self.memory.snapshot(collection)
    }

    /// Registers a collection without writing anything; the directory
    /// appears on first write.
    ///
    /// # Errors
    ///
    /// `INVALID_COLLECTION_NAME` on a bad name.
    pub fn create_collection(&self, collection: &str) -> DbResult<()> {
        validate_collection_name(collection)?;
        self.memory.create_collection(collection);
        Ok(())
    }

    /// Whether the collection exists.
    #[must_use]
    pub fn has_collection(&self, collection: &str) -> bool {
        self.memory.has_collection(collection)
    }

    /// Sorted collection names.
    #[must_use]
    pub fn list_collections(&self) -> Vec<String> {
        self.memory.collection_names()
    }

    /// Drops a collection: memory, indexes, and the directory tree.
    ///
    /// # Errors
    ///
    /// `STORAGE_ERROR` when the directory removal fails.
    pub async fn drop_collection(&self, collection: &str) -> DbResult<Vec<Document>> {
        validate_collection_name(collection)?;
        // Let queued writes land first so none of them re-create files
        // after the directory is removed.
        self.writer.flush().await;
        let removed = self.memory.drop_collection(collection);
        self.indexes.drop_collection(collection);
        let dir = self.base.join(collection);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(removed)
    }

    /// Empties a collection: memory, index contents, and every `*.json`
    /// file in its directory. The collection itself survives.
    ///
    /// # Errors
    ///
    /// `STORAGE_ERROR` when the directory listing fails.
    pub async fn clear_collection(&self, collection: &str) -> DbResult<Vec<Document>> {
        validate_collection_name(collection)?;
        // Same ordering rule as drop: queued writes land before the files
        // are deleted.
        self.writer.flush().await;
        let removed = self.memory.clear_collection(collection);
        self.indexes.clear_collection(collection);
        let dir = self.base.join(collection);
        let mut files = match tokio::fs::read_dir(&dir).await {
            Ok(files) => files,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), %err, "failed to remove document file");
                }
            }
        }
        Ok(removed)
    }

    /// The durability barrier: completes when `pending_writes == 0`.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Enqueued-but-unapplied write count.
    #[must_use]
    pub fn pending_writes(&self) -> u64 {
        self.writer.pending_writes()
    }

    /// Occupancy counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            collections: self.memory.collection_names().len(),
            documents: self.memory.total_count(),
            pending_writes: self.writer.pending_writes(),
            write_failures: self.writer.failure_count(),
        }
    }

    /// Closes the write queue and waits up to 30 seconds for it to drain.
    pub async fn close(&self) {
        self.writer.close(CLOSE_TIMEOUT).await;
    }
}
