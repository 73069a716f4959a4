//! Concurrent in-memory tier: collection name -> (document id -> document).
//!
//! Backed by `DashMap` at both levels for lock-free reads and single-key
//! exclusive writes (insert uses the entry API for duplicate detection).

use std::sync::Arc;

use dashmap::DashMap;
use nosq_core::{DbError, DbResult, Document};

type CollectionMap = DashMap<String, Document>;

/// The in-memory tier of the hybrid store.
#[derive(Default)]
pub struct MemoryTier {
    collections: DashMap<String, Arc<CollectionMap>>,
}

impl MemoryTier {
    /// Creates an empty tier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn collection(&self, name: &str) -> Option<Arc<CollectionMap>> {
        self.collections.get(name).map(|e| Arc::clone(&e))
    }

    /// Registers a collection, creating it when absent.
    pub fn create_collection(&self, name: &str) {
        self.collections.entry(name.to_string()).or_default();
    }

    /// Inserts a brand-new document.
    ///
    /// # Errors
    ///
    /// Returns `DUPLICATE_KEY` when the id is already present; the check
    /// and the insert are a single exclusive entry operation.
    pub fn insert(&self, collection: &str, doc: Document) -> DbResult<()> {
        let map = self
            .collections
            .entry(collection.to_string())
            .or_default()
            .clone();
        let result = match map.entry(doc.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DbError::DuplicateKey(format!(
                "{collection}/{id}",
                id = doc.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(doc);
                Ok(())
            }
        };
        result
    }

    /// Replaces an existing document, returning the previous version.
    ///
    /// # Errors
    ///
    /// Returns `NOT_FOUND` when the id is absent.
    pub fn replace(&self, collection: &str, doc: Document) -> DbResult<Document> {
        let map = self
            .collection(collection)
            .ok_or_else(|| DbError::NotFound {
                collection: collection.to_string(),
                id: doc.id.clone(),
            })?;
        let result = match map.entry(doc.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                Ok(std::mem::replace(slot.get_mut(), doc))
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Err(DbError::NotFound {
                collection: collection.to_string(),
                id: doc.id,
            }),
        };
        result
    }

    /// Installs a document unconditionally (startup loading, read-through).
    pub fn install(&self, collection: &str, doc: Document) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(doc.id.clone(), doc);
    }

    /// Fetches a clone of a document.
    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.collection(collection)?.get(id).map(|d| d.clone())
    }

    /// Removes a document, returning it.
    #[must_use]
    pub fn remove(&self, collection: &str, id: &str) -> Option<Document> {
        self.collection(collection)?.remove(id).map(|(_, d)| d)
    }

    /// Whether a document is resident.
    #[must_use]
    pub fn contains(&self, collection: &str, id: &str) -> bool {
        self.collection(collection)
            .is_some_and(|map| map.contains_key(id))
    }

    /// Number of resident documents in one collection.
    #[must_use]
    pub fn count(&self, collection: &str) -> usize {
        self.collection(collection).map_or(0, |map| map.len())
    }

    /// Total resident documents across all collections.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.collections.iter().map(|entry| entry.value().len()).sum()
    }

    /// A point-in-time snapshot of one collection.
    #[must_use]
    pub fn snapshot(&self, collection: &str) -> Vec<Document> {
        self.collection(collection)
            .map(|map| map.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Whether the collection exists (created explicitly or by a write).
    #[must_use]
    pub fn has_collection(&self, collection: &str) -> bool {
        self.collections.contains_key(collection)
    }

    /// Sorted collection names.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Drops a collection, returning its former contents.
    #[must_use]
    pub fn drop_collection(&self, collection: &str) -> Vec<Document> {
        self.collections
            .remove(collection)
            .map(|(_, map)| map.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Empties a collection in place, returning the removed documents.
    #[must_use]
    pub fn clear_collection(&self, collection: &str) -> Vec<Document> {
        self.collection(collection)
            .map(|map| {
                let docs: Vec<Document> = map.iter().map(|e| e.value().clone()).collect();
                map.clear();
                docs
            })
            .unwrap_or_default()
    }
}
