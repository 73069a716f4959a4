//! Registry of secondary indexes and the store-side maintenance hooks.
//!
//! One [`BTreeIndex`] per (collection, field). The hybrid store calls the
//! `on_*` hooks around every mutation so the planner's id-sets stay
//! consistent with the in-memory tier.

use std::sync::Arc;

use dashmap::DashMap;
use nosq_core::{DbError, DbResult, Document};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use super::btree::{BTreeIndex, IndexKey};

/// Summary of one index, as reported by `listIndexes`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    /// Index name (`<collection>_<field>_idx`).
    pub name: String,
    /// Indexed dot-path.
    pub field: String,
    /// Whether duplicate keys are rejected.
    pub unique: bool,
    /// Number of (key, id) entries.
    pub entries: usize,
}

type FieldIndexes = DashMap<String, Arc<RwLock<BTreeIndex>>>;

/// All secondary indexes, keyed by collection then field.
#[derive(Default)]
pub struct IndexManager {
    collections: DashMap<String, Arc<FieldIndexes>>,
}

impl IndexManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fields(&self, collection: &str) -> Option<Arc<FieldIndexes>> {
        self.collections.get(collection).map(|e| Arc::clone(&e))
    }

    /// Creates (or rebuilds) an index over `field` from the given
    /// documents.
    ///
    /// # Errors
    ///
    /// Returns `DUPLICATE_KEY` when a unique constraint is violated by
    /// the existing documents; no index is registered in that case.
    pub fn create_index(
        &self,
        collection: &str,
        field: &str,
        unique: bool,
        docs: &[Document],
    ) -> DbResult<String> {
        let name = format!("{collection}_{field}_idx");
        let mut index = BTreeIndex::new(name.clone(), field.to_string(), unique);
        index.build(docs)?;
        let fields = self
            .collections
            .entry(collection.to_string())
            .or_default()
            .clone();
        fields.insert(field.to_string(), Arc::new(RwLock::new(index)));
        tracing::info!(collection, field, unique, "index created");
        Ok(name)
    }

    /// Drops the index over `field`; returns whether one existed.
    pub fn drop_index(&self, collection: &str, field: &str) -> bool {
        self.fields(collection)
            .is_some_and(|fields| fields.remove(field).is_some())
    }

    /// Drops every index of a collection.
    pub fn drop_collection(&self, collection: &str) {
        self.collections.remove(collection);
    }

    /// Clears the contents of every index of a collection, keeping the
    /// index definitions registered.
    pub fn clear_collection(&self, collection: &str) {
        if let Some(fields) = self.fields(collection) {
            for entry in fields.iter() {
                let mut index = entry.value().write();
                let (name, field, unique) = (
                    index.name().to_string(),
                    index.field().to_string(),
                    index.is_unique(),
                );
                *index = BTreeIndex::new(name, field, unique);
            }
        }
    }

    /// Lists the indexes of a collection.
    #[must_use]
    pub fn list(&self, collection: &str) -> Vec<IndexInfo> {
        self.fields(collection)
            .map(|fields| {
                fields
                    .iter()
                    .map(|entry| {
                        let index = entry.value().read();
                        IndexInfo {
                            name: index.name().to_string(),
                            field: index.field().to_string(),
                            unique: index.is_unique(),
                            entries: index.len(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The name of the index over `field`, when one exists. Used by the
    /// planner for `explain` output.
    #[must_use]
    pub fn index_name(&self, collection: &str, field: &str) -> Option<String> {
        let fields = self.fields(collection)?;
        let index = fields.get(field)?;
        let name = index.read().name().to_string();
        Some(name)
    }

    /// Equality probe: ids whose indexed key equals `value`.
    ///
    /// Returns `None` when no index covers the field (the caller falls
    /// back to a scan); `Some(empty)` is a definitive empty result.
    #[must_use]
    pub fn lookup_eq(&self, collection: &str, field: &str, value: &Value) -> Option<Vec<String>> {
        let fields = self.fields(collection)?;
        let index = fields.get(field)?;
        let Some(key) = IndexKey::from_value(value) else {
            // The field is indexed but the probe value is not indexable:
            // a typed index can never match it.
            return Some(Vec::new());
        };
        let result = index.read().lookup(&key);
        Some(result)
    }

    /// Pre-checks unique constraints for a new document.
    ///
    /// # Errors
    ///
    /// Returns `DUPLICATE_KEY` when any unique index already holds the
    /// document's key under a different id.
    pub fn check_unique(&self, collection: &str, doc: &Document) -> DbResult<()> {
        let Some(fields) = self.fields(collection) else {
            return Ok(());
        };
        for entry in fields.iter() {
            let index = entry.value().read();
            if !index.is_unique() {
                continue;
            }
            if let Some(key) = index.key_for(doc) {
                if index.lookup(&key).iter().any(|id| id != &doc.id) {
                    return Err(DbError::DuplicateKey(format!(
                        "unique index {} already holds this key",
                        index.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Maintenance hook: a document was inserted.
    pub fn on_insert(&self, collection: &str, doc: &Document) {
        let Some(fields) = self.fields(collection) else {
            return;
        };
        for entry in fields.iter() {
            let mut index = entry.value().write();
            if let Some(key) = index.key_for(doc) {
                if let Err(err) = index.insert(key, &doc.id) {
                    // Unique violations are pre-checked; anything here is
                    // a lost race worth surfacing in the log.
                    tracing::warn!(collection, id = %doc.id, %err, "index insert failed");
                }
            }
        }
    }

    /// Maintenance hook: a document was replaced.
    pub fn on_update(&self, collection: &str, old: &Document, new: &Document) {
        let Some(fields) = self.fields(collection) else {
            return;
        };
        for entry in fields.iter() {
            let mut index = entry.value().write();
            let old_key = index.key_for(old);
            let new_key = index.key_for(new);
            if old_key == new_key {
                continue;
            }
            if let Some(key) = old_key {
                index.delete(&key, &old.id);
            }
            if let Some(key) = new_key {
                if let Err(err) = index.insert(key, &new.id) {
                    tracing::warn!(collection, id = %new.id, %err, "index update failed");
                }
            }
        }
    }

    /// Maintenance hook: a document was deleted.
    pub fn on_delete(&self, collection: &str, doc: &Document) {
        let Some(fields) = self.fields(collection) else {
            return;
        };
        for entry in fields.iter() {
            let mut index = entry.value().write();
            if let Some(key) = index.key_for(doc) {
                index.delete(&key, &doc.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(id: &str, v: Value) -> Document {
        Document::new(id.to_string(), v.as_object().cloned().unwrap(), 0)
    }

    fn seeded() -> (IndexManager, Vec<Document>) {
        let docs = vec![
            doc("a", json!({"age": 30, "name": "ann"})),
            doc("b", json!({"age": 40, "name": "bob"})),
            doc("c", json!({"age": 30, "name": "cay"})),
        ];
        let manager = IndexManager::new();
        manager.create_index("users", "age", false, &docs).unwrap();
        (manager, docs)
    }

    #[test]
    fn create_and_lookup() {
        let (manager, _) = seeded();
        let ids = manager.lookup_eq("users", "age", &json!(30)).unwrap();
        assert_eq!(ids, vec!["a", "c"]);
        // Unindexed field: planner must fall back to a scan.
        assert!(manager.lookup_eq("users", "name", &json!("ann")).is_none());
        // Unindexable probe value against an indexed field: empty.
        assert_eq!(
            manager.lookup_eq("users", "age", &json!([30])).unwrap(),
            Vec::<String>::new()
        );
    }

    #[test]
    fn hooks_keep_the_index_consistent() {
        let (manager, _) = seeded();

        let d = doc("d", json!({"age": 30}));
        manager.on_insert("users", &d);
        assert_eq!(
            manager.lookup_eq("users", "age", &json!(30)).unwrap(),
            vec!["a", "c", "d"]
        );

        let d2 = doc("d", json!({"age": 31}));
        manager.on_update("users", &d, &d2);
        assert_eq!(
            manager.lookup_eq("users", "age", &json!(31)).unwrap(),
            vec!["d"]
        );

        manager.on_delete("users", &d2);
        assert!(manager.lookup_eq("users", "age", &json!(31)).unwrap().is_empty());
    }

    #[test]
    fn unique_precheck() {
        let docs = vec![doc("a", json!({"email": "x@y"}))];
        let manager = IndexManager::new();
        manager.create_index("users", "email", true, &docs).unwrap();

        let dup = doc("b", json!({"email": "x@y"}));
        assert_eq!(
            manager.check_unique("users", &dup).unwrap_err().code(),
            "DUPLICATE_KEY"
        );
        // The same id re-checking its own key is fine.
        let same = doc("a", json!({"email": "x@y"}));
        assert!(manager.check_unique("users", &same).is_ok());
        // A different key is fine.
        let other = doc("b", json!({"email": "z@y"}));
        assert!(manager.check_unique("users", &other).is_ok());
    }

    #[test]
    fn drop_and_list() {
        let (manager, _) = seeded();
        let infos = manager.list("users");
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "users_age_idx");
        assert_eq!(infos[0].entries, 3);
        assert!(!infos[0].unique);

        assert!(manager.drop_index("users", "age"));
        assert!(!manager.drop_index("users", "age"));
        assert!(manager.list("users").is_empty());
    }

    #[test]
    fn clear_collection_keeps_definitions() {
        let (manager, _) = seeded();
        manager.clear_collection("users");
        let infos = manager.list("users");
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].entries, 0);
        assert!(manager.lookup_eq("users", "age", &json!(30)).unwrap().is_empty());
    }
}
