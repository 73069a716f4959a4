//! Ordered key -> document-id index for one (collection, field) pair.
//!
//! Keys are typed; the key space is partitioned by type (strings,
//! integers, floats), so a lookup or range scan only ever touches keys of
//! its own type and mixed-type comparison never happens. Values of any
//! other JSON type are not indexable and are skipped at build time.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use nosq_core::value::resolve_path;
use nosq_core::{DbError, DbResult, Document};
use ordered_float::OrderedFloat;
use serde_json::Value;

/// A typed index key. The derived ordering groups keys by type first
/// (strings, then integers, then floats), then by natural order within
/// the type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    /// Lexicographic (code point) order.
    Str(String),
    /// Numeric order.
    Int(i64),
    /// Numeric order with a total order over floats.
    Float(OrderedFloat<f64>),
}

impl IndexKey {
    /// Extracts an index key from a JSON value; non-indexable types
    /// (null, bool, array, object) yield `None`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Int(i))
                } else {
                    n.as_f64().map(|f| Self::Float(OrderedFloat(f)))
                }
            }
            _ => None,
        }
    }
}

/// Inclusivity of the two ends of a range scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeBounds {
    /// Whether the lower bound itself is included.
    pub lower_inclusive: bool,
    /// Whether the upper bound itself is included.
    pub upper_inclusive: bool,
}

impl Default for RangeBounds {
    fn default() -> Self {
        Self {
            lower_inclusive: true,
            upper_inclusive: true,
        }
    }
}

/// A secondary index over one document field.
#[derive(Debug)]
pub struct BTreeIndex {
    name: String,
    field: String,
    unique: bool,
    map: BTreeMap<IndexKey, BTreeSet<String>>,
    entries: usize,
}

impl BTreeIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(name: String, field: String, unique: bool) -> Self {
        Self {
            name,
            field,
            unique,
            map: BTreeMap::new(),
            entries: 0,
        }
    }

    /// The index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The indexed dot-path.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Whether duplicate keys are rejected.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Number of (key, id) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
    }

    /// True when the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Adds one (key, id) entry.
    ///
    /// # Errors
    ///
    /// Returns `DUPLICATE_KEY` when the index is unique and the key is
    /// already mapped to a different id.
    pub fn insert(&mut self, key: IndexKey, id: &str) -> DbResult<()> {
        let ids = self.map.entry(key).or_default();
        if self.unique && !ids.is_empty() && !ids.contains(id) {
            return Err(DbError::DuplicateKey(format!(
                "unique index {} already holds this key",
                self.name
            )));
        }
        if ids.insert(id.to_string()) {
            self.entries += 1;
        }
        Ok(())
    }

    /// Removes one (key, id) entry; returns whether it was present.
    pub fn delete(&mut self, key: &IndexKey, id: &str) -> bool {
        let Some(ids) = self.map.get_mut(key) else {
            return false;
        };
        let removed = ids.remove(id);
        if removed {
            self.entries -= 1;
            if ids.is_empty() {
                self.map.remove(key);
            }
        }
        removed
    }

    /// The ids mapped to one key.
    #[must_use]
    pub fn lookup(&self, key: &IndexKey) -> Vec<String> {
        self.map
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids for every key in `[lo, hi]` (per the bound inclusivity), in
    /// key order. Open ends scan to the edge of the key's type partition,
    /// or the whole index when both ends are open.
    #[must_use]
    pub fn range(
        &self,
        lo: Option<&IndexKey>,
        hi: Option<&IndexKey>,
        bounds: RangeBounds,
    ) -> Vec<String> {
        let lower = match lo {
            None => Bound::Unbounded,
            Some(k) if bounds.lower_inclusive => Bound::Included(k.clone()),
            Some(k) => Bound::Excluded(k.clone()),
        };
        let upper = match hi {
            None => Bound::Unbounded,
            Some(k) if bounds.upper_inclusive => Bound::Included(k.clone()),
            Some(k) => Bound::Excluded(k.clone()),
        };
        // An inverted range would panic in BTreeMap::range.
        if let (Some(l), Some(h)) = (lo, hi) {
            if l > h {
                return Vec::new();
            }
        }
        let mut out = Vec::new();
        for (key, ids) in self.map.range((lower, upper)) {
            // An open end must not leak into the next type partition.
            if let Some(anchor) = lo.or(hi) {
                if std::mem::discriminant(key) != std::mem::discriminant(anchor) {
                    continue;
                }
            }
            out.extend(ids.iter().cloned());
        }
        out
    }

    /// Rebuilds the index from a document set. Documents missing the
    /// field (or holding a non-indexable value) are skipped.
    ///
    /// # Errors
    ///
    /// Returns `DUPLICATE_KEY` when a unique constraint is violated;
    /// the index is left empty in that case.
    pub fn build(&mut self, docs: &[Document]) -> DbResult<()> {
        self.map.clear();
        self.entries = 0;
        for doc in docs {
            if let Some(key) = self.key_for(doc) {
                if let Err(err) = self.insert(key, &doc.id) {
                    self.map.clear();
                    self.entries = 0;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Extracts this index's key from a document, if present.
    #[must_use]
    pub fn key_for(&self, doc: &Document) -> Option<IndexKey> {
        resolve_path(&doc.data, &self.field).and_then(IndexKey::from_value)
    }
}
