//! Server-side cursors: stateful batched iteration over a materialized
//! query result, with expiry and opaque resume tokens.
//!
//! A cursor owns the filtered-and-sorted document vector and a position
//! counter; successive `next` calls hand out disjoint consecutive slices.
//! Cursors die three ways: an explicit close, the batch after the last
//! documents (auto-close), or the 60-second expiry sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::{DashMap, DashSet};
use nosq_core::{now_millis, DataMap, DbError, DbResult, Document, SortSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inclusive bounds on `batch_size`.
pub const BATCH_SIZE_RANGE: (usize, usize) = (1, 10_000);

/// Inclusive bounds on `timeout_minutes`.
pub const TIMEOUT_MINUTES_RANGE: (u64, u64) = (1, 60);

/// Options accepted when opening a cursor.
#[derive(Debug, Clone)]
pub struct CursorOptions {
    /// Documents per batch, in `[1, 10_000]`.
    pub batch_size: usize,
    /// Snapshot the total match count at creation.
    pub include_total_count: bool,
    /// Idle lifetime in minutes, in `[1, 60]`.
    pub timeout_minutes: u64,
    /// Continue a previous iteration.
    pub resume_token: Option<String>,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            include_total_count: false,
            timeout_minutes: 10,
            resume_token: None,
        }
    }
}

impl CursorOptions {
    /// Checks the documented ranges.
    ///
    /// # Errors
    ///
    /// Returns `CURSOR_INVALID_OPTIONS`; no cursor is created.
    pub fn validate(&self) -> DbResult<()> {
        let (lo, hi) = BATCH_SIZE_RANGE;
        if self.batch_size < lo || self.batch_size > hi {
            return Err(DbError::CursorInvalidOptions(format!(
                "batchSize must be in [{lo}, {hi}]"
            )));
        }
        let (lo, hi) = TIMEOUT_MINUTES_RANGE;
        if self.timeout_minutes < lo || self.timeout_minutes > hi {
            return Err(DbError::CursorInvalidOptions(format!(
                "timeoutMinutes must be in [{lo}, {hi}]"
            )));
        }
        Ok(())
    }
}

/// The opaque resume token payload (base64 of this JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeToken {
    cursor_id: String,
    last_document_id: Option<String>,
    created_at: i64,
    filter: Option<DataMap>,
    sort: Value,
}

impl ResumeToken {
    fn encode(&self) -> String {
        BASE64.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    fn decode(token: &str) -> DbResult<Self> {
        let bytes = BASE64
            .decode(token)
            .map_err(|_| DbError::ResumeStale("token is not valid base64".into()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| DbError::ResumeStale("token payload is unreadable".into()))
    }
}

/// What `openCursor` returns.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorInfo {
    /// The fresh cursor id.
    pub cursor_id: String,
    /// Match count at creation, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    /// Effective batch size.
    pub batch_size: usize,
    /// Expiry, UTC epoch milliseconds.
    pub expires_at: i64,
}

/// One `next` result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorBatch {
    /// At most `batch_size` documents in wire form.
    pub documents: Vec<Value>,
    /// Whether further non-empty batches remain.
    pub has_more: bool,
    /// Id of the last document delivered so far, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_document_id: Option<String>,
    /// Token that can resume after the delivered prefix.
    pub resume_token: String,
    /// Match count at creation, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
}

/// Cursor counters for the `stats` command.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorStats {
    /// Currently open cursors.
    pub active: u64,
    /// Cursors ever created.
    pub created: u64,
    /// Explicit + automatic closes.
    pub closed: u64,
    /// Cursors reclaimed by the expiry sweep (or found expired).
    pub expired: u64,
    /// Mean lifetime of finished cursors.
    pub avg_lifetime_ms: u64,
}

struct CursorState {
    collection: String,
    filter: Option<DataMap>,
    sort: Value,
    documents: Vec<Document>,
    position: usize,
    batch_size: usize,
    total_count: Option<u64>,
    last_document_id: Option<String>,
    created_at_ms: i64,
    opened: Instant,
    expires_at: Instant,
}

/// Owns every open cursor.
#[derive(Default)]
pub struct CursorManager {
    cursors: DashMap<String, CursorState>,
    by_collection: DashMap<String, DashSet<String>>,
    created: AtomicU64,
    closed: AtomicU64,
    expired: AtomicU64,
    lifetime_ms: AtomicU64,
}

impl CursorManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a cursor over an already materialized (filtered + sorted)
    /// result set. With a resume token, iteration continues after the
    /// token's last delivered document.
    ///
    /// # Errors
    ///
    /// `CURSOR_INVALID_OPTIONS` on out-of-range options,
    /// `RESUME_MISMATCH` when the token's filter/sort differ from the
    /// request, `RESUME_STALE` when the resume position cannot be found.
    pub fn open(
        &self,
        collection: &str,
        filter: Option<DataMap>,
        sort: &[SortSpec],
        options: &CursorOptions,
        documents: Vec<Document>,
    ) -> DbResult<CursorInfo> {
        options.validate()?;
        let sort_value = serde_json::to_value(sort).unwrap_or(Value::Null);

        let position = match &options.resume_token {
            None => 0,
            Some(token) => {
                let token = ResumeToken::decode(token)?;
                if token.filter != filter || token.sort != sort_value {
                    return Err(DbError::ResumeMismatch);
                }
                match &token.last_document_id {
                    None => 0,
                    Some(last_id) => {
                        let idx = documents
                            .iter()
                            .position(|d| &d.id == last_id)
                            .ok_or_else(|| {
                                DbError::ResumeStale(format!(
                                    "document {last_id} is no longer in the result ordering"
                                ))
                            })?;
                        idx + 1
                    }
                }
            }
        };

        let cursor_id = uuid::Uuid::new_v4().simple().to_string();
        let now = Instant::now();
        let now_ms = now_millis();
        let ttl = Duration::from_secs(options.timeout_minutes * 60);
        let total_count = options
            .include_total_count
            .then(|| documents.len() as u64);
        let expires_at_ms = now_ms + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        let last_document_id = position
            .checked_sub(1)
            .and_then(|i| documents.get(i))
            .map(|d| d.id.clone());

        let state = CursorState {
            collection: collection.to_string(),
            filter,
            sort: sort_value,
            documents,
            position,
            batch_size: options.batch_size,
            total_count,
            last_document_id,
            created_at_ms: now_ms,
            opened: now,
            expires_at: now + ttl,
        };

        self.by_collection
            .entry(collection.to_string())
            .or_default()
            .insert(cursor_id.clone());
        self.cursors.insert(cursor_id.clone(), state);
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%cursor_id, collection, "cursor opened");

        Ok(CursorInfo {
            cursor_id,
            total_count,
            batch_size: options.batch_size,
            expires_at: expires_at_ms,
        })
    }

    /// Delivers the next batch.
    ///
    /// An empty batch (everything already delivered) closes the cursor
    /// after reporting `has_more: false`.
    ///
    /// # Errors
    ///
    /// `CURSOR_NOT_FOUND` for unknown/closed ids, `CURSOR_EXPIRED` for a
    /// cursor past its deadline (which is reclaimed on the spot).
    pub fn next(&self, cursor_id: &str, batch_size: Option<usize>) -> DbResult<CursorBatch> {
        let (batch, finished) = {
            let mut state = self
                .cursors
                .get_mut(cursor_id)
                .ok_or_else(|| DbError::CursorNotFound(cursor_id.to_string()))?;

            if state.expires_at <= Instant::now() {
                drop(state);
                self.reclaim(cursor_id, true);
                return Err(DbError::CursorExpired(cursor_id.to_string()));
            }

            let size = batch_size
                .filter(|s| *s > 0)
                .unwrap_or(state.batch_size)
                .min(BATCH_SIZE_RANGE.1);
            let start = state.position;
            let end = (start + size).min(state.documents.len());
            let slice: Vec<Value> = state.documents[start..end]
                .iter()
                .map(Document::to_wire)
                .collect();
            state.position = end;
            if end > start {
                let last_id = state.documents[end - 1].id.clone();
                state.last_document_id = Some(last_id);
            }

            let has_more = state.position < state.documents.len();
            let token = ResumeToken {
                cursor_id: cursor_id.to_string(),
                last_document_id: state.last_document_id.clone(),
                created_at: state.created_at_ms,
                filter: state.filter.clone(),
                sort: state.sort.clone(),
            };
            let batch = CursorBatch {
                documents: slice,
                has_more,
                last_document_id: state.last_document_id.clone(),
                resume_token: token.encode(),
                total_count: state.total_count,
            };
            (batch, end == start)
        };

        if finished {
            // The batch after the final documents auto-closes the cursor.
            self.reclaim(cursor_id, false);
        }
        Ok(batch)
    }

    /// Closes a cursor; `false` on double-close or unknown id.
    pub fn close(&self, cursor_id: &str) -> bool {
        self.reclaim(cursor_id, false)
    }

    /// Closes every cursor bound to a collection (drop/clear paths).
    pub fn close_collection(&self, collection: &str) -> usize {
        let Some((_, ids)) = self.by_collection.remove(collection) else {
            return 0;
        };
        let mut closed = 0;
        for id in ids {
            if self.reclaim(&id, false) {
                closed += 1;
            }
        }
        closed
    }

    fn reclaim(&self, cursor_id: &str, expired: bool) -> bool {
        let Some((_, state)) = self.cursors.remove(cursor_id) else {
            return false;
        };
        if let Some(ids) = self.by_collection.get(&state.collection) {
            ids.remove(cursor_id);
        }
        let lifetime = u64::try_from(state.opened.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.lifetime_ms.fetch_add(lifetime, Ordering::Relaxed);
        if expired {
            self.expired.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(cursor_id, collection = %state.collection, "cursor expired");
        } else {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Reclaims every cursor past its deadline; returns how many.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .cursors
            .iter()
            .filter(|entry| entry.value().expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();
        let mut count = 0;
        for id in expired {
            if self.reclaim(&id, true) {
                count += 1;
            }
        }
        count
    }

    /// Spawns the 60-second expiry sweeper.
    pub fn spawn_sweeper(
        manager: Arc<Self>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let swept = manager.sweep();
                if swept > 0 {
                    tracing::debug!(swept, "cursor sweep reclaimed expired cursors");
                }
            }
        })
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CursorStats {
        let closed = self.closed.load(Ordering::Relaxed);
        let expired = self.expired.load(Ordering::Relaxed);
        let finished = closed + expired;
        CursorStats {
            active: self.cursors.len() as u64,
            created: self.created.load(Ordering::Relaxed),
            closed,
            expired,
            avg_lifetime_ms: if finished == 0 {
                0
            } else {
                self.lifetime_ms.load(Ordering::Relaxed) / finished
            },
        }
    }
}
