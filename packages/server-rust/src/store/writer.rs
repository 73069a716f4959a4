//! Asynchronous disk writer: an unbounded MPSC queue drained by a single
//! task, giving FIFO (and therefore per-document) write ordering.
//!
//! A successful in-memory mutation enqueues a [`WriteOp`]; durability is
//! reached when the matching op has been dequeued and applied.
//! [`DiskWriter::flush`] is the barrier. Writer failures never propagate
//! to the originating command — the in-memory operation has already
//! succeeded — they are logged and counted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nosq_core::Document;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// One queued persistence operation.
#[derive(Debug)]
pub enum WriteOp {
    /// Write a freshly inserted document.
    Insert {
        /// Owning collection.
        collection: String,
        /// The document to serialize.
        document: Document,
    },
    /// Rewrite an updated document.
    Update {
        /// Owning collection.
        collection: String,
        /// The document to serialize.
        document: Document,
    },
    /// Remove a document file.
    Delete {
        /// Owning collection.
        collection: String,
        /// Id of the removed document.
        id: String,
    },
}

/// Handle to the background writer task.
pub struct DiskWriter {
    tx: Mutex<Option<mpsc::UnboundedSender<WriteOp>>>,
    pending: Arc<AtomicU64>,
    drained: Arc<Notify>,
    failures: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DiskWriter {
    /// Spawns the writer task rooted at `base`.
    #[must_use]
    pub fn spawn(base: PathBuf) -> Self {
        let pending = Arc::new(AtomicU64::new(0));
        let drained = Arc::new(Notify::new());
        let failures = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(
            base,
            rx,
            Arc::clone(&pending),
            Arc::clone(&drained),
            Arc::clone(&failures),
        ));
        Self {
            tx: Mutex::new(Some(tx)),
            pending,
            drained,
            failures,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues an operation. After `close` the op is dropped with a
    /// warning (the in-memory tier is already updated; the next startup
    /// replays only what reached disk).
    pub fn enqueue(&self, op: WriteOp) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let sent = {
            let tx = self.tx.lock();
            tx.as_ref().map(|tx| tx.send(op))
        };
        match sent {
            Some(Ok(())) => {}
            _ => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!("write dropped: writer queue is closed");
            }
        }
    }

    /// Number of enqueued-but-unapplied operations.
    #[must_use]
    pub fn pending_writes(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of file operations that failed (logged, never propagated).
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// Completes once every previously enqueued write has been applied.
    pub async fn flush(&self) {
        loop {
            let notified = self.drained.notified();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Closes the queue and waits (up to `timeout`) for the writer to
    /// drain what was already enqueued.
    pub async fn close(&self, timeout: Duration) {
        let tx = self.tx.lock().take();
        drop(tx);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::error!("disk writer did not drain within {timeout:?}");
            }
        }
    }
}

async fn run(
    base: PathBuf,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    pending: Arc<AtomicU64>,
    drained: Arc<Notify>,
    failures: Arc<AtomicU64>,
) {
    while let Some(op) = rx.recv().await {
        if let Err(err) = apply(&base, &op).await {
            failures.fetch_add(1, Ordering::AcqRel);
            tracing::error!(?op, %err, "disk write failed");
        }
        if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            drained.notify_waiters();
        }
    }
    tracing::debug!("disk writer drained and stopped");
}

async fn apply(base: &Path, op: &WriteOp) -> std::io::Result<()> {
    match op {
        WriteOp::Insert {
            collection,
            document,
        }
        | WriteOp::Update {
            collection,
            document,
        } => write_document_atomic(base, collection, document).await,
        WriteOp::Delete { collection, id } => {
            let path = document_path(base, collection, id);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err),
            }
        }
    }
}

/// The on-disk location of one document: `<base>/<collection>/<id>.json`.
#[must_use]
pub fn document_path(base: &Path, collection: &str, id: &str) -> PathBuf {
    base.join(collection).join(format!("{id}.json"))
}

/// Serializes a document to its file via a temp file + rename, so a crash
/// mid-write never leaves a truncated document behind.
async fn write_document_atomic(
    base: &Path,
    collection: &str,
    document: &Document,
) -> std::io::Result<()> {
    let dir = base.join(collection);
    tokio::fs::create_dir_all(&dir).await?;
    let final_path = dir.join(format!("{}.json", document.id));
    let tmp_path = dir.join(format!("{}.json.tmp", document.id));
    let bytes = serde_json::to_vec_pretty(document)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(&tmp_path, &bytes).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(id: &str, n: i64) -> Document {
        Document::new(
            id.to_string(),
            json!({"n": n}).as_object().cloned().unwrap(),
            1_000,
        )
    }

    #[tokio::test]
    async fn insert_then_flush_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskWriter::spawn(dir.path().to_path_buf());

        writer.enqueue(WriteOp::Insert {
            collection: "c".into(),
            document: doc("a", 1),
        });
        writer.flush().await;
        assert_eq!(writer.pending_writes(), 0);

        let path = document_path(dir.path(), "c", "a");
        let text = std::fs::read_to_string(&path).unwrap();
        let loaded: Document = serde_json::from_str(&text).unwrap();
        assert_eq!(loaded.id, "a");
        assert_eq!(loaded.data["n"], json!(1));

        writer.close(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn per_document_fifo_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskWriter::spawn(dir.path().to_path_buf());

        // Insert, update, delete the same id; the file must be gone.
        writer.enqueue(WriteOp::Insert {
            collection: "c".into(),
            document: doc("a", 1),
        });
        writer.enqueue(WriteOp::Update {
            collection: "c".into(),
            document: doc("a", 2),
        });
        writer.enqueue(WriteOp::Delete {
            collection: "c".into(),
            id: "a".into(),
        });
        writer.flush().await;

        assert!(!document_path(dir.path(), "c", "a").exists());
        writer.close(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn update_rewrites_content() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskWriter::spawn(dir.path().to_path_buf());

        writer.enqueue(WriteOp::Insert {
            collection: "c".into(),
            document: doc("a", 1),
        });
        let mut updated = doc("a", 2);
        updated.version = 2;
        writer.enqueue(WriteOp::Update {
            collection: "c".into(),
            document: updated,
        });
        writer.flush().await;

        let text = std::fs::read_to_string(document_path(dir.path(), "c", "a")).unwrap();
        assert!(text.contains("\"Version\": 2"));
        writer.close(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn delete_of_missing_file_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskWriter::spawn(dir.path().to_path_buf());
        writer.enqueue(WriteOp::Delete {
            collection: "c".into(),
            id: "ghost".into(),
        });
        writer.flush().await;
        assert_eq!(writer.failure_count(), 0);
        writer.close(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn close_drains_enqueued_writes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskWriter::spawn(dir.path().to_path_buf());
        for i in 0..50 {
            writer.enqueue(WriteOp::Insert {
                collection: "c".into(),
                document: doc(&format!("d{i}"), i),
            });
        }
        writer.close(Duration::from_secs(10)).await;
        let entries = std::fs::read_dir(dir.path().join("c")).unwrap().count();
        assert_eq!(entries, 50);
    }

    #[tokio::test]
    async fn enqueue_after_close_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskWriter::spawn(dir.path().to_path_buf());
        writer.close(Duration::from_secs(5)).await;
        writer.enqueue(WriteOp::Insert {
            collection: "c".into(),
            document: doc("late", 1),
        });
        assert_eq!(writer.pending_writes(), 0);
    }
}
