//! Active-connection registry.
//!
//! Tracks every live connection under a fresh 128-bit id for the `stats`
//! surface and for teardown accounting. `DashMap` keeps registration off
//! the accept loop's critical path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

/// Metadata for one live connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Fresh 128-bit id in hex form.
    pub id: String,
    /// Remote peer address.
    pub peer_addr: SocketAddr,
    /// When the connection was accepted.
    pub connected_at: Instant,
    /// Requests served on this connection.
    pub requests: AtomicU64,
}

impl ConnectionHandle {
    /// Bumps the served-request counter.
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }
}

/// Thread-safe set of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<ConnectionHandle>>,
    total_accepted: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection under a fresh id.
    pub fn register(&self, peer_addr: SocketAddr) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle {
            id: uuid::Uuid::new_v4().simple().to_string(),
            peer_addr,
            connected_at: Instant::now(),
            requests: AtomicU64::new(0),
        });
        self.connections.insert(handle.id.clone(), Arc::clone(&handle));
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        handle
    }

    /// Removes a connection; returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        self.connections.remove(id).is_some()
    }

    /// Number of live connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Connections accepted over the server's lifetime.
    #[must_use]
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }
}
