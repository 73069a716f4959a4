//! Server bootstrap and accept loop.
//!
//! `Server::start` wires the store, cache, indexes, cursors, and
//! authenticator together, initializes the store from disk, binds the
//! listener, and spawns the accept loop plus the two 60-second sweepers.
//! Each accepted socket takes one semaphore slot; with none available the
//! client gets a synthetic `CAPACITY` error frame and is disconnected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use nosq_core::{DbError, DbResult, Document};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::auth::{Authenticator, MasterPasswordAuthenticator};
use crate::cache::{CacheConfig, LruTtlCache};
use crate::config::ServerConfig;
use crate::cursor::CursorManager;
use crate::index::IndexManager;
use crate::query::QueryExecutor;
use crate::store::HybridStore;

use super::connection;
use super::registry::ConnectionRegistry;
use super::shutdown::ShutdownController;

/// Period of the cache and cursor expiry sweeps.
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// How long shutdown waits for in-flight requests.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the connection tasks share.
pub struct ServerState {
    /// Immutable configuration.
    pub config: ServerConfig,
    /// The hybrid document store (owns the index registry).
    pub store: Arc<HybridStore>,
    /// Read-through document cache.
    pub cache: Arc<LruTtlCache<Document>>,
    /// Query planner/executor.
    pub executor: QueryExecutor,
    /// Open cursors.
    pub cursors: Arc<CursorManager>,
    /// Authentication collaborator.
    pub auth: Arc<dyn Authenticator>,
    /// Live connections.
    pub registry: ConnectionRegistry,
    /// Server start time, for uptime reporting.
    pub started_at: Instant,
}

/// A started server: address, shared state, and the teardown path.
pub struct ServerHandle {
    /// The bound address (useful with port 0).
    pub addr: SocketAddr,
    state: Arc<ServerState>,
    controller: Arc<ShutdownController>,
    accept_task: JoinHandle<()>,
    sweepers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// The shared state, primarily for tests and the stats surface.
    #[must_use]
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// The shutdown controller, for wiring external signals.
    #[must_use]
    pub fn controller(&self) -> &Arc<ShutdownController> {
        &self.controller
    }

    /// Graceful shutdown: stop accepting, drain in-flight requests,
    /// close the cache, and drain the write queue (30 s bound).
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        self.controller.begin_drain();
        if !self.controller.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::warn!(
                in_flight = self.controller.in_flight(),
                "drain timeout; closing with requests in flight"
            );
        }
        if let Err(err) = self.accept_task.await {
            if !err.is_cancelled() {
                tracing::warn!(%err, "accept loop ended abnormally");
            }
        }
        for sweeper in self.sweepers {
            sweeper.abort();
        }
        self.state.cache.close();
        self.state.store.close().await;
        tracing::info!("shutdown complete");
    }
}

/// The NoSQ server.
pub struct Server;

impl Server {
    /// Builds every subsystem, loads the on-disk state, binds, and starts
    /// accepting.
    ///
    /// # Errors
    ///
    /// Surfaces configuration, store-initialization, and bind failures.
    pub async fn start(config: ServerConfig) -> DbResult<ServerHandle> {
        config
            .validate()
            .map_err(|err| DbError::Internal(err.to_string()))?;

        let indexes = Arc::new(IndexManager::new());
        let store = Arc::new(HybridStore::new(config.data_path.clone(), indexes));
        store.initialize().await?;

        let cache = Arc::new(LruTtlCache::new(CacheConfig {
            max_items: config.max_cache_item_count as usize,
            max_bytes: config.max_cache_size_bytes,
            default_ttl: Duration::from_millis(config.default_cache_ttl_ms),
        }));
        let cursors = Arc::new(CursorManager::new());
        let auth: Arc<dyn Authenticator> = Arc::new(MasterPasswordAuthenticator::new(
            config.master_password.clone(),
            Duration::from_secs(u64::from(config.token_expiration_hours) * 3600),
        ));

        let bind_addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|err| DbError::Internal(format!("cannot bind {bind_addr}: {err}")))?;
        let addr = listener
            .local_addr()
            .map_err(|err| DbError::Internal(err.to_string()))?;

        let max_connections = config.max_concurrent_connections as usize;
        let state = Arc::new(ServerState {
            executor: QueryExecutor::new(Arc::clone(&store)),
            config,
            store,
            cache: Arc::clone(&cache),
            cursors: Arc::clone(&cursors),
            auth,
            registry: ConnectionRegistry::new(),
            started_at: Instant::now(),
        });

        let controller = Arc::new(ShutdownController::new());
        let sweepers = vec![
            LruTtlCache::spawn_sweeper(cache, SWEEP_PERIOD),
            CursorManager::spawn_sweeper(cursors, SWEEP_PERIOD),
        ];

        let semaphore = Arc::new(Semaphore::new(max_connections));
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&state),
            listener,
            semaphore,
            Arc::clone(&controller),
        ));

        controller.set_ready();
        tracing::info!(%addr, max_connections, "server ready");

        Ok(ServerHandle {
            addr,
            state,
            controller,
            accept_task,
            sweepers,
        })
    }
}

async fn accept_loop(
    state: Arc<ServerState>,
    listener: TcpListener,
    semaphore: Arc<Semaphore>,
    controller: Arc<ShutdownController>,
) {
    let mut shutdown = controller.subscribe();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
            tracing::warn!(%peer, "rejecting connection at capacity");
            tokio::spawn(reject_at_capacity(stream));
            continue;
        };

        let handle = state.registry.register(peer);
        let conn_state = Arc::clone(&state);
        let conn_controller = Arc::clone(&controller);
        tokio::spawn(async move {
            connection::serve(
                Arc::clone(&conn_state),
                stream,
                Arc::clone(&handle),
                conn_controller,
            )
            .await;
            conn_state.registry.remove(&handle.id);
            drop(permit);
        });
    }
    tracing::debug!("accept loop stopped");
}

/// Sends the synthetic `CAPACITY` error frame and drops the socket.
async fn reject_at_capacity(mut stream: TcpStream) {
    let mut buf = BytesMut::new();
    if connection::error_frame(&DbError::Capacity)
        .encode(&mut buf)
        .is_ok()
    {
        let _ = tokio::time::timeout(Duration::from_secs(5), stream.write_all(&buf)).await;
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            data_path: dir.path().to_path_buf(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn start_binds_an_ephemeral_port() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Server::start(test_config(&dir)).await.unwrap();
        assert_ne!(handle.addr.port(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_clean_with_no_connections() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Server::start(test_config(&dir)).await.unwrap();
        let state = Arc::clone(handle.state());
        handle.shutdown().await;
        assert_eq!(state.registry.count(), 0);
        // The cache is closed as part of shutdown.
        assert!(state.cache.get("x").is_err());
    }

    #[tokio::test]
    async fn connections_are_tracked_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Server::start(test_config(&dir)).await.unwrap();

        let stream = TcpStream::connect(handle.addr).await.unwrap();
        // Registration happens on the accept side; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state().registry.count(), 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.state().registry.count(), 0);

        handle.shutdown().await;
    }
}
