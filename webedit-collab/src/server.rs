//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── ConnectionRegistry
//!            ├── connection task ─┤── StateStore ──── PersistHandle ── FileStore (RocksDB)
//! Client B ──┘   (one per socket) ├── SubscriptionIndex
//!                                 └── BroadcastGroup
//!                                          │
//!                               ┌──────────┼───────────┐
//!                               ▼          ▼           ▼
//!                            Client A   Client B    Client C
//! ```
//!
//! Shutdown stops the accept loop first, then signals every connection
//! task, which finishes the message it is handling, flushes its outbox,
//! sends a close frame and unregisters. Tasks still running after the
//! grace period are aborted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::ServerConfig;
use crate::connection::{handle_connection, Heartbeat};
use crate::error::CollabError;
use crate::hub::{CollabHub, HubStats};
use crate::router::MessageRouter;
use crate::storage::{spawn_writer, FileStore, StoreConfig};

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<CollabHub>,
}

impl CollabServer {
    /// Create an in-memory server. `storage_path` is ignored; use
    /// [`CollabServer::open`] for a server backed by durable storage.
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(CollabHub::new(config.outbox_capacity));
        Self { config, hub }
    }

    /// Create a server, opening storage and recovering persisted files
    /// when `storage_path` is set.
    pub async fn open(config: ServerConfig) -> Result<Self, CollabError> {
        let Some(path) = config.storage_path.clone() else {
            return Ok(Self::new(config));
        };

        let store = FileStore::open(StoreConfig::at(path))?;
        let files = store.load_all()?;
        log::info!("Opened file store at {}", store.path().display());

        let (persistence, _writer) = spawn_writer(store, config.persist_queue);
        let hub = Arc::new(CollabHub::with_persistence(
            config.outbox_capacity,
            persistence,
        ));
        let server = Self { config, hub };
        server.recover(files).await;
        Ok(server)
    }

    async fn recover(&self, files: Vec<(String, String)>) -> usize {
        let total = files.len();
        let recovered = self.hub.restore_files(files).await;
        if recovered > 0 {
            log::info!("Recovery complete: {recovered}/{total} files restored");
        }
        recovered
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, CollabError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| CollabError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), CollabError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept WebSocket connections on `listener` until `shutdown` resolves,
    /// then drain connections and release storage.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), CollabError> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        let router = MessageRouter::new(self.hub.clone());
        let heartbeat = Heartbeat::from(&self.config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("New TCP connection from {addr}");
                            let router = router.clone();
                            let shutdown_rx = shutdown_rx.clone();
                            connections.spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, addr, router, heartbeat, shutdown_rx).await
                                {
                                    log::error!("Connection error from {addr}: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            log::error!("Failed to accept connection: {e}");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("Connection task failed: {e}");
                    }
                }

                _ = &mut shutdown => break,
            }
        }

        drop(listener);
        log::info!(
            "Shutting down, draining {} connections",
            connections.len()
        );
        let _ = shutdown_tx.send(true);

        let drain = async {
            while let Some(joined) = connections.join_next().await {
                if let Err(e) = joined {
                    log::error!("Connection task failed: {e}");
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            log::warn!(
                "Connections still open after {:?}, aborting them",
                self.config.shutdown_grace
            );
            connections.shutdown().await;
        }

        self.hub.close_storage().await;

        let stats = self.stats().await;
        log::info!(
            "Server stopped: {} connections served, {} messages ({} bytes) received, {} frames sent, {} dropped, {} evicted",
            stats.total_connections,
            stats.total_messages,
            stats.total_bytes,
            stats.broadcast.messages_sent,
            stats.broadcast.messages_dropped,
            stats.broadcast.peers_evicted
        );
        Ok(())
    }

    pub async fn stats(&self) -> HubStats {
        self.hub.stats().await
    }

    pub fn hub(&self) -> &Arc<CollabHub> {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    log::info!("Shutdown signal received");
}
