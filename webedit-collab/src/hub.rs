//! The collaboration hub: one object owning every shared map.
//!
//! ```text
//!              ┌──────────────── RwLock<HubState> ────────────────┐
//! register ──► │ ConnectionRegistry   StateStore   SubscriptionIndex │
//! route    ──► │                 BroadcastGroup (outboxes)          │
//! unregister ► └────────────────────────┬──────────────────────────┘
//!                                       │ try_send, never awaits I/O
//!                              per-connection outboxes
//! ```
//!
//! A critical section covers one mutation, the serialization of the
//! resulting message and its non-blocking hand-off to each outbox. No lock
//! is held across socket I/O. Because hand-off happens under the lock,
//! every recipient sees broadcasts in the same order the state was
//! mutated, and a freshly registered connection receives its `init`
//! snapshot before any broadcast that follows it.
//!
//! A connection whose outbox overflows is purged in the same critical
//! section that overflowed it, exactly as if it had disconnected. Its
//! client reconnects and gets a fresh `init`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::broadcast::{BroadcastGroup, BroadcastStats, OutboxReceiver};
use crate::protocol::{ProtocolError, ServerMessage};
use crate::registry::{ConnectionRegistry, Session, UserId};
use crate::state::{CursorState, QuadrantField, QuadrantState, StateStore};
use crate::storage::PersistHandle;
use crate::subscriptions::SubscriptionIndex;

/// What a new connection gets back from [`CollabHub::register`].
pub struct Registration {
    pub session: Session,
    /// Outbound frames for this connection; `init` is already queued.
    pub outbox: OutboxReceiver,
}

/// Server-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub broadcast: BroadcastStats,
}

struct HubState {
    registry: ConnectionRegistry,
    store: StateStore,
    subscriptions: SubscriptionIndex,
    broadcast: BroadcastGroup,
}

/// Mutable view of the shared documents handed to router mutations.
pub struct Workspace<'a> {
    store: &'a mut StateStore,
    subscriptions: &'a mut SubscriptionIndex,
    persistence: Option<&'a PersistHandle>,
}

impl Workspace<'_> {
    /// Overwrite a quadrant field; `None` if the field name is unknown.
    pub fn update_quadrant(&mut self, field: &str, value: &str) -> Option<QuadrantField> {
        self.store.update_quadrant(field, value)
    }

    /// Subscribe `user_id` to `path`, seeding content if the server has none.
    ///
    /// Returns the subscribers of `path` after the change.
    pub fn open_file(&mut self, user_id: UserId, path: &str, initial_content: &str) -> Vec<UserId> {
        self.subscriptions.open(user_id, path);
        if self.store.seed_file(path, initial_content) {
            log::debug!("Seeded {path} with {} chars from {user_id}", initial_content.len());
        }
        self.subscriptions.subscribers(path)
    }

    /// Unsubscribe `user_id` from `path`. Content stays in the store.
    ///
    /// Returns the remaining subscribers, or `None` if the user did not
    /// have the file open.
    pub fn close_file(&mut self, user_id: UserId, path: &str) -> Option<Vec<UserId>> {
        self.subscriptions
            .close(user_id, path)
            .then(|| self.subscriptions.subscribers(path))
    }

    /// Replace a file's content and queue it for durable storage.
    pub fn set_file(&mut self, path: &str, content: &str) {
        self.store.set_file(path, content);
        if let Some(persistence) = self.persistence {
            if let Err(e) = persistence.save(path, content) {
                log::error!("Failed to queue {path} for storage: {e}");
            }
        }
    }

    pub fn get_file(&self, path: &str) -> Option<&str> {
        self.store.get_file(path)
    }

    pub fn set_cursor(&mut self, user_id: UserId, cursor: CursorState) {
        self.store.set_cursor(user_id, cursor);
    }
}

/// Shared state for every connection in the process.
pub struct CollabHub {
    state: RwLock<HubState>,
    persistence: Option<PersistHandle>,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

impl CollabHub {
    /// Create an in-memory hub. `outbox_capacity` bounds each connection's
    /// queue of pending outbound frames.
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            state: RwLock::new(HubState {
                registry: ConnectionRegistry::new(),
                store: StateStore::new(),
                subscriptions: SubscriptionIndex::new(),
                broadcast: BroadcastGroup::new(outbox_capacity),
            }),
            persistence: None,
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        }
    }

    /// Create a hub that mirrors every file update into durable storage.
    pub fn with_persistence(outbox_capacity: usize, persistence: PersistHandle) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::new(outbox_capacity)
        }
    }

    /// Register a new connection.
    ///
    /// Allocates its identity, queues a consistent `init` snapshot as the
    /// first outbound frame, then announces `user_joined` to everyone else.
    /// On failure the connection is rolled back and nobody is notified.
    pub async fn register(&self, remote: Option<SocketAddr>) -> Result<Registration, ProtocolError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let session = state.registry.register(remote);
        let user_id = session.user_id;
        state.subscriptions.track_user(user_id);
        let outbox = state.broadcast.add_peer(user_id);

        let init = Self::init_snapshot(state, user_id);
        if let Err(e) = state.broadcast.send_to(&user_id, &init) {
            state.broadcast.remove_peer(&user_id);
            state.subscriptions.remove_user(&user_id);
            state.registry.unregister(&user_id);
            return Err(e);
        }

        let total_users = state.registry.len();
        let joined = ServerMessage::UserJoined {
            user: session.clone(),
            total_users,
        };
        if let Err(e) = state.broadcast.broadcast(&joined, Some(&user_id)) {
            log::error!("Failed to announce {user_id}: {e}");
        }
        Self::purge_evicted(state);
        drop(guard);

        self.total_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Client connected: {user_id} from {} ({total_users} connected)",
            session.remote_address
        );

        Ok(Registration { session, outbox })
    }

    /// Remove a connection from every index and announce `user_left`.
    ///
    /// Returns `false` (and broadcasts nothing) if it was already removed.
    pub async fn unregister(&self, user_id: &UserId) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let Some(closed) = Self::purge(state, user_id) else {
            return false;
        };
        Self::purge_evicted(state);
        let total_users = state.registry.len();
        drop(guard);

        log::info!(
            "Client disconnected: {user_id} ({closed} open files released, {total_users} connected)"
        );
        true
    }

    /// Drop `user_id` from every index and announce `user_left`.
    ///
    /// Returns how many open files were released, or `None` if the user was
    /// not registered.
    fn purge(state: &mut HubState, user_id: &UserId) -> Option<usize> {
        state.registry.unregister(user_id)?;
        state.broadcast.remove_peer(user_id);
        state.store.remove_cursor(user_id);
        let closed = state.subscriptions.remove_user(user_id);

        let left = ServerMessage::UserLeft {
            user_id: *user_id,
            total_users: state.registry.len(),
        };
        if let Err(e) = state.broadcast.broadcast(&left, None) {
            log::error!("Failed to announce departure of {user_id}: {e}");
        }
        Some(closed.len())
    }

    /// Purge every peer the broadcast group evicted for overflow. Each
    /// `user_left` may overflow someone else, so repeat until none remain.
    fn purge_evicted(state: &mut HubState) {
        loop {
            let evicted = state.broadcast.take_evicted();
            if evicted.is_empty() {
                return;
            }
            for user_id in evicted {
                if let Some(closed) = Self::purge(state, &user_id) {
                    log::warn!(
                        "Evicted {user_id} for falling behind ({closed} open files released, {} connected)",
                        state.registry.len()
                    );
                }
            }
        }
    }

    /// Apply one mutation and broadcast its result, excluding `exclude`.
    ///
    /// `mutate` returns the message to broadcast, or `None` to stay silent.
    /// Returns the number of recipients the broadcast reached.
    pub async fn mutate_and_broadcast<F>(
        &self,
        exclude: Option<&UserId>,
        mutate: F,
    ) -> Result<usize, ProtocolError>
    where
        F: FnOnce(&mut Workspace<'_>) -> Option<ServerMessage>,
    {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let mut workspace = Workspace {
            store: &mut state.store,
            subscriptions: &mut state.subscriptions,
            persistence: self.persistence.as_ref(),
        };
        let Some(msg) = mutate(&mut workspace) else {
            return Ok(0);
        };
        let delivered = state.broadcast.broadcast(&msg, exclude)?;
        Self::purge_evicted(state);
        Ok(delivered)
    }

    /// Send a message to one connection only.
    pub async fn send_to(&self, user_id: &UserId, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let delivered = state.broadcast.send_to(user_id, msg)?;
        Self::purge_evicted(state);
        Ok(delivered)
    }

    /// The `init` message a connection registering right now would receive.
    pub async fn snapshot(&self, user_id: UserId) -> ServerMessage {
        let state = self.state.read().await;
        Self::init_snapshot(&state, user_id)
    }

    fn init_snapshot(state: &HubState, user_id: UserId) -> ServerMessage {
        ServerMessage::Init {
            user_id,
            webedit: state.store.quadrant().clone(),
            files: state.store.files().clone(),
            users: state.registry.sessions(),
            cursors: state.store.cursors().clone(),
            file_users: state.subscriptions.snapshot(),
        }
    }

    /// Load previously persisted files without re-persisting them.
    pub async fn restore_files(&self, files: impl IntoIterator<Item = (String, String)>) -> usize {
        let mut state = self.state.write().await;
        let mut restored = 0;
        for (path, content) in files {
            state.store.set_file(path, content);
            restored += 1;
        }
        restored
    }

    /// Clear quadrant fields and file contents.
    pub async fn reset_documents(&self) {
        self.state.write().await.store.reset();
        log::info!("Shared documents reset");
    }

    pub(crate) fn record_inbound(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub async fn quadrant(&self) -> QuadrantState {
        self.state.read().await.store.quadrant().clone()
    }

    pub async fn file(&self, path: &str) -> Option<String> {
        self.state.read().await.store.get_file(path).map(str::to_string)
    }

    pub async fn subscribers(&self, path: &str) -> Vec<UserId> {
        self.state.read().await.subscriptions.subscribers(path)
    }

    pub async fn open_files(&self, user_id: &UserId) -> Vec<String> {
        self.state.read().await.subscriptions.open_files(user_id)
    }

    pub async fn cursor(&self, user_id: &UserId) -> Option<CursorState> {
        self.state.read().await.store.cursors().get(user_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.state.read().await.registry.sessions()
    }

    pub async fn user_count(&self) -> usize {
        self.state.read().await.registry.len()
    }

    /// Whether the subscription index is symmetric and every registered
    /// user is reachable by broadcasts.
    pub async fn is_consistent(&self) -> bool {
        let state = self.state.read().await;
        state.subscriptions.is_symmetric()
            && state.broadcast.peer_count() == state.registry.len()
            && state
                .registry
                .sessions()
                .iter()
                .all(|s| state.broadcast.has_peer(&s.user_id))
    }

    pub async fn stats(&self) -> HubStats {
        let state = self.state.read().await;
        HubStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: state.registry.len(),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            broadcast: state.broadcast.stats(),
        }
    }

    /// Wait until every queued file save has reached storage.
    pub async fn flush_storage(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.flush().await {
                log::error!("Failed to flush file store: {e}");
            }
        }
    }

    /// Flush and release durable storage. Later saves are logged and dropped.
    pub async fn close_storage(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.close().await;
        }
    }
}
