//! # webedit-collab - real-time collaborative editing server
//!
//! Keeps one shared workspace (three quadrant fields plus a set of text
//! files) in memory and relays every edit, cursor move and chat message
//! to all connected WebSocket clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON text frames   ┌──────────────────┐
//! │ Browser A   │ ◄──────────────────► │ connection task  │──┐
//! └─────────────┘                      └──────────────────┘  │   ┌───────────┐
//! ┌─────────────┐                      ┌──────────────────┐  ├──►│ CollabHub │
//! │ Browser B   │ ◄──────────────────► │ connection task  │──┘   │ (one lock)│
//! └─────────────┘                      └──────────────────┘      └─────┬─────┘
//!                                                                      │
//!                                                               ┌──────┴──────┐
//!                                                               │ FileStore   │
//!                                                               │ (optional)  │
//!                                                               └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`registry`]: user ids and session metadata
//! - [`state`]: quadrant fields, file contents and cursors
//! - [`subscriptions`]: who has which file open
//! - [`broadcast`]: fan-out to per-connection outboxes
//! - [`hub`]: the single owner of all of the above
//! - [`router`]: per-message-type handling
//! - [`connection`]: per-socket task with heartbeat
//! - [`server`]: accept loop and graceful shutdown
//! - [`storage`]: durable file contents (RocksDB)

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;
pub mod storage;
pub mod subscriptions;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use config::ServerConfig;
pub use error::CollabError;
pub use hub::{CollabHub, HubStats, Registration, Workspace};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use registry::{ConnectionRegistry, Session, UserId};
pub use router::MessageRouter;
pub use server::CollabServer;
pub use state::{CursorState, QuadrantField, QuadrantState, StateStore};
pub use storage::{FileMetadata, FileStore, PersistHandle, StoreConfig, StoreError};
pub use subscriptions::SubscriptionIndex;
