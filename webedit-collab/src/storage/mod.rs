//! Optional durable storage for file documents.
//!
//! ```text
//! ┌─────────────┐  (path, content)  ┌──────────────┐      ┌───────────┐
//! │ CollabHub   │ ────────────────► │ writer task  │ ───► │ FileStore │
//! │ (in-memory) │   ordered queue   │ (blocking)   │      │ (RocksDB) │
//! └──────┬──────┘                   └──────────────┘      └─────┬─────┘
//!        ▲                                                      │
//!        └──────────────────── load_all() on startup ───────────┘
//! ```
//!
//! The in-memory hub stays authoritative. Storage failures are logged and
//! never reach clients.

pub mod rocks;
pub mod writer;

pub use rocks::{FileMetadata, FileStore, StoreConfig, StoreError};
pub use writer::{spawn_writer, PersistHandle};
