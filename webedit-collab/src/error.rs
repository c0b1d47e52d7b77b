//! Server-level errors.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by the server lifecycle.
///
/// Only [`CollabError::Bind`] is fatal to the process; the rest end a
/// single connection at most.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}
