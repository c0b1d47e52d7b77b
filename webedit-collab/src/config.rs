//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames queued per connection before it is evicted
    pub outbox_capacity: usize,
    /// Interval between heartbeat pings
    pub ping_interval: Duration,
    /// How long a ping may go unanswered before the connection is dropped
    pub ping_timeout: Duration,
    /// How long shutdown waits for connection tasks to drain
    pub shutdown_grace: Duration,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// File saves queued for the storage writer before new ones are dropped
    pub persist_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8001".to_string(),
            outbox_capacity: 256,
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            storage_path: None,
            persist_queue: 1024,
        }
    }
}

impl ServerConfig {
    /// Config bound to `bind_addr` with every other setting at its default.
    pub fn with_bind_addr(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }
}
