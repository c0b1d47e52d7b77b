//! Connection registry: identity allocation and live session tracking.
//!
//! Every accepted connection gets exactly one [`Session`]. Identities are
//! handed out from a per-process sequence and are never reused, even after
//! the owning connection goes away.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use crate::protocol::timestamp_now;

/// Process-unique user identity, rendered on the wire as `user_<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(u64);

impl UserId {
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Sequence number this identity was allocated with.
    pub fn seq(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user_{}", self.0)
    }
}

impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Server-side identity and metadata bound to one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub user_id: UserId,
    pub connected_at: String,
    pub remote_address: String,
}

impl Session {
    fn new(user_id: UserId, remote: Option<SocketAddr>) -> Self {
        Self {
            user_id,
            connected_at: timestamp_now(),
            remote_address: remote
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Live sessions keyed by identity, plus the identity sequence.
#[derive(Debug)]
pub struct ConnectionRegistry {
    sessions: BTreeMap<UserId, Session>,
    next_seq: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_seq: 1,
        }
    }

    /// Allocate the next identity and record a session for it.
    pub fn register(&mut self, remote: Option<SocketAddr>) -> Session {
        let user_id = UserId::new(self.next_seq);
        self.next_seq += 1;

        let session = Session::new(user_id, remote);
        self.sessions.insert(user_id, session.clone());
        session
    }

    /// Drop a session. Returns `None` if it was already gone.
    pub fn unregister(&mut self, user_id: &UserId) -> Option<Session> {
        self.sessions.remove(user_id)
    }

    /// All live sessions in allocation order.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
