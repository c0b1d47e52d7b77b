//! JSON wire protocol.
//!
//! Every frame is one JSON object with a mandatory `type` discriminator:
//! ```text
//! {"type": "file_update", "file_path": "main.py", "content": "print(2)"}
//! ```
//! Inbound frames decode into [`ClientMessage`]; everything the server
//! sends is a [`ServerMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::registry::{Session, UserId};
use crate::state::{CursorState, QuadrantState};

/// Inbound `type` values the router knows how to handle.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "code_update",
    "file_open",
    "file_close",
    "file_update",
    "cursor_update",
    "chat_message",
    "ping",
];

/// Local wall-clock time, ISO-8601 with microseconds.
pub fn timestamp_now() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// A message received from a client.
///
/// Guard fields are optional: a missing `file_path` or `field` turns the
/// message into a no-op instead of an error.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CodeUpdate {
        field: Option<String>,
        value: Option<String>,
    },
    FileOpen {
        file_path: Option<String>,
        content: Option<String>,
    },
    FileClose {
        file_path: Option<String>,
    },
    FileUpdate {
        file_path: Option<String>,
        content: Option<String>,
    },
    /// Position fields are relayed as sent, whatever their JSON type.
    CursorUpdate {
        #[serde(default)]
        field: Value,
        #[serde(default)]
        line: Value,
        #[serde(default)]
        column: Value,
    },
    ChatMessage {
        #[serde(default = "empty_chat")]
        message: Value,
    },
    Ping,
}

fn empty_chat() -> Value {
    Value::String(String::new())
}

impl ClientMessage {
    /// Parse one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(ProtocolError::InvalidJson)?;
        let kind = match value.as_object() {
            None => return Err(ProtocolError::NotAnObject),
            Some(object) => match object.get("type") {
                Some(Value::String(kind)) => kind.clone(),
                _ => return Err(ProtocolError::MissingType),
            },
        };

        if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value)
            .map_err(|source| ProtocolError::InvalidPayload { kind, source })
    }

    /// Wire name of this message's `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CodeUpdate { .. } => "code_update",
            Self::FileOpen { .. } => "file_open",
            Self::FileClose { .. } => "file_close",
            Self::FileUpdate { .. } => "file_update",
            Self::CursorUpdate { .. } => "cursor_update",
            Self::ChatMessage { .. } => "chat_message",
            Self::Ping => "ping",
        }
    }
}

/// A message sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full-state snapshot, sent once right after registration.
    Init {
        user_id: UserId,
        webedit: QuadrantState,
        files: BTreeMap<String, String>,
        users: Vec<Session>,
        cursors: BTreeMap<UserId, CursorState>,
        file_users: BTreeMap<String, Vec<UserId>>,
    },
    UserJoined {
        user: Session,
        total_users: usize,
    },
    UserLeft {
        user_id: UserId,
        total_users: usize,
    },
    CodeUpdate {
        field: String,
        value: String,
        user_id: UserId,
        timestamp: String,
    },
    FileOpened {
        file_path: String,
        user_id: UserId,
        users_editing: Vec<UserId>,
        timestamp: String,
    },
    FileClosed {
        file_path: String,
        user_id: UserId,
        users_editing: Vec<UserId>,
        timestamp: String,
    },
    FileUpdate {
        file_path: String,
        content: String,
        user_id: UserId,
        timestamp: String,
    },
    CursorUpdate {
        user_id: UserId,
        cursor: CursorState,
    },
    ChatMessage {
        user_id: UserId,
        message: Value,
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
}

impl ServerMessage {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }
}

/// Protocol errors. All of them drop the offending message only.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing or non-string `type` field")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("malformed `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("binary frames are not supported")]
    BinaryFrame,
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
}
