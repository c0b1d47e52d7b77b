//! Inbound message dispatch.
//!
//! | `type`          | mutation                        | broadcast        | recipients      |
//! |-----------------|---------------------------------|------------------|-----------------|
//! | `code_update`   | quadrant field                  | `code_update`    | all but sender  |
//! | `file_open`     | subscribe, seed content         | `file_opened`    | all but sender  |
//! | `file_close`    | unsubscribe                     | `file_closed`    | all but sender  |
//! | `file_update`   | file content (persisted)        | `file_update`    | all but sender  |
//! | `cursor_update` | sender's cursor                 | `cursor_update`  | all but sender  |
//! | `chat_message`  | none                            | `chat_message`   | all but sender  |
//! | `ping`          | none                            | `pong`           | sender only     |

use serde_json::Value;
use std::sync::Arc;

use crate::hub::CollabHub;
use crate::protocol::{timestamp_now, ClientMessage, ProtocolError, ServerMessage};
use crate::registry::UserId;
use crate::state::CursorState;

/// Routes decoded client messages to their hub mutation and broadcast.
#[derive(Clone)]
pub struct MessageRouter {
    hub: Arc<CollabHub>,
}

impl MessageRouter {
    pub fn new(hub: Arc<CollabHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<CollabHub> {
        &self.hub
    }

    /// Decode and handle one text frame from `sender`.
    ///
    /// An error means the frame was dropped; the connection stays usable.
    pub async fn route(&self, sender: UserId, raw: &str) -> Result<(), ProtocolError> {
        self.hub.record_inbound(raw.len());
        let msg = ClientMessage::parse(raw)?;
        self.dispatch(sender, msg).await
    }

    /// Handle an already decoded message from `sender`.
    pub async fn dispatch(&self, sender: UserId, msg: ClientMessage) -> Result<(), ProtocolError> {
        match msg {
            ClientMessage::CodeUpdate { field, value } => {
                self.code_update(sender, field, value.unwrap_or_default()).await
            }
            ClientMessage::FileOpen { file_path, content } => {
                self.file_open(sender, file_path, content.unwrap_or_default())
                    .await
            }
            ClientMessage::FileClose { file_path } => self.file_close(sender, file_path).await,
            ClientMessage::FileUpdate { file_path, content } => {
                self.file_update(sender, file_path, content.unwrap_or_default())
                    .await
            }
            ClientMessage::CursorUpdate {
                field,
                line,
                column,
            } => self.cursor_update(sender, field, line, column).await,
            ClientMessage::ChatMessage { message } => self.chat_message(sender, message).await,
            ClientMessage::Ping => self.ping(sender).await,
        }
    }

    async fn code_update(
        &self,
        sender: UserId,
        field: Option<String>,
        value: String,
    ) -> Result<(), ProtocolError> {
        let Some(field) = field else {
            log::debug!("Ignoring code_update without field from {sender}");
            return Ok(());
        };

        self.hub
            .mutate_and_broadcast(Some(&sender), |ws| {
                let Some(parsed) = ws.update_quadrant(&field, &value) else {
                    log::debug!("Ignoring code_update for unknown field {field:?} from {sender}");
                    return None;
                };
                log::debug!("{sender} updated {} ({} chars)", parsed.as_str(), value.len());
                Some(ServerMessage::CodeUpdate {
                    field: parsed.as_str().to_string(),
                    value,
                    user_id: sender,
                    timestamp: timestamp_now(),
                })
            })
            .await?;
        Ok(())
    }

    async fn file_open(
        &self,
        sender: UserId,
        file_path: Option<String>,
        content: String,
    ) -> Result<(), ProtocolError> {
        let Some(file_path) = file_path else {
            log::debug!("Ignoring file_open without file_path from {sender}");
            return Ok(());
        };

        self.hub
            .mutate_and_broadcast(Some(&sender), |ws| {
                let users_editing = ws.open_file(sender, &file_path, &content);
                log::info!("{sender} opened {file_path} ({} editing)", users_editing.len());
                Some(ServerMessage::FileOpened {
                    file_path,
                    user_id: sender,
                    users_editing,
                    timestamp: timestamp_now(),
                })
            })
            .await?;
        Ok(())
    }

    async fn file_close(&self, sender: UserId, file_path: Option<String>) -> Result<(), ProtocolError> {
        let Some(file_path) = file_path else {
            log::debug!("Ignoring file_close without file_path from {sender}");
            return Ok(());
        };

        self.hub
            .mutate_and_broadcast(Some(&sender), |ws| {
                let users_editing = ws.close_file(sender, &file_path)?;
                log::info!("{sender} closed {file_path}");
                Some(ServerMessage::FileClosed {
                    file_path,
                    user_id: sender,
                    users_editing,
                    timestamp: timestamp_now(),
                })
            })
            .await?;
        Ok(())
    }

    async fn file_update(
        &self,
        sender: UserId,
        file_path: Option<String>,
        content: String,
    ) -> Result<(), ProtocolError> {
        let Some(file_path) = file_path else {
            log::debug!("Ignoring file_update without file_path from {sender}");
            return Ok(());
        };

        self.hub
            .mutate_and_broadcast(Some(&sender), |ws| {
                ws.set_file(&file_path, &content);
                log::debug!("{sender} updated {file_path} ({} chars)", content.len());
                Some(ServerMessage::FileUpdate {
                    file_path,
                    content,
                    user_id: sender,
                    timestamp: timestamp_now(),
                })
            })
            .await?;
        Ok(())
    }

    async fn cursor_update(
        &self,
        sender: UserId,
        field: Value,
        line: Value,
        column: Value,
    ) -> Result<(), ProtocolError> {
        let cursor = CursorState {
            field,
            line,
            column,
            timestamp: timestamp_now(),
        };

        self.hub
            .mutate_and_broadcast(Some(&sender), |ws| {
                log::trace!("{sender} cursor at {}:{}", cursor.line, cursor.column);
                ws.set_cursor(sender, cursor.clone());
                Some(ServerMessage::CursorUpdate {
                    user_id: sender,
                    cursor,
                })
            })
            .await?;
        Ok(())
    }

    async fn chat_message(&self, sender: UserId, message: Value) -> Result<(), ProtocolError> {
        log::info!("Chat from {sender}: {message}");
        self.hub
            .mutate_and_broadcast(Some(&sender), |_| {
                Some(ServerMessage::ChatMessage {
                    user_id: sender,
                    message,
                    timestamp: timestamp_now(),
                })
            })
            .await?;
        Ok(())
    }

    async fn ping(&self, sender: UserId) -> Result<(), ProtocolError> {
        let pong = ServerMessage::Pong {
            timestamp: timestamp_now(),
        };
        if !self.hub.send_to(&sender, &pong).await? {
            log::debug!("Could not deliver pong to {sender}");
        }
        Ok(())
    }
}
