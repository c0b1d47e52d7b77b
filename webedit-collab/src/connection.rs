//! Per-connection task.
//!
//! One task per WebSocket multiplexes four event sources:
//! - inbound frames, routed through [`MessageRouter`]
//! - the connection's outbox, written to the socket
//! - the heartbeat timer and the pending pong deadline
//! - the server shutdown signal
//!
//! However the loop ends, the connection is unregistered exactly once.
//! Every socket write is bounded by the heartbeat timeout, so a peer that
//! stops reading cannot hold the loop away from its heartbeat or shutdown
//! arms.

use std::net::SocketAddr;
use std::time::Duration;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::OutboxReceiver;
use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::hub::Registration;
use crate::protocol::ProtocolError;
use crate::registry::UserId;
use crate::router::MessageRouter;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Heartbeat timing for one connection.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<&ServerConfig> for Heartbeat {
    fn from(config: &ServerConfig) -> Self {
        Self {
            interval: config.ping_interval,
            timeout: config.ping_timeout,
        }
    }
}

/// Why a connection's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    ClientClosed,
    PongTimeout,
    Shutdown,
    Evicted,
    WriteStalled,
}

/// Serve one accepted TCP stream until it closes.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: MessageRouter,
    heartbeat: Heartbeat,
    shutdown: watch::Receiver<bool>,
) -> Result<(), CollabError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, ws_receiver) = ws_stream.split();
    log::debug!("WebSocket handshake completed with {addr}");

    let hub = router.hub().clone();
    let Registration { session, mut outbox } = hub.register(Some(addr)).await?;
    let user_id = session.user_id;

    let result = run_session(
        user_id,
        &router,
        &mut ws_sender,
        ws_receiver,
        &mut outbox,
        heartbeat,
        shutdown,
    )
    .await;

    hub.unregister(&user_id).await;

    let exit = result?;
    log::debug!("Session {user_id} ended: {exit:?}");

    if exit == Exit::WriteStalled {
        log::warn!("{user_id} stopped reading, dropping connection");
        return Ok(());
    }
    let farewell = say_goodbye(&mut ws_sender, &mut outbox, exit);
    if time::timeout(heartbeat.timeout, farewell).await.is_err() {
        log::debug!("Closing handshake with {user_id} timed out");
    }
    Ok(())
}

/// Flush frames queued before unregistration, then close the socket.
async fn say_goodbye(ws_sender: &mut WsSink, outbox: &mut OutboxReceiver, exit: Exit) {
    while let Ok(frame) = outbox.try_recv() {
        if ws_sender.send(Message::Text(frame)).await.is_err() {
            break;
        }
    }
    let close = match exit {
        Exit::Shutdown => Some(CloseFrame {
            code: CloseCode::Away,
            reason: Utf8Bytes::from_static("server shutting down"),
        }),
        Exit::PongTimeout => Some(CloseFrame {
            code: CloseCode::Policy,
            reason: Utf8Bytes::from_static("heartbeat timeout"),
        }),
        Exit::Evicted => Some(CloseFrame {
            code: CloseCode::Again,
            reason: Utf8Bytes::from_static("fell behind, reconnect"),
        }),
        Exit::ClientClosed | Exit::WriteStalled => None,
    };
    if let Some(frame) = close {
        let _ = ws_sender.send(Message::Close(Some(frame))).await;
    }
    let _ = ws_sender.close().await;
}

/// Write one frame. `Ok(false)` means the peer did not take it within `limit`.
async fn send_within(ws_sender: &mut WsSink, msg: Message, limit: Duration) -> Result<bool, CollabError> {
    match time::timeout(limit, ws_sender.send(msg)).await {
        Ok(sent) => {
            sent?;
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

async fn run_session(
    user_id: UserId,
    router: &MessageRouter,
    ws_sender: &mut WsSink,
    mut ws_receiver: WsSource,
    outbox: &mut OutboxReceiver,
    heartbeat: Heartbeat,
    mut shutdown: watch::Receiver<bool>,
) -> Result<Exit, CollabError> {
    if *shutdown.borrow() {
        return Ok(Exit::Shutdown);
    }

    let mut ping_timer = time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            // Incoming WebSocket frame
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = router.route(user_id, text.as_str()).await {
                            log::warn!("Dropped message from {user_id}: {e}");
                        }
                    }

                    Some(Ok(Message::Binary(data))) => {
                        log::warn!(
                            "Dropped {} byte frame from {user_id}: {}",
                            data.len(),
                            ProtocolError::BinaryFrame
                        );
                    }

                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed by {user_id}");
                        return Ok(Exit::ClientClosed);
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error from {user_id}: {e}");
                        return Ok(Exit::ClientClosed);
                    }

                    // Pings are answered by tungstenite on the next write.
                    Some(Ok(_)) => {}
                }
            }

            // Outgoing frame queued by the hub
            frame = outbox.recv() => {
                let Some(frame) = frame else {
                    return Ok(Exit::Evicted);
                };
                if !send_within(ws_sender, Message::Text(frame), heartbeat.timeout).await? {
                    return Ok(Exit::WriteStalled);
                }
            }

            _ = ping_timer.tick() => {
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + heartbeat.timeout);
                }
                if !send_within(ws_sender, Message::Ping(Default::default()), heartbeat.timeout).await? {
                    return Ok(Exit::WriteStalled);
                }
            }

            _ = async {
                match pong_deadline {
                    Some(deadline) => time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                log::warn!(
                    "No pong from {user_id} within {:?}, closing",
                    heartbeat.timeout
                );
                return Ok(Exit::PongTimeout);
            }

            _ = shutdown.changed() => {
                return Ok(Exit::Shutdown);
            }
        }
    }
}
