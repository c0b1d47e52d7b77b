//! Shared harness: a real server on an ephemeral port and a raw
//! WebSocket client speaking JSON.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use webedit_collab::{CollabError, CollabHub, CollabServer, ServerConfig};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

pub struct TestServer {
    pub addr: SocketAddr,
    pub hub: Arc<CollabHub>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), CollabError>>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ServerConfig::with_bind_addr("127.0.0.1:0")).await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = CollabServer::open(config).await.unwrap();
        let hub = server.hub().clone();
        let (tx, rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
        });

        Self {
            addr,
            hub,
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn connect(&self) -> TestClient {
        let (ws, _) = tokio_tungstenite::connect_async(self.url()).await.unwrap();
        TestClient { ws }
    }

    /// Connect and consume the `init` frame.
    pub async fn join(&self) -> (TestClient, Value) {
        let mut client = self.connect().await;
        let init = client.recv().await;
        assert_eq!(init["type"], "init");
        (client, init)
    }

    /// Trigger graceful shutdown and wait for `serve` to return.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            timeout(Duration::from_secs(10), task)
                .await
                .expect("server did not stop")
                .unwrap()
                .unwrap();
        }
    }
}

pub struct TestClient {
    pub ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn send(&mut self, msg: Value) {
        self.send_raw(&msg.to_string()).await;
    }

    pub async fn send_raw(&mut self, raw: &str) {
        self.ws.send(Message::text(raw)).await.unwrap();
    }

    /// Next JSON text frame, skipping control frames.
    pub async fn recv(&mut self) -> Value {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection ended")
                .expect("websocket error");
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Next frame whose `type` is `kind`, discarding others.
    pub async fn recv_type(&mut self, kind: &str) -> Value {
        loop {
            let msg = self.recv().await;
            if msg["type"] == kind {
                return msg;
            }
        }
    }

    /// Assert no text frame arrives for a short while.
    pub async fn expect_silence(&mut self) {
        let deadline = tokio::time::Instant::now() + QUIET_PERIOD;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {text}"),
                Ok(Some(Ok(_))) => continue,
                Ok(other) => panic!("connection ended: {other:?}"),
            }
        }
    }

    /// Round-trip a ping so every earlier message from this client has
    /// been processed by the server.
    pub async fn sync(&mut self) {
        self.send(serde_json::json!({"type": "ping"})).await;
        self.recv_type("pong").await;
    }

    /// Wait for the server to close the connection; returns the close
    /// frame if one was sent.
    pub async fn recv_close(&mut self) -> Option<Message> {
        loop {
            match timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for close")
            {
                Some(Ok(msg @ Message::Close(_))) => return Some(msg),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Drain until the server acknowledges.
        while let Ok(Some(Ok(_))) = timeout(RECV_TIMEOUT, self.ws.next()).await {}
    }
}
