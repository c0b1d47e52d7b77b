//! End-to-end tests: a real server and real WebSocket clients.

mod common;

use common::TestServer;
use futures_util::SinkExt;
use serde_json::json;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use webedit_collab::{ServerConfig, UserId};

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = TestServer::start().await;
    let result = tokio_tungstenite::connect_async(server.url()).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_init_snapshot_for_first_client() {
    let server = TestServer::start().await;
    let (_a, init) = server.join().await;

    assert_eq!(init["user_id"], "user_1");
    assert_eq!(init["webedit"], json!({"css": "", "javascript": "", "html": ""}));
    assert_eq!(init["files"], json!({}));
    assert_eq!(init["cursors"], json!({}));
    assert_eq!(init["file_users"], json!({}));

    let users = init["users"].as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["user_id"], "user_1");
    assert_eq!(users[0]["remote_address"], "127.0.0.1");
    assert!(users[0]["connected_at"].is_string());
}

#[tokio::test]
async fn test_two_clients_edit_file_then_third_joins() {
    let server = TestServer::start().await;

    let (mut a, _) = server.join().await;
    let (mut b, init_b) = server.join().await;
    assert_eq!(init_b["user_id"], "user_2");
    assert_eq!(init_b["users"].as_array().unwrap().len(), 2);

    let joined = a.recv().await;
    assert_eq!(joined["type"], "user_joined");
    assert_eq!(joined["user"]["user_id"], "user_2");
    assert_eq!(joined["total_users"], 2);

    a.send(json!({"type": "file_open", "file_path": "main.py", "content": "print(1)"}))
        .await;
    let opened = b.recv().await;
    assert_eq!(opened["type"], "file_opened");
    assert_eq!(opened["file_path"], "main.py");
    assert_eq!(opened["user_id"], "user_1");
    assert_eq!(opened["users_editing"], json!(["user_1"]));

    a.send(json!({"type": "file_update", "file_path": "main.py", "content": "print(2)"}))
        .await;
    let update = b.recv().await;
    assert_eq!(update["type"], "file_update");
    assert_eq!(update["content"], "print(2)");
    assert_eq!(update["user_id"], "user_1");

    a.close().await;
    let left = b.recv().await;
    assert_eq!(left["type"], "user_left");
    assert_eq!(left["user_id"], "user_1");
    assert_eq!(left["total_users"], 1);

    let (_c, init_c) = server.join().await;
    assert_eq!(init_c["user_id"], "user_3");
    assert_eq!(init_c["files"]["main.py"], "print(2)");
    assert_eq!(init_c["file_users"], json!({}));
    assert_eq!(init_c["users"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_sender_does_not_receive_own_edit() {
    let server = TestServer::start().await;
    let (mut a, _) = server.join().await;
    let (mut b, _) = server.join().await;
    a.recv_type("user_joined").await;

    a.send(json!({"type": "code_update", "field": "javascript", "value": "let x = 1;"}))
        .await;
    let update = b.recv().await;
    assert_eq!(update["type"], "code_update");
    assert_eq!(update["field"], "javascript");
    assert_eq!(update["value"], "let x = 1;");

    a.expect_silence().await;
    assert_eq!(server.hub.quadrant().await.javascript, "let x = 1;");
}

#[tokio::test]
async fn test_ping_answered_to_sender_only() {
    let server = TestServer::start().await;
    let (mut a, _) = server.join().await;
    let (mut b, _) = server.join().await;
    a.recv_type("user_joined").await;

    a.send(json!({"type": "ping"})).await;
    let pong = a.recv().await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_string());
    b.expect_silence().await;
}

#[tokio::test]
async fn test_bad_frames_keep_connection_open() {
    let server = TestServer::start().await;
    let (mut a, _) = server.join().await;
    let (mut b, _) = server.join().await;
    a.recv_type("user_joined").await;

    a.send_raw("{this is not json").await;
    a.send_raw("[1, 2, 3]").await;
    a.send(json!({"type": "teleport", "to": "mars"})).await;
    a.send(json!({"file_path": "x"})).await;
    a.send(json!({"type": "file_update", "file_path": 42})).await;
    a.ws.send(Message::binary(vec![0u8, 1, 2])).await.unwrap();
    a.send(json!({"type": "code_update", "field": "python", "value": "x"}))
        .await;

    a.sync().await;
    b.expect_silence().await;
    assert_eq!(server.hub.user_count().await, 2);
    assert!(server.hub.file("x").await.is_none());
}

#[tokio::test]
async fn test_chat_reaches_others_only() {
    let server = TestServer::start().await;
    let (mut a, _) = server.join().await;
    let (mut b, _) = server.join().await;
    a.recv_type("user_joined").await;

    b.send(json!({"type": "chat_message", "message": "hello all"}))
        .await;
    let chat = a.recv().await;
    assert_eq!(chat["type"], "chat_message");
    assert_eq!(chat["user_id"], "user_2");
    assert_eq!(chat["message"], "hello all");
    b.expect_silence().await;
}

#[tokio::test]
async fn test_file_close_broadcast() {
    let server = TestServer::start().await;
    let (mut a, _) = server.join().await;
    let (mut b, _) = server.join().await;
    a.recv_type("user_joined").await;

    a.send(json!({"type": "file_open", "file_path": "app.js", "content": ""}))
        .await;
    b.recv_type("file_opened").await;
    b.send(json!({"type": "file_open", "file_path": "app.js", "content": "ignored"}))
        .await;
    let opened = a.recv_type("file_opened").await;
    assert_eq!(opened["users_editing"], json!(["user_1", "user_2"]));

    a.send(json!({"type": "file_close", "file_path": "app.js"})).await;
    let closed = b.recv_type("file_closed").await;
    assert_eq!(closed["user_id"], "user_1");
    assert_eq!(closed["users_editing"], json!(["user_2"]));

    // Closing again is a no-op.
    a.send(json!({"type": "file_close", "file_path": "app.js"})).await;
    a.sync().await;
    b.expect_silence().await;
    assert_eq!(server.hub.file("app.js").await.as_deref(), Some(""));
}

#[tokio::test]
async fn test_every_observer_sees_the_same_order() {
    let server = TestServer::start().await;
    let (mut o1, _) = server.join().await;
    let (mut o2, _) = server.join().await;

    let mut writers = Vec::new();
    for _ in 0..3 {
        writers.push(server.join().await.0);
    }

    let tasks: Vec<_> = writers
        .into_iter()
        .enumerate()
        .map(|(w, mut client)| {
            tokio::spawn(async move {
                for i in 0..20 {
                    client
                        .send(json!({
                            "type": "file_update",
                            "file_path": "shared.txt",
                            "content": format!("w{w}-{i}")
                        }))
                        .await;
                }
                client.sync().await;
                client
            })
        })
        .collect();

    let mut seen1 = Vec::new();
    let mut seen2 = Vec::new();
    for _ in 0..60 {
        seen1.push(o1.recv_type("file_update").await["content"].clone());
        seen2.push(o2.recv_type("file_update").await["content"].clone());
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(seen1, seen2);
    let last = seen1.last().and_then(|v| v.as_str()).map(str::to_string);
    assert_eq!(server.hub.file("shared.txt").await, last);
    assert!(server.hub.is_consistent().await);
}

#[tokio::test]
async fn test_unresponsive_client_dropped_by_heartbeat() {
    let config = ServerConfig {
        ping_interval: Duration::from_millis(100),
        ping_timeout: Duration::from_millis(150),
        ..ServerConfig::with_bind_addr("127.0.0.1:0")
    };
    let server = TestServer::start_with(config).await;

    // Never polled again, so it never answers pings.
    let (_silent, _) = server.join().await;
    let (mut live, _) = server.join().await;

    let left = live.recv_type("user_left").await;
    assert_eq!(left["user_id"], "user_1");
    assert_eq!(left["total_users"], 1);

    // The responsive client survives several heartbeat rounds.
    tokio::time::sleep(Duration::from_millis(50)).await;
    live.sync().await;
    assert_eq!(server.hub.user_count().await, 1);
}

#[tokio::test]
async fn test_stalled_reader_dropped_while_others_flood() {
    let config = ServerConfig {
        ping_interval: Duration::from_millis(100),
        ping_timeout: Duration::from_millis(300),
        ..ServerConfig::with_bind_addr("127.0.0.1:0")
    };
    let server = TestServer::start_with(config).await;

    // Joins, then never reads again while its socket buffers fill up.
    let (_stalled, _) = server.join().await;
    let (mut writer, _) = server.join().await;

    let body = "x".repeat(1 << 20);
    let started = Instant::now();
    for i in 0..32 {
        writer
            .send(json!({"type": "file_update", "file_path": "big.txt", "content": format!("{i}{body}")}))
            .await;
        writer.sync().await;
    }

    while server.hub.user_count().await > 1 {
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "stalled client still registered after {:?}",
            started.elapsed()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let sessions = server.hub.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].user_id, UserId::new(2));
    assert!(server.hub.is_consistent().await);

    writer.sync().await;
    assert!(server.hub.file("big.txt").await.unwrap().starts_with("31x"));
}

#[tokio::test]
async fn test_graceful_shutdown_closes_clients() {
    let mut server = TestServer::start().await;
    let (mut a, _) = server.join().await;
    let (mut b, _) = server.join().await;
    a.recv_type("user_joined").await;

    server.stop().await;

    for client in [&mut a, &mut b] {
        match client.recv_close().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close frame, got {other:?}"),
        }
    }
    assert_eq!(server.hub.user_count().await, 0);
    assert!(tokio_tungstenite::connect_async(server.url()).await.is_err());
}
