mod common;

use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use common::TestServer;
use taskmux_protocol::TaskState;
use taskmux_protocol::api::TaskInfo;

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn send_json(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Read text frames until the stream's final event; returns them and the
/// close code that follows.
async fn read_until_final(socket: &mut Socket) -> (Vec<Value>, Option<u16>) {
    let mut frames = Vec::new();
    let read = async {
        while let Some(msg) = socket.next().await {
            match msg.unwrap() {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    frames.push(value);
                }
                Message::Close(frame) => return frame.map(|f| u16::from(f.code)),
                _ => {}
            }
        }
        None
    };
    let code = tokio::time::timeout(Duration::from_secs(20), read)
        .await
        .expect("socket did not close");
    (frames, code)
}

fn kinds(frames: &[Value]) -> Vec<&str> {
    frames.iter().map(|f| f["kind"].as_str().unwrap()).collect()
}

#[tokio::test]
async fn unknown_session_closes_with_4004() {
    let server = TestServer::start().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(server.ws_url("/ws/missing"))
        .await
        .unwrap();
    let (frames, code) = read_until_final(&mut socket).await;
    assert!(frames.is_empty());
    assert_eq!(code, Some(4004));
    server.stop().await;
}

#[tokio::test]
async fn socket_streams_output_and_forwards_input() {
    let server = TestServer::start().await;
    let session = server.create_session().await;
    let task: TaskInfo = server
        .start_shell(&session.id, "read line; echo ws:$line")
        .await
        .json()
        .await
        .unwrap();
    server.wait_for_stream(&session.id, &task.id).await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(server.ws_url(&format!("/ws/{}", session.id)))
            .await
            .unwrap();
    // The task blocks on input, so both replies land before `complete`.
    send_json(&mut socket, json!({ "type": "ping" })).await;
    send_json(&mut socket, json!({ "type": "bogus" })).await;
    let data = base64::engine::general_purpose::STANDARD.encode(b"hi\n");
    send_json(&mut socket, json!({ "type": "input", "data": data })).await;

    let (frames, code) = read_until_final(&mut socket).await;
    let kinds = kinds(&frames);
    assert!(kinds.contains(&"pong"));
    assert!(
        frames
            .iter()
            .any(|f| f["kind"] == "ack" && f["op"] == "input")
    );
    assert!(
        frames
            .iter()
            .any(|f| f["kind"] == "nack" && f["op"] == "parse")
    );
    assert_eq!(kinds.last(), Some(&"complete"));
    assert_eq!(frames.last().unwrap()["exit_code"], 0);
    assert_eq!(code, Some(1000));

    let output: String = frames
        .iter()
        .filter(|f| f["kind"] == "terminal")
        .map(|f| {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(f["data"].as_str().unwrap())
                .unwrap();
            String::from_utf8_lossy(&bytes).into_owned()
        })
        .collect();
    assert!(output.contains("ws:hi"), "{output}");

    // Stream sequence numbers only ever increase.
    let seqs: Vec<u64> = frames
        .iter()
        .filter(|f| f["kind"] == "terminal" || f["kind"] == "event")
        .map(|f| f["seq"].as_u64().unwrap())
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    server.stop().await;
}

#[tokio::test]
async fn cancel_over_socket_stops_the_task() {
    let server = TestServer::start().await;
    let session = server.create_session().await;
    let task: TaskInfo = server
        .start_shell(&session.id, "sleep 30")
        .await
        .json()
        .await
        .unwrap();
    server.wait_for_stream(&session.id, &task.id).await;

    let url = server.ws_url(&format!("/ws/{}?include_terminal=false", session.id));
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    send_json(&mut socket, json!({ "type": "cancel" })).await;

    let (frames, _) = read_until_final(&mut socket).await;
    assert!(
        frames
            .iter()
            .any(|f| f["kind"] == "ack" && f["op"] == "cancel")
    );
    assert!(!kinds(&frames).contains(&"terminal"));
    let ended = frames
        .iter()
        .find(|f| f["type"] == "session_ended")
        .expect("session_ended event");
    assert_eq!(ended["reason"], "cancelled");

    let done = server.wait_for_terminal_state(&session.id, &task.id).await;
    assert_eq!(done.state, TaskState::Cancelled);

    server.stop().await;
}

#[tokio::test]
async fn shutdown_sends_a_final_event_before_going_away() {
    let server = TestServer::start().await;
    let session = server.create_session().await;
    let task: TaskInfo = server
        .start_shell(&session.id, "sleep 30")
        .await
        .json()
        .await
        .unwrap();
    server.wait_for_stream(&session.id, &task.id).await;

    let url = server.ws_url(&format!("/ws/{}?include_terminal=false", session.id));
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let (_, (frames, code)) = tokio::join!(server.stop(), read_until_final(&mut socket));
    assert_eq!(kinds(&frames).last(), Some(&"complete"));
    assert!(
        frames
            .iter()
            .any(|f| f["type"] == "session_ended" && f["reason"] == "cancelled")
    );
    assert_eq!(code, Some(1001));
}
