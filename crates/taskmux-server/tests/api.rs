mod common;

use std::time::Duration;

use base64::Engine;
use serde_json::{Value, json};

use common::TestServer;
use taskmux_protocol::TaskState;
use taskmux_protocol::api::{CancelResponse, HealthResponse, SessionList, TaskInfo};

/// Payloads of the `data:` lines of an SSE body.
fn data_events(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

fn kinds(events: &[Value]) -> Vec<&str> {
    events.iter().map(|e| e["kind"].as_str().unwrap()).collect()
}

#[tokio::test]
async fn session_crud_and_not_found_errors() {
    let server = TestServer::start().await;
    let health: HealthResponse = server
        .client
        .get(server.url("/api/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.sessions, 0);

    let session = server.create_session().await;
    assert_eq!(session.name, "test");

    let list: SessionList = server
        .client
        .get(server.url("/api/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.total, 1);
    assert_eq!(list.sessions[0].id, session.id);

    let resp = server
        .client
        .delete(server.url(&format!("/api/sessions/{}", session.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = server
        .client
        .get(server.url(&format!("/api/sessions/{}", session.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "session_not_found");

    let resp = server
        .client
        .get(server.url("/api/sessions/nosuch/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn task_runs_to_completion_and_log_is_queryable() {
    let server = TestServer::start().await;
    let session = server.create_session().await;

    let resp = server.start_shell(&session.id, "echo hello-api").await;
    assert_eq!(resp.status(), 201);
    let task: TaskInfo = resp.json().await.unwrap();
    assert_eq!(task.state, TaskState::Running);

    let done = server.wait_for_terminal_state(&session.id, &task.id).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.exit_code, Some(0));

    let lifecycle = server
        .events(&session.id, "?types=session_started,session_ended")
        .await;
    let types: Vec<&str> = lifecycle.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(types, vec!["session_started", "session_ended"]);
    assert_eq!(lifecycle[1]["success"], true);

    let all = server.events(&session.id, "").await;
    let seqs: Vec<u64> = all.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
    let tail = server.events(&session.id, &format!("?since_seq={}", seqs[1])).await;
    assert_eq!(tail.len(), seqs.len() - 2);

    server.stop().await;
}

#[tokio::test]
async fn busy_session_and_bad_requests_are_rejected() {
    let server = TestServer::start().await;
    let session = server.create_session().await;

    let resp = server.start_shell(&session.id, "sleep 30").await;
    assert_eq!(resp.status(), 201);
    let resp = server.start_shell(&session.id, "echo second").await;
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "conflict");

    let resp = server
        .client
        .delete(server.url(&format!("/api/sessions/{}", session.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let other = server.create_session().await;
    let resp = server
        .client
        .post(server.url(&format!("/api/sessions/{}/tasks", other.id)))
        .json(&json!({ "command": { "program": "  " } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .delete(server.url(&format!("/api/sessions/{}?force=true", session.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    server.stop().await;
}

#[tokio::test]
async fn cancel_is_idempotent_and_reports_no_active_task() {
    let server = TestServer::start().await;
    let session = server.create_session().await;
    let task: TaskInfo = server
        .start_shell(&session.id, "sleep 30")
        .await
        .json()
        .await
        .unwrap();
    server.wait_for_stream(&session.id, &task.id).await;

    let cancel_url = server.url(&format!("/api/sessions/{}/cancel", session.id));
    let first: CancelResponse = server
        .client
        .post(&cancel_url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(first.cancel_requested);

    let done = server.wait_for_terminal_state(&session.id, &task.id).await;
    assert_eq!(done.state, TaskState::Cancelled);
    assert_eq!(done.reason.as_deref(), Some("cancelled"));

    let again: CancelResponse = server
        .client
        .post(&cancel_url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!again.cancel_requested);
    assert_eq!(again.message, "no active task to cancel");

    server.stop().await;
}

#[tokio::test]
async fn input_and_resize_reach_the_terminal() {
    let server = TestServer::start().await;
    let session = server.create_session().await;
    let task: TaskInfo = server
        .start_shell(&session.id, "read line; echo got:$line; stty size")
        .await
        .json()
        .await
        .unwrap();
    server.wait_for_stream(&session.id, &task.id).await;

    let resp = server
        .client
        .post(server.url(&format!("/api/sessions/{}/resize", session.id)))
        .json(&json!({ "rows": 30, "cols": 100 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let data = base64::engine::general_purpose::STANDARD.encode(b"abc\n");
    let written: Value = server
        .client
        .post(server.url(&format!("/api/sessions/{}/input", session.id)))
        .json(&json!({ "data": data }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(written["written"], 4);

    let done = server.wait_for_terminal_state(&session.id, &task.id).await;
    assert_eq!(done.state, TaskState::Completed);

    let snapshot = server.events(&session.id, "?types=terminal_output").await;
    let text = snapshot[0]["text"].as_str().unwrap();
    assert!(text.contains("got:abc"), "{text}");
    assert!(text.contains("30 100"), "{text}");
    assert_eq!(snapshot[0]["rows"], 30);

    let late: Value = server
        .client
        .post(server.url(&format!("/api/sessions/{}/input", session.id)))
        .json(&json!({ "data": data }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(late["closed"], true);

    server.stop().await;
}

#[tokio::test]
async fn sse_stream_replays_and_ends_with_complete() {
    let server = TestServer::start().await;
    let session = server.create_session().await;
    let task: TaskInfo = server
        .start_shell(&session.id, "echo streamed; exit 4")
        .await
        .json()
        .await
        .unwrap();

    let body = tokio::time::timeout(Duration::from_secs(20), async {
        server
            .client
            .get(server.url(&format!("/api/sessions/{}/stream", session.id)))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    })
    .await
    .expect("stream did not end");

    let events = data_events(&body);
    let kinds = kinds(&events);
    assert!(kinds.contains(&"terminal"));
    assert_eq!(kinds.last(), Some(&"complete"));
    assert_eq!(events.last().unwrap()["exit_code"], 4);

    let terminal: String = events
        .iter()
        .filter(|e| e["kind"] == "terminal")
        .map(|e| {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(e["data"].as_str().unwrap())
                .unwrap();
            String::from_utf8_lossy(&bytes).into_owned()
        })
        .collect();
    assert!(terminal.contains("streamed"));

    let done = server.wait_for_terminal_state(&session.id, &task.id).await;
    assert_eq!(done.state, TaskState::Failed);
    assert_eq!(done.reason.as_deref(), Some("process exited with code 4"));

    // Without terminal chunks only structured events remain.
    let body = server
        .client
        .get(server.url(&format!(
            "/api/sessions/{}/stream?include_terminal=false",
            session.id
        )))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let events = data_events(&body);
    let kinds = crate::kinds(&events);
    assert!(!kinds.contains(&"terminal"));
    assert_eq!(kinds.last(), Some(&"complete"));

    server.stop().await;
}

#[tokio::test]
async fn shutdown_ends_every_stream_with_a_final_event() {
    let server = TestServer::start().await;
    let busy = server.create_session().await;
    let idle = server.create_session().await;
    let task: TaskInfo = server
        .start_shell(&busy.id, "sleep 30")
        .await
        .json()
        .await
        .unwrap();
    server.wait_for_stream(&busy.id, &task.id).await;

    let busy_resp = server
        .client
        .get(server.url(&format!(
            "/api/sessions/{}/stream?include_terminal=false",
            busy.id
        )))
        .send()
        .await
        .unwrap();
    let idle_resp = server
        .client
        .get(server.url(&format!("/api/sessions/{}/stream", idle.id)))
        .send()
        .await
        .unwrap();

    let (_, busy_body, idle_body) =
        tokio::join!(server.stop(), busy_resp.text(), idle_resp.text());

    // The running task is stopped first, so its stream completes normally.
    let events = data_events(&busy_body.unwrap());
    assert_eq!(kinds(&events).last(), Some(&"complete"));
    let ended = events
        .iter()
        .find(|e| e["type"] == "session_ended")
        .expect("session_ended event");
    assert_eq!(ended["reason"], "cancelled");

    // A stream with nothing to complete is told why it is closing.
    let events = data_events(&idle_body.unwrap());
    let last = events.last().expect("final event");
    assert_eq!(last["kind"], "error");
    assert_eq!(last["error"], "server shutting down");
}
