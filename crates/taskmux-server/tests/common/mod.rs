#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;

use taskmux_protocol::api::{SessionInfo, TaskInfo};
use taskmux_server::config::ServerConfig;
use taskmux_server::{AppState, build_cors, serve};

/// The router served in-process on an ephemeral port.
pub struct TestServer {
    pub addr: std::net::SocketAddr,
    pub state: Arc<AppState>,
    pub client: reqwest::Client,
    handle: JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            log_dir: dir.path().join("logs"),
            pid_file: dir.path().join("processes.pid"),
            fsync: false,
            ping_interval_secs: 1,
            grace_period_secs: 2,
            ..ServerConfig::default()
        };
        let state = Arc::new(AppState::from_config(&config).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cors = build_cors(&config.allow_origins).unwrap();
        let handle = tokio::spawn(serve(listener, Arc::clone(&state), cors));
        Self {
            addr,
            state,
            client: reqwest::Client::new(),
            handle,
            _dir: dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub async fn create_session(&self) -> SessionInfo {
        let resp = self
            .client
            .post(self.url("/api/sessions"))
            .json(&json!({ "name": "test" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }

    pub async fn start_shell(&self, session_id: &str, script: &str) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/api/sessions/{session_id}/tasks")))
            .json(&json!({
                "command": { "program": "/bin/sh", "args": ["-c", script] },
                "description": "integration test",
            }))
            .send()
            .await
            .unwrap()
    }

    pub async fn task(&self, session_id: &str, task_id: &str) -> TaskInfo {
        self.client
            .get(self.url(&format!("/api/sessions/{session_id}/tasks/{task_id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Poll until the task has a terminal attached.
    pub async fn wait_for_stream(&self, session_id: &str, task_id: &str) {
        for _ in 0..200 {
            if self.task(session_id, task_id).await.stream_id.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {task_id} never attached a terminal");
    }

    pub async fn wait_for_terminal_state(&self, session_id: &str, task_id: &str) -> TaskInfo {
        for _ in 0..400 {
            let task = self.task(session_id, task_id).await;
            if task.state.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {task_id} never finished");
    }

    pub async fn events(&self, session_id: &str, query: &str) -> Vec<Value> {
        self.client
            .get(self.url(&format!("/api/sessions/{session_id}/events{query}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    pub async fn stop(self) {
        self.state.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(20), self.handle)
            .await
            .expect("server did not shut down")
            .unwrap()
            .unwrap();
    }
}
