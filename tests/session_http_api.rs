//! End-to-end HTTP scenarios driven with a real `reqwest::Client` against
//! a server bound to an ephemeral port, mirroring the create/list/input/
//! cleanup lifecycle and error-status scenarios from spec §8.

use reqwest::StatusCode;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use ttysrv::config::ServerConfig;
use ttysrv::eventloop::EventLoop;
use ttysrv::http::auth::TokenManager;
use ttysrv::http::rate_limit::{RateLimitConfig, RateLimiter};
use ttysrv::http::{build_router, AppState};
use ttysrv::registry::{Registry, SessionFd};
use ttysrv::supervisor::Supervisor;

/// Stands up the real router behind an ephemeral `TcpListener`, the same
/// bootstrap `server::run` performs, so these tests exercise auth, rate
/// limiting, and SSE exactly as a live deployment would.
struct TestServer {
    base_url: String,
    token: String,
    client: reqwest::Client,
    _control_root: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let control_root = TempDir::new().unwrap();
        let config = ServerConfig::new(Some(control_root.path().to_path_buf()), None);

        let event_loop = Arc::new(EventLoop::<SessionFd>::new().unwrap());
        let registry = Arc::new(Registry::new(config.clone(), event_loop));
        registry.recover_on_startup();

        let worker_registry = registry.clone();
        std::thread::Builder::new()
            .name("pty-event-loop-test".to_string())
            .spawn(move || worker_registry.run_event_loop())
            .unwrap();

        let (token_manager, minted) =
            TokenManager::load_or_bootstrap(config.control_root.join("tokens.json"))
                .await
                .unwrap();
        let token = minted.expect("a fresh control root should mint a token");

        let state = Arc::new(AppState {
            registry,
            supervisor: Supervisor::new(),
            token_manager,
            rate_limiter: RateLimiter::new(RateLimitConfig::default()),
        });
        let router = build_router(state, None);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        Self {
            base_url: format!("http://{addr}"),
            token,
            client: reqwest::Client::new(),
            _control_root: control_root,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).header("X-API-Key", &self.token).send().await.unwrap()
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("X-API-Key", &self.token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn delete(&self, path: &str) -> reqwest::Response {
        self.client.delete(self.url(path)).header("X-API-Key", &self.token).send().await.unwrap()
    }

    async fn wait_for_status(&self, id: &str, want: &str) -> Value {
        for _ in 0..50 {
            let sessions: Value = self.get("/api/sessions").await.json().await.unwrap();
            if let Some(entry) = sessions.as_array().unwrap().iter().find(|s| s["id"] == id) {
                if entry["status"] == want {
                    return entry.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("session {id} never reached status {want}");
    }
}

#[tokio::test]
async fn create_list_exit_and_cleanup_lifecycle() {
    let server = TestServer::start().await;

    let create =
        server.post("/api/sessions", json!({"command": ["/bin/sh", "-c", "echo hello"]})).await;
    assert_eq!(create.status(), StatusCode::OK);
    let created: Value = create.json().await.unwrap();
    assert_eq!(created["success"], true);
    let id = created["sessionId"].as_str().unwrap().to_string();

    let sessions: Value = server.get("/api/sessions").await.json().await.unwrap();
    let entry = sessions.as_array().unwrap().iter().find(|s| s["id"] == id).unwrap();
    assert_eq!(entry["command"], "/bin/sh -c echo hello");

    let exited = server.wait_for_status(&id, "exited").await;
    assert_eq!(exited["exitCode"], 0);

    let cleanup = server.delete(&format!("/api/sessions/{id}/cleanup")).await;
    assert_eq!(cleanup.status(), StatusCode::OK);

    let sessions: Value = server.get("/api/sessions").await.json().await.unwrap();
    assert!(sessions.as_array().unwrap().iter().all(|s| s["id"] != id));
}

/// Spec §8 E4: a request to write input to a session that has already
/// exited must surface 410, not the generic 400 "not running" error.
#[tokio::test]
async fn input_to_a_session_that_already_exited_is_gone() {
    let server = TestServer::start().await;

    let create = server.post("/api/sessions", json!({"command": ["/bin/sh", "-c", "exit 3"]})).await;
    let created: Value = create.json().await.unwrap();
    let id = created["sessionId"].as_str().unwrap().to_string();

    server.wait_for_status(&id, "exited").await;

    let input = server.post(&format!("/api/sessions/{id}/input"), json!({"text": "hi"})).await;
    assert_eq!(input.status(), StatusCode::GONE);
    let body: Value = input.json().await.unwrap();
    assert_eq!(body["error"], "Session process has died");
}

#[tokio::test]
async fn requests_without_a_token_are_rejected() {
    let server = TestServer::start().await;
    let response = server.client.get(server.url("/api/sessions")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_does_not_require_a_token() {
    let server = TestServer::start().await;
    let response = server.client.get(server.url("/api/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn creating_a_session_with_an_empty_command_is_a_client_error() {
    let server = TestServer::start().await;
    let response = server.post("/api/sessions", json!({"command": []})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
