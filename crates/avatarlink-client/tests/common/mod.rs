//! In-process mock of the backend: session endpoint, provider proxy and
//! knowledge endpoints. Every request is recorded.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::Value;

use avatarlink_client::{BackendClient, ClientConfig};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub body: Value,
    pub admin_key: Option<String>,
    pub bearer: Option<String>,
}

#[derive(Clone, Default)]
struct MockState {
    responses: Arc<Mutex<HashMap<String, (u16, String)>>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

#[derive(Clone)]
pub struct MockBackend {
    pub base: String,
    state: MockState,
}

impl MockBackend {
    pub async fn spawn() -> Self {
        let state = MockState::default();
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("mock backend addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock backend");
        });
        Self {
            base: format!("http://{addr}"),
            state,
        }
    }

    /// Serves `body` as JSON for `path` (e.g. `/provider/proxy/streaming.task`).
    pub fn respond_json(&self, path: &str, status: u16, body: Value) {
        self.respond_raw(path, status, &body.to_string());
    }

    pub fn respond_raw(&self, path: &str, status: u16, body: &str) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.to_string()));
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::from_backend(&self.base);
        config.acquire_timeout = Duration::from_secs(5);
        config.media_timeout = Duration::from_secs(5);
        config.teardown_timeout = Duration::from_secs(2);
        config.request_timeout = Duration::from_secs(5);
        config.ice_servers = Vec::new();
        config
    }

    pub fn http(&self, config: &ClientConfig) -> BackendClient {
        BackendClient::new(config).expect("http client")
    }
}

/// Accepts connections and never answers them.
pub async fn spawn_silent_backend() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind silent backend");
    let addr = listener.local_addr().expect("silent backend addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

async fn handle(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let path = uri.path().to_string();
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.requests.lock().unwrap().push(Recorded {
        method,
        path: path.clone(),
        query: uri.query().map(str::to_string),
        body: serde_json::from_str(&body).unwrap_or(Value::Null),
        admin_key: header_value("x-admin-key"),
        bearer: header_value("authorization")
            .and_then(|v| v.strip_prefix("Bearer ").map(str::to_string)),
    });

    let (status, body) = state
        .responses
        .lock()
        .unwrap()
        .get(&path)
        .cloned()
        .unwrap_or((200, "{}".to_string()));
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}
