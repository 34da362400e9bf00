#![allow(dead_code)]

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Response, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::Notify, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use trade_export_core::{
    ConnectionCredentials, DirectorySink, JobKind, JobOrchestrator, OrchestratorSettings,
    QueryServiceClient, Session,
};

pub const TOKEN: &str = "token-1";
pub const SPREADSHEET: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Debug, Clone)]
pub struct GenerateCall {
    pub kind: String,
    pub force: bool,
    pub resume_token: Option<String>,
    pub filter: Value,
}

/// Knobs and counters of the fake query service.
pub struct FakeState {
    pub total_count: AtomicU64,
    pub server_limit: AtomicU64,
    pub reject_generate: AtomicBool,
    pub preview_error: Mutex<Option<String>>,
    pub preview_delay: Mutex<Duration>,
    pub generate_delays: Mutex<VecDeque<Duration>>,
    pub chunk_delay: Mutex<Duration>,
    pub payload: Mutex<Vec<u8>>,
    pub disposition: Mutex<Option<String>>,
    pub operation_id: Mutex<Option<String>>,
    pub progress_script: Mutex<VecDeque<Value>>,
    pub generate_started: Notify,
    pub logins: AtomicUsize,
    pub previews: AtomicUsize,
    pub preview_kinds: Mutex<Vec<String>>,
    pub generate_calls: Mutex<Vec<GenerateCall>>,
    pub progress_polls: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub cleanup_sessions: Mutex<Vec<String>>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            total_count: AtomicU64::new(250),
            server_limit: AtomicU64::new(1_048_576),
            reject_generate: AtomicBool::new(false),
            preview_error: Mutex::new(None),
            preview_delay: Mutex::new(Duration::ZERO),
            generate_delays: Mutex::new(VecDeque::new()),
            chunk_delay: Mutex::new(Duration::ZERO),
            payload: Mutex::new(b"PK\x03\x04 fake workbook bytes for the tests".to_vec()),
            disposition: Mutex::new(None),
            operation_id: Mutex::new(None),
            progress_script: Mutex::new(VecDeque::new()),
            generate_started: Notify::new(),
            logins: AtomicUsize::new(0),
            previews: AtomicUsize::new(0),
            preview_kinds: Mutex::new(Vec::new()),
            generate_calls: Mutex::new(Vec::new()),
            progress_polls: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            cleanup_sessions: Mutex::new(Vec::new()),
        }
    }
}

impl FakeState {
    pub fn set_total(&self, total: u64) {
        self.total_count.store(total, Ordering::SeqCst);
    }

    pub fn push_generate_delay(&self, delay: Duration) {
        self.generate_delays.lock().unwrap().push_back(delay);
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        *self.chunk_delay.lock().unwrap() = delay;
    }

    pub fn set_disposition(&self, value: &str) {
        *self.disposition.lock().unwrap() = Some(value.to_string());
    }

    pub fn set_operation_id(&self, value: &str) {
        *self.operation_id.lock().unwrap() = Some(value.to_string());
    }

    pub fn set_progress_script(&self, snapshots: Vec<Value>) {
        *self.progress_script.lock().unwrap() = snapshots.into();
    }

    pub fn generate_calls(&self) -> Vec<GenerateCall> {
        self.generate_calls.lock().unwrap().clone()
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.progress_polls.load(Ordering::SeqCst)
    }

    pub fn network_calls(&self) -> usize {
        self.previews.load(Ordering::SeqCst)
            + self.generate_calls.lock().unwrap().len()
            + self.progress_polls.load(Ordering::SeqCst)
            + self.cleanups.load(Ordering::SeqCst)
    }
}

pub struct FakeService {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
    task: JoinHandle<()>,
}

impl FakeService {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/{kind}/preview", post(preview))
            .route("/api/{kind}/generate", post(generate))
            .route("/api/{kind}/progress/{operation_id}", get(progress))
            .route("/api/connection/cleanup", post(cleanup))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake service");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake service");
        });
        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn session(&self) -> Arc<Session> {
        let session = Session::login(QueryServiceClient::new(&self.url()), credentials())
            .await
            .expect("login");
        Arc::new(session)
    }

    pub async fn orchestrator(&self, kind: JobKind, dir: &std::path::Path) -> JobOrchestrator {
        self.orchestrator_with(kind, dir, fast_settings()).await
    }

    pub async fn orchestrator_with(
        &self,
        kind: JobKind,
        dir: &std::path::Path,
        settings: OrchestratorSettings,
    ) -> JobOrchestrator {
        JobOrchestrator::new(
            kind,
            self.session().await,
            settings,
            Arc::new(DirectorySink::new(dir)),
        )
    }
}

impl Drop for FakeService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn credentials() -> ConnectionCredentials {
    ConnectionCredentials {
        server: "db01".into(),
        database: "customs".into(),
        username: "analyst".into(),
        password: "secret".into(),
    }
}

pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        row_limit: 1_048_576,
        preview_limit: 3,
        preview_timeout: Duration::from_secs(5),
        generate_timeout: Duration::from_secs(60),
        cleanup_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(50),
        release_delay: Duration::from_millis(10),
    }
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn error_body(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(json!({ "error": { "message": message } }))).into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {TOKEN}"))
        .unwrap_or(false)
}

async fn login(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> impl IntoResponse {
    state.logins.fetch_add(1, Ordering::SeqCst);
    if body["password"] != "secret" {
        return error_body(StatusCode::UNAUTHORIZED, "Login failed for user 'analyst'.");
    }
    Json(json!({ "access_token": TOKEN, "expires_in": 3600 })).into_response()
}

async fn preview(
    State(state): State<Arc<FakeState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.previews.fetch_add(1, Ordering::SeqCst);
    state.preview_kinds.lock().unwrap().push(kind);
    if !authorized(&headers) {
        return error_body(StatusCode::UNAUTHORIZED, "Token expired");
    }

    let delay = *state.preview_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let preview_error = state.preview_error.lock().unwrap().clone();
    if let Some(message) = preview_error {
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, &message);
    }

    let total = state.total_count.load(Ordering::SeqCst);
    let limit = body["limit"].as_u64().unwrap_or(100).min(total);
    let rows: Vec<Value> = (0..limit)
        .map(|i| json!({ "row": i + 1, "hs_code": "8471.30", "company": "Acme Trading" }))
        .collect();
    Json(json!({ "rows": rows, "matched_count": total, "total_count": total })).into_response()
}

async fn generate(
    State(state): State<Arc<FakeState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let force = body["force_continue_despite_limit"].as_bool().unwrap_or(false);
    state.generate_calls.lock().unwrap().push(GenerateCall {
        kind,
        force,
        resume_token: body["resume_token"].as_str().map(str::to_string),
        filter: body["filter"].clone(),
    });
    state.generate_started.notify_one();

    let delay = state.generate_delays.lock().unwrap().pop_front();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    if !authorized(&headers) || state.reject_generate.load(Ordering::SeqCst) {
        return error_body(StatusCode::UNAUTHORIZED, "Token expired");
    }

    let total = state.total_count.load(Ordering::SeqCst);
    let limit = state.server_limit.load(Ordering::SeqCst);
    if total > limit && !force {
        return Json(json!({
            "status": "limit_exceeded",
            "total_records": total,
            "limit": limit,
            "operation_id": "op-limit",
            "message": "Row limit exceeded"
        }))
        .into_response();
    }

    let payload = state.payload.lock().unwrap().clone();
    let chunk_delay = *state.chunk_delay.lock().unwrap();
    let length = payload.len();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(4);
    tokio::spawn(async move {
        let chunk_size = length.div_ceil(4).max(1);
        for chunk in payload.chunks(chunk_size) {
            if !chunk_delay.is_zero() {
                tokio::time::sleep(chunk_delay).await;
            }
            if tx.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                return;
            }
        }
    });

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, SPREADSHEET)
        .header(header::CONTENT_LENGTH, length.to_string());
    if let Some(disposition) = state.disposition.lock().unwrap().clone() {
        response = response.header(header::CONTENT_DISPOSITION, disposition);
    }
    if let Some(operation_id) = state.operation_id.lock().unwrap().clone() {
        response = response.header("x-operation-id", operation_id);
    }
    response
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .expect("generate response")
        .into_response()
}

async fn progress(
    State(state): State<Arc<FakeState>>,
    Path((_kind, _operation_id)): Path<(String, String)>,
) -> impl IntoResponse {
    state.progress_polls.fetch_add(1, Ordering::SeqCst);
    let mut script = state.progress_script.lock().unwrap();
    let snapshot = if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    };
    Json(snapshot.unwrap_or_else(|| json!({ "percent": 0, "status": "generating" })))
}

async fn cleanup(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> impl IntoResponse {
    state.cleanups.fetch_add(1, Ordering::SeqCst);
    if let Some(session_id) = body["session_id"].as_str() {
        state.cleanup_sessions.lock().unwrap().push(session_id.to_string());
    }
    Json(json!({ "released": true }))
}
