//! # transcript-viewer
//!
//! Browser viewer for exported chat-support transcripts.
//!
//! This server provides:
//! - Remote fetch of transcripts from a webhook-style endpoint (30s deadline, cancellable)
//! - Manual upload of `.json` / `.xlsx` exports, plus an optional watched import directory
//! - Normalization of the inconsistent source shapes into one canonical message record
//! - Session list filtering and a searchable thread view as a JSON API
//! - Real-time SSE notifications when a dataset loads or a load fails
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  Frontend   │────▶│  Axum HTTP   │────▶│  Remote webhook │
//! │ (index.html)│     │  Server      │     │  (searchAll)    │
//! └─────────────┘     └──────────────┘     └─────────────────┘
//!       │ SSE               │ upload / import dir
//!       ▼                   ▼
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Real-time  │     │  Normalizer  │────▶│  Aggregator  │──▶ Snapshot
//! │  Updates    │     │  (+ xlsx)    │     │              │
//! └─────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! ## API Endpoints
//!
//! - `GET /health` - Server health check
//! - `GET /api/status` - Load state (loading, awaiting upload, ready, failed)
//! - `GET /api/stream` - SSE event stream
//! - `GET /api/sessions` - Filtered session list
//! - `GET /api/sessions/{id}/thread` - Thread with date separators and search
//! - `GET /api/remote/sessions/{id}` - Fetch one session from the endpoint
//! - `POST /api/upload` - Upload an export (`x-filename` header, raw body)
//! - `POST /api/reload` - Re-run the remote fetch
//! - `POST /api/reload/cancel` - Cancel the running fetch
//! - `GET /api/diagnostics` - What the last load reported
//! - `GET /api/curl` - Shell command reproducing the remote fetch

mod aggregate;
mod config;
mod diagnostics;
mod error;
mod normalizer;
mod remote;
mod sessions;
mod spreadsheet;
mod upload;
mod view;
mod watcher;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::HeaderMap,
    response::{sse::{Event, KeepAlive, Sse}, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures::future::{abortable, AbortHandle};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    net::SocketAddr,
    path::PathBuf,
    sync::{atomic::{AtomicU64, Ordering}, Arc, Mutex},
    time::{Duration, Instant, SystemTime},
};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::aggregate::aggregate;
use crate::config::Config;
use crate::diagnostics::{Collector, Diagnostic, TracingSink};
use crate::error::{ApiError, ErrorKind, LoadError};
use crate::normalizer::normalize_payload;
use crate::remote::{FetchRange, RemoteClient};
use crate::sessions::{CanonicalMessage, DataSource, Dataset, Snapshot};
use crate::view::{SessionFilter, SessionList, ThreadQuery, ThreadView};

/// Uploads are buffered whole; anything larger is refused before parsing
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

// ============================================================================
// SSE Event Types
// ============================================================================

/// Server-Sent Events broadcast to connected clients, tagged by type.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SseEvent {
    Heartbeat { timestamp: u64 },
    Status { status: String, details: Option<String> },
    DatasetLoaded(LoadSummary),
    LoadFailed { kind: ErrorKind, message: String },
}

impl SseEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::Status { .. } => "status",
            Self::DatasetLoaded(_) => "dataset_loaded",
            Self::LoadFailed { .. } => "load_failed",
        }
    }

    fn to_event(&self, seq: u64) -> Event {
        let data = serde_json::to_string(self).unwrap_or_default();
        Event::default().event(self.name()).id(seq.to_string()).data(data)
    }
}

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    source: DataSource,
    sessions: usize,
    messages: usize,
    /// Set when the load produced a single session, which the UI opens directly
    open_session: Option<String>,
}

impl LoadSummary {
    fn of(snapshot: &Snapshot, source: DataSource) -> Self {
        Self {
            source,
            sessions: snapshot.session_count(),
            messages: snapshot.message_count,
            open_session: snapshot.sole_session().map(str::to_string),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum LoadState {
    Loading,
    /// The remote source is unusable; the UI offers the manual upload
    AwaitingUpload { message: String },
    Ready(LoadSummary),
    Failed { kind: ErrorKind, message: String },
}

/// Global application state shared across all HTTP handlers.
struct AppState {
    start_time: Instant,
    event_tx: broadcast::Sender<(u64, SseEvent)>,
    seq: AtomicU64,
    config: Config,
    client: Option<RemoteClient>,
    dataset: Arc<Dataset>,
    load_state: RwLock<LoadState>,
    diagnostics: RwLock<Vec<Diagnostic>>,
    fetch_abort: Mutex<FetchSlot>,
}

/// Ownership of the load state by remote fetches, keyed by generation number.
enum FetchSlot {
    Idle,
    Running(u64, AbortHandle),
    /// Aborted through `/api/reload/cancel`; the fetch still reports its failure
    Cancelled(u64),
}

impl AppState {
    fn new(config: Config) -> Arc<Self> {
        let client = config
            .endpoint
            .clone()
            .map(|endpoint| RemoteClient::new(endpoint, config.token.clone()));
        let initial = if client.is_some() {
            LoadState::Loading
        } else {
            LoadState::AwaitingUpload {
                message: "No remote endpoint configured. Upload a .xlsx or .json export.".to_string(),
            }
        };
        let (event_tx, _) = broadcast::channel::<(u64, SseEvent)>(100);

        Arc::new(Self {
            start_time: Instant::now(),
            event_tx,
            seq: AtomicU64::new(1),
            config,
            client,
            dataset: Dataset::new(),
            load_state: RwLock::new(initial),
            diagnostics: RwLock::new(Vec::new()),
            fetch_abort: Mutex::new(FetchSlot::Idle),
        })
    }

    /// Get next sequence number for SSE events (ensures ordering)
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Broadcast an event to all connected SSE clients
    fn broadcast(&self, event: SseEvent) {
        let seq = self.next_seq();
        let _ = self.event_tx.send((seq, event)); // no subscribers is fine
    }

    async fn set_state(&self, next: LoadState) {
        *self.load_state.write().await = next;
    }

    /// Aggregate `messages` and swap the result in as the current dataset.
    async fn install(
        &self,
        source: DataSource,
        messages: Vec<CanonicalMessage>,
        collector: Collector,
    ) -> LoadSummary {
        let threads = aggregate(messages, &collector);
        let snapshot = Snapshot::new(source, threads);
        let summary = LoadSummary::of(&snapshot, source);
        self.dataset.replace(snapshot).await;
        *self.diagnostics.write().await = collector.into_events();

        info!(
            "Loaded {} sessions ({} messages) from {:?}",
            summary.sessions, summary.messages, source
        );
        self.set_state(LoadState::Ready(summary.clone())).await;
        self.broadcast(SseEvent::DatasetLoaded(summary.clone()));
        summary
    }

    /// Record a failed load. Only remote failures on an empty dataset move
    /// the load state; a failed upload leaves the screen where it was.
    async fn fail(&self, source: DataSource, err: &LoadError, collector: Collector) {
        warn!("Load from {:?} failed: {}", source, err);
        *self.diagnostics.write().await = collector.into_events();

        if source == DataSource::Remote && self.dataset.snapshot().await.is_empty() {
            let next = if err.offers_upload() {
                LoadState::AwaitingUpload { message: err.user_message() }
            } else {
                LoadState::Failed { kind: err.kind(), message: err.user_message() }
            };
            self.set_state(next).await;
        }
        self.broadcast(SseEvent::LoadFailed {
            kind: err.kind(),
            message: err.user_message(),
        });
    }

    fn fetch_slot(&self) -> std::sync::MutexGuard<'_, FetchSlot> {
        self.fetch_abort.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new fetch, aborting whichever one was running.
    fn arm_fetch(&self, handle: AbortHandle) -> u64 {
        let generation = self.next_seq();
        let previous = std::mem::replace(&mut *self.fetch_slot(), FetchSlot::Running(generation, handle));
        if let FetchSlot::Running(_, previous) = previous {
            previous.abort();
        }
        generation
    }

    /// Release the slot if it still belongs to `generation`. Returns false
    /// when a newer fetch has taken over, even one that already finished.
    fn disarm_fetch(&self, generation: u64) -> bool {
        let mut slot = self.fetch_slot();
        let owned = match &*slot {
            FetchSlot::Running(current, _) | FetchSlot::Cancelled(current) => *current == generation,
            FetchSlot::Idle => false,
        };
        if owned {
            *slot = FetchSlot::Idle;
        }
        owned
    }

    fn cancel_fetch(&self) -> bool {
        let mut slot = self.fetch_slot();
        match std::mem::replace(&mut *slot, FetchSlot::Idle) {
            FetchSlot::Running(generation, handle) => {
                handle.abort();
                *slot = FetchSlot::Cancelled(generation);
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Run one remote fetch and install the result.
async fn load_remote(state: &Arc<AppState>, range: FetchRange) -> Result<LoadSummary, ApiError> {
    let client = state.client.clone().ok_or(ApiError::RemoteDisabled)?;

    let (fetch, handle) = abortable(async move { client.search_all(&range).await });
    let generation = state.arm_fetch(handle);
    if state.dataset.snapshot().await.is_empty() {
        state.set_state(LoadState::Loading).await;
    }
    state.broadcast(SseEvent::Status {
        status: "loading".to_string(),
        details: state.client.as_ref().map(|c| c.endpoint().to_string()),
    });

    let outcome = fetch.await;
    if !state.disarm_fetch(generation) {
        // superseded by a newer reload, which owns the load state now
        return Err(LoadError::Aborted.into());
    }

    let collector = Collector::new();
    let result = outcome
        .unwrap_or(Err(LoadError::Aborted))
        .and_then(|payload| normalize_payload(payload, state.config.unknown_author, &collector));

    match result {
        Ok(messages) => Ok(state.install(DataSource::Remote, messages, collector).await),
        Err(e) => {
            state.fail(DataSource::Remote, &e, collector).await;
            Err(e.into())
        }
    }
}

/// Parse a file body and install it. Used by uploads and the import watcher.
async fn load_file(
    state: &AppState,
    source: DataSource,
    name: &str,
    bytes: &[u8],
) -> Result<LoadSummary, LoadError> {
    let collector = Collector::new();
    match upload::parse_file(name, bytes, state.config.unknown_author, &collector) {
        Ok(messages) => Ok(state.install(source, messages, collector).await),
        Err(e) => {
            state.fail(source, &e, collector).await;
            Err(e)
        }
    }
}

async fn import_path(state: &AppState, path: PathBuf) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            info!("Importing {}", path.display());
            if let Err(e) = load_file(state, DataSource::ImportDir, &name, &bytes).await {
                warn!("Import of {} failed: {}", path.display(), e);
            }
        }
        Err(e) => error!("Failed to read {}: {}", path.display(), e),
    }
}

// ============================================================================
// Health & Status
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    version: &'static str,
    sessions: usize,
    source: Option<DataSource>,
    loaded_at: Option<DateTime<Utc>>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshot = state.dataset.snapshot().await;
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        sessions: snapshot.session_count(),
        source: snapshot.source,
        loaded_at: snapshot.loaded_at,
    })
}

async fn status(State(state): State<Arc<AppState>>) -> Json<LoadState> {
    Json(state.load_state.read().await.clone())
}

#[derive(Serialize)]
struct DiagnosticsResponse {
    events: Vec<Diagnostic>,
}

async fn diagnostics(State(state): State<Arc<AppState>>) -> Json<DiagnosticsResponse> {
    Json(DiagnosticsResponse {
        events: state.diagnostics.read().await.clone(),
    })
}

// ============================================================================
// SSE Stream Endpoint
// ============================================================================

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();

    let heartbeat_state = state.clone();
    let heartbeat = stream::unfold((), move |()| {
        let s = heartbeat_state.clone();
        async move {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            let event = SseEvent::Heartbeat { timestamp: unix_now() };
            Some((Ok(event.to_event(s.next_seq())), ()))
        }
    });

    let broadcast_stream = stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok((seq, event)) => return Some((Ok(event.to_event(seq)), rx)),
                // a slow client missed some events; keep streaming
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE client lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let init_seq = state.next_seq();
    let init_event = stream::once(async move {
        let event = SseEvent::Status {
            status: "connected".to_string(),
            details: Some(format!("seq: {}", init_seq)),
        };
        Ok(event.to_event(init_seq))
    });

    let merged = init_event.chain(tokio_stream::StreamExt::merge(heartbeat, broadcast_stream));

    Sse::new(merged).keep_alive(KeepAlive::default())
}

// ============================================================================
// Session Endpoints
// ============================================================================

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<SessionFilter>,
) -> Json<SessionList> {
    let snapshot = state.dataset.snapshot().await;
    Json(view::list_sessions(&snapshot, &filter))
}

async fn session_thread(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<ThreadView>, ApiError> {
    let snapshot = state.dataset.snapshot().await;
    let thread = snapshot
        .thread(&session_id)
        .ok_or_else(|| ApiError::SessionNotFound(session_id.clone()))?;
    Ok(Json(view::thread_view(
        thread,
        snapshot.neighbors(&session_id),
        &query,
        Utc::now().date_naive(),
    )))
}

/// Fetch one session straight from the endpoint. The loaded dataset is left alone.
async fn remote_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<ThreadView>, ApiError> {
    let client = state.client.as_ref().ok_or(ApiError::RemoteDisabled)?;
    let payload = client.search_session(&session_id).await?;

    // one-off lookup: log diagnostics, keep the last load's list intact
    let messages = normalize_payload(payload, state.config.unknown_author, &TracingSink)?;
    let threads = aggregate(messages, &TracingSink);
    let thread = threads
        .iter()
        .find(|t| t.summary.session_id == session_id)
        .ok_or_else(|| ApiError::SessionNotFound(session_id.clone()))?;

    Ok(Json(view::thread_view(
        thread,
        (None, None),
        &query,
        Utc::now().date_naive(),
    )))
}

// ============================================================================
// Loading Endpoints
// ============================================================================

async fn upload_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<LoadSummary>, ApiError> {
    let name = headers
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| urlencoding::decode(s).ok())
        .map(|s| s.into_owned())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing x-filename header".to_string()))?;

    info!("Upload {} ({} bytes)", name, body.len());
    let summary = load_file(&state, DataSource::Upload, &name, &body).await?;
    Ok(Json(summary))
}

/// Optional overrides for a reload; unset fields use the configured range
#[derive(Debug, Default, Deserialize)]
struct ReloadRequest {
    tenant: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

async fn reload(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<LoadSummary>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ReloadRequest::default()
    } else {
        serde_json::from_slice::<ReloadRequest>(&body)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let mut range = state.config.fetch_range(Utc::now());
    if let Some(tenant) = request.tenant {
        range.tenant = tenant;
    }
    if let Some(start) = request.start_date {
        range.start_date = start;
    }
    if let Some(end) = request.end_date {
        range.end_date = end;
    }

    Ok(Json(load_remote(&state, range).await?))
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_reload(State(state): State<Arc<AppState>>) -> Json<CancelResponse> {
    let cancelled = state.cancel_fetch();
    if cancelled {
        info!("Remote fetch cancelled");
    }
    Json(CancelResponse { cancelled })
}

#[derive(Serialize)]
struct CurlResponse {
    command: String,
}

async fn curl_command(State(state): State<Arc<AppState>>) -> Result<Json<CurlResponse>, ApiError> {
    let client = state.client.as_ref().ok_or(ApiError::RemoteDisabled)?;
    Ok(Json(CurlResponse {
        command: client.curl_command(&state.config.fetch_range(Utc::now())),
    }))
}

// ============================================================================
// Main
// ============================================================================

fn router(state: Arc<AppState>) -> Router {
    let static_dir = state.config.static_dir.clone();
    Router::new()
        // Health
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/diagnostics", get(diagnostics))
        // SSE
        .route("/api/stream", get(stream_events))
        // Sessions
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{session_id}/thread", get(session_thread))
        .route("/api/remote/sessions/{session_id}", get(remote_session))
        // Loading (10MB limit)
        .route("/api/upload", post(upload_file))
        .route("/api/reload", post(reload))
        .route("/api/reload/cancel", post(cancel_reload))
        .route("/api/curl", get(curl_command))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        // Static files
        .fallback_service(ServeDir::new(static_dir).append_index_html_on_directories(true))
        .with_state(state)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("transcript_viewer=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env();
    let port = config.port;
    let import_dir = config.import_dir.clone();
    let state = AppState::new(config);

    // Startup fetch
    if state.client.is_some() {
        let fetch_state = state.clone();
        tokio::spawn(async move {
            let range = fetch_state.config.fetch_range(Utc::now());
            if let Err(e) = load_remote(&fetch_state, range).await {
                warn!("Startup fetch failed: {}", e);
            }
        });
    } else {
        info!("VIEWER_ENDPOINT_URL not set, waiting for an upload");
    }

    // Import directory: newest export at startup (when there is no remote), then watch
    if let Some(dir) = import_dir {
        let import_state = state.clone();
        tokio::spawn(async move {
            if import_state.client.is_none() {
                if let Some(path) = watcher::latest_importable(&dir) {
                    import_path(&import_state, path).await;
                }
            }
            let mut rx = watcher::spawn(dir);
            while let Some(path) = rx.recv().await {
                import_path(&import_state, path).await;
            }
        });
    }

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("transcript-viewer v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::{Request, StatusCode}};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const EXPORT: &str = r#"[
        {"session_id":"S1","author":"whatsapp:+5551999999999","first_message_text":"Oi","conversations":[
            {"author":"bot","message":"Olá!","timestamp":"2025-10-20T10:00:00Z"},
            {"author":"customer","message":"Oi","timestamp":"2025-10-20T10:00:00Z"}
        ]}
    ]"#;

    fn test_state(vars: &[(&str, String)]) -> Arc<AppState> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        AppState::new(Config::from_lookup(move |key| {
            vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        }))
    }

    async fn call(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn upload_req(name: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header("x-filename", urlencoding::encode(name).into_owned())
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/webhook")
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state(&[]);
        let (status, body) = call(&state, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_index_marks_cards_by_exact_session_id() {
        let static_dir = format!("{}/static", env!("CARGO_MANIFEST_DIR"));
        let state = test_state(&[("VIEWER_STATIC_DIR", static_dir)]);
        let response = router(state).oneshot(get_req("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let page = String::from_utf8_lossy(&bytes);
        // opening session "1" must not also mark "11"
        assert!(page.contains("el.dataset.session = s.session_id"));
        assert!(page.contains("c.dataset.session === id"));
        assert!(!page.contains(".endsWith(id)"));
    }

    #[tokio::test]
    async fn test_without_endpoint_awaits_upload() {
        let state = test_state(&[]);
        let (_, body) = call(&state, get_req("/api/status")).await;
        assert_eq!(body["state"], "awaiting_upload");

        let (status, body) = call(&state, post_req("/api/reload")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("upload"));
    }

    #[tokio::test]
    async fn test_upload_then_browse() {
        let state = test_state(&[]);

        let (status, body) = call(&state, upload_req("export final.json", EXPORT)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "upload");
        assert_eq!(body["sessions"], 1);
        assert_eq!(body["messages"], 2);
        assert_eq!(body["open_session"], "S1");

        let (_, body) = call(&state, get_req("/api/status")).await;
        assert_eq!(body["state"], "ready");
        assert_eq!(body["open_session"], "S1");

        let (_, body) = call(&state, get_req("/api/sessions?q=oi&min_messages=2")).await;
        assert_eq!(body["sessions"][0]["session_id"], "S1");
        assert_eq!(body["sessions"][0]["contact"], "5551999999999");
        assert_eq!(body["filters_active"], true);
        assert_eq!(body["bounds"]["max_messages"], 100);

        let (status, body) = call(&state, get_req("/api/sessions/S1/thread?q=ol%C3%A1")).await;
        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().unwrap();
        assert_eq!(items[0]["kind"], "separator");
        assert_eq!(items[1]["author"], "customer");
        assert_eq!(items[2]["message"], "Olá!");
        assert_eq!(body["matches"], json!([1]));
        assert_eq!(body["scroll_to"], 1);

        let (_, body) = call(&state, get_req("/api/diagnostics")).await;
        let events = body["events"].as_array().unwrap();
        assert!(events.iter().any(|e| e["event"] == "sessions_aggregated"));
    }

    #[tokio::test]
    async fn test_upload_errors() {
        let state = test_state(&[]);

        let (status, body) = call(&state, upload_req("export.csv", "a,b")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "unsupported");

        let (status, body) = call(
            &state,
            upload_req("summary.json", r#"[{"session_id":"S1","count_messages":4,"first_message_text":"Oi"}]"#),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("conversations"));

        let missing_header = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .body(Body::from(EXPORT))
            .unwrap();
        let (status, _) = call(&state, missing_header).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // failed uploads leave the load state alone
        let (_, body) = call(&state, get_req("/api/status")).await;
        assert_eq!(body["state"], "awaiting_upload");
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let state = test_state(&[]);
        let (status, _) = call(&state, get_req("/api/sessions/nope/thread")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reload_from_remote() {
        let upstream = Router::new().route(
            "/webhook",
            axum::routing::post(|Json(body): Json<Value>| async move {
                assert_eq!(body["filter"][0]["tenant"], "acme");
                Json(json!({ "success": true, "data": serde_json::from_str::<Value>(EXPORT).unwrap() }))
            }),
        );
        let endpoint = serve(upstream).await;
        let state = test_state(&[("VIEWER_ENDPOINT_URL", endpoint)]);

        let request = Request::builder()
            .method("POST")
            .uri("/api/reload")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"tenant":"acme"}"#))
            .unwrap();
        let (status, body) = call(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "remote");
        assert_eq!(body["sessions"], 1);

        let (_, body) = call(&state, get_req("/api/curl")).await;
        assert!(body["command"].as_str().unwrap().contains("searchAll"));
    }

    #[tokio::test]
    async fn test_unreachable_remote_offers_upload() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let state = test_state(&[("VIEWER_ENDPOINT_URL", format!("http://{addr}/webhook"))]);

        let (status, body) = call(&state, post_req("/api/reload")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "connectivity");

        let (_, body) = call(&state, get_req("/api/status")).await;
        assert_eq!(body["state"], "awaiting_upload");
        assert!(body["message"].as_str().unwrap().ends_with("Use the manual upload instead."));
    }

    #[tokio::test]
    async fn test_cancel_running_reload() {
        let upstream = Router::new().route(
            "/webhook",
            axum::routing::post(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Json(json!([]))
            }),
        );
        let endpoint = serve(upstream).await;
        let state = test_state(&[("VIEWER_ENDPOINT_URL", endpoint)]);

        let (_, body) = call(&state, post_req("/api/reload/cancel")).await;
        assert_eq!(body["cancelled"], false);

        let reload_state = state.clone();
        let pending = tokio::spawn(async move { call(&reload_state, post_req("/api/reload")).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (_, body) = call(&state, post_req("/api/reload/cancel")).await;
        assert_eq!(body["cancelled"], true);

        let (status, body) = pending.await.unwrap();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "aborted");

        let (_, body) = call(&state, get_req("/api/status")).await;
        assert_eq!(body["state"], "awaiting_upload");
    }

    #[test]
    fn test_superseded_fetch_never_owns_state() {
        let state = test_state(&[]);
        let (first, _) = AbortHandle::new_pair();
        let (second, _) = AbortHandle::new_pair();

        let g1 = state.arm_fetch(first.clone());
        let g2 = state.arm_fetch(second);
        assert!(first.is_aborted());

        // the newer fetch finishes before the old task resumes
        assert!(state.disarm_fetch(g2));
        assert!(!state.disarm_fetch(g1));
        assert!(!state.cancel_fetch());
    }

    #[test]
    fn test_cancelled_fetch_still_reports() {
        let state = test_state(&[]);
        let (handle, _) = AbortHandle::new_pair();
        let generation = state.arm_fetch(handle.clone());

        assert!(state.cancel_fetch());
        assert!(handle.is_aborted());
        assert!(!state.cancel_fetch());
        assert!(state.disarm_fetch(generation));
        assert!(!state.disarm_fetch(generation));

        // a reload started after the cancel takes the slot over
        let (late, _) = AbortHandle::new_pair();
        let g_late = state.arm_fetch(late);
        assert!(state.cancel_fetch());
        let (newest, _) = AbortHandle::new_pair();
        let g_newest = state.arm_fetch(newest);
        assert!(!state.disarm_fetch(g_late));
        assert!(state.disarm_fetch(g_newest));
    }

    #[tokio::test]
    async fn test_remote_session_does_not_touch_dataset() {
        let upstream = Router::new().route(
            "/webhook",
            axum::routing::post(|Json(body): Json<Value>| async move {
                let id = body["filter"][0]["session_id"].as_str().unwrap_or("").to_string();
                Json(json!([{ "session_id": id, "author": "cliente", "message": "Oi", "timestamp": "2025-10-20T10:00:00Z" }]))
            }),
        );
        let endpoint = serve(upstream).await;
        let state = test_state(&[("VIEWER_ENDPOINT_URL", endpoint)]);

        let (status, body) = call(&state, get_req("/api/remote/sessions/X9")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["session_id"], "X9");
        assert_eq!(body["summary"]["message_count"], 1);

        assert!(state.dataset.snapshot().await.is_empty());
    }

    #[test]
    fn test_sse_event_shape() {
        let event = SseEvent::DatasetLoaded(LoadSummary {
            source: DataSource::Upload,
            sessions: 2,
            messages: 5,
            open_session: None,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "dataset_loaded");
        assert_eq!(json["sessions"], 2);
        assert_eq!(event.name(), "dataset_loaded");
    }
}
