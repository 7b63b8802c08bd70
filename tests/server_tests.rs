//! Protocol tests for the server client against an in-process stub server.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use flowsync::config::ExtractorSettings;
use flowsync::extract::Registry;
use flowsync::server::{AuthMode, ServerClient, ServerOptions};
use flowsync::watch::{EngineOptions, SyncEngine};
use flowsync::SyncError;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct StubState {
    flows: Value,
    etag: String,
    rev: String,
    get_count: usize,
    post_count: usize,
    conflict_next: bool,
    reject_next_post: bool,
}

type Shared = Arc<Mutex<StubState>>;

async fn get_flows(State(state): State<Shared>, headers: HeaderMap) -> impl IntoResponse {
    let mut stub = state.lock().unwrap();
    stub.get_count += 1;
    if let Some(tag) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if tag == stub.etag {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }
    let body = json!({"flows": stub.flows, "rev": stub.rev});
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ETAG, stub.etag.parse().unwrap());
    (StatusCode::OK, response_headers, Json(body)).into_response()
}

async fn post_flows(State(state): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    let mut stub = state.lock().unwrap();
    stub.post_count += 1;
    if stub.reject_next_post {
        stub.reject_next_post = false;
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if stub.conflict_next {
        stub.conflict_next = false;
        return StatusCode::CONFLICT.into_response();
    }
    stub.flows = body.get("flows").cloned().unwrap_or(json!([]));
    stub.rev = format!("rev-{}", stub.post_count);
    stub.etag = format!("etag-{}", stub.post_count);
    Json(json!({"rev": stub.rev})).into_response()
}

async fn start_stub(state: Shared) -> String {
    let app = Router::new()
        .route("/flows", get(get_flows).post(post_flows))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn seeded_state() -> Shared {
    Arc::new(Mutex::new(StubState {
        flows: json!([{"id": "n1", "type": "inject", "x": 1, "y": 2, "wires": []}]),
        etag: "etag-0".to_string(),
        rev: "rev-0".to_string(),
        ..Default::default()
    }))
}

fn client_for(url: &str) -> ServerClient {
    ServerClient::new(ServerOptions::new(url, AuthMode::Anonymous)).unwrap()
}

/// A second fetch sends the stored ETag and observes 304.
#[tokio::test]
async fn conditional_fetch_honors_etag() {
    let state = seeded_state();
    let url = start_stub(state.clone()).await;
    let client = client_for(&url);

    let first = client.fetch(false).await.unwrap();
    assert!(first.changed);
    assert_eq!(first.document.unwrap().len(), 1);
    assert_eq!(client.last_etag().as_deref(), Some("etag-0"));
    assert_eq!(client.last_revision().as_deref(), Some("rev-0"));

    let second = client.fetch(false).await.unwrap();
    assert!(!second.changed);
    assert!(second.document.is_none());

    // Forcing skips the precondition and re-downloads.
    let forced = client.fetch(true).await.unwrap();
    assert!(forced.changed);
}

/// A conflicting deploy resynchronizes ETag/revision to the server's
/// latest, surfaces a conflict error, and never retries the deploy.
#[tokio::test]
async fn deploy_conflict_resyncs_and_aborts() {
    let state = seeded_state();
    let url = start_stub(state.clone()).await;
    let client = client_for(&url);

    let fetched = client.fetch(false).await.unwrap();
    let document = fetched.document.unwrap();

    // Another editor moved the server ahead of us.
    {
        let mut stub = state.lock().unwrap();
        stub.rev = "rev-other".to_string();
        stub.etag = "etag-other".to_string();
        stub.conflict_next = true;
    }

    let err = client.deploy(&document, true).await.unwrap_err();
    assert!(matches!(err, SyncError::Conflict(_)), "got: {err}");

    // Local tracking now matches the server's latest.
    assert_eq!(client.last_revision().as_deref(), Some("rev-other"));
    assert_eq!(client.last_etag().as_deref(), Some("etag-other"));
    // Exactly one deploy attempt hit the wire.
    assert_eq!(state.lock().unwrap().post_count, 1);
}

/// An expired session re-authenticates once and retries the deploy once.
#[tokio::test]
async fn deploy_retries_once_after_auth_expiry() {
    let state = seeded_state();
    let url = start_stub(state.clone()).await;
    let client = client_for(&url);

    let fetched = client.fetch(false).await.unwrap();
    let document = fetched.document.unwrap();

    state.lock().unwrap().reject_next_post = true;
    client.deploy(&document, true).await.unwrap();
    assert_eq!(state.lock().unwrap().post_count, 2);
}

/// More automated deploys than the convergence limit inside the window
/// pause convergence: the ETag survives deploys until a user-initiated
/// deploy clears the pause and empties the cycle history.
#[tokio::test]
async fn oscillation_pauses_and_user_upload_resumes() {
    let state = seeded_state();
    let url = start_stub(state.clone()).await;
    let mut options = ServerOptions::new(&url, AuthMode::Anonymous);
    options.convergence_limit = 2;
    let client = ServerClient::new(options).unwrap();

    let document = client.fetch(false).await.unwrap().document.unwrap();

    // Automated deploys: the third exceeds the limit of 2 in the window.
    for _ in 0..3 {
        client.deploy(&document, false).await.unwrap();
    }
    assert!(client.convergence_paused());

    // While paused, a fetch stores an ETag and deploys do not clear it
    // (the assume-changed re-download step is suppressed).
    client.fetch(true).await.unwrap();
    assert!(client.last_etag().is_some());
    client.deploy(&document, false).await.unwrap();
    assert!(client.last_etag().is_some());
    assert!(client.convergence_paused());

    // A user-initiated deploy resumes convergence and empties the history.
    client.deploy(&document, true).await.unwrap();
    assert!(!client.convergence_paused());
    let stats = client.stats();
    assert_eq!(stats.uploads, 1, "automated deploys must not count");
    // Convergence no longer paused: the ETag was cleared again.
    assert!(stats.etag.is_none());
}

/// Rate-limit denial aborts the call before any request is sent.
#[tokio::test]
async fn rate_limit_denial_sends_no_request() {
    let state = seeded_state();
    let url = start_stub(state.clone()).await;
    let mut options = ServerOptions::new(&url, AuthMode::Anonymous);
    options.requests_per_minute = 2;
    let client = ServerClient::new(options).unwrap();

    // connect() consumes one admission, fetch() the second.
    client.connect().await.unwrap();
    client.fetch(true).await.unwrap();
    let gets_before = state.lock().unwrap().get_count;

    let err = client.fetch(true).await.unwrap_err();
    assert!(matches!(err, SyncError::RateLimit(_)), "got: {err}");
    assert_eq!(state.lock().unwrap().get_count, gets_before);
}

/// The engine's download pipeline writes the document and explodes it into
/// the tree.
#[tokio::test]
async fn engine_download_pipeline_explodes_tree() {
    let state = Arc::new(Mutex::new(StubState {
        flows: json!([
            {"id": "t1", "type": "tab", "label": "Flow"},
            {"id": "n1", "type": "function", "z": "t1", "name": "fn",
             "func": "return msg;", "x": 100, "y": 100, "wires": []}
        ]),
        etag: "etag-0".to_string(),
        rev: "rev-0".to_string(),
        ..Default::default()
    }));
    let url = start_stub(state.clone()).await;

    let workdir = TempDir::new().unwrap();
    let flows_path = workdir.path().join("flows.json");
    let src_dir = workdir.path().join("src");
    std::fs::create_dir_all(&src_dir).unwrap();

    let client = Arc::new(client_for(&url));
    let registry = Registry::builtin(&ExtractorSettings::default());
    let engine = SyncEngine::new(
        client,
        registry,
        flows_path.clone(),
        src_dir.clone(),
        EngineOptions::default(),
    );

    let changed = engine.download_and_explode(true).await.unwrap();
    assert!(changed);
    assert!(flows_path.exists());
    assert!(src_dir.join("t1/n1.js").exists());
    assert!(src_dir.join(".flow-skeleton.json").exists());

    // Stable document: nothing was pushed back.
    assert_eq!(state.lock().unwrap().post_count, 0);

    // Unchanged server: the next poll-style download is a no-op.
    let changed = engine.download_and_explode(false).await.unwrap();
    assert!(!changed);
}
