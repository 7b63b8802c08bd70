//! HTTP client for the flows server.
//!
//! Wraps a `reqwest` session with auth handling, conditional fetch via
//! ETag, optimistic-concurrency deploy via revision tokens, per-process
//! counters, and convergence (oscillation) tracking. All protocol state
//! lives behind one mutex, held only for assignments.

use super::rate_limit::RateLimiter;
use crate::error::SyncError;
use crate::graph::Node;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const API_VERSION_HEADER: (&str, &str) = ("Node-RED-API-Version", "v2");
const DEPLOY_TYPE_HEADER: (&str, &str) = ("Node-RED-Deployment-Type", "full");

/// Max deploy cycles inside the window before automatic re-downloads pause.
pub const DEFAULT_CONVERGENCE_LIMIT: usize = 5;
/// Convergence detection window.
pub const DEFAULT_CONVERGENCE_WINDOW: Duration = Duration::from_secs(60);

/// Authentication for the flows server. Exactly one mode is selected at
/// construction; an unknown mode string is a fatal configuration error.
#[derive(Debug, Clone)]
pub enum AuthMode {
    Anonymous,
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl AuthMode {
    /// Resolve an auth mode from configuration strings.
    pub fn from_config(
        kind: &str,
        username: Option<String>,
        password: Option<String>,
        token: Option<String>,
    ) -> Result<Self, SyncError> {
        match kind {
            "none" => Ok(AuthMode::Anonymous),
            "basic" => {
                let username = username
                    .ok_or_else(|| SyncError::Config("basic auth requires a username".into()))?;
                let password = password
                    .ok_or_else(|| SyncError::Config("basic auth requires a password".into()))?;
                Ok(AuthMode::Basic { username, password })
            }
            "bearer" => {
                let token =
                    token.ok_or_else(|| SyncError::Config("bearer auth requires a token".into()))?;
                Ok(AuthMode::Bearer { token })
            }
            other => Err(SyncError::Config(format!(
                "unknown authentication type: {other}"
            ))),
        }
    }
}

/// Construction options for [`ServerClient`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub url: String,
    pub auth: AuthMode,
    pub verify_tls: bool,
    pub convergence_limit: usize,
    pub convergence_window: Duration,
    pub requests_per_minute: usize,
    pub requests_per_ten_minutes: usize,
}

impl ServerOptions {
    pub fn new(url: impl Into<String>, auth: AuthMode) -> Self {
        ServerOptions {
            url: url.into(),
            auth,
            verify_tls: true,
            convergence_limit: DEFAULT_CONVERGENCE_LIMIT,
            convergence_window: DEFAULT_CONVERGENCE_WINDOW,
            requests_per_minute: super::DEFAULT_PER_MINUTE,
            requests_per_ten_minutes: super::DEFAULT_PER_TEN_MINUTES,
        }
    }
}

/// Result of a fetch: `changed=false` means the server answered 304.
#[derive(Debug)]
pub struct FetchOutcome {
    pub changed: bool,
    pub document: Option<Vec<Node>>,
}

/// Counter snapshot for the status command and external dashboards.
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub downloads: u64,
    pub uploads: u64,
    pub errors: u64,
    pub last_download_ago: Option<Duration>,
    pub last_upload_ago: Option<Duration>,
    pub revision: Option<String>,
    pub etag: Option<String>,
    pub convergence_paused: bool,
}

#[derive(Default)]
struct ClientState {
    authenticated: bool,
    etag: Option<String>,
    revision: Option<String>,
    downloads: u64,
    uploads: u64,
    errors: u64,
    last_download: Option<Instant>,
    last_upload: Option<Instant>,
    cycles: Vec<Instant>,
    convergence_paused: bool,
}

pub struct ServerClient {
    http: reqwest::Client,
    url: String,
    auth: AuthMode,
    limiter: RateLimiter,
    convergence_limit: usize,
    convergence_window: Duration,
    state: Mutex<ClientState>,
}

impl ServerClient {
    /// Build a client. Fails fast on bad TLS/auth configuration.
    pub fn new(options: ServerOptions) -> Result<Self, SyncError> {
        if !options.verify_tls {
            warn!("TLS verification disabled");
        }
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(!options.verify_tls)
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(ServerClient {
            http,
            url: options.url.trim_end_matches('/').to_string(),
            auth: options.auth,
            limiter: RateLimiter::new(
                options.requests_per_minute,
                options.requests_per_ten_minutes,
            ),
            convergence_limit: options.convergence_limit,
            convergence_window: options.convergence_window,
            state: Mutex::new(ClientState::default()),
        })
    }

    fn flows_url(&self) -> String {
        format!("{}/flows", self.url)
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            AuthMode::Anonymous => request,
            AuthMode::Basic { username, password } => request.basic_auth(username, Some(password)),
            AuthMode::Bearer { token } => request.bearer_auth(token),
        }
    }

    fn check_rate(&self, what: &str) -> Result<(), SyncError> {
        if self.limiter.try_acquire() {
            return Ok(());
        }
        let stats = self.limiter.stats();
        Err(SyncError::RateLimit(format!(
            "{what}: {}/{} requests/min, {}/{} requests/10min",
            stats.last_minute, stats.per_minute, stats.last_ten_minutes, stats.per_ten_minutes
        )))
    }

    fn count_error(&self) {
        let mut state = self.state.lock().expect("client state lock poisoned");
        state.errors += 1;
    }

    /// Explicit initial connectivity/authentication probe.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.check_rate("authentication")?;
        let response = self
            .apply_auth(self.http.get(self.flows_url()))
            .header(API_VERSION_HEADER.0, API_VERSION_HEADER.1)
            .send()
            .await
            .map_err(|e| {
                self.count_error();
                SyncError::from_http(e)
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.count_error();
            return Err(SyncError::Auth(format!(
                "server rejected credentials (status {status})"
            )));
        }
        if !status.is_success() {
            self.count_error();
            return Err(SyncError::Server(format!(
                "connect probe failed with status {status}"
            )));
        }

        let mut state = self.state.lock().expect("client state lock poisoned");
        state.authenticated = true;
        drop(state);
        info!("Connected to flows server at {}", self.url);
        Ok(())
    }

    async fn ensure_auth(&self) -> Result<(), SyncError> {
        let authenticated = {
            let state = self.state.lock().expect("client state lock poisoned");
            state.authenticated
        };
        if authenticated {
            return Ok(());
        }
        self.connect().await
    }

    /// Conditional fetch of the flows document.
    ///
    /// Sends the stored ETag as `If-None-Match` unless forced; a 304 yields
    /// `changed=false`. The caller owns writing the document to disk.
    pub async fn fetch(&self, force: bool) -> Result<FetchOutcome, SyncError> {
        self.ensure_auth().await?;
        self.check_rate("fetch")?;

        let etag = {
            let state = self.state.lock().expect("client state lock poisoned");
            state.etag.clone()
        };

        let mut request = self
            .apply_auth(self.http.get(self.flows_url()))
            .header(API_VERSION_HEADER.0, API_VERSION_HEADER.1);
        if !force {
            if let Some(etag) = etag {
                request = request.header("If-None-Match", etag);
            }
        }

        let response = request.send().await.map_err(|e| {
            self.count_error();
            SyncError::from_http(e)
        })?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome {
                changed: false,
                document: None,
            });
        }
        if !response.status().is_success() {
            self.count_error();
            return Err(SyncError::Server(format!(
                "fetch failed with status {}",
                response.status()
            )));
        }

        let new_etag = response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: Value = response.json().await.map_err(|e| {
            self.count_error();
            SyncError::from_http(e)
        })?;
        let (document, new_revision) = parse_flows_body(body)?;

        let mut state = self.state.lock().expect("client state lock poisoned");
        if let Some(etag) = new_etag {
            state.etag = Some(etag);
        }
        if let Some(revision) = new_revision {
            if state.revision.as_deref() != Some(revision.as_str()) {
                info!(
                    "Flows changed (rev: {} -> {revision})",
                    state.revision.as_deref().unwrap_or("initial")
                );
            }
            state.revision = Some(revision);
        }
        state.downloads += 1;
        state.last_download = Some(Instant::now());
        drop(state);

        Ok(FetchOutcome {
            changed: true,
            document: Some(document),
        })
    }

    /// Deploy the full document with the last-known revision attached for
    /// optimistic concurrency.
    ///
    /// `user_initiated` marks manual uploads: they count toward statistics
    /// and clear a convergence pause. Automated deploys (canonical-form
    /// corrections) mutate revision/ETag state but are not counted.
    pub async fn deploy(&self, document: &[Node], user_initiated: bool) -> Result<(), SyncError> {
        self.ensure_auth().await?;
        self.check_rate("deploy")?;

        let revision = {
            let state = self.state.lock().expect("client state lock poisoned");
            state.revision.clone()
        };

        let body = serde_json::json!({ "flows": document });
        let mut response = self
            .deploy_request(&body, revision.as_deref())
            .send()
            .await
            .map_err(|e| {
                self.count_error();
                SyncError::from_http(e)
            })?;

        // Expired session: re-authenticate once and retry once.
        if response.status() == StatusCode::UNAUTHORIZED
            || response.status() == StatusCode::FORBIDDEN
        {
            warn!("Authentication expired, re-authenticating...");
            {
                let mut state = self.state.lock().expect("client state lock poisoned");
                state.authenticated = false;
            }
            self.ensure_auth().await?;
            self.check_rate("deploy retry")?;
            response = self
                .deploy_request(&body, revision.as_deref())
                .send()
                .await
                .map_err(|e| {
                    self.count_error();
                    SyncError::from_http(e)
                })?;
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN
            {
                self.count_error();
                return Err(SyncError::Auth("re-authentication failed".to_string()));
            }
        }

        if response.status() == StatusCode::CONFLICT {
            warn!("Conflict detected (409) - server flows changed while you were editing");
            self.resync_after_conflict().await?;
            self.count_error();
            return Err(SyncError::Conflict(
                "local changes were not deployed - server was updated by someone else".to_string(),
            ));
        }

        if !response.status().is_success() {
            self.count_error();
            return Err(SyncError::Server(format!(
                "deploy failed with status {}",
                response.status()
            )));
        }

        let result: Value = response.json().await.unwrap_or(Value::Null);
        let deploy_revision = result
            .get("rev")
            .and_then(Value::as_str)
            .map(str::to_string);

        let now = Instant::now();
        let mut state = self.state.lock().expect("client state lock poisoned");
        if let Some(revision) = deploy_revision.clone() {
            state.revision = Some(revision);
        }

        // Convergence tracking: too many deploys inside the window means an
        // upload/download feedback loop; pause automatic re-downloads.
        state.cycles.push(now);
        let window = self.convergence_window;
        state.cycles.retain(|t| now.duration_since(*t) < window);
        if state.cycles.len() > self.convergence_limit && !state.convergence_paused {
            warn!(
                "Oscillation detected: {} cycles in {}s",
                state.cycles.len(),
                window.as_secs()
            );
            warn!("Pausing convergence - manual uploads only until resumed");
            state.convergence_paused = true;
        }

        if user_initiated {
            state.uploads += 1;
            state.last_upload = Some(now);
            if state.convergence_paused {
                info!("Convergence resumed by user upload");
                state.convergence_paused = false;
                state.cycles.clear();
            }
        }

        // Clearing the ETag makes the next poll re-download and re-explode
        // the deployed state. While paused that step is suppressed to break
        // the feedback loop.
        if !state.convergence_paused {
            state.etag = None;
            debug!(
                "Deployed - ETag cleared (will re-download), rev: {:?}",
                deploy_revision
            );
        } else {
            debug!(
                "Deployed - convergence paused (ETag kept), rev: {:?}",
                deploy_revision
            );
        }

        Ok(())
    }

    fn deploy_request(&self, body: &Value, revision: Option<&str>) -> reqwest::RequestBuilder {
        let mut request = self
            .apply_auth(self.http.post(self.flows_url()))
            .header(API_VERSION_HEADER.0, API_VERSION_HEADER.1)
            .header(DEPLOY_TYPE_HEADER.0, DEPLOY_TYPE_HEADER.1)
            .json(body);
        if let Some(revision) = revision {
            request = request.query(&[("rev", revision)]);
        }
        request
    }

    /// After a conflict, adopt the server's current ETag/revision so the
    /// caller can re-derive local state from a fresh fetch.
    async fn resync_after_conflict(&self) -> Result<(), SyncError> {
        self.check_rate("conflict resync")?;
        let response = self
            .apply_auth(self.http.get(self.flows_url()))
            .header(API_VERSION_HEADER.0, API_VERSION_HEADER.1)
            .send()
            .await
            .map_err(SyncError::from_http)?;
        if !response.status().is_success() {
            return Err(SyncError::Server(format!(
                "failed to fetch latest server state: status {}",
                response.status()
            )));
        }

        let etag = response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: Value = response.json().await.map_err(SyncError::from_http)?;
        let revision = body.get("rev").and_then(Value::as_str).map(str::to_string);

        let mut state = self.state.lock().expect("client state lock poisoned");
        if let Some(revision) = revision {
            info!("Updated to server rev: {revision}");
            state.revision = Some(revision);
        }
        if let Some(etag) = etag {
            state.etag = Some(etag);
        }
        Ok(())
    }

    pub fn stats(&self) -> ServerStats {
        let state = self.state.lock().expect("client state lock poisoned");
        ServerStats {
            downloads: state.downloads,
            uploads: state.uploads,
            errors: state.errors,
            last_download_ago: state.last_download.map(|t| t.elapsed()),
            last_upload_ago: state.last_upload.map(|t| t.elapsed()),
            revision: state.revision.clone(),
            etag: state.etag.clone(),
            convergence_paused: state.convergence_paused,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.url
    }

    pub fn convergence_paused(&self) -> bool {
        self.state
            .lock()
            .expect("client state lock poisoned")
            .convergence_paused
    }

    pub fn last_etag(&self) -> Option<String> {
        self.state
            .lock()
            .expect("client state lock poisoned")
            .etag
            .clone()
    }

    pub fn last_revision(&self) -> Option<String> {
        self.state
            .lock()
            .expect("client state lock poisoned")
            .revision
            .clone()
    }
}

/// Parse a flows response body: either a bare node array or an envelope
/// carrying the array plus a revision token.
fn parse_flows_body(body: Value) -> Result<(Vec<Node>, Option<String>), SyncError> {
    match body {
        Value::Array(items) => {
            let nodes = items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(map),
                    _ => Err(SyncError::InvalidDocument(
                        "flows response contained a non-object node".to_string(),
                    )),
                })
                .collect::<Result<Vec<Node>, SyncError>>()?;
            Ok((nodes, None))
        }
        Value::Object(mut envelope) => {
            let revision = envelope
                .get("rev")
                .and_then(Value::as_str)
                .map(str::to_string);
            let flows = envelope.remove("flows").ok_or_else(|| {
                SyncError::InvalidDocument("flows response envelope without flows".to_string())
            })?;
            let Value::Array(items) = flows else {
                return Err(SyncError::InvalidDocument(
                    "flows envelope field is not an array".to_string(),
                ));
            };
            let nodes = items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(map),
                    _ => Err(SyncError::InvalidDocument(
                        "flows response contained a non-object node".to_string(),
                    )),
                })
                .collect::<Result<Vec<Node>, SyncError>>()?;
            Ok((nodes, revision))
        }
        other => Err(SyncError::InvalidDocument(format!(
            "unexpected flows response: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_mode_rejects_unknown_kind() {
        let err = AuthMode::from_config("digest", None, None, None).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn auth_mode_requires_material() {
        assert!(AuthMode::from_config("basic", Some("u".into()), None, None).is_err());
        assert!(AuthMode::from_config("bearer", None, None, None).is_err());
        assert!(AuthMode::from_config("none", None, None, None).is_ok());
    }

    #[test]
    fn parse_body_accepts_bare_array_and_envelope() {
        let (nodes, rev) = parse_flows_body(serde_json::json!([{"id": "n1"}])).unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(rev.is_none());

        let (nodes, rev) =
            parse_flows_body(serde_json::json!({"flows": [{"id": "n1"}], "rev": "abc"})).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(rev.as_deref(), Some("abc"));
    }
}
