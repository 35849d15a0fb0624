//! Origin-side session endpoint.
//!
//! One path, dispatched by method:
//!
//! - `GET` with `X-Session-ReadOnly: true`: JSON snapshot, no lease.
//! - `GET` otherwise: writable acquire. The snapshot frame is streamed, then
//!   the connection is held open with `\n` heartbeats until the peer commits,
//!   disconnects, the session timeout elapses, or the server shuts down.
//! - `POST`: single-connection writable acquire. The response streams like
//!   `GET`, and the request body, once complete, is the commit (empty means
//!   release). The outcome is written as one JSON line before the response
//!   ends. Answered with 405 when single-connection mode is off.
//! - `PUT`: commit (or release, with an empty body) the leased session.
//! - anything else: 405.
//!
//! Every response carries the version header. Snapshots only advertise
//! changeset commits to peers that sent a version of 2 or later.
//!
//! Every request must carry the shared API key; the comparison is
//! constant-time. The key is a migration aid, not a security boundary.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::{Body, BodyDataStream, Bytes};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, SessionConfig, is_loopback_host};
use crate::error::{ConfigError, LeaseError};
use crate::lease::{LeaseCache, LeaseHandle, SaveResult};
use crate::serializer::{FRAME_DELIMITER, ProtocolVersion};
use crate::session::{SessionRecord, SessionStore};
use crate::{Error, Result, VERSION};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8085;
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Frames buffered per writable stream. Heartbeats are dropped when full.
const STREAM_CHANNEL_BUFFER: usize = 8;

/// How long a single-connection result line may wait for buffer space.
const RESULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

type StreamItem = std::result::Result<Bytes, Infallible>;

const READ_ONLY_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const WRITABLE_CONTENT_TYPE: &str = "text/event-stream";

/// Configuration for the session endpoint.
#[derive(Clone)]
pub struct EndpointConfig {
    host: String,
    port: u16,
    session: SessionConfig,
    heartbeat_interval: Duration,
    max_body_bytes: usize,
    accept_single_connection: bool,
    /// Off unless [`EndpointConfig::with_dangerous_public_bind`] was called.
    allow_public_bind: bool,
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("session", &self.session)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("accept_single_connection", &self.accept_single_connection)
            .field("allow_public_bind", &self.allow_public_bind)
            .finish()
    }
}

impl EndpointConfig {
    #[must_use]
    pub fn new(session: SessionConfig) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            session,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            accept_single_connection: true,
            allow_public_bind: false,
        }
    }

    /// Endpoint settings from a loaded config file.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut endpoint = Self::new(config.session.clone())
            .with_host(config.origin.host.clone())
            .with_port(config.origin.port)
            .with_heartbeat_interval(config.origin.heartbeat_interval())
            .with_max_body_bytes(config.origin.max_body_bytes)
            .with_single_connection(config.origin.accept_single_connection);
        endpoint.allow_public_bind = config.origin.allow_public_bind;
        endpoint
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Serve writable acquires over one `POST`. When off, `POST` gets 405
    /// and peers fall back to `GET` plus `PUT`.
    #[must_use]
    pub fn with_single_connection(mut self, accept: bool) -> Self {
        self.accept_single_connection = accept;
        self
    }

    /// Allow binding on a non-localhost address.
    ///
    /// The endpoint hands out session contents to anyone holding the shared
    /// key; only expose it on a network the peer alone can reach.
    #[must_use]
    pub fn with_dangerous_public_bind(mut self) -> Self {
        self.allow_public_bind = true;
        self
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn is_localhost(&self) -> bool {
        is_loopback_host(&self.host)
    }
}

/// Header names and limits resolved once at router build time.
struct EndpointSettings {
    cookie_name: String,
    api_key_header: HeaderName,
    api_key: String,
    read_only_header: HeaderName,
    version_header: HeaderName,
    heartbeat_interval: Duration,
    max_body_bytes: usize,
    accept_single_connection: bool,
}

impl EndpointSettings {
    fn from_config(config: &EndpointConfig) -> Result<Self> {
        let session = &config.session;
        if session.api_key.is_empty() {
            return Err(ConfigError::ValidationError(
                "session.api_key must not be empty".to_string(),
            )
            .into());
        }
        if config.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "heartbeat interval must be positive".to_string(),
            )
            .into());
        }
        Ok(Self {
            cookie_name: session.cookie_name.clone(),
            api_key_header: parse_header_name(&session.api_key_header)?,
            api_key: session.api_key.clone(),
            read_only_header: parse_header_name(&session.read_only_header)?,
            version_header: parse_header_name(&session.version_header)?,
            heartbeat_interval: config.heartbeat_interval,
            max_body_bytes: config.max_body_bytes,
            accept_single_connection: config.accept_single_connection,
        })
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
        Error::Config(ConfigError::ValidationError(format!(
            "invalid header name '{name}': {e}"
        )))
    })
}

#[derive(Clone)]
struct EndpointState {
    settings: Arc<EndpointSettings>,
    leases: LeaseCache,
    shutdown: CancellationToken,
}

impl EndpointState {
    fn store(&self) -> &Arc<dyn SessionStore> {
        self.leases.store()
    }
}

// =============================================================================
// Response envelope
// =============================================================================

#[derive(Serialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    version: &'static str,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            error_code: None,
            version: VERSION,
        }
    }
}

impl ApiResponse<()> {
    fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            error_code: Some(code.to_string()),
            version: VERSION,
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &ApiResponse<T>) -> Response {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(READ_ONLY_CONTENT_TYPE))],
        bytes,
    )
        .into_response()
}

fn json_ok<T: Serialize>(data: T) -> Response {
    json_response(StatusCode::OK, &ApiResponse::success(data))
}

fn json_err(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    json_response(status, &ApiResponse::<()>::error(code, message))
}

#[derive(Serialize)]
struct CommitAck<'a> {
    session_id: &'a str,
}

/// One delimited JSON line, as written at the end of a single-connection
/// stream.
fn result_line<T: Serialize>(body: &ApiResponse<T>) -> Bytes {
    let mut line = serde_json::to_vec(body).unwrap_or_default();
    line.push(FRAME_DELIMITER);
    Bytes::from(line)
}

fn commit_result_line(session_id: &str, result: SaveResult) -> Bytes {
    match result.error_code() {
        None => result_line(&ApiResponse::success(CommitAck { session_id })),
        Some(code) => result_line(&ApiResponse::<()>::error(code, result.reason())),
    }
}

fn store_task_failed(operation: &'static str, err: &tokio::task::JoinError) -> ApiResponse<()> {
    warn!(
        target: "session_relay.endpoint",
        operation,
        error = %err,
        "session store task failed"
    );
    ApiResponse::<()>::error("internal_error", "The session store failed")
}

// =============================================================================
// Middleware
// =============================================================================

async fn log_requests(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;
    info!(
        target: "session_relay.endpoint",
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "session request"
    );
    response
}

/// Rejects requests whose Content-Length exceeds the configured limit.
async fn guard_body_size(State(limit): State<usize>, req: Request, next: Next) -> Response {
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(len) = declared {
        if len > limit {
            return json_err(
                StatusCode::BAD_REQUEST,
                "body_too_large",
                format!("Request body too large ({len} bytes); max is {limit}"),
            );
        }
    }
    next.run(req).await
}

// =============================================================================
// Dispatch
// =============================================================================

/// Constant-time comparison of the configured key and the presented one.
fn constant_time_eq(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    // Scan the full expected key even on a length mismatch.
    let mismatch = (0..a.len()).fold(a.len() ^ b.len(), |acc, i| {
        acc | usize::from(a[i] ^ b.get(i).copied().unwrap_or(!a[i]))
    });
    mismatch == 0
}

fn is_authorized(settings: &EndpointSettings, headers: &HeaderMap) -> bool {
    headers
        .get(&settings.api_key_header)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| constant_time_eq(&settings.api_key, presented))
}

/// Absent means a `V1` peer.
fn requested_version(settings: &EndpointSettings, headers: &HeaderMap) -> ProtocolVersion {
    ProtocolVersion::parse(
        headers
            .get(&settings.version_header)
            .and_then(|v| v.to_str().ok()),
    )
}

/// Absent or unparsable means writable.
fn wants_read_only(settings: &EndpointSettings, headers: &HeaderMap) -> bool {
    headers
        .get(&settings.read_only_header)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Session id from the request cookies.
fn session_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == cookie_name && !value.is_empty())
        .map(|(_, value)| value.trim_matches('"').to_string())
}

fn set_cookie_value(cookie_name: &str, session_id: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{cookie_name}={session_id}; path=/; HttpOnly; SameSite=Lax"
    ))
    .ok()
}

async fn dispatch(State(state): State<EndpointState>, req: Request) -> Response {
    let mut response = route(&state, req).await;
    response.headers_mut().insert(
        state.settings.version_header.clone(),
        HeaderValue::from_static(ProtocolVersion::LATEST.as_str()),
    );
    response
}

async fn route(state: &EndpointState, req: Request) -> Response {
    if !is_authorized(&state.settings, req.headers()) {
        return json_err(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing or invalid API key",
        );
    }

    let cookie = session_cookie(req.headers(), &state.settings.cookie_name);
    let version = requested_version(&state.settings, req.headers());
    let read_only = wants_read_only(&state.settings, req.headers());
    let method = req.method().clone();
    match method {
        Method::GET if read_only => read_only_acquire(state, cookie, version).await,
        Method::GET => writable_acquire(state, cookie, version, None).await,
        Method::POST if state.settings.accept_single_connection => {
            if read_only {
                return json_err(
                    StatusCode::BAD_REQUEST,
                    "read_only_post",
                    "Read-only sessions are fetched with GET",
                );
            }
            let body = req.into_body().into_data_stream();
            writable_acquire(state, cookie, version, Some(body)).await
        }
        Method::PUT => commit(state, cookie, req).await,
        _ => method_not_allowed(&state.settings),
    }
}

fn method_not_allowed(settings: &EndpointSettings) -> Response {
    let (allow, message) = if settings.accept_single_connection {
        ("GET, POST, PUT", "Only GET, POST and PUT are supported")
    } else {
        ("GET, PUT", "Only GET and PUT are supported")
    };
    let mut response = json_err(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", message);
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static(allow));
    response
}

/// Stores may block, so loads run on the blocking pool.
async fn load_session(
    state: &EndpointState,
    cookie: Option<String>,
    read_only: bool,
) -> std::result::Result<SessionRecord, Response> {
    let store = Arc::clone(state.store());
    tokio::task::spawn_blocking(move || store.load(cookie.as_deref(), read_only))
        .await
        .map_err(|err| {
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &store_task_failed("load", &err),
            )
        })
}

/// [`LeaseCache::save`] on the blocking pool; it ends in
/// [`SessionStore::commit`].
async fn save_session(
    leases: &LeaseCache,
    session_id: String,
    payload: Bytes,
) -> std::result::Result<SaveResult, tokio::task::JoinError> {
    let leases = leases.clone();
    tokio::task::spawn_blocking(move || leases.save(&session_id, &payload)).await
}

fn with_new_session_cookie(mut response: Response, state: &EndpointState, session_id: &str) -> Response {
    if let Some(value) = set_cookie_value(&state.settings.cookie_name, session_id) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

fn serialization_failed(session_id: &str, err: &crate::error::SerializationError) -> Response {
    warn!(
        target: "session_relay.endpoint",
        session_id = %session_id,
        error = %err,
        "failed to serialize session"
    );
    json_err(
        StatusCode::INTERNAL_SERVER_ERROR,
        "serialization_error",
        "The session could not be serialized",
    )
}

async fn read_only_acquire(
    state: &EndpointState,
    cookie: Option<String>,
    version: ProtocolVersion,
) -> Response {
    let record = match load_session(state, cookie, true).await {
        Ok(record) => record,
        Err(response) => return response,
    };
    let body = match state.leases.serializer().encode_for(&record, version) {
        Ok(body) => body,
        Err(err) => return serialization_failed(record.session_id(), &err),
    };
    debug!(
        target: "session_relay.endpoint",
        session_id = %record.session_id(),
        keys = record.len(),
        "served read-only snapshot"
    );

    let response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static(READ_ONLY_CONTENT_TYPE))],
        body,
    )
        .into_response();
    if record.is_new_session() {
        with_new_session_cookie(response, state, record.session_id())
    } else {
        response
    }
}

async fn writable_acquire(
    state: &EndpointState,
    cookie: Option<String>,
    version: ProtocolVersion,
    commit_body: Option<BodyDataStream>,
) -> Response {
    let record = match load_session(state, cookie, false).await {
        Ok(record) => record,
        Err(response) => return response,
    };
    let session_id = record.session_id().to_string();
    let is_new = record.is_new_session();
    let timeout = record.timeout();

    let frame = match state.leases.serializer().encode_frame_for(&record, version) {
        Ok(frame) => frame,
        Err(err) => return serialization_failed(&session_id, &err),
    };

    let (release_tx, release_rx) = oneshot::channel::<()>();
    let handle = match state.leases.register(record, move || {
        let _ = release_tx.send(());
    }) {
        Ok(handle) => handle,
        Err(LeaseError::AlreadyLeased(id)) => {
            return json_err(
                StatusCode::CONFLICT,
                "already_leased",
                format!("Session {id} is already leased"),
            );
        }
    };

    let (tx, mut rx) = mpsc::channel::<StreamItem>(STREAM_CHANNEL_BUFFER);
    if tx.try_send(Ok(Bytes::from(frame))).is_err() {
        // fresh channel; only reachable if the buffer were zero
        return json_err(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Failed to queue session snapshot",
        );
    }
    debug!(
        target: "session_relay.endpoint",
        session_id = %session_id,
        version = %version,
        single_connection = commit_body.is_some(),
        "lease granted, snapshot queued"
    );

    tokio::spawn(hold_lease(HeldLease {
        handle,
        tx,
        released: release_rx,
        timeout,
        heartbeat_interval: state.settings.heartbeat_interval,
        shutdown: state.shutdown.clone(),
        leases: state.leases.clone(),
        commit_body,
        max_body_bytes: state.settings.max_body_bytes,
    }));

    let body = Body::from_stream(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)));
    let response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(WRITABLE_CONTENT_TYPE)),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        body,
    )
        .into_response();
    if is_new {
        with_new_session_cookie(response, state, &session_id)
    } else {
        response
    }
}

/// Why a writable acquire ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseEnd {
    Committed,
    Disconnected,
    TimedOut,
    Shutdown,
    BodyTooLarge,
}

/// A granted writable acquire, owned by its [`hold_lease`] task.
struct HeldLease {
    handle: LeaseHandle,
    tx: mpsc::Sender<StreamItem>,
    released: oneshot::Receiver<()>,
    timeout: Duration,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
    leases: LeaseCache,
    /// Request body of a single-connection acquire; it carries the commit.
    commit_body: Option<BodyDataStream>,
    max_body_bytes: usize,
}

async fn next_body_chunk(
    body: &mut Option<BodyDataStream>,
) -> Option<std::result::Result<Bytes, axum::Error>> {
    match body {
        Some(body) => body.next().await,
        None => std::future::pending().await,
    }
}

async fn send_result(tx: &mpsc::Sender<StreamItem>, line: Bytes) {
    if !matches!(
        tokio::time::timeout(RESULT_SEND_TIMEOUT, tx.send(Ok(line))).await,
        Ok(Ok(()))
    ) {
        debug!(target: "session_relay.endpoint", "peer stopped reading before the commit result");
    }
}

/// Hold the lease until the first of: commit, peer disconnect, session
/// timeout, or server shutdown. The handle is released on every path.
async fn hold_lease(lease: HeldLease) {
    let HeldLease {
        handle,
        tx,
        mut released,
        timeout,
        heartbeat_interval,
        shutdown,
        leases,
        mut commit_body,
        max_body_bytes,
    } = lease;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut pending = Vec::new();
    let end = loop {
        tokio::select! {
            _ = &mut released => break LeaseEnd::Committed,
            () = tx.closed() => break LeaseEnd::Disconnected,
            () = &mut deadline => break LeaseEnd::TimedOut,
            () = shutdown.cancelled() => break LeaseEnd::Shutdown,
            chunk = next_body_chunk(&mut commit_body) => match chunk {
                Some(Ok(bytes)) if pending.len() + bytes.len() > max_body_bytes => {
                    let line = result_line(&ApiResponse::<()>::error(
                        "body_too_large",
                        format!("Commit body too large; max is {max_body_bytes} bytes"),
                    ));
                    send_result(&tx, line).await;
                    break LeaseEnd::BodyTooLarge;
                }
                Some(Ok(bytes)) => pending.extend_from_slice(&bytes),
                Some(Err(err)) => {
                    debug!(
                        target: "session_relay.endpoint",
                        session_id = %handle.session_id(),
                        error = %err,
                        "commit body aborted"
                    );
                    break LeaseEnd::Disconnected;
                }
                None => {
                    let session_id = handle.session_id().to_string();
                    let payload = Bytes::from(std::mem::take(&mut pending));
                    let line = match save_session(&leases, session_id.clone(), payload).await {
                        Ok(result) => commit_result_line(&session_id, result),
                        Err(err) => result_line(&store_task_failed("commit", &err)),
                    };
                    send_result(&tx, line).await;
                    break LeaseEnd::Committed;
                }
            },
            _ = heartbeat.tick() => {
                match tx.try_send(Ok(Bytes::from_static(&[FRAME_DELIMITER]))) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break LeaseEnd::Disconnected,
                }
            }
        }
    };

    handle.release();
    debug!(
        target: "session_relay.endpoint",
        session_id = %handle.session_id(),
        end = ?end,
        "writable acquire ended"
    );
}

async fn commit(state: &EndpointState, cookie: Option<String>, req: Request) -> Response {
    let Some(session_id) = cookie else {
        return json_err(
            StatusCode::BAD_REQUEST,
            "missing_session_cookie",
            "A session id cookie is required",
        );
    };

    let body = match axum::body::to_bytes(req.into_body(), state.settings.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            debug!(target: "session_relay.endpoint", session_id = %session_id, error = %err, "failed to read commit body");
            return json_err(
                StatusCode::BAD_REQUEST,
                "invalid_body",
                "The request body could not be read",
            );
        }
    };

    let result = match save_session(&state.leases, session_id.clone(), body).await {
        Ok(result) => result,
        Err(err) => {
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &store_task_failed("commit", &err),
            );
        }
    };
    match result.error_code() {
        None => json_ok(CommitAck {
            session_id: &session_id,
        }),
        Some(code) => json_err(StatusCode::BAD_REQUEST, code, result.reason()),
    }
}

// =============================================================================
// Server lifecycle
// =============================================================================

/// Build the endpoint router.
///
/// Outstanding writable streams end when `shutdown` is cancelled.
pub fn session_router(
    config: &EndpointConfig,
    leases: LeaseCache,
    shutdown: CancellationToken,
) -> Result<Router> {
    let settings = EndpointSettings::from_config(config)?;
    let path = config.session.endpoint_path.clone();
    if !path.starts_with('/') {
        return Err(ConfigError::ValidationError(format!(
            "endpoint path must start with '/': {path}"
        ))
        .into());
    }
    let max_body = settings.max_body_bytes;
    let state = EndpointState {
        settings: Arc::new(settings),
        leases,
        shutdown,
    };

    Ok(Router::new()
        .route(&path, any(dispatch))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(middleware::from_fn_with_state(max_body, guard_body_size))
        .layer(middleware::from_fn(log_requests)))
}

/// Handle to a running endpoint
#[derive(Debug)]
pub struct EndpointHandle {
    bound_addr: SocketAddr,
    shutdown: CancellationToken,
    join: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl EndpointHandle {
    /// The address the endpoint actually bound to.
    #[must_use]
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Stops accepting connections and waits for the server task to exit.
    ///
    /// Held writable streams are ended and their leases released.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        handle_server_exit(self.join.await)
    }
}

/// Start the endpoint and return a handle for shutdown.
///
/// Refuses to bind on non-localhost addresses unless the config was
/// created with [`EndpointConfig::with_dangerous_public_bind`].
pub async fn start_session_endpoint(config: EndpointConfig, leases: LeaseCache) -> Result<EndpointHandle> {
    if !config.is_localhost() && !config.allow_public_bind {
        return Err(Error::Runtime(format!(
            "refusing to bind on public address '{}'; set origin.allow_public_bind \
             or use with_dangerous_public_bind() to override",
            config.host
        )));
    }
    if !config.is_localhost() {
        warn!(
            target: "session_relay.endpoint",
            host = %config.host,
            "binding session endpoint on non-localhost address"
        );
    }

    let shutdown = CancellationToken::new();
    let router = session_router(&config, leases, shutdown.clone())?;
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let bound_addr = listener.local_addr()?;

    let serve_shutdown = shutdown.clone();
    let join = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await
    });

    info!(
        target: "session_relay.endpoint",
        bound_addr = %bound_addr,
        path = %config.session.endpoint_path,
        "session endpoint listening"
    );

    Ok(EndpointHandle {
        bound_addr,
        shutdown,
        join,
    })
}

/// Run the endpoint until Ctrl+C or SIGTERM, then shut down gracefully.
pub async fn run_session_endpoint(config: EndpointConfig, leases: LeaseCache) -> Result<()> {
    let EndpointHandle {
        bound_addr,
        shutdown,
        mut join,
    } = start_session_endpoint(config, leases).await?;

    println!("srelay origin listening on http://{bound_addr}");

    tokio::select! {
        result = &mut join => handle_server_exit(result)?,
        signal = wait_for_shutdown_signal() => {
            signal?;
            info!(target: "session_relay.endpoint", "shutdown signal received");
            shutdown.cancel();
            handle_server_exit(join.await)?;
        }
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| Error::Runtime(format!("SIGTERM handler failed: {e}")))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Runtime(format!("Ctrl+C handler failed: {e}")))?;
        Ok(())
    }
}

fn handle_server_exit(
    result: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Error::Runtime(format!("session endpoint error: {err}"))),
        Err(err) => Err(Error::Runtime(format!("session endpoint join error: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EndpointSettings {
        EndpointSettings::from_config(&EndpointConfig::new(SessionConfig::with_api_key("k3y")))
            .unwrap()
    }

    #[test]
    fn constant_time_eq_matches_exactly() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "Secret"));
        assert!(!constant_time_eq("secret", "secret "));
        assert!(!constant_time_eq("secret", ""));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn authorization_requires_exact_key() {
        let settings = settings();
        let mut headers = HeaderMap::new();
        assert!(!is_authorized(&settings, &headers));
        headers.insert("x-session-apikey", HeaderValue::from_static("K3Y"));
        assert!(!is_authorized(&settings, &headers));
        headers.insert("x-session-apikey", HeaderValue::from_static("k3y"));
        assert!(is_authorized(&settings, &headers));
    }

    #[test]
    fn read_only_header_defaults_to_writable() {
        let settings = settings();
        let mut headers = HeaderMap::new();
        assert!(!wants_read_only(&settings, &headers));
        headers.insert("x-session-readonly", HeaderValue::from_static("maybe"));
        assert!(!wants_read_only(&settings, &headers));
        headers.insert("x-session-readonly", HeaderValue::from_static("True"));
        assert!(wants_read_only(&settings, &headers));
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; ASP.NET_SessionId=abc; other=1"),
        );
        assert_eq!(
            session_cookie(&headers, "ASP.NET_SessionId"),
            Some("abc".to_string())
        );
        assert_eq!(session_cookie(&headers, "missing"), None);

        headers.insert(header::COOKIE, HeaderValue::from_static("ASP.NET_SessionId="));
        assert_eq!(session_cookie(&headers, "ASP.NET_SessionId"), None);
    }

    #[test]
    fn set_cookie_is_http_only() {
        let value = set_cookie_value("sid", "abc").unwrap();
        assert_eq!(value.to_str().unwrap(), "sid=abc; path=/; HttpOnly; SameSite=Lax");
    }

    #[test]
    fn empty_api_key_is_rejected_at_build_time() {
        let config = EndpointConfig::new(SessionConfig::default());
        assert!(EndpointSettings::from_config(&config).is_err());
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let mut session = SessionConfig::with_api_key("k");
        session.api_key_header = "bad header".to_string();
        assert!(EndpointSettings::from_config(&EndpointConfig::new(session)).is_err());
    }

    #[test]
    fn public_bind_requires_opt_in() {
        let config = EndpointConfig::new(SessionConfig::with_api_key("k")).with_host("0.0.0.0");
        assert!(!config.is_localhost());
        assert!(!config.allow_public_bind);
        assert!(config.with_dangerous_public_bind().allow_public_bind);

        for host in ["127.0.0.1", "127.0.0.9", "::1", "[::1]", "LOCALHOST"] {
            let config = EndpointConfig::new(SessionConfig::with_api_key("k")).with_host(host);
            assert!(config.is_localhost(), "{host} should count as loopback");
        }
    }

    #[test]
    fn version_header_defaults_to_v1() {
        let settings = settings();
        let mut headers = HeaderMap::new();
        assert_eq!(requested_version(&settings, &headers), ProtocolVersion::V1);
        headers.insert("x-session-version", HeaderValue::from_static("2"));
        assert_eq!(requested_version(&settings, &headers), ProtocolVersion::V2);
    }

    #[test]
    fn allow_header_tracks_single_connection() {
        let response = method_not_allowed(&settings());
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, POST, PUT");

        let config = EndpointConfig::new(SessionConfig::with_api_key("k3y")).with_single_connection(false);
        let response = method_not_allowed(&EndpointSettings::from_config(&config).unwrap());
        assert_eq!(response.headers()[header::ALLOW], "GET, PUT");
    }

    #[test]
    fn commit_result_line_is_one_json_line() {
        let line = commit_result_line("abc", SaveResult::Success);
        assert_eq!(line.last(), Some(&FRAME_DELIMITER));
        assert_eq!(line.iter().filter(|b| **b == FRAME_DELIMITER).count(), 1);
        let body: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["session_id"], "abc");

        let line = commit_result_line("abc", SaveResult::AlreadyUpdated);
        let body: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error_code"], "already_updated");
    }

    #[test]
    fn error_envelope_shape() {
        let body = serde_json::to_value(ApiResponse::<()>::error("already_updated", "dup")).unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error_code"], "already_updated");
        assert_eq!(body["error"], "dup");
        assert!(body.get("data").is_none());
    }
}
