//! Peer-side client for borrowing sessions from the origin.
//!
//! Single-connection mode (the default) keeps one HTTP/2 request open for
//! the whole lease:
//!
//! ```text
//! acquire()  ── POST (body held open) ──►  origin
//!            ◄── snapshot frame, then "\n" heartbeats
//!   ...caller mutates the record...
//! commit()   ── changeset | snapshot, end of body ──►
//!            ◄── {"ok":true,...} result line, end of stream
//! release()  ── end of body ──►                        (lease ends)
//! ```
//!
//! When the origin answers the `POST` with 405 the client switches, for its
//! lifetime, to two connections: a `GET` for the snapshot stream and a `PUT`
//! for the commit (an empty `PUT` releases).
//!
//! A writable acquisition keeps the response open in a background task
//! until the session is committed, released, or dropped. Dropping it closes
//! the stream, which the origin treats as a disconnect.
//!
//! Every request sends the version header; the origin's reply decides
//! whether changeset commits may be used.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{COOKIE, HeaderName, SET_COOKIE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{Config, PeerConfig, SessionConfig};
use crate::error::{ConflictKind, RemoteError};
use crate::serializer::{FRAME_DELIMITER, ProtocolVersion, SessionSerializer};
use crate::session::SessionRecord;

/// Cap on the bytes kept after the snapshot frame of a lease stream.
const MAX_RESULT_BYTES: usize = 64 * 1024;

type CommitSender = mpsc::Sender<std::io::Result<Bytes>>;

struct ClientInner {
    http: reqwest::Client,
    /// HTTP/2 client for single-connection acquires; `None` when disabled.
    duplex: Option<reqwest::Client>,
    /// Cleared for good once the origin refuses a single-connection acquire.
    single_connection: AtomicBool,
    endpoint: Url,
    cookie_name: String,
    api_key_header: HeaderName,
    api_key: String,
    read_only_header: HeaderName,
    version_header: HeaderName,
    network_timeout: Duration,
    prefer_changesets: bool,
    serializer: SessionSerializer,
}

/// Borrows sessions from the origin's session endpoint. Cheap to clone.
#[derive(Clone)]
pub struct RemoteSessionClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RemoteSessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSessionClient")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("network_timeout", &self.inner.network_timeout)
            .field("prefer_changesets", &self.inner.prefer_changesets)
            .field("single_connection", &self.uses_single_connection())
            .finish_non_exhaustive()
    }
}

fn header_name(name: &str) -> Result<HeaderName, RemoteError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| RemoteError::InvalidHeader(format!("{name}: {e}")))
}

impl RemoteSessionClient {
    pub fn new(
        peer: &PeerConfig,
        session: SessionConfig,
        serializer: SessionSerializer,
    ) -> Result<Self, RemoteError> {
        let base = Url::parse(&peer.origin_url)
            .map_err(|e| RemoteError::InvalidUrl(format!("{}: {e}", peer.origin_url)))?;
        let endpoint = base
            .join(&session.endpoint_path)
            .map_err(|e| RemoteError::InvalidUrl(format!("{}: {e}", session.endpoint_path)))?;

        // No overall request timeout: it would cut the held lease stream.
        let http = reqwest::Client::builder()
            .connect_timeout(peer.network_timeout())
            .build()?;
        let duplex = if peer.use_single_connection {
            Some(
                reqwest::Client::builder()
                    .connect_timeout(peer.network_timeout())
                    .http2_prior_knowledge()
                    .build()?,
            )
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                single_connection: AtomicBool::new(duplex.is_some()),
                duplex,
                endpoint,
                cookie_name: session.cookie_name,
                api_key_header: header_name(&session.api_key_header)?,
                api_key: session.api_key,
                read_only_header: header_name(&session.read_only_header)?,
                version_header: header_name(&session.version_header)?,
                network_timeout: peer.network_timeout(),
                prefer_changesets: peer.prefer_changesets,
                serializer,
            }),
        })
    }

    /// Client for the `[peer]`, `[session]` and `[serializer]` sections.
    pub fn from_config(config: &Config) -> Result<Self, RemoteError> {
        let serializer = SessionSerializer::new(
            config
                .serializer
                .options(config.origin.advertise_changesets),
        );
        Self::new(&config.peer, config.session.clone(), serializer)
    }

    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Whether writable acquires currently go over one `POST`.
    pub fn uses_single_connection(&self) -> bool {
        self.duplex_client().is_some()
    }

    fn duplex_client(&self) -> Option<&reqwest::Client> {
        self.inner
            .duplex
            .as_ref()
            .filter(|_| self.inner.single_connection.load(Ordering::SeqCst))
    }

    fn request_on(
        &self,
        http: &reqwest::Client,
        method: reqwest::Method,
        session_id: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let inner = &self.inner;
        let mut builder = http
            .request(method, inner.endpoint.clone())
            .header(inner.api_key_header.clone(), inner.api_key.as_str())
            .header(inner.version_header.clone(), ProtocolVersion::LATEST.as_str());
        if let Some(id) = session_id {
            builder = builder.header(COOKIE, format!("{}={id}", inner.cookie_name));
        }
        builder
    }

    fn request(&self, method: reqwest::Method, session_id: Option<&str>) -> reqwest::RequestBuilder {
        self.request_on(&self.inner.http, method, session_id)
    }

    async fn within_timeout<F, T>(&self, fut: F) -> Result<T, RemoteError>
    where
        F: std::future::Future<Output = Result<T, RemoteError>>,
    {
        let limit = self.inner.network_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| RemoteError::Timeout(limit))?
    }

    /// Version both sides speak; a missing header means a `V1` origin.
    fn negotiated_version(&self, response: &reqwest::Response) -> ProtocolVersion {
        let offered = ProtocolVersion::parse(
            response
                .headers()
                .get(&self.inner.version_header)
                .and_then(|v| v.to_str().ok()),
        );
        ProtocolVersion::LATEST.negotiate(offered)
    }

    /// Borrow a session.
    ///
    /// `None` asks the origin for a brand-new session. Any non-success
    /// response fails the call; no partial record is ever returned.
    pub async fn acquire(
        &self,
        session_id: Option<&str>,
        read_only: bool,
    ) -> Result<AcquiredSession, RemoteError> {
        let duplex = if read_only { None } else { self.duplex_client() };
        if let Some(http) = duplex {
            match self.acquire_single(http, session_id).await {
                Err(RemoteError::Rejected { status: 405, .. }) => {
                    self.inner.single_connection.store(false, Ordering::SeqCst);
                    warn!(
                        target: "session_relay.client",
                        endpoint = %self.inner.endpoint,
                        "origin refused single-connection acquire; falling back to GET and PUT"
                    );
                }
                other => return other,
            }
        }

        let request = self.request(reqwest::Method::GET, session_id).header(
            self.inner.read_only_header.clone(),
            if read_only { "true" } else { "false" },
        );
        let response = self
            .within_timeout(async { request.send().await.map_err(RemoteError::from) })
            .await?;
        let response = check_status(response).await?;

        if !read_only {
            return self.open_lease(response, None).await;
        }

        let set_cookie_headers = set_cookie_headers(&response);
        let version = self.negotiated_version(&response);
        let body = self
            .within_timeout(async { response.bytes().await.map_err(RemoteError::from) })
            .await?;
        let record = self.inner.serializer.decode(&body)?.into_snapshot()?;
        debug!(
            target: "session_relay.client",
            session_id = %record.session_id(),
            keys = record.len(),
            "acquired read-only session"
        );
        Ok(AcquiredSession {
            client: self.clone(),
            record,
            set_cookie_headers,
            version,
            stream: None,
        })
    }

    /// Writable acquire over one HTTP/2 `POST` whose body stays open for
    /// the commit.
    async fn acquire_single(
        &self,
        http: &reqwest::Client,
        session_id: Option<&str>,
    ) -> Result<AcquiredSession, RemoteError> {
        let (commit_tx, mut commit_rx) = mpsc::channel::<std::io::Result<Bytes>>(1);
        let body = reqwest::Body::wrap_stream(futures::stream::poll_fn(move |cx| {
            commit_rx.poll_recv(cx)
        }));
        let request = self
            .request_on(http, reqwest::Method::POST, session_id)
            .body(body);
        let response = self
            .within_timeout(async { request.send().await.map_err(RemoteError::from) })
            .await?;
        let response = check_status(response).await?;
        self.open_lease(response, Some(commit_tx)).await
    }

    /// Read the snapshot frame, then keep draining the stream in the
    /// background so heartbeats never back up.
    async fn open_lease(
        &self,
        response: reqwest::Response,
        commit_tx: Option<CommitSender>,
    ) -> Result<AcquiredSession, RemoteError> {
        let set_cookie_headers = set_cookie_headers(&response);
        let version = self.negotiated_version(&response);
        let mut stream = Box::pin(response.bytes_stream());
        let frame = self
            .within_timeout(read_first_frame(&mut stream))
            .await?;
        let record = self.inner.serializer.decode(&frame)?.into_snapshot()?;

        let ended = Arc::new(AtomicBool::new(false));
        let drain_ended = Arc::clone(&ended);
        let drain_session = record.session_id().to_string();
        let task = tokio::spawn(async move {
            let mut tail = Vec::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => keep_result_bytes(&mut tail, &bytes),
                    Err(err) => {
                        debug!(
                            target: "session_relay.client",
                            session_id = %drain_session,
                            error = %err,
                            "lease stream failed"
                        );
                        break;
                    }
                }
            }
            drain_ended.store(true, Ordering::SeqCst);
            tail
        });

        debug!(
            target: "session_relay.client",
            session_id = %record.session_id(),
            keys = record.len(),
            new_session = record.is_new_session(),
            version = %version,
            single_connection = commit_tx.is_some(),
            "acquired writable session"
        );
        Ok(AcquiredSession {
            client: self.clone(),
            record,
            set_cookie_headers,
            version,
            stream: Some(LeaseStream {
                task,
                ended,
                commit_tx,
            }),
        })
    }

    async fn put(&self, session_id: &str, payload: Vec<u8>) -> Result<(), RemoteError> {
        let request = self
            .request(reqwest::Method::PUT, Some(session_id))
            .timeout(self.inner.network_timeout)
            .body(payload);
        let response = self
            .within_timeout(async { request.send().await.map_err(RemoteError::from) })
            .await?;
        check_status(response).await?;
        Ok(())
    }

    /// Hand `payload` back and end the lease. Empty means release.
    async fn finish_lease(
        &self,
        session_id: &str,
        stream: LeaseStream,
        payload: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let LeaseStream { task, commit_tx, .. } = stream;
        let Some(commit_tx) = commit_tx else {
            let result = self.put(session_id, payload).await;
            task.abort();
            return result;
        };

        // A closed body means the origin already ended the lease; the
        // result line (or its absence) says why.
        if !payload.is_empty() && commit_tx.send(Ok(Bytes::from(payload))).await.is_err() {
            debug!(target: "session_relay.client", session_id = %session_id, "commit body closed early");
        }
        drop(commit_tx);

        let abort = task.abort_handle();
        let tail = self
            .within_timeout(async move { task.await.map_err(|_| RemoteError::StreamClosed) })
            .await;
        if tail.is_err() {
            abort.abort();
        }
        parse_commit_result(&tail?)
    }

    /// Acquire, run `f`, then commit on `Ok` or release on `Err`.
    pub async fn with_session<T, F>(
        &self,
        session_id: Option<&str>,
        read_only: bool,
        f: F,
    ) -> crate::Result<SessionOutcome<T>>
    where
        F: FnOnce(&mut SessionRecord) -> crate::Result<T>,
    {
        let mut session = self.acquire(session_id, read_only).await?;
        let value = match f(&mut session.record) {
            Ok(value) => value,
            Err(err) => {
                if let Err(release_err) = session.release().await {
                    warn!(
                        target: "session_relay.client",
                        error = %release_err,
                        "failed to release session after caller error"
                    );
                }
                return Err(err);
            }
        };
        let session_id = session.record.session_id().to_string();
        let set_cookie_headers = session.set_cookie_headers.clone();
        session.commit().await?;
        Ok(SessionOutcome {
            value,
            session_id,
            set_cookie_headers,
        })
    }
}

/// Result of [`RemoteSessionClient::with_session`].
#[derive(Debug)]
pub struct SessionOutcome<T> {
    pub value: T,
    pub session_id: String,
    /// `Set-Cookie` headers to forward to the caller's own response.
    pub set_cookie_headers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReplyBody {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

fn set_cookie_headers(response: &reqwest::Response) -> Vec<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect()
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(RemoteError::Unauthorized);
    }
    if status == StatusCode::CONFLICT {
        return Err(RemoteError::Conflict(ConflictKind::AlreadyLeased));
    }
    let body = response.json::<ReplyBody>().await.ok();
    Err(reply_error(status, body))
}

fn reply_error(status: StatusCode, body: Option<ReplyBody>) -> RemoteError {
    let code = body.as_ref().and_then(|b| b.error_code.as_deref());
    let conflict = match code {
        Some("session_not_found") => Some(ConflictKind::SessionNotFound),
        Some("already_updated") => Some(ConflictKind::AlreadyUpdated),
        Some("already_leased") => Some(ConflictKind::AlreadyLeased),
        _ => None,
    };
    if let Some(kind) = conflict {
        return RemoteError::Conflict(kind);
    }

    let reason = body
        .and_then(|b| b.error)
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_default();
    RemoteError::Rejected {
        status: status.as_u16(),
        reason,
    }
}

/// Everything after the snapshot frame, minus heartbeats. Only the commit
/// result line of a single-connection stream survives the filter.
fn keep_result_bytes(tail: &mut Vec<u8>, chunk: &[u8]) {
    let room = MAX_RESULT_BYTES.saturating_sub(tail.len());
    tail.extend(
        chunk
            .iter()
            .copied()
            .filter(|b| *b != FRAME_DELIMITER)
            .take(room),
    );
}

/// Outcome of a single-connection commit. A stream that ended without a
/// result line lost its lease to a timeout or shutdown.
fn parse_commit_result(line: &[u8]) -> Result<(), RemoteError> {
    if line.is_empty() {
        return Err(RemoteError::Conflict(ConflictKind::SessionNotFound));
    }
    let reply: ReplyBody = serde_json::from_slice(line).map_err(|e| RemoteError::Rejected {
        status: StatusCode::OK.as_u16(),
        reason: format!("unreadable commit result: {e}"),
    })?;
    if reply.ok {
        Ok(())
    } else {
        Err(reply_error(StatusCode::BAD_REQUEST, Some(reply)))
    }
}

/// Read up to the first frame delimiter, skipping leading heartbeats.
async fn read_first_frame<S>(stream: &mut S) -> Result<Vec<u8>, RemoteError>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
        let start = buf
            .iter()
            .position(|b| *b != FRAME_DELIMITER)
            .unwrap_or(buf.len());
        if let Some(len) = buf[start..].iter().position(|b| *b == FRAME_DELIMITER) {
            buf.truncate(start + len);
            buf.drain(..start);
            return Ok(buf);
        }
    }
    Err(RemoteError::StreamClosed)
}

struct LeaseStream {
    /// Drains the response; yields the bytes kept by [`keep_result_bytes`].
    task: tokio::task::JoinHandle<Vec<u8>>,
    ended: Arc<AtomicBool>,
    /// Request body of a single-connection acquire.
    commit_tx: Option<CommitSender>,
}

/// A borrowed session.
///
/// Writable sessions must be finished with [`Self::commit`] or
/// [`Self::release`]; dropping one closes the lease stream instead.
pub struct AcquiredSession {
    client: RemoteSessionClient,
    record: SessionRecord,
    set_cookie_headers: Vec<String>,
    version: ProtocolVersion,
    stream: Option<LeaseStream>,
}

impl std::fmt::Debug for AcquiredSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredSession")
            .field("session_id", &self.record.session_id())
            .field("read_only", &self.record.is_read_only())
            .field("version", &self.version)
            .field("lease_active", &self.is_lease_active())
            .finish_non_exhaustive()
    }
}

impl AcquiredSession {
    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut SessionRecord {
        &mut self.record
    }

    pub fn session_id(&self) -> &str {
        self.record.session_id()
    }

    pub fn is_read_only(&self) -> bool {
        self.record.is_read_only()
    }

    /// `Set-Cookie` headers the origin sent, for a newly issued session id.
    pub fn set_cookie_headers(&self) -> &[String] {
        &self.set_cookie_headers
    }

    /// Protocol version agreed with the origin for this acquire.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    /// Whether the lease travels over a single `POST`.
    pub fn is_single_connection(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.commit_tx.is_some())
    }

    /// Whether the origin is still holding the lease stream open.
    pub fn is_lease_active(&self) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|s| !s.ended.load(Ordering::SeqCst))
    }

    /// Send the mutations back and end the lease.
    ///
    /// Uses a changeset when both sides speak version 2, the origin
    /// advertised support and the client prefers it; otherwise a full
    /// snapshot. Read-only sessions are simply discarded.
    pub async fn commit(mut self) -> Result<(), RemoteError> {
        if self.stream.is_none() {
            return Ok(());
        }
        let client = self.client.clone();
        let use_changeset = self.version.supports_changesets()
            && self.record.supports_changeset()
            && client.inner.prefer_changesets;
        let payload = if use_changeset {
            client.inner.serializer.encode_changeset(&self.record)?
        } else {
            client.inner.serializer.encode(&self.record)?
        };
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let result = client
            .finish_lease(self.record.session_id(), stream, payload)
            .await;
        debug!(
            target: "session_relay.client",
            session_id = %self.record.session_id(),
            changeset = use_changeset,
            ok = result.is_ok(),
            "committed session"
        );
        result
    }

    /// End the lease without applying any change.
    pub async fn release(mut self) -> Result<(), RemoteError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let client = self.client.clone();
        let result = client
            .finish_lease(self.record.session_id(), stream, Vec::new())
            .await;
        debug!(
            target: "session_relay.client",
            session_id = %self.record.session_id(),
            ok = result.is_ok(),
            "released session"
        );
        result
    }
}

impl Drop for AcquiredSession {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!(
                target: "session_relay.client",
                session_id = %self.record.session_id(),
                "writable session dropped without commit; closing lease stream"
            );
            stream.task.abort();
        }
    }
}
