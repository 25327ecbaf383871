//! Transport Selector and the channels behind a `ConnectionHandle`.
//!
//! Selection is an exhaustive match on [`TransportKind`]:
//!
//! | kind          | strategy                  | shutdown class |
//! |---------------|---------------------------|----------------|
//! | local-pipe    | spawn + attach to stdio   | local-pipe     |
//! | local-socket  | launch if needed, dial    | reconnectable  |
//! | remote-http   | open HTTP session         | remote         |
//! | remote-socket | dial                      | remote         |
//!
//! Pipe, TCP and unix-socket channels speak line-delimited JSON-RPC 2.0.
//! HTTP channels POST one JSON-RPC message per request and accept either a
//! JSON body or a `text/event-stream` body.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::Url;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{mpsc, Mutex};

use super::errors::LifecycleError;
use super::types::{JsonRpcRequest, JsonRpcResponse, TransportKind, INTERNAL_ERROR};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Request timeout when the server config sets none.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Session header used by streamable-HTTP servers.
const SESSION_HEADER: &str = "mcp-session-id";

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Endpoint ────────────────────────────────────────────────────────────────

/// A parsed server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `http://` or `https://`.
    Http(Url),
    /// `ws://` or `wss://`.
    WebSocket(Url),
    /// `tcp://host:port`.
    Tcp { host: String, port: u16 },
    /// `unix:///path/to/socket`.
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse a URL into an endpoint. The error string is user-facing.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let url = Url::parse(raw.trim()).map_err(|e| format!("invalid url '{raw}': {e}"))?;

        match url.scheme() {
            "http" | "https" => Ok(Self::Http(url)),
            "ws" | "wss" => {
                if url.host_str().is_none() {
                    return Err(format!("websocket url '{raw}' has no host"));
                }
                Ok(Self::WebSocket(url))
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| format!("tcp url '{raw}' has no host"))?
                    .to_string();
                let port = url
                    .port()
                    .ok_or_else(|| format!("tcp url '{raw}' has no port"))?;
                Ok(Self::Tcp { host, port })
            }
            "unix" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(format!("unix url '{raw}' has no socket path"));
                }
                Ok(Self::Unix(PathBuf::from(path)))
            }
            other => Err(format!("unsupported url scheme '{other}' in '{raw}'")),
        }
    }

    /// `host:port` for socket-style endpoints.
    fn socket_address(&self) -> Option<String> {
        match self {
            Self::Tcp { host, port } => Some(format!("{host}:{port}")),
            Self::WebSocket(url) => {
                let host = url.host_str()?;
                let port = url.port_or_known_default()?;
                Some(format!("{host}:{port}"))
            }
            Self::Http(_) | Self::Unix(_) => None,
        }
    }
}

// ─── Selection ───────────────────────────────────────────────────────────────

/// What happens to a server's process when a session that used it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownClass {
    /// Reachable only through the spawning process's pipes; stopped at
    /// session end unless launched with persist.
    LocalPipe,
    /// Reachable from any process; survives the session.
    Reconnectable,
    /// Not owned by this system; never stopped.
    Remote,
}

impl ShutdownClass {
    pub fn for_kind(kind: TransportKind) -> Self {
        match kind {
            TransportKind::LocalPipe => Self::LocalPipe,
            TransportKind::LocalSocket => Self::Reconnectable,
            TransportKind::RemoteHttp | TransportKind::RemoteSocket => Self::Remote,
        }
    }
}

/// How to obtain a channel for a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStrategy {
    /// Spawn the process with piped stdio and talk over it.
    SpawnAttach,
    /// Ensure a local process is live, then dial its endpoint.
    LaunchThenDial(Endpoint),
    /// Dial an externally managed endpoint.
    Dial(Endpoint),
}

impl ConnectionStrategy {
    /// Whether this strategy requires a local process.
    pub fn needs_local_process(&self) -> bool {
        matches!(self, Self::SpawnAttach | Self::LaunchThenDial(_))
    }
}

/// Choose the connection strategy for a resolved config.
pub fn select(
    name: &str,
    kind: TransportKind,
    url: Option<&str>,
) -> Result<ConnectionStrategy, LifecycleError> {
    let endpoint = || -> Result<Endpoint, LifecycleError> {
        let url = url.ok_or_else(|| LifecycleError::Config {
            name: name.to_string(),
            reason: format!("{kind} server has no url"),
        })?;
        Endpoint::parse(url).map_err(|reason| LifecycleError::Config {
            name: name.to_string(),
            reason,
        })
    };

    Ok(match kind {
        TransportKind::LocalPipe => ConnectionStrategy::SpawnAttach,
        TransportKind::LocalSocket => ConnectionStrategy::LaunchThenDial(endpoint()?),
        TransportKind::RemoteHttp | TransportKind::RemoteSocket => {
            ConnectionStrategy::Dial(endpoint()?)
        }
    })
}

// ─── Line Link ───────────────────────────────────────────────────────────────

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Where incoming lines come from.
enum LineSource {
    /// Read straight from a socket.
    Stream(Lines<BufReader<BoxedReader>>),
    /// Forwarded by a background task that also tees them to a log file.
    /// The queue is bounded; the forwarder drops lines when it is full.
    Forwarded(mpsc::Receiver<String>),
}

impl LineSource {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        match self {
            Self::Stream(lines) => lines.next_line().await,
            Self::Forwarded(rx) => Ok(rx.recv().await),
        }
    }

    /// Drop forwarded lines queued before a request was sent. None of them
    /// can answer it, and clearing them leaves room for the response.
    fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        if let Self::Forwarded(rx) = self {
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
        }
        dropped
    }
}

/// Bi-directional line-delimited JSON-RPC link.
///
/// Used for a child's stdio and for TCP / unix sockets alike.
pub struct LineLink {
    server_name: String,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<LineSource>,
}

impl LineLink {
    /// Link over a child's stdin and a forwarded stdout line stream.
    pub fn forwarded(
        server_name: &str,
        writer: impl AsyncWrite + Send + 'static,
        lines: mpsc::Receiver<String>,
    ) -> Self {
        let writer: BoxedWriter = Box::pin(writer);
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(LineSource::Forwarded(lines)),
        }
    }

    /// Link over a connected socket's read and write halves.
    pub fn stream(
        server_name: &str,
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        let reader: BoxedReader = Box::pin(reader);
        let writer: BoxedWriter = Box::pin(writer);
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(LineSource::Stream(BufReader::new(reader).lines())),
        }
    }

    fn rpc_error(&self, method: &str, reason: impl Into<String>) -> LifecycleError {
        LifecycleError::Rpc {
            server: self.server_name.clone(),
            method: method.to_string(),
            reason: reason.into(),
        }
    }

    async fn write_line(&self, method: &str, mut json: String) -> Result<(), LifecycleError> {
        json.push('\n');
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.rpc_error(method, "channel is closed"))?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.rpc_error(method, format!("failed to write request: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.rpc_error(method, format!("failed to flush request: {e}")))?;
        Ok(())
    }

    /// Send a request and read lines until the response with the same id.
    ///
    /// Non-JSON lines (server log output) and responses for other ids are
    /// skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, LifecycleError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)
            .map_err(|e| self.rpc_error(method, format!("failed to serialize request: {e}")))?;

        // Hold the reader across the write so concurrent callers can't steal
        // each other's responses.
        let mut reader = self.reader.lock().await;
        let stale = reader.discard_pending();
        if stale > 0 {
            tracing::trace!(server = %self.server_name, stale, "discarded queued output before request");
        }
        self.write_line(method, json).await?;

        loop {
            let line = reader
                .next_line()
                .await
                .map_err(|e| self.rpc_error(method, format!("failed to read response: {e}")))?
                .ok_or_else(|| {
                    self.rpc_error(method, "server output closed (process may have exited)")
                })?;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                Ok(_) => continue,
                Err(_) => {
                    tracing::trace!(server = %self.server_name, line = trimmed, "skipping non-response line");
                    continue;
                }
            }
        }
    }

    /// Drop the writer. For a child's stdin this delivers EOF.
    pub async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }
}

// ─── HTTP Session ────────────────────────────────────────────────────────────

/// JSON-RPC over HTTP POST. Opening one does no network I/O.
pub struct HttpSession {
    server_name: String,
    http: reqwest::Client,
    url: Url,
    headers: Vec<(String, String)>,
    session_id: Mutex<Option<String>>,
}

impl HttpSession {
    pub fn open(
        server_name: &str,
        url: Url,
        headers: Vec<(String, String)>,
        connect_timeout: Duration,
    ) -> Result<Self, LifecycleError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| LifecycleError::Connect {
                name: server_name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_name: server_name.to_string(),
            http,
            url,
            headers,
            session_id: Mutex::new(None),
        })
    }

    fn rpc_error(&self, method: &str, reason: impl Into<String>) -> LifecycleError {
        LifecycleError::Rpc {
            server: self.server_name.clone(),
            method: method.to_string(),
            reason: reason.into(),
        }
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, LifecycleError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut builder = self
            .http
            .post(self.url.clone())
            .header("Accept", "application/json, text/event-stream")
            .json(&req);
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(session) = self.session_id.lock().await.as_deref() {
            builder = builder.header(SESSION_HEADER, session);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| self.rpc_error(method, format!("HTTP request failed: {e}")))?;

        if let Some(session) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(session.to_string());
        }

        let status = resp.status();
        if !status.is_success() {
            return Err(self.rpc_error(method, format!("HTTP status {status}")));
        }

        let is_event_stream = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_event_stream {
            return self.read_event_stream(method, resp, id).await;
        }

        let body = resp
            .text()
            .await
            .map_err(|e| self.rpc_error(method, format!("failed to read HTTP body: {e}")))?;
        serde_json::from_str(&body)
            .map_err(|e| self.rpc_error(method, format!("invalid JSON-RPC response: {e}")))
    }

    /// Read SSE lines until the response for `id` arrives.
    ///
    /// The server may keep the stream open after answering, so this stops at
    /// the first match instead of reading to the end.
    async fn read_event_stream(
        &self,
        method: &str,
        resp: reqwest::Response,
        id: u64,
    ) -> Result<JsonRpcResponse, LifecycleError> {
        let mut stream = resp.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| self.rpc_error(method, format!("event stream failed: {e}")))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(resp) = parse_event_line(&String::from_utf8_lossy(&line), id) {
                    return Ok(resp);
                }
            }
        }

        parse_event_line(&String::from_utf8_lossy(&buffer), id).ok_or_else(|| {
            self.rpc_error(method, "event stream ended without a matching response")
        })
    }
}

/// Parse one SSE line, returning the response if it is `data:` for `id`.
fn parse_event_line(line: &str, id: u64) -> Option<JsonRpcResponse> {
    let data = line.trim_end().strip_prefix("data:")?;
    serde_json::from_str::<JsonRpcResponse>(data.trim())
        .ok()
        .filter(|resp| resp.id == id)
}

// ─── Channel ─────────────────────────────────────────────────────────────────

/// The opaque channel inside a `ConnectionHandle`.
pub enum Channel {
    /// Shared stdio link of a process spawned by this session.
    Pipe(Arc<LineLink>),
    /// Dialed TCP or unix socket.
    Socket(LineLink),
    /// HTTP session.
    Http(HttpSession),
    /// Open TCP connection to a WebSocket endpoint. Framing is not spoken
    /// here; the connection proves reachability only.
    WebSocket(tokio::net::TcpStream),
}

impl Channel {
    fn label(&self) -> &'static str {
        match self {
            Self::Pipe(_) => "pipe",
            Self::Socket(_) => "socket",
            Self::Http(_) => "http",
            Self::WebSocket(_) => "websocket",
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Open a channel to a dialable endpoint.
pub async fn dial(
    server_name: &str,
    endpoint: &Endpoint,
    headers: Vec<(String, String)>,
    connect_timeout: Duration,
) -> Result<Channel, LifecycleError> {
    let connect_error = |reason: String| LifecycleError::Connect {
        name: server_name.to_string(),
        reason,
    };

    match endpoint {
        Endpoint::Http(url) => Ok(Channel::Http(HttpSession::open(
            server_name,
            url.clone(),
            headers,
            connect_timeout,
        )?)),
        Endpoint::Tcp { .. } | Endpoint::WebSocket(_) => {
            let address = endpoint
                .socket_address()
                .ok_or_else(|| connect_error("endpoint has no socket address".into()))?;
            let stream =
                tokio::time::timeout(connect_timeout, tokio::net::TcpStream::connect(&address))
                    .await
                    .map_err(|_| {
                        connect_error(format!(
                            "timed out after {}ms connecting to {address}",
                            connect_timeout.as_millis()
                        ))
                    })?
                    .map_err(|e| connect_error(format!("failed to connect to {address}: {e}")))?;

            if matches!(endpoint, Endpoint::WebSocket(_)) {
                return Ok(Channel::WebSocket(stream));
            }
            let (reader, writer) = stream.into_split();
            Ok(Channel::Socket(LineLink::stream(server_name, reader, writer)))
        }
        Endpoint::Unix(path) => dial_unix(server_name, path, connect_timeout).await,
    }
}

#[cfg(unix)]
async fn dial_unix(
    server_name: &str,
    path: &std::path::Path,
    connect_timeout: Duration,
) -> Result<Channel, LifecycleError> {
    let stream = tokio::time::timeout(connect_timeout, tokio::net::UnixStream::connect(path))
        .await
        .map_err(|_| LifecycleError::Connect {
            name: server_name.to_string(),
            reason: format!("timed out connecting to {}", path.display()),
        })?
        .map_err(|e| LifecycleError::Connect {
            name: server_name.to_string(),
            reason: format!("failed to connect to {}: {e}", path.display()),
        })?;
    let (reader, writer) = stream.into_split();
    Ok(Channel::Socket(LineLink::stream(server_name, reader, writer)))
}

#[cfg(not(unix))]
async fn dial_unix(
    server_name: &str,
    path: &std::path::Path,
    _connect_timeout: Duration,
) -> Result<Channel, LifecycleError> {
    Err(LifecycleError::Connect {
        name: server_name.to_string(),
        reason: format!("unix sockets are not supported here ({})", path.display()),
    })
}

// ─── ConnectionHandle ────────────────────────────────────────────────────────

/// An open logical session to one server, owned by the caller.
pub struct ConnectionHandle {
    id: uuid::Uuid,
    server_name: String,
    transport_kind: TransportKind,
    channel: Channel,
    request_timeout: Duration,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("server_name", &self.server_name)
            .field("transport_kind", &self.transport_kind)
            .field("channel", &self.channel.label())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(
        server_name: &str,
        transport_kind: TransportKind,
        channel: Channel,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            server_name: server_name.to_string(),
            transport_kind,
            channel,
            request_timeout: request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    pub fn shutdown_class(&self) -> ShutdownClass {
        ShutdownClass::for_kind(self.transport_kind)
    }

    /// Send a JSON-RPC request and return its `result`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, LifecycleError> {
        let call = async {
            match &self.channel {
                Channel::Pipe(link) => link.request(method, params).await,
                Channel::Socket(link) => link.request(method, params).await,
                Channel::Http(session) => session.request(method, params).await,
                Channel::WebSocket(_) => Err(LifecycleError::Rpc {
                    server: self.server_name.clone(),
                    method: method.to_string(),
                    reason: "requests over websocket are not supported".into(),
                }),
            }
        };

        let response = tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| LifecycleError::Rpc {
                server: self.server_name.clone(),
                method: method.to_string(),
                reason: format!("timed out after {}ms", self.request_timeout.as_millis()),
            })??;

        extract_result(&self.server_name, response)
    }

    /// Round-trip a JSON-RPC `ping` and return the latency.
    pub async fn ping(&self) -> Result<Duration, LifecycleError> {
        let start = Instant::now();
        self.request("ping", None).await?;
        Ok(start.elapsed())
    }

    /// Release the channel. Never stops the server process; a pipe shared
    /// with other handles stays open.
    pub async fn close(self) {
        match self.channel {
            Channel::Socket(link) => link.close().await,
            Channel::WebSocket(mut stream) => {
                let _ = stream.shutdown().await;
            }
            Channel::Pipe(_) | Channel::Http(_) => {}
        }
        tracing::debug!(server = %self.server_name, handle = %self.id, "connection handle closed");
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response.
pub fn extract_result(
    server_name: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, LifecycleError> {
    if let Some(err) = response.error {
        return Err(LifecycleError::ServerError {
            server: server_name.to_string(),
            code: err.code,
            message: err.message,
        });
    }

    response.result.ok_or(LifecycleError::ServerError {
        server: server_name.to_string(),
        code: INTERNAL_ERROR,
        message: "response missing both result and error".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
