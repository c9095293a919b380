//! Proxy forwarding to the supervised backend
//!
//! Requests are sent through a pooled hyper client to `127.0.0.1:<port>` of the
//! leased handle. Method, headers and body go through unmodified and the
//! backend's response comes back unmodified. Nothing is retried here.
//!
//! Protocol upgrades (WebSocket and friends) bypass the pool: the handshake
//! is replayed on a dedicated backend connection and, once the backend
//! answers `101 Switching Protocols`, bytes are copied in both directions
//! until either side closes. The lease travels with the tunnel, so an open
//! WebSocket keeps the backend awake.

use crate::config::ServerConfig;
use crate::supervisor::ContainerLease;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE};
use hyper::http::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Upper bound on a backend's upgrade response head
const MAX_UPGRADE_HEAD: usize = 16 * 1024;
/// Upper bound on the body of a refused upgrade
const MAX_REFUSAL_BODY: usize = 1024 * 1024;

/// Body type used on both sides of the gateway
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
pub enum ForwardError {
    /// Connection refused, reset, or protocol failure talking to the backend
    #[error("backend request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("failed to build backend request: {0}")]
    RequestBuild(#[from] hyper::http::Error),
    /// I/O failure on a dedicated upgrade connection
    #[error("backend upgrade connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid upgrade response from backend: {0}")]
    InvalidUpgradeResponse(&'static str),
}

/// Pool settings for backend connections
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        }
    }
}

/// Forwards requests to the leased backend over pooled connections
pub struct Forwarder {
    client: Client<HttpConnector, GatewayBody>,
    forwarded: AtomicU64,
    failed: AtomicU64,
}

impl Forwarder {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Backend connection pool initialized"
        );

        Self {
            client,
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Requests that reached the backend and got a response
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Requests whose backend call failed
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Send `req` to the leased backend and return its response as-is
    pub async fn forward(
        &self,
        req: Request<GatewayBody>,
        lease: &ContainerLease,
    ) -> Result<Response<GatewayBody>, ForwardError> {
        let backend_req = backend_request(req, lease.port())?;

        match self.client.request(backend_req).await {
            Ok(response) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Replay an upgrade handshake on the backend and, on `101`, splice the
    /// two connections together. The lease is held until the tunnel closes.
    pub async fn tunnel(
        &self,
        req: Request<GatewayBody>,
        lease: ContainerLease,
    ) -> Result<Response<GatewayBody>, ForwardError> {
        match open_tunnel(req, lease).await {
            Ok(response) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                Ok(response)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// `Connection: upgrade` together with an `Upgrade` header
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && req.headers().contains_key(UPGRADE)
}

async fn open_tunnel(
    req: Request<GatewayBody>,
    lease: ContainerLease,
) -> Result<Response<GatewayBody>, ForwardError> {
    let protocol = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_ascii_lowercase();
    let port = lease.port();

    let mut backend = TcpStream::connect(("127.0.0.1", port)).await?;
    let _ = backend.set_nodelay(true);
    backend.write_all(&upgrade_request_head(&req, port)).await?;

    let (head, early) = read_response_head(&mut backend).await?;
    let (status, headers) = parse_response_head(&head)?;

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(port, %protocol, status = status.as_u16(), "Backend refused upgrade");
        let body = read_refusal_body(&mut backend, &headers, early).await?;
        let mut response = Response::builder().status(status);
        if let Some(out) = response.headers_mut() {
            copy_response_headers(&headers, out);
        }
        return Ok(response.body(Full::new(body).map_err(|never| match never {}).boxed())?);
    }

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    if let Some(out) = response.headers_mut() {
        copy_response_headers(&headers, out);
    }
    let response = response.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())?;

    info!(port, %protocol, "Upgrade accepted, tunnelling");

    tokio::spawn(async move {
        let lease = lease;
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                // Bytes the backend sent right behind its 101 head
                if !early.is_empty() {
                    if let Err(e) = client.write_all(&early).await {
                        debug!(port, error = %e, "Client went away before tunnel started");
                        return;
                    }
                }
                match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                    Ok((to_backend, to_client)) => {
                        debug!(port, %protocol, to_backend, to_client, "Tunnel closed");
                    }
                    Err(e) => {
                        debug!(port, %protocol, error = %e, "Tunnel closed with error");
                    }
                }
            }
            Err(e) => {
                warn!(port, error = %e, "Client connection upgrade failed");
            }
        }
        debug!(port, in_flight = lease.in_flight(), "Releasing tunnel lease");
    });

    Ok(response)
}

/// Raw HTTP/1.1 request head carrying the client's headers verbatim
fn upgrade_request_head<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();
    if !req.headers().contains_key(HOST) {
        head.extend_from_slice(format!("host: 127.0.0.1:{}\r\n", port).as_bytes());
    }
    for (name, value) in req.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Read up to the blank line; returns the head and any bytes read past it
async fn read_response_head(backend: &mut TcpStream) -> Result<(Vec<u8>, Bytes), ForwardError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(end) = head_end(&buf) {
            let early = Bytes::copy_from_slice(&buf[end..]);
            buf.truncate(end);
            return Ok((buf, early));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(ForwardError::InvalidUpgradeResponse("response head too large"));
        }

        let n = backend.read(&mut chunk).await?;
        if n == 0 {
            return Err(ForwardError::InvalidUpgradeResponse("connection closed before response"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_response_head(head: &[u8]) -> Result<(StatusCode, HeaderMap), ForwardError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ForwardError::InvalidUpgradeResponse("response head is not UTF-8"))?;
    let mut lines = text.split("\r\n");

    // Format: "HTTP/1.1 101 Switching Protocols"
    let status = lines
        .next()
        .filter(|line| line.starts_with("HTTP/"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(ForwardError::InvalidUpgradeResponse("bad status line"))?;

    let mut headers = HeaderMap::new();
    for line in lines.take_while(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            headers.append(name, value);
        }
    }

    Ok((status, headers))
}

/// Framing headers are recomputed by hyper for the client side
fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

async fn read_refusal_body(
    backend: &mut TcpStream,
    headers: &HeaderMap,
    early: Bytes,
) -> Result<Bytes, ForwardError> {
    let Some(len) = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
    else {
        return Ok(early);
    };
    let len = len.min(MAX_REFUSAL_BODY);

    let mut body = early.to_vec();
    let mut chunk = [0u8; 4096];
    while body.len() < len {
        let n = backend.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(len);
    Ok(Bytes::from(body))
}

/// Rewrite only the target authority; everything else is carried over
fn backend_request(req: Request<GatewayBody>, port: u16) -> Result<Request<GatewayBody>, ForwardError> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://127.0.0.1:{}{}", port, path_and_query);

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder()
        .method(parts.method)
        .uri(uri)
        .version(hyper::Version::HTTP_11);

    if let Some(headers) = builder.headers_mut() {
        headers.extend(parts.headers);
    }

    Ok(builder.body(body)?)
}
