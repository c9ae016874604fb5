// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! The proxy engine: accept loop, CONNECT tunneling, and the HTTP exchange
//! state machine.
//!
//! Each accepted connection runs as an independent task. Within a task the
//! state machine sequences reads and writes so one exchange is in flight at a
//! time; only an established CONNECT tunnel pumps both directions
//! concurrently. Errors recover at connection boundary: a failing exchange
//! synthesizes a status to its own client (when nothing was emitted yet) and
//! never affects other connections.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::codec::{RequestCodec, ResponseCodec};
use crate::config::{Config, ExternalProxy};
use crate::connection::ConnectionMetadata;
use crate::error::ProxyError;
use crate::events::{EventBus, ExchangeEvent, ExchangeOutcome};
use crate::export::ExchangeWriter;
use crate::hostport::HostAndPort;
use crate::message::{HttpRequest, HttpResponse, Method};
use crate::rewrite::{apply_request_rewrite, apply_response_rewrite, RequestRewriteRule};

/// Object-safe alias for a plaintext byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type PlaintextStream = Box<dyn DuplexStream>;

/// Pluggable TLS interception seam. On success the engine resumes HTTP
/// exchanges over the returned plaintext streams; on refusal the original
/// sockets come back and the tunnel stays opaque.
pub trait SecureTransport: Send + Sync {
    fn intercept<'a>(
        &'a self,
        client: TcpStream,
        upstream: TcpStream,
        target: &'a HostAndPort,
    ) -> Pin<
        Box<
            dyn Future<
                    Output = Result<(PlaintextStream, PlaintextStream), (TcpStream, TcpStream)>,
                > + Send
                + 'a,
        >,
    >;
}

struct EngineShared {
    config: watch::Receiver<Arc<Config>>,
    events: EventBus,
    exporter: Option<ExchangeWriter>,
    transport: Option<Arc<dyn SecureTransport>>,
}

/// The engine owns the accept loop; construct it with a config watch
/// receiver (see `ConfigStore::subscribe`) and run it as a task.
pub struct ProxyEngine {
    config: watch::Receiver<Arc<Config>>,
    events: EventBus,
    exporter: Option<ExchangeWriter>,
    transport: Option<Arc<dyn SecureTransport>>,
}

impl ProxyEngine {
    pub fn new(config: watch::Receiver<Arc<Config>>, events: EventBus) -> Self {
        Self {
            config,
            events,
            exporter: None,
            transport: None,
        }
    }

    /// Persist every published exchange to a JSONL file.
    pub fn with_exporter(mut self, exporter: ExchangeWriter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Install the TLS interception seam.
    pub fn with_transport(mut self, transport: Arc<dyn SecureTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Bind the configured port and serve until the config store goes away.
    /// A port change restarts the listener; in-flight exchanges continue.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut config_rx = self.config.clone();
        let shared = Arc::new(EngineShared {
            config: self.config,
            events: self.events,
            exporter: self.exporter,
            transport: self.transport,
        });
        loop {
            let cfg = config_rx.borrow().clone();
            cfg.validate()?;
            let listener = TcpListener::bind(("127.0.0.1", cfg.listen_port)).await?;
            info!(port = cfg.listen_port, "listening");

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let shared = shared.clone();
                                tokio::spawn(async move {
                                    handle_connection(stream, ConnectionMetadata::new(peer), shared).await;
                                });
                            }
                            Err(e) => warn!(error = %e, "accept failed"),
                        }
                    }
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            info!("configuration store closed, stopping listener");
                            return Ok(());
                        }
                        let new_port = config_rx.borrow().listen_port;
                        if new_port != cfg.listen_port {
                            info!(old = cfg.listen_port, new = new_port, "listen port changed, rebinding");
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, meta: ConnectionMetadata, shared: Arc<EngineShared>) {
    debug!(conn = %meta.id, peer = %meta.remote_addr, "connection accepted");
    let mut client = stream;
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut codec = RequestCodec::new();

    loop {
        let cfg = shared.config.borrow().clone();
        let idle = Duration::from_secs(cfg.timeouts.client_idle_secs);
        let started = Instant::now();

        let mut req = match read_request(&mut client, &mut buf, &mut codec, idle).await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(err) => {
                if matches!(err, ProxyError::Parse { .. }) {
                    warn!(conn = %meta.id, error = %err, "malformed request");
                    let resp =
                        HttpResponse::synthetic(400, "Bad Request", "malformed request");
                    let _ = client.write_all(&ResponseCodec::encode(&resp)).await;
                    emit_failure(&shared, &meta, None, started, &err).await;
                } else {
                    debug!(conn = %meta.id, error = %err, "client read failed");
                }
                break;
            }
        };
        req.remote_addr = Some(meta.remote_addr.to_string());

        if req.method == Method::Connect {
            handle_connect(client, buf, req, cfg, shared, meta, started).await;
            return;
        }

        match run_exchange(&mut client, req, &cfg, &shared, &meta, started).await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(()) => break,
        }
    }
    debug!(conn = %meta.id, "connection closed");
}

/// Decode the next request, reading as needed. `Ok(None)` means a clean
/// close (EOF or idle timeout between requests); mid-request EOF is a parse
/// error.
async fn read_request<C>(
    client: &mut C,
    buf: &mut BytesMut,
    codec: &mut RequestCodec,
    idle: Duration,
) -> Result<Option<HttpRequest>, ProxyError>
where
    C: AsyncRead + Unpin,
{
    loop {
        if let Some(req) = codec.decode(buf)? {
            return Ok(Some(req));
        }
        match timeout(idle, client.read_buf(buf)).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(0)) => {
                if codec.is_idle() && buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::parse(
                    "unexpected EOF mid-request",
                    buf.clone().freeze(),
                ));
            }
            Ok(Ok(_)) => {}
        }
    }
}

/// Decode one response from upstream, honoring the read-idle deadline and
/// finalizing until-close bodies on EOF.
async fn read_response<U>(
    upstream: &mut U,
    buf: &mut BytesMut,
    codec: &mut ResponseCodec,
    read_idle: Duration,
) -> Result<HttpResponse, ProxyError>
where
    U: AsyncRead + Unpin,
{
    loop {
        if let Some(resp) = codec.decode(buf)? {
            return Ok(resp);
        }
        match timeout(read_idle, upstream.read_buf(buf)).await {
            Err(_) => return Err(ProxyError::UpstreamTimeout("response read")),
            Ok(Err(e)) => return Err(ProxyError::Io(e)),
            Ok(Ok(0)) => {
                return codec.on_eof()?.ok_or(ProxyError::UpstreamConnect(
                    "upstream closed before responding".into(),
                ));
            }
            Ok(Ok(_)) => {}
        }
    }
}

/// One HTTP exchange over an already-connected client. Returns whether the
/// client connection should be kept alive.
async fn run_exchange<C>(
    client: &mut C,
    req: HttpRequest,
    cfg: &Arc<Config>,
    shared: &Arc<EngineShared>,
    meta: &ConnectionMetadata,
    started: Instant,
) -> Result<bool, ()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let target = match req.host_and_port() {
        Ok(target) => target,
        Err(err) => {
            warn!(conn = %meta.id, error = %err, "unresolvable request target");
            let resp = HttpResponse::synthetic(400, "Bad Request", "unresolvable target");
            let _ = client.write_all(&ResponseCodec::encode(&resp)).await;
            emit_failure(shared, meta, Some(req), started, &err).await;
            return Ok(false);
        }
    };

    if !cfg.host_filter.allows(&target.host) {
        info!(conn = %meta.id, host = %target.host, "host denied by filter");
        let resp = HttpResponse::synthetic(403, "Forbidden", "host denied by filter");
        let _ = client.write_all(&ResponseCodec::encode(&resp)).await;
        emit_complete(shared, meta, Some(req), Some(resp), started).await;
        return Ok(false);
    }

    let use_external = cfg.external_proxy.enabled && !cfg.external_proxy.bypasses(&target.host);
    let connect_deadline = Duration::from_secs(cfg.timeouts.upstream_connect_secs);
    let dial = async {
        if use_external {
            TcpStream::connect((
                cfg.external_proxy.host.as_str(),
                cfg.external_proxy.port,
            ))
            .await
        } else {
            TcpStream::connect((target.host.as_str(), target.port)).await
        }
    };
    let mut upstream = match timeout(connect_deadline, dial).await {
        Err(_) => {
            let err = ProxyError::UpstreamTimeout("connect");
            let resp = HttpResponse::synthetic(504, "Gateway Timeout", "upstream connect timeout");
            let _ = client.write_all(&ResponseCodec::encode(&resp)).await;
            emit_failure(shared, meta, Some(req), started, &err).await;
            return Ok(false);
        }
        Ok(Err(e)) => {
            let err = ProxyError::UpstreamConnect(e.to_string());
            warn!(conn = %meta.id, host = %target, error = %e, "upstream connect failed");
            let resp = HttpResponse::synthetic(502, "Bad Gateway", "upstream unreachable");
            let _ = client.write_all(&ResponseCodec::encode(&resp)).await;
            emit_failure(shared, meta, Some(req), started, &err).await;
            return Ok(false);
        }
        Ok(Ok(stream)) => stream,
    };

    let forwarded =
        forward_exchange(client, &mut upstream, req, &target, use_external, cfg).await;
    match forwarded {
        Ok((req, resp, keep)) => {
            emit_complete(shared, meta, Some(req), Some(resp), started).await;
            Ok(keep)
        }
        Err(ExchangeFailure::BeforeEmit { request, error }) => {
            warn!(conn = %meta.id, error = %error, "exchange failed before emission");
            let (status, reason, body) = error_status(&error);
            let resp = HttpResponse::synthetic(status, reason, body);
            let _ = client.write_all(&ResponseCodec::encode(&resp)).await;
            emit_failure(shared, meta, Some(request), started, &error).await;
            Ok(false)
        }
        Err(ExchangeFailure::MidEmit { request, error }) => {
            warn!(conn = %meta.id, error = %error, "exchange aborted mid-emission");
            emit_failure(shared, meta, Some(request), started, &error).await;
            Err(())
        }
    }
}

enum ExchangeFailure {
    /// Nothing was written to the client yet; a status can be synthesized.
    BeforeEmit {
        request: HttpRequest,
        error: ProxyError,
    },
    /// Response bytes were partially emitted; the connection must abort.
    MidEmit {
        request: HttpRequest,
        error: ProxyError,
    },
}

/// Rewrite, forward, and answer one request over the given upstream stream.
/// Returns the final request, the response as emitted, and the keep-alive
/// decision.
async fn forward_exchange<C, U>(
    client: &mut C,
    upstream: &mut U,
    mut req: HttpRequest,
    target: &HostAndPort,
    via_external: bool,
    cfg: &Arc<Config>,
) -> Result<(HttpRequest, HttpResponse, bool), ExchangeFailure>
where
    C: AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let matched: Option<RequestRewriteRule> = cfg
        .rewrites
        .find_match(Some(target.host.as_str()), req.path())
        .cloned();
    if let Some(rule) = &matched {
        if apply_request_rewrite(rule, &mut req) {
            debug!(path = %req.path(), "request body rewritten");
        }
    }

    let mut outgoing = req.clone();
    prepare_outgoing_target(&mut outgoing, target, via_external, &cfg.external_proxy);

    if let Err(e) = upstream.write_all(&RequestCodec::encode(&outgoing)).await {
        return Err(ExchangeFailure::BeforeEmit {
            request: req,
            error: ProxyError::UpstreamConnect(e.to_string()),
        });
    }

    let mut resp_codec = ResponseCodec::new();
    resp_codec.expect_head_only(req.method == Method::Head);
    let mut upstream_buf = BytesMut::with_capacity(8 * 1024);
    let read_idle = Duration::from_secs(cfg.timeouts.upstream_read_secs);
    let mut resp =
        match read_response(upstream, &mut upstream_buf, &mut resp_codec, read_idle).await {
            Ok(resp) => resp,
            Err(error) => {
                return Err(ExchangeFailure::BeforeEmit {
                    request: req,
                    error,
                });
            }
        };

    if let Some(rule) = &matched {
        if apply_response_rewrite(rule, &mut resp) {
            debug!(path = %req.path(), "response body rewritten");
        }
    }

    if let Err(e) = client.write_all(&ResponseCodec::encode(&resp)).await {
        return Err(ExchangeFailure::MidEmit {
            request: req,
            error: ProxyError::Io(e),
        });
    }

    let keep = req.wants_keep_alive() && resp.allows_keep_alive();
    Ok((req, resp, keep))
}

/// Rewrite the request-line target and headers for the chosen route:
/// absolute-form (plus Proxy-Authorization) toward an external proxy,
/// origin-form with a Host header toward the origin itself.
fn prepare_outgoing_target(
    req: &mut HttpRequest,
    target: &HostAndPort,
    via_external: bool,
    external: &ExternalProxy,
) {
    let path = request_path_and_query(&req.target);
    let host_value = if (target.tls && target.port == 443) || (!target.tls && target.port == 80) {
        target.host.clone()
    } else {
        target.authority()
    };
    if via_external {
        let scheme = if target.tls { "https" } else { "http" };
        req.target = format!("{}://{}{}", scheme, host_value, path);
        if let Some(auth) = basic_proxy_authorization(external) {
            req.headers.set("Proxy-Authorization", auth);
        }
    } else {
        req.target = path;
        req.headers.remove("Proxy-Connection");
    }
    if !req.headers.contains("Host") {
        req.headers.set("Host", host_value);
    }
}

/// Path-and-query of a request target (keeps the query, unlike
/// [`request_target_path`]).
fn request_path_and_query(target: &str) -> String {
    if let Some(idx) = target.find("://") {
        let after = &target[idx + 3..];
        match after.find('/') {
            Some(pos) => after[pos..].to_string(),
            None => "/".to_string(),
        }
    } else {
        target.to_string()
    }
}

fn basic_proxy_authorization(external: &ExternalProxy) -> Option<String> {
    let username = external.username.as_deref().filter(|u| !u.is_empty())?;
    let password = external.password.as_deref().unwrap_or_default();
    let token = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", username, password));
    Some(format!("Basic {}", token))
}

fn error_status(err: &ProxyError) -> (u16, &'static str, &'static str) {
    match err {
        ProxyError::UpstreamTimeout(_) => (504, "Gateway Timeout", "upstream timeout"),
        ProxyError::Parse { .. } => (502, "Bad Gateway", "malformed upstream response"),
        _ => (502, "Bad Gateway", "upstream error"),
    }
}

async fn handle_connect(
    client: TcpStream,
    buf: BytesMut,
    req: HttpRequest,
    cfg: Arc<Config>,
    shared: Arc<EngineShared>,
    meta: ConnectionMetadata,
    started: Instant,
) {
    let mut client = client;
    let target = match HostAndPort::from_connect_target(&req.target) {
        Ok(target) => target,
        Err(err) => {
            warn!(conn = %meta.id, error = %err, "bad CONNECT target");
            let resp = HttpResponse::synthetic(400, "Bad Request", "bad CONNECT target");
            let _ = client.write_all(&ResponseCodec::encode(&resp)).await;
            emit_failure(&shared, &meta, Some(req), started, &err).await;
            return;
        }
    };

    if !cfg.host_filter.allows(&target.host) {
        info!(conn = %meta.id, host = %target.host, "CONNECT denied by filter");
        let resp = HttpResponse::synthetic(403, "Forbidden", "host denied by filter");
        let _ = client.write_all(&ResponseCodec::encode(&resp)).await;
        emit_complete(&shared, &meta, Some(req), Some(resp), started).await;
        return;
    }

    let connect_deadline = Duration::from_secs(cfg.timeouts.upstream_connect_secs);
    let use_external = cfg.external_proxy.enabled && !cfg.external_proxy.bypasses(&target.host);
    let dialed = if use_external {
        connect_via_external_proxy(&cfg.external_proxy, &target, connect_deadline).await
    } else {
        match timeout(
            connect_deadline,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        {
            Err(_) => Err(ProxyError::UpstreamTimeout("connect")),
            Ok(Err(e)) => Err(ProxyError::UpstreamConnect(e.to_string())),
            Ok(Ok(stream)) => Ok(stream),
        }
    };
    let mut upstream = match dialed {
        Ok(stream) => stream,
        Err(err) => {
            warn!(conn = %meta.id, host = %target, error = %err, "CONNECT dial failed");
            let (status, reason, body) = error_status(&err);
            let resp = HttpResponse::synthetic(status, reason, body);
            let _ = client.write_all(&ResponseCodec::encode(&resp)).await;
            emit_failure(&shared, &meta, Some(req), started, &err).await;
            return;
        }
    };

    if client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }
    info!(conn = %meta.id, target = %target, "tunnel established");
    let established = HttpResponse::new("HTTP/1.1", 200, "Connection Established");
    emit_complete(&shared, &meta, Some(req), Some(established), started).await;

    // bytes the client pipelined behind the CONNECT head belong upstream
    if !buf.is_empty() && upstream.write_all(&buf).await.is_err() {
        return;
    }

    let drain = Duration::from_secs(cfg.timeouts.tunnel_drain_secs);
    if let Some(transport) = shared.transport.clone() {
        match transport.intercept(client, upstream, &target).await {
            Ok((plain_client, plain_upstream)) => {
                debug!(conn = %meta.id, target = %target, "tunnel intercepted");
                exchange_over_tunnel(plain_client, plain_upstream, &target, cfg, shared, meta)
                    .await;
                return;
            }
            Err((client, upstream)) => {
                pump_tunnel(client, upstream, drain, &meta).await;
            }
        }
    } else {
        pump_tunnel(client, upstream, drain, &meta).await;
    }
}

/// Opaque bidirectional copy. The first EOF half-closes the peer; the
/// opposite direction gets a bounded drain before both sides shut down.
async fn pump_tunnel<C, U>(client: C, upstream: U, drain: Duration, meta: &ConnectionMetadata)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let result: Result<(), std::io::Error> = tokio::select! {
        res = tokio::io::copy(&mut client_read, &mut upstream_write) => {
            let _ = upstream_write.shutdown().await;
            let _ = timeout(drain, tokio::io::copy(&mut upstream_read, &mut client_write)).await;
            let _ = client_write.shutdown().await;
            res.map(|_| ())
        }
        res = tokio::io::copy(&mut upstream_read, &mut client_write) => {
            let _ = client_write.shutdown().await;
            let _ = timeout(drain, tokio::io::copy(&mut client_read, &mut upstream_write)).await;
            let _ = upstream_write.shutdown().await;
            res.map(|_| ())
        }
    };
    match result {
        Ok(()) => debug!(conn = %meta.id, "tunnel drained"),
        // tunnel failures close both sides silently
        Err(e) => debug!(conn = %meta.id, error = %e, "tunnel I/O error"),
    }
}

/// HTTP exchanges over an intercepted (plaintext) tunnel: same pipeline as
/// the direct path, but against the fixed upstream stream.
async fn exchange_over_tunnel(
    mut client: PlaintextStream,
    mut upstream: PlaintextStream,
    target: &HostAndPort,
    cfg: Arc<Config>,
    shared: Arc<EngineShared>,
    meta: ConnectionMetadata,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut codec = RequestCodec::new();
    let idle = Duration::from_secs(cfg.timeouts.client_idle_secs);

    loop {
        let started = Instant::now();
        let mut req = match read_request(&mut client, &mut buf, &mut codec, idle).await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(err) => {
                if matches!(err, ProxyError::Parse { .. }) {
                    let resp =
                        HttpResponse::synthetic(400, "Bad Request", "malformed request");
                    let _ = client.write_all(&ResponseCodec::encode(&resp)).await;
                    emit_failure(&shared, &meta, None, started, &err).await;
                }
                break;
            }
        };
        req.remote_addr = Some(meta.remote_addr.to_string());

        match forward_exchange(&mut client, &mut upstream, req, target, false, &cfg).await {
            Ok((req, resp, keep)) => {
                emit_complete(&shared, &meta, Some(req), Some(resp), started).await;
                if !keep {
                    break;
                }
            }
            Err(ExchangeFailure::BeforeEmit { request, error }) => {
                let (status, reason, body) = error_status(&error);
                let resp = HttpResponse::synthetic(status, reason, body);
                let _ = client.write_all(&ResponseCodec::encode(&resp)).await;
                emit_failure(&shared, &meta, Some(request), started, &error).await;
                break;
            }
            Err(ExchangeFailure::MidEmit { request, error }) => {
                emit_failure(&shared, &meta, Some(request), started, &error).await;
                break;
            }
        }
    }
}

/// CONNECT through the configured external proxy (grounded on the classic
/// raw-socket CONNECT handshake), with optional Basic credentials.
async fn connect_via_external_proxy(
    external: &ExternalProxy,
    target: &HostAndPort,
    connect_deadline: Duration,
) -> Result<TcpStream, ProxyError> {
    let mut stream = match timeout(
        connect_deadline,
        TcpStream::connect((external.host.as_str(), external.port)),
    )
    .await
    {
        Err(_) => return Err(ProxyError::UpstreamTimeout("external proxy connect")),
        Ok(Err(e)) => return Err(ProxyError::UpstreamConnect(e.to_string())),
        Ok(Ok(stream)) => stream,
    };

    let authority = target.authority();
    let mut connect_request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n",
        authority = authority
    );
    if let Some(auth) = basic_proxy_authorization(external) {
        connect_request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    connect_request.push_str("\r\n");

    stream
        .write_all(connect_request.as_bytes())
        .await
        .map_err(|e| ProxyError::UpstreamConnect(e.to_string()))?;

    // read the external proxy's reply head
    let mut head = Vec::with_capacity(1024);
    let mut tmp = [0u8; 512];
    loop {
        let n = match timeout(connect_deadline, stream.read(&mut tmp)).await {
            Err(_) => return Err(ProxyError::UpstreamTimeout("external proxy reply")),
            Ok(Err(e)) => return Err(ProxyError::UpstreamConnect(e.to_string())),
            Ok(Ok(0)) => {
                return Err(ProxyError::UpstreamConnect(
                    "external proxy closed during CONNECT".into(),
                ))
            }
            Ok(Ok(n)) => n,
        };
        head.extend_from_slice(&tmp[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > 32 * 1024 {
            return Err(ProxyError::UpstreamConnect(
                "external proxy CONNECT reply too large".into(),
            ));
        }
    }

    let head_text = String::from_utf8_lossy(&head);
    let status_line = head_text.lines().next().unwrap_or_default();
    if !status_line.contains(" 200") {
        return Err(ProxyError::UpstreamConnect(format!(
            "external proxy refused CONNECT: {}",
            status_line
        )));
    }
    Ok(stream)
}

async fn emit_complete(
    shared: &Arc<EngineShared>,
    meta: &ConnectionMetadata,
    request: Option<HttpRequest>,
    response: Option<HttpResponse>,
    started: Instant,
) {
    let mut event = ExchangeEvent::new(meta.remote_addr.to_string());
    event.request = request;
    event.response = response;
    event.duration_ms = started.elapsed().as_millis() as u64;
    publish(shared, event).await;
}

async fn emit_failure(
    shared: &Arc<EngineShared>,
    meta: &ConnectionMetadata,
    request: Option<HttpRequest>,
    started: Instant,
    error: &ProxyError,
) {
    let mut event = ExchangeEvent::new(meta.remote_addr.to_string());
    event.request = request;
    event.duration_ms = started.elapsed().as_millis() as u64;
    event.outcome = ExchangeOutcome::from_error(error);
    publish(shared, event).await;
}

async fn publish(shared: &Arc<EngineShared>, event: ExchangeEvent) {
    if let Some(exporter) = &shared.exporter {
        if let Err(e) = exporter.write_exchange(&event).await {
            warn!(error = %e, "failed to persist exchange record");
        }
    }
    shared.events.publish(event);
}
