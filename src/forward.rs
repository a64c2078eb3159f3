use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONNECTION, FORWARDED, HOST, UPGRADE};
use http::request::Parts;
use http::uri::{PathAndQuery, Uri};
use http::{Method, StatusCode, Version};
use hyper::body::HttpBody;
use hyper::client::conn::{self, SendRequest};
use hyper::{Body, Request, Response};
use socket2::SockRef;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::ProxyError;
use crate::headers;
use crate::idle::IdleTimeout;
use crate::{ConnInfo, ProxyConfig};

/// Prepares a raw socket for long-lived full-duplex streaming: Nagle off
/// and TCP keepalive on. Applied to every upstream socket this crate
/// dials; hosts should apply it to hijacked client sockets they hand to
/// [`ws`].
pub fn tune_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

/// Forwards a request/response exchange to the configured upstream.
///
/// The caller supplies the inbound request together with the connection
/// metadata hyper does not carry ([`ConnInfo`]) and flushes the returned
/// response to the client. Errors are never written to the client here;
/// the caller formats them (status via [`ProxyError::status_code`]).
/// Failures after the response head has been returned surface as errors
/// on the returned body stream.
pub async fn web(
    req: Request<Body>,
    conn: ConnInfo,
    cfg: &ProxyConfig,
) -> Result<Response<Body>, ProxyError> {
    if let Some(name) = &cfg.proxy_name {
        if headers::via_contains(req.headers(), name) {
            return Err(ProxyError::LoopDetected);
        }
    }

    let (parts, body) = req.into_parts();
    let stalled = Arc::new(AtomicBool::new(false));
    let body = with_idle_limit(body, cfg.timeout, Some(stalled.clone()));

    let mut upstream_req = build_upstream_request(&parts, body, &conn, cfg)?;
    if let Some(on_req) = &cfg.on_req {
        on_req(&parts, &mut upstream_req).map_err(ProxyError::Hook)?;
    }

    let mut sender = dial(cfg).await?;
    info!(
        client = %conn.remote_addr,
        method = %parts.method,
        path = %parts.uri.path(),
        upstream = %cfg.hostname,
        port = cfg.port,
        "proxy web"
    );

    let mut response = exchange(&mut sender, upstream_req, cfg.proxy_timeout, &stalled).await?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        // A plain exchange has nothing to relay a protocol switch onto.
        return Err(ProxyError::UnexpectedUpgrade);
    }

    headers::filter_hop_by_hop(response.headers_mut());
    if let Some(on_res) = &cfg.on_res {
        on_res(&parts, &mut response).map_err(ProxyError::Hook)?;
    }

    let (head, body) = response.into_parts();
    let body = with_idle_limit(body, cfg.proxy_timeout, None);
    Ok(Response::from_parts(head, body))
}

/// Forwards a protocol-upgrade exchange and then relays raw bytes in both
/// directions until either side closes.
///
/// `client` is the hijacked client connection (handed over before any
/// response was written) and `head` holds whatever bytes the client
/// already sent past its request preamble; they are delivered to the
/// upstream first. The client socket is borrowed so that a caller can
/// still write an error response onto it when the call fails before the
/// `101` was sent.
pub async fn ws(
    req: Request<Body>,
    client: &mut TcpStream,
    head: Bytes,
    cfg: &ProxyConfig,
) -> Result<(), ProxyError> {
    if req.method() != Method::GET {
        return Err(ProxyError::MethodNotAllowed);
    }
    let websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !websocket {
        return Err(ProxyError::UnsupportedUpgrade);
    }
    if let Some(name) = &cfg.proxy_name {
        if headers::via_contains(req.headers(), name) {
            return Err(ProxyError::LoopDetected);
        }
    }

    tune_socket(client)?;
    let conn = ConnInfo::new(client.local_addr()?, client.peer_addr()?);

    let (parts, body) = req.into_parts();
    let stalled = Arc::new(AtomicBool::new(false));
    let body = with_idle_limit(body, cfg.timeout, Some(stalled.clone()));

    let mut upstream_req = build_upstream_request(&parts, body, &conn, cfg)?;
    upstream_req
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("upgrade"));
    upstream_req
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static("websocket"));
    if let Some(on_req) = &cfg.on_req {
        on_req(&parts, &mut upstream_req).map_err(ProxyError::Hook)?;
    }

    let mut sender = dial(cfg).await?;
    info!(
        client = %conn.remote_addr,
        path = %parts.uri.path(),
        upstream = %cfg.hostname,
        port = cfg.port,
        "proxy upgrade"
    );

    let mut response = exchange(&mut sender, upstream_req, cfg.proxy_timeout, &stalled).await?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        // Upstream declined the upgrade; there is nothing to relay and no
        // response writer to copy onto, so observe and end the socket.
        if let Some(on_res) = &cfg.on_res {
            on_res(&parts, &mut response).map_err(ProxyError::Hook)?;
        }
        let _ = client.shutdown().await;
        return Ok(());
    }

    let preamble = upgrade_preamble(response.headers());
    client.write_all(&preamble).await?;

    let mut upstream = hyper::upgrade::on(response)
        .await
        .map_err(ProxyError::Upstream)?;
    if !head.is_empty() {
        upstream.write_all(&head).await?;
    }

    let relayed = copy_bidirectional(client, &mut upstream).await;
    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;

    match relayed {
        Ok((from_client, from_upstream)) => {
            debug!(from_client, from_upstream, "relay finished");
            Ok(())
        }
        Err(err) => {
            warn!(%err, "relay error");
            Err(ProxyError::Io(err))
        }
    }
}

/// Connects to the configured upstream and spawns the task driving the
/// HTTP/1.1 connection. The returned handle is the only way to reach the
/// connection, so dropping everything owned by a call closes it.
async fn dial(cfg: &ProxyConfig) -> Result<SendRequest<Body>, ProxyError> {
    let stream = TcpStream::connect((cfg.hostname.as_str(), cfg.port))
        .await
        .map_err(ProxyError::Connect)?;
    tune_socket(&stream).map_err(ProxyError::Connect)?;

    let (sender, connection) = conn::Builder::new()
        .handshake::<TcpStream, Body>(stream)
        .await
        .map_err(ProxyError::Upstream)?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(%err, "upstream connection ended");
        }
    });

    Ok(sender)
}

/// Sends the rewritten request and waits for the response head, bounded
/// by the upstream idle limit when one is configured.
async fn exchange(
    sender: &mut SendRequest<Body>,
    req: Request<Body>,
    limit: Option<Duration>,
    stalled: &AtomicBool,
) -> Result<Response<Body>, ProxyError> {
    let pending = sender.send_request(req);
    match limit {
        Some(limit) => match timeout(limit, pending).await {
            Ok(result) => result.map_err(|err| classify(err, stalled)),
            Err(_) => Err(ProxyError::GatewayTimeout),
        },
        None => pending.await.map_err(|err| classify(err, stalled)),
    }
}

/// Rebuilds the inbound request as the HTTP/1.1 request sent upstream:
/// same method and raw path+query, rewritten headers, synthesized
/// `Forwarded`, and a `Via` entry when the proxy has a name.
fn build_upstream_request(
    parts: &Parts,
    body: Body,
    conn: &ConnInfo,
    cfg: &ProxyConfig,
) -> Result<Request<Body>, ProxyError> {
    // HTTP/2 carries the host in the :authority pseudo-header, which hyper
    // surfaces through the URI rather than the header map.
    let authority = parts
        .uri
        .authority()
        .map(|a| a.as_str().to_owned())
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        });

    let mut upstream = Request::new(body);
    *upstream.method_mut() = parts.method.clone();
    *upstream.version_mut() = Version::HTTP_11;

    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    let mut target = http::uri::Parts::default();
    target.path_and_query = Some(path_and_query);
    *upstream.uri_mut() =
        Uri::from_parts(target).map_err(|_| ProxyError::InvalidRequest("request target"))?;

    for (name, value) in parts.headers.iter() {
        upstream.headers_mut().append(name.clone(), value.clone());
    }
    headers::filter_hop_by_hop(upstream.headers_mut());

    if !upstream.headers().contains_key(HOST) {
        let host = format!("{}:{}", cfg.hostname, cfg.port);
        upstream.headers_mut().insert(
            HOST,
            HeaderValue::from_str(&host).map_err(|_| ProxyError::InvalidRequest("host"))?,
        );
    }

    let forwarded = headers::forwarded_value(&parts.headers, authority.as_deref(), conn);
    upstream.headers_mut().insert(
        FORWARDED,
        HeaderValue::from_str(&forwarded).map_err(|_| ProxyError::InvalidRequest("forwarded"))?,
    );

    if let Some(name) = &cfg.proxy_name {
        headers::add_via(upstream.headers_mut(), parts.version, name);
    }

    Ok(upstream)
}

fn with_idle_limit(body: Body, limit: Option<Duration>, expired: Option<Arc<AtomicBool>>) -> Body {
    match limit {
        Some(limit) if !body.is_end_stream() => {
            Body::wrap_stream(IdleTimeout::new(body, limit, expired))
        }
        _ => body,
    }
}

/// Maps a failed upstream exchange onto the error surface. The stalled
/// flag takes precedence: hyper reports an idle inbound body as a generic
/// body-write failure, but the exchange died because the client went
/// quiet.
fn classify(err: hyper::Error, stalled: &AtomicBool) -> ProxyError {
    if stalled.load(Ordering::SeqCst) {
        return ProxyError::RequestTimeout;
    }
    if err.is_parse() {
        return ProxyError::UpstreamProtocol(err);
    }
    if err.is_incomplete_message() {
        return ProxyError::UpstreamReset(err);
    }
    match io_kind(&err) {
        Some(
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe,
        ) => ProxyError::UpstreamReset(err),
        Some(io::ErrorKind::TimedOut) => ProxyError::GatewayTimeout,
        _ => ProxyError::Upstream(err),
    }
}

fn io_kind(err: &hyper::Error) -> Option<io::ErrorKind> {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = cause.source();
    }
    None
}

/// Serializes the status line and headers relayed to the client when the
/// upstream accepts an upgrade. One line per value for repeated headers.
fn upgrade_preamble(headers: &HeaderMap) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    for (name, value) in headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
}
