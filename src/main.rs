use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use clap::Parser;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use relay_proxy::{web, ws, ConnInfo, ProxyConfig, ProxyError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const MAX_PREAMBLE: usize = 16 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "HTTP/1.1 reverse proxy for web and websocket traffic")]
struct Args {
    /// Listen address.
    #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Upstream host to forward to.
    #[arg(long, env = "RELAY_UPSTREAM_HOST")]
    hostname: String,

    /// Upstream port to forward to.
    #[arg(long, env = "RELAY_UPSTREAM_PORT")]
    port: u16,

    /// Idle limit for the inbound request body, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Idle limit for the upstream, in milliseconds.
    #[arg(long)]
    proxy_timeout_ms: Option<u64>,

    /// Name written to Via and used for loop detection.
    #[arg(long, env = "RELAY_PROXY_NAME")]
    proxy_name: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_proxy=info,hyper=warn".into()),
        )
        .compact()
        .init();

    let mut cfg = ProxyConfig::new(args.hostname.clone(), args.port);
    cfg.timeout = args.timeout_ms.map(Duration::from_millis);
    cfg.proxy_timeout = args.proxy_timeout_ms.map(Duration::from_millis);
    cfg.proxy_name = args.proxy_name.clone();
    let cfg = Arc::new(cfg);

    info!(listen = %args.listen, upstream = %cfg.hostname, port = cfg.port, "starting relay-proxy");

    let listener = match TcpListener::bind(args.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, "failed to bind");
            return;
        }
    };
    let local_addr = listener.local_addr().unwrap();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, remote_addr)) => {
                        let cfg = cfg.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, remote_addr, local_addr, cfg).await;
                        });
                    }
                    Err(err) => {
                        error!(%err, "accept error");
                    }
                }
            }
        }
    }
}

/// Reads the request preamble off the raw connection so upgrade requests
/// can be hijacked before any response is written. Plain requests are
/// replayed into a hyper connection.
async fn handle_connection(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    cfg: Arc<ProxyConfig>,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let (req, preamble_end) = loop {
        match parse_preamble(&buf) {
            Preamble::Request { req, end } => break (req, end),
            Preamble::Invalid => {
                let _ = stream
                    .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
                return;
            }
            Preamble::Incomplete => {
                if buf.len() >= MAX_PREAMBLE {
                    let _ = stream
                        .write_all(b"HTTP/1.1 431 Request Header Fields Too Large\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                        .await;
                    return;
                }
                match stream.read_buf(&mut buf).await {
                    Ok(0) => return,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(%err, "client read error");
                        return;
                    }
                }
            }
        }
    };

    if is_upgrade_request(&req) {
        // Bytes past the preamble already belong to the upgraded protocol.
        let head = Bytes::copy_from_slice(&buf[preamble_end..]);
        if let Err(err) = ws(req, &mut stream, head, &cfg).await {
            warn!(client = %remote_addr, %err, "upgrade proxy failed");
            let status = err.status_code();
            let response = format!(
                "HTTP/1.1 {} {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Error"),
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
        return;
    }

    let conn_info = ConnInfo::new(local_addr, remote_addr);
    let service = service_fn(move |req: Request<Body>| {
        let cfg = cfg.clone();
        async move {
            match web(req, conn_info, &cfg).await {
                Ok(response) => Ok::<_, Infallible>(response),
                Err(err) => {
                    warn!(client = %conn_info.remote_addr, %err, "proxy error");
                    Ok(error_response(&err))
                }
            }
        }
    });

    let replay = Rewind::new(buf.freeze(), stream);
    if let Err(err) = Http::new().serve_connection(replay, service).await {
        debug!(%err, "connection error");
    }
}

enum Preamble {
    Incomplete,
    Invalid,
    Request { req: Request<Body>, end: usize },
}

fn parse_preamble(buf: &[u8]) -> Preamble {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers);
    let end = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(end)) => end,
        Ok(httparse::Status::Partial) => return Preamble::Incomplete,
        Err(_) => return Preamble::Invalid,
    };

    let (Some(method), Some(path), Some(version)) = (parsed.method, parsed.path, parsed.version)
    else {
        return Preamble::Invalid;
    };

    let mut builder = Request::builder().method(method).uri(path).version(if version == 0 {
        http::Version::HTTP_10
    } else {
        http::Version::HTTP_11
    });
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    match builder.body(Body::empty()) {
        Ok(req) => Preamble::Request { req, end },
        Err(_) => Preamble::Invalid,
    }
}

fn is_upgrade_request(req: &Request<Body>) -> bool {
    let has_conn_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_conn_upgrade && req.headers().contains_key(UPGRADE)
}

fn error_response(err: &ProxyError) -> Response<Body> {
    Response::builder()
        .status(err.status_code())
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(err.to_string()))
        .unwrap()
}

/// Serves the already-consumed preamble bytes back to hyper before
/// continuing from the socket.
struct Rewind {
    prefix: Bytes,
    inner: TcpStream,
}

impl Rewind {
    fn new(prefix: Bytes, inner: TcpStream) -> Self {
        Self { prefix, inner }
    }
}

impl AsyncRead for Rewind {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            let chunk = this.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
