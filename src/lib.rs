//! Forwarding engine for an HTTP/1.1 reverse proxy.
//!
//! The crate is meant to be embedded in a host server that owns the
//! listening sockets, routing, and TLS termination. The host hands each
//! inbound exchange to one of two entry points: [`web`] for plain
//! request/response traffic and [`ws`] for protocol upgrades over a
//! hijacked client socket. Both rewrite headers (hop-by-hop stripping,
//! `Forwarded`, `Via`), dial the configured upstream, and stream bytes
//! until the exchange ends, releasing everything they own on every exit
//! path. See `src/main.rs` for a minimal embedding.

mod errors;
mod forward;
mod headers;
mod idle;

pub use errors::ProxyError;
pub use forward::{tune_socket, web, ws};

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::request::Parts;
use hyper::{Body, Request, Response};

/// Error type for [`OnReq`] / [`OnRes`] hooks. A failing hook aborts the
/// exchange with [`ProxyError::Hook`].
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Adjusts the outgoing upstream request (headers, method, target) after
/// the engine has built it. First argument is the inbound request head.
pub type OnReq =
    Arc<dyn Fn(&Parts, &mut Request<Body>) -> Result<(), HookError> + Send + Sync>;

/// Observes or mutates the upstream response before the caller flushes it
/// to the client. The only hook that may rewrite status and headers.
pub type OnRes =
    Arc<dyn Fn(&Parts, &mut Response<Body>) -> Result<(), HookError> + Send + Sync>;

/// Connection metadata for one inbound exchange, supplied by the host in
/// [`web`] mode and derived from the client socket in [`ws`] mode. Feeds
/// the `Forwarded` header (`by`/`for`/`proto`).
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    /// Address the host accepted the connection on.
    pub local_addr: SocketAddr,
    /// Address of the connecting client.
    pub remote_addr: SocketAddr,
    /// Whether the client connection is TLS-terminated (`proto=https`).
    pub secure: bool,
}

impl ConnInfo {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            remote_addr,
            secure: false,
        }
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

/// Per-call forwarding options. Immutable for the duration of one call;
/// clone-cheap so hosts can share one instance per route.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Upstream host to dial.
    pub hostname: String,
    /// Upstream port.
    pub port: u16,
    /// Idle limit applied to the inbound request body. Expiring fails the
    /// exchange with 408.
    pub timeout: Option<Duration>,
    /// Idle limit applied to the upstream side (response head and body).
    /// Expiring fails the exchange with 504.
    pub proxy_timeout: Option<Duration>,
    /// Identity appended to `Via` and matched for loop detection. Without
    /// it no `Via` entry is written and loops are not detected.
    pub proxy_name: Option<String>,
    pub on_req: Option<OnReq>,
    pub on_res: Option<OnRes>,
}

impl ProxyConfig {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            timeout: None,
            proxy_timeout: None,
            proxy_name: None,
            on_req: None,
            on_res: None,
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("proxy_timeout", &self.proxy_timeout)
            .field("proxy_name", &self.proxy_name)
            .field("on_req", &self.on_req.is_some())
            .field("on_res", &self.on_res.is_some())
            .finish()
    }
}
