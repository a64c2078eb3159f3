use std::io;

use http::StatusCode;

/// Why a forwarded exchange failed. The embedding server is responsible for
/// turning this into a client-facing response; [`ProxyError::status_code`]
/// gives the suggested status and [`ProxyError::code`] the classic socket
/// error mnemonic where one applies.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The `Via` chain already names this proxy.
    #[error("loop detected")]
    LoopDetected,
    /// Upgrade requests must be `GET`.
    #[error("method not allowed")]
    MethodNotAllowed,
    /// The inbound `Upgrade` header named a protocol other than websocket.
    #[error("unsupported upgrade")]
    UnsupportedUpgrade,
    /// The client went idle past the configured inbound limit.
    #[error("request timeout")]
    RequestTimeout,
    /// The upstream went idle past the configured limit.
    #[error("gateway timeout")]
    GatewayTimeout,
    /// The upstream answered a plain exchange with `101 Switching Protocols`.
    #[error("upstream switched protocols on a non-upgrade exchange")]
    UnexpectedUpgrade,
    /// The upstream dropped the connection mid-exchange.
    #[error("socket hang up")]
    UpstreamReset(#[source] hyper::Error),
    /// The upstream connection could not be established.
    #[error("upstream unreachable: {0}")]
    Connect(#[source] io::Error),
    /// The upstream sent bytes that do not parse as HTTP/1.1.
    #[error("upstream protocol violation: {0}")]
    UpstreamProtocol(#[source] hyper::Error),
    /// The inbound request could not be rewritten into an upstream request.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(&'static str),
    /// A caller-supplied hook refused the exchange.
    #[error("hook failed: {0}")]
    Hook(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Any other upstream transport failure.
    #[error("upstream error: {0}")]
    Upstream(#[source] hyper::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Suggested HTTP status for an error response to the client. Only
    /// meaningful while the response head has not been flushed yet.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::LoopDetected => StatusCode::LOOP_DETECTED,
            ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::UnsupportedUpgrade => StatusCode::BAD_REQUEST,
            ProxyError::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            ProxyError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UnexpectedUpgrade
            | ProxyError::UpstreamReset(_)
            | ProxyError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Connect(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::InvalidRequest(_)
            | ProxyError::Hook(_)
            | ProxyError::Upstream(_)
            | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Socket-level error mnemonic, when the failure maps onto one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ProxyError::UpstreamReset(_) => Some("ECONNRESET"),
            ProxyError::Connect(err) => match err.kind() {
                io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
                io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
                io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
                // DNS failures surface as uncategorized lookup errors.
                _ if err.to_string().contains("lookup") => Some("ENOTFOUND"),
                _ => None,
            },
            _ => None,
        }
    }
}
