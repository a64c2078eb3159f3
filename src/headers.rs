// Header rewriting applied on the way to the upstream and, for hop-by-hop
// filtering, on the way back: requests from clients to the upstream and
// responses coming back from the upstream to the client.

use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, FORWARDED, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE, VIA,
};
use http::Version;

use crate::ConnInfo;

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    UPGRADE,
    PROXY_AUTHORIZATION,
    TRAILER,
];

// Hop-by-hop names the `http` crate has no named constant for.
static HOP_BY_HOP_EXTRA: &[&str] = &["keep-alive", "proxy-connection", "http2-settings"];

/// Removes connection-scoped headers before a message crosses the proxy:
/// the standard hop-by-hop set plus any header named by the `Connection`
/// header value.
pub(crate) fn filter_hop_by_hop(headers: &mut HeaderMap) {
    // Parse the Connection header for additional headers to drop before
    // the header itself is removed.
    let mut named_drops = Vec::new();
    if let Some(connection) = headers.get(CONNECTION).and_then(|v| v.to_str().ok()) {
        for token in connection.split(',').map(str::trim) {
            if token.is_empty()
                || token.eq_ignore_ascii_case("connection")
                || token.eq_ignore_ascii_case("keep-alive")
            {
                continue;
            }
            if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                named_drops.push(name);
            }
        }
    }

    for name in HOP_BY_HOP_NAMES {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_EXTRA {
        headers.remove(*name);
    }
    for name in named_drops {
        headers.remove(&name);
    }
}

/// Builds the `Forwarded` value sent upstream (RFC 7239). The value is
/// synthesized per exchange; an inbound `Forwarded` contributes only its
/// `for=` tokens, appended in their original order. Parameters always
/// appear as `by`, `for`..., `host`, `proto`.
pub(crate) fn forwarded_value(
    inbound: &HeaderMap,
    authority: Option<&str>,
    conn: &ConnInfo,
) -> String {
    let mut value = format!(
        "by={}; for={}",
        conn.local_addr.ip(),
        conn.remote_addr.ip()
    );

    if let Some(previous) = inbound.get(FORWARDED).and_then(|v| v.to_str().ok()) {
        for token in forwarded_for_tokens(previous) {
            value.push_str("; for=");
            value.push_str(token);
        }
    }

    if let Some(host) = authority {
        value.push_str("; host=");
        value.push_str(host);
    }

    value.push_str("; proto=");
    value.push_str(if conn.secure { "https" } else { "http" });
    value
}

// Lenient extraction of `for=` tokens from a prior proxy's Forwarded value.
// Malformed segments are skipped.
fn forwarded_for_tokens(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c| c == ';' || c == ',')
        .filter_map(|segment| {
            let (key, token) = segment.trim().split_once('=')?;
            if key.trim().eq_ignore_ascii_case("for") {
                Some(token.trim())
            } else {
                None
            }
        })
        .filter(|token| !token.is_empty())
}

/// Appends `"<version> <name>"` to the `Via` chain, or starts one.
pub(crate) fn add_via(headers: &mut HeaderMap, version: Version, name: &str) {
    let Some(version) = version_token(version) else {
        tracing::warn!(?version, "unknown HTTP version, skipping Via header");
        return;
    };

    let entry = format!("{} {}", version, name);
    let value = match headers.get(VIA).and_then(|existing| existing.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, entry),
        None => entry,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(VIA, value);
    }
}

/// Whether any `Via` entry already names this proxy: case-insensitive
/// suffix match on every comma-separated token.
pub(crate) fn via_contains(headers: &HeaderMap, name: &str) -> bool {
    let needle = name.to_ascii_lowercase();
    headers
        .get_all(VIA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().to_ascii_lowercase().ends_with(&needle))
}

fn version_token(version: Version) -> Option<&'static str> {
    match version {
        Version::HTTP_09 => Some("0.9"),
        Version::HTTP_10 => Some("1.0"),
        Version::HTTP_11 => Some("1.1"),
        Version::HTTP_2 => Some("2"),
        Version::HTTP_3 => Some("3"),
        _ => None,
    }
}
