use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::body::to_bytes;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use relay_proxy::{web, ConnInfo, ProxyConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

fn conn_info() -> ConnInfo {
    ConnInfo::new(
        "10.0.0.1:8080".parse().unwrap(),
        "1.2.3.4:50123".parse().unwrap(),
    )
}

/// Upstream that records the headers it received and answers 200 "hi".
async fn start_upstream_capture() -> (SocketAddr, Arc<Mutex<Option<HeaderMap>>>) {
    let seen = Arc::new(Mutex::new(None));
    let seen_svc = seen.clone();
    let make_svc = make_service_fn(move |_conn| {
        let seen = seen_svc.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let seen = seen.clone();
                async move {
                    *seen.lock().unwrap() = Some(req.headers().clone());
                    Ok::<_, Infallible>(
                        Response::builder()
                            .header("content-type", "text/plain")
                            .body(Body::from("hi"))
                            .unwrap(),
                    )
                }
            }))
        }
    });
    let addr: SocketAddr = (IpAddr::V4(Ipv4Addr::LOCALHOST), 0).into();
    let server = Server::bind(&addr).serve(make_svc);
    let local = server.local_addr();
    tokio::spawn(server);
    (local, seen)
}

/// Upstream that echoes the request body back.
async fn start_upstream_echo() -> SocketAddr {
    let make_svc = make_service_fn(|_conn| async move {
        Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
            let body = to_bytes(req.into_body()).await.unwrap_or_default();
            Ok::<_, Infallible>(Response::new(Body::from(body)))
        }))
    });
    let addr: SocketAddr = (IpAddr::V4(Ipv4Addr::LOCALHOST), 0).into();
    let server = Server::bind(&addr).serve(make_svc);
    let local = server.local_addr();
    tokio::spawn(server);
    local
}

/// Raw upstream that reads the request preamble and writes a fixed
/// response, byte for byte.
async fn start_raw_upstream(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut seen = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        seen.extend_from_slice(&buf[..n]);
                        if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }
            let _ = stream.write_all(response).await;
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plain_get_passthrough() {
    let (upstream, seen) = start_upstream_capture().await;
    let cfg = ProxyConfig::new("127.0.0.1", upstream.port());

    let req = Request::builder()
        .uri("/a?b=1")
        .header("host", "x")
        .body(Body::empty())
        .unwrap();
    let resp = timeout(Duration::from_secs(5), web(req, conn_info(), &cfg))
        .await
        .expect("resp timeout")
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
    let body = to_bytes(resp.into_body()).await.unwrap();
    assert_eq!(&body[..], b"hi");

    let headers = seen.lock().unwrap().clone().expect("upstream saw request");
    assert_eq!(
        headers.get("forwarded").unwrap(),
        "by=10.0.0.1; for=1.2.3.4; host=x; proto=http"
    );
    assert_eq!(headers.get("host").unwrap(), "x");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hop_by_hop_headers_never_forwarded() {
    let (upstream, seen) = start_upstream_capture().await;
    let cfg = ProxyConfig::new("127.0.0.1", upstream.port());

    let req = Request::builder()
        .uri("/strip")
        .header("host", "x")
        .header("connection", "close, x-trace")
        .header("x-trace", "1")
        .header("keep-alive", "timeout=5")
        .header("proxy-connection", "keep-alive")
        .header("proxy-authorization", "Basic Zm9vOmJhcg==")
        .header("te", "trailers")
        .header("trailer", "x-checksum")
        .header("transfer-encoding", "chunked")
        .header("upgrade", "websocket")
        .header("http2-settings", "AAMAAABkAAQAAP__")
        .header("x-keep", "1")
        .body(Body::empty())
        .unwrap();
    let resp = timeout(Duration::from_secs(5), web(req, conn_info(), &cfg))
        .await
        .expect("resp timeout")
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let headers = seen.lock().unwrap().clone().expect("upstream saw request");
    for name in [
        "connection",
        "x-trace",
        "keep-alive",
        "proxy-connection",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "http2-settings",
    ] {
        assert!(headers.get(name).is_none(), "{} was forwarded", name);
    }
    assert_eq!(headers.get("x-keep").unwrap(), "1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forwarded_chain_preserves_order() {
    let (upstream, seen) = start_upstream_capture().await;
    let cfg = ProxyConfig::new("127.0.0.1", upstream.port());

    let req = Request::builder()
        .uri("/chain")
        .header("host", "x")
        .header("forwarded", "for=9.9.9.9, for=8.8.8.8")
        .body(Body::empty())
        .unwrap();
    timeout(Duration::from_secs(5), web(req, conn_info(), &cfg))
        .await
        .expect("resp timeout")
        .unwrap();

    let headers = seen.lock().unwrap().clone().expect("upstream saw request");
    assert_eq!(
        headers.get("forwarded").unwrap(),
        "by=10.0.0.1; for=1.2.3.4; for=9.9.9.9; for=8.8.8.8; host=x; proto=http"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_via_appended_to_existing_chain() {
    let (upstream, seen) = start_upstream_capture().await;
    let mut cfg = ProxyConfig::new("127.0.0.1", upstream.port());
    cfg.proxy_name = Some("edge".to_string());

    let req = Request::builder()
        .uri("/via")
        .header("host", "x")
        .header("via", "1.0 cache")
        .body(Body::empty())
        .unwrap();
    timeout(Duration::from_secs(5), web(req, conn_info(), &cfg))
        .await
        .expect("resp timeout")
        .unwrap();

    let headers = seen.lock().unwrap().clone().expect("upstream saw request");
    assert_eq!(headers.get("via").unwrap(), "1.0 cache, 1.1 edge");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loop_detected_without_dialing_upstream() {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_count = hits.clone();
    tokio::spawn(async move {
        while listener.accept().await.is_ok() {
            hits_count.fetch_add(1, Ordering::SeqCst);
        }
    });

    let mut cfg = ProxyConfig::new("127.0.0.1", addr.port());
    cfg.proxy_name = Some("edge".to_string());

    let req = Request::builder()
        .uri("/loop")
        .header("host", "x")
        .header("via", "1.1 edge")
        .body(Body::empty())
        .unwrap();
    let err = web(req, conn_info(), &cfg).await.unwrap_err();

    assert_eq!(err.status_code(), StatusCode::LOOP_DETECTED);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0, "upstream was dialed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_refused_maps_to_503() {
    // Grab an ephemeral port and close it again.
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let cfg = ProxyConfig::new("127.0.0.1", addr.port());
    let req = Request::builder()
        .uri("/refused")
        .header("host", "x")
        .body(Body::empty())
        .unwrap();
    let err = timeout(Duration::from_secs(5), web(req, conn_info(), &cfg))
        .await
        .expect("resp timeout")
        .unwrap_err();

    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(err.code(), Some("ECONNREFUSED"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_request_body_times_out_with_408() {
    let upstream = start_upstream_echo().await;
    let mut cfg = ProxyConfig::new("127.0.0.1", upstream.port());
    cfg.timeout = Some(Duration::from_millis(100));

    let (sender, body) = Body::channel();
    let req = Request::builder()
        .method("POST")
        .uri("/stall")
        .header("host", "x")
        .body(body)
        .unwrap();

    let err = timeout(Duration::from_secs(5), web(req, conn_info(), &cfg))
        .await
        .expect("resp timeout")
        .unwrap_err();
    drop(sender);

    assert_eq!(err.status_code(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(err.to_string(), "request timeout");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_upstream_times_out_with_504() {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            // Swallow the request, never answer.
            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
        }
    });

    let mut cfg = ProxyConfig::new("127.0.0.1", addr.port());
    cfg.proxy_timeout = Some(Duration::from_millis(100));

    let req = Request::builder()
        .uri("/silent")
        .header("host", "x")
        .body(Body::empty())
        .unwrap();
    let err = timeout(Duration::from_secs(5), web(req, conn_info(), &cfg))
        .await
        .expect("resp timeout")
        .unwrap_err();

    assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hooks_can_adjust_both_directions() {
    let (upstream, seen) = start_upstream_capture().await;
    let mut cfg = ProxyConfig::new("127.0.0.1", upstream.port());
    let on_res_called = Arc::new(AtomicBool::new(false));
    let on_res_flag = on_res_called.clone();
    cfg.on_req = Some(Arc::new(|_parts, upstream_req| {
        upstream_req
            .headers_mut()
            .insert("x-injected", HeaderValue::from_static("1"));
        Ok(())
    }));
    cfg.on_res = Some(Arc::new(move |_parts, response| {
        on_res_flag.store(true, Ordering::SeqCst);
        response
            .headers_mut()
            .insert("x-observed", HeaderValue::from_static("1"));
        Ok(())
    }));

    let req = Request::builder()
        .uri("/hooks")
        .header("host", "x")
        .body(Body::empty())
        .unwrap();
    let resp = timeout(Duration::from_secs(5), web(req, conn_info(), &cfg))
        .await
        .expect("resp timeout")
        .unwrap();

    assert!(on_res_called.load(Ordering::SeqCst));
    assert_eq!(resp.headers().get("x-observed").unwrap(), "1");
    let headers = seen.lock().unwrap().clone().expect("upstream saw request");
    assert_eq!(headers.get("x-injected").unwrap(), "1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_response_hop_by_hop_headers_stripped() {
    let upstream = start_raw_upstream(
        b"HTTP/1.1 200 OK\r\n\
          content-length: 2\r\n\
          foo: bar\r\n\
          connection: x-conn-resp\r\n\
          x-conn-resp: 1\r\n\
          keep-alive: timeout=5\r\n\
          \r\n\
          hi",
    )
    .await;
    let cfg = ProxyConfig::new("127.0.0.1", upstream.port());

    let req = Request::builder()
        .uri("/resp")
        .header("host", "x")
        .body(Body::empty())
        .unwrap();
    let resp = timeout(Duration::from_secs(5), web(req, conn_info(), &cfg))
        .await
        .expect("resp timeout")
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("foo").unwrap(), "bar");
    assert!(resp.headers().get("connection").is_none());
    assert!(resp.headers().get("x-conn-resp").is_none());
    assert!(resp.headers().get("keep-alive").is_none());
    let body = to_bytes(resp.into_body()).await.unwrap();
    assert_eq!(&body[..], b"hi");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_body_round_trips_verbatim() {
    let upstream = start_upstream_echo().await;
    let cfg = ProxyConfig::new("127.0.0.1", upstream.port());

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let req = Request::builder()
        .method("POST")
        .uri("/echo")
        .header("host", "x")
        .body(Body::from(payload.clone()))
        .unwrap();
    let resp = timeout(Duration::from_secs(5), web(req, conn_info(), &cfg))
        .await
        .expect("resp timeout")
        .unwrap();

    let body = to_bytes(resp.into_body()).await.unwrap();
    assert_eq!(&body[..], &payload[..]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unexpected_upgrade_response_is_bad_gateway() {
    let upstream = start_raw_upstream(b"HTTP/1.1 101 Switching Protocols\r\n\r\n").await;
    let cfg = ProxyConfig::new("127.0.0.1", upstream.port());

    let req = Request::builder()
        .uri("/odd")
        .header("host", "x")
        .body(Body::empty())
        .unwrap();
    let err = timeout(Duration::from_secs(5), web(req, conn_info(), &cfg))
        .await
        .expect("resp timeout")
        .unwrap_err();

    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
}
