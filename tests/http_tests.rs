use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header;
use axum::routing::get;
use axum::Router;
use svcprobe_rs::catalog::ProtocolCatalog;
use svcprobe_rs::verify::{compute_digest, ContentRule, DigestAlgorithm, Verdict};
use svcprobe_rs::{EngineConfig, Outcome, Scheduler, TargetDescriptor, TestResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn probe(target: TargetDescriptor) -> TestResult {
    let scheduler = Scheduler::new(Arc::new(ProtocolCatalog::builtin()), EngineConfig::default());
    let mut results = scheduler.submit(vec![target], 1, Duration::from_secs(5)).collect_all().await;
    assert_eq!(results.len(), 1);
    results.remove(0)
}

/// Serves one canned response, written in the given fragments with a pause
/// between each, then closes.
async fn raw_server(fragments: Vec<&'static [u8]>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut s, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = s.read(&mut buf).await;
        for f in fragments {
            s.write_all(f).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });
    port
}

#[tokio::test]
async fn fragmented_chunked_response_is_decoded() {
    let port = raw_server(vec![
        &b"HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nTransfer-"[..],
        b"Encoding: chunked\r\n\r\n6\r\n<html>\r",
        b"\n7;ext=1\r\nhealthy\r\n",
        b"7\r\n</html>\r\n0\r\n\r\n",
    ])
    .await;

    let target = TargetDescriptor::new("web", LOCALHOST, port, "http")
        .with_content(ContentRule::pattern("<html>healthy</html>").unwrap());
    let r = probe(target).await;

    assert_eq!(r.outcome, Outcome::Ok);
    assert_eq!(r.http_status, Some(200));
    assert_eq!(r.content_type.as_deref(), Some("text/html; charset=utf-8"));
    assert_eq!(r.content_verification, Some(Verdict::Pass));
    assert_eq!(
        r.content_digest,
        Some(compute_digest(DigestAlgorithm::Sha256, b"<html>healthy</html>"))
    );
    let banner = r.banner.unwrap();
    assert!(banner.starts_with("HTTP/1.1 200 OK\\r\\n"));
    assert!(!banner.contains("healthy"));
}

#[tokio::test]
async fn continue_then_content_length() {
    let port = raw_server(vec![
        &b"HTTP/1.1 100 Continue\r\n\r\n"[..],
        b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 11\r\n\r\nmaintenance",
    ])
    .await;

    let target = TargetDescriptor::new("web", LOCALHOST, port, "http")
        .with_content(ContentRule::digest(&compute_digest(DigestAlgorithm::Sha256, b"maintenance")).unwrap());
    let r = probe(target).await;
    assert_eq!(r.outcome, Outcome::Ok);
    assert_eq!(r.http_status, Some(503));
    assert_eq!(r.content_verification, Some(Verdict::Pass));
}

#[tokio::test]
async fn eof_inside_chunked_body_is_io_error() {
    let port = raw_server(vec![
        &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n10\r\nonly-half"[..],
    ])
    .await;

    let r = probe(TargetDescriptor::new("web", LOCALHOST, port, "http")).await;
    assert_eq!(r.outcome, Outcome::Io);
    assert!(r.content_verification.is_none());
}

#[tokio::test]
async fn non_hex_chunk_size_is_io_error() {
    let port = raw_server(vec![&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nnope\r\n0\r\n\r\n"[..]]).await;
    let r = probe(TargetDescriptor::new("web", LOCALHOST, port, "http")).await;
    assert_eq!(r.outcome, Outcome::Io);
}

#[tokio::test]
async fn close_delimited_body() {
    let port = raw_server(vec![&b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nall "[..], b"good"]).await;
    let target = TargetDescriptor::new("web", LOCALHOST, port, "http")
        .with_content(ContentRule::content_type("TEXT/PLAIN"));
    let r = probe(target).await;
    assert_eq!(r.outcome, Outcome::Ok);
    assert_eq!(r.content_digest, Some(compute_digest(DigestAlgorithm::Sha256, b"all good")));
    assert_eq!(r.content_verification, Some(Verdict::Pass));
}

#[tokio::test]
async fn digest_covers_body_beyond_capture_limit() {
    const BODY: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let port = raw_server(vec![
        &b"HTTP/1.1 200 OK\r\nContent-Length: 36\r\n\r\n0123456789"[..],
        b"abcdefghijklmnopqrstuvwxyz",
    ])
    .await;

    let config = EngineConfig {
        max_read_bytes: 16,
        ..Default::default()
    };
    let scheduler = Scheduler::new(Arc::new(ProtocolCatalog::builtin()), config);
    let target = TargetDescriptor::new("web", LOCALHOST, port, "http")
        .with_content(ContentRule::digest(&compute_digest(DigestAlgorithm::Sha1, BODY)).unwrap());
    let mut results = scheduler.submit(vec![target], 1, Duration::from_secs(5)).collect_all().await;
    let r = results.remove(0);

    assert_eq!(r.outcome, Outcome::Ok);
    assert_eq!(r.content_verification, Some(Verdict::Pass));
    assert_eq!(r.content_digest, Some(compute_digest(DigestAlgorithm::Sha256, BODY)));
}

async fn streamed() -> impl axum::response::IntoResponse {
    let parts = ["alpha ", "beta ", "gamma"].map(|p| Ok::<_, Infallible>(Bytes::from(p)));
    (
        [(header::CONTENT_TYPE, "text/plain")],
        Body::from_stream(futures::stream::iter(parts)),
    )
}

async fn axum_server() -> u16 {
    let app = Router::new().route("/stream", get(streamed));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

#[tokio::test]
async fn streamed_response_from_real_server() {
    let port = axum_server().await;

    let target = TargetDescriptor::new("localhost", LOCALHOST, port, "http")
        .with_http_path("/stream")
        .with_content(ContentRule::pattern("^alpha beta gamma$").unwrap());
    let r = probe(target).await;
    assert_eq!(r.outcome, Outcome::Ok);
    assert_eq!(r.http_status, Some(200));
    assert_eq!(r.content_type.as_deref(), Some("text/plain"));
    assert_eq!(r.content_verification, Some(Verdict::Pass));

    let missing = probe(TargetDescriptor::new("localhost", LOCALHOST, port, "http").with_http_path("/nope")).await;
    assert_eq!(missing.outcome, Outcome::Ok);
    assert_eq!(missing.http_status, Some(404));
}
