//! End-to-end scenarios against an in-process `hyper` stub server, grounded
//! in the pack's `wilsonzlin-aero` streaming tests (range-request handling
//! shape) rather than mocking at the `reqwest` layer.

use std::convert::Infallible;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hyper::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};

use turbodl::{DownloadOptions, HashType, MaxConnections};

fn make_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Spawns a stub server. `fail_first_n_range_requests` returns a connection-
/// reset-style empty body with a 500 for that many ranged GETs before
/// starting to serve real bytes, to exercise scenario S4 (retry with
/// partial progress).
fn spawn_server(
    data: Arc<Vec<u8>>,
    fail_first_n_range_requests: u32,
) -> (String, tokio::task::JoinHandle<()>) {
    let attempts = Arc::new(AtomicU32::new(0));

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let addr = listener.local_addr().expect("server addr");

    let make_svc = make_service_fn(move |_| {
        let data = data.clone();
        let attempts = attempts.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let data = data.clone();
                let attempts = attempts.clone();
                async move {
                    Ok::<_, Infallible>(handle(req, data, attempts, fail_first_n_range_requests))
                }
            }))
        }
    });

    let server = Server::from_tcp(listener).expect("server from_tcp").serve(make_svc);
    let handle = tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{addr}/payload.bin"), handle)
}

fn handle(req: Request<Body>, data: Arc<Vec<u8>>, attempts: Arc<AtomicU32>, fail_first_n: u32) -> Response<Body> {
    let total = data.len() as u64;
    let base = Response::builder().header(ACCEPT_RANGES, "bytes");

    match *req.method() {
        Method::HEAD => {
            return base
                .status(StatusCode::OK)
                .header(CONTENT_LENGTH, total.to_string())
                .body(Body::empty())
                .expect("head response");
        }
        Method::GET => {}
        _ => return base.status(StatusCode::METHOD_NOT_ALLOWED).body(Body::empty()).expect("405"),
    }

    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
    if attempt < fail_first_n {
        return base
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .expect("injected 500");
    }

    let range = req.headers().get(RANGE).and_then(|v| v.to_str().ok());
    let Some(range) = range else {
        return base
            .status(StatusCode::OK)
            .header(CONTENT_LENGTH, total.to_string())
            .body(Body::from(data.as_ref().clone()))
            .expect("full body response");
    };

    let spec = range.strip_prefix("bytes=").unwrap_or(range);
    let (start_s, end_s) = spec.split_once('-').unwrap_or((spec, ""));
    let start: u64 = start_s.parse().unwrap_or(0);
    let end: u64 = if end_s.is_empty() {
        total.saturating_sub(1)
    } else {
        end_s.parse().unwrap_or(total.saturating_sub(1)).min(total.saturating_sub(1))
    };

    let body = data[start as usize..=end as usize].to_vec();
    base.status(StatusCode::PARTIAL_CONTENT)
        .header(CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))
        .header(CONTENT_LENGTH, (end - start + 1).to_string())
        .body(Body::from(body))
        .expect("partial content response")
}

#[tokio::test]
async fn downloads_small_file_end_to_end() {
    let data = Arc::new(make_test_data(4096));
    let (url, _server) = spawn_server(data.clone(), 0);

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("out.bin");

    let mut options = DownloadOptions::default();
    options.show_progress = false;

    let final_path = turbodl::download(&url, &destination, options).await.unwrap();
    assert_eq!(final_path, destination);
    assert_eq!(std::fs::read(&final_path).unwrap(), *data);
}

#[tokio::test]
async fn downloads_multi_chunk_file_with_forced_connection_count() {
    let data = Arc::new(make_test_data(2_000_000));
    let (url, _server) = spawn_server(data.clone(), 0);

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("big.bin");

    let mut options = DownloadOptions::default();
    options.show_progress = false;
    options.max_connections = MaxConnections::Fixed(6);

    let final_path = turbodl::download(&url, &destination, options).await.unwrap();
    assert_eq!(std::fs::read(&final_path).unwrap(), *data);
}

#[tokio::test]
async fn retries_through_transient_server_errors_scenario_s4() {
    let data = Arc::new(make_test_data(500_000));
    // Force a single worker so there's exactly one retry sequence to reason
    // about, and fail its first two attempts before succeeding.
    let (url, _server) = spawn_server(data.clone(), 2);

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("retried.bin");

    let mut options = DownloadOptions::default();
    options.show_progress = false;
    options.max_connections = MaxConnections::Fixed(1);

    let final_path = turbodl::download(&url, &destination, options).await.unwrap();
    assert_eq!(std::fs::read(&final_path).unwrap(), *data);
}

#[tokio::test]
async fn hash_mismatch_leaves_no_file_at_destination_scenario_s5() {
    let data = Arc::new(make_test_data(1024));
    let (url, _server) = spawn_server(data.clone(), 0);

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("hashed.bin");

    let mut options = DownloadOptions::default();
    options.show_progress = false;
    options.expected_hash = Some("0".repeat(32));
    options.hash_type = HashType::Md5;

    let err = turbodl::download(&url, &destination, options).await.unwrap_err();
    assert!(matches!(err, turbodl::TurboDlError::HashMismatch { .. }));
    assert!(!destination.exists());
}

#[tokio::test]
async fn passes_hash_verification_when_digest_matches() {
    let data = Arc::new(make_test_data(1024));
    let (url, _server) = spawn_server(data.clone(), 0);

    let expected = md5_hex(&data);

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("verified.bin");

    let mut options = DownloadOptions::default();
    options.show_progress = false;
    options.expected_hash = Some(expected);
    options.hash_type = HashType::Md5;

    let final_path = turbodl::download(&url, &destination, options).await.unwrap();
    assert_eq!(std::fs::read(&final_path).unwrap(), *data);
}

#[tokio::test]
async fn collision_resolution_picks_suffixed_name_scenario_s6() {
    let data = Arc::new(make_test_data(2048));
    let (url, _server) = spawn_server(data.clone(), 0);

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("existing.bin");
    std::fs::write(&destination, b"already here").unwrap();

    let mut options = DownloadOptions::default();
    options.show_progress = false;
    options.overwrite = false;

    let final_path = turbodl::download(&url, &destination, options).await.unwrap();
    assert_eq!(final_path, dir.path().join("existing_1.bin"));
    assert_eq!(std::fs::read(&final_path).unwrap(), *data);
    assert_eq!(std::fs::read(&destination).unwrap(), b"already here");
}

#[tokio::test]
async fn destination_directory_uses_probed_filename() {
    let data = Arc::new(make_test_data(512));
    let (url, _server) = spawn_server(data.clone(), 0);

    let dir = tempfile::tempdir().unwrap();

    let mut options = DownloadOptions::default();
    options.show_progress = false;

    let final_path = turbodl::download(&url, dir.path(), options).await.unwrap();
    assert_eq!(final_path, dir.path().join("payload.bin"));
}

/// A second stub server whose handler permanently 404s range requests whose
/// start offset is `fatal_start`, simulating one chunk out of several hitting
/// a non-retryable remote error while its siblings succeed.
fn spawn_server_with_fatal_chunk(data: Arc<Vec<u8>>, fatal_start: u64) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let addr = listener.local_addr().expect("server addr");

    let make_svc = make_service_fn(move |_| {
        let data = data.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let data = data.clone();
                async move { Ok::<_, Infallible>(handle_with_fatal_chunk(req, data, fatal_start)) }
            }))
        }
    });

    let server = Server::from_tcp(listener).expect("server from_tcp").serve(make_svc);
    let handle = tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{addr}/payload.bin"), handle)
}

fn handle_with_fatal_chunk(req: Request<Body>, data: Arc<Vec<u8>>, fatal_start: u64) -> Response<Body> {
    let total = data.len() as u64;
    let base = Response::builder().header(ACCEPT_RANGES, "bytes");

    match *req.method() {
        Method::HEAD => {
            return base
                .status(StatusCode::OK)
                .header(CONTENT_LENGTH, total.to_string())
                .body(Body::empty())
                .expect("head response");
        }
        Method::GET => {}
        _ => return base.status(StatusCode::METHOD_NOT_ALLOWED).body(Body::empty()).expect("405"),
    }

    let range = req.headers().get(RANGE).and_then(|v| v.to_str().ok()).unwrap_or("bytes=0-");
    let spec = range.strip_prefix("bytes=").unwrap_or(range);
    let (start_s, end_s) = spec.split_once('-').unwrap_or((spec, ""));
    let start: u64 = start_s.parse().unwrap_or(0);

    if start == fatal_start {
        return base.status(StatusCode::NOT_FOUND).body(Body::empty()).expect("404");
    }

    let end: u64 = if end_s.is_empty() {
        total.saturating_sub(1)
    } else {
        end_s.parse().unwrap_or(total.saturating_sub(1)).min(total.saturating_sub(1))
    };

    let body = data[start as usize..=end as usize].to_vec();
    base.status(StatusCode::PARTIAL_CONTENT)
        .header(CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))
        .header(CONTENT_LENGTH, (end - start + 1).to_string())
        .body(Body::from(body))
        .expect("partial content response")
}

/// A third stub server whose single-request (no-Range) GET truncates its
/// body mid-stream on the first attempt, then serves the full body on the
/// next, simulating scenario S4's "retry with partial progress" in
/// single-connection mode rather than ranged mode.
fn spawn_server_truncating_first_whole_body(data: Arc<Vec<u8>>) -> (String, tokio::task::JoinHandle<()>) {
    let attempts = Arc::new(AtomicU32::new(0));

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let addr = listener.local_addr().expect("server addr");

    let make_svc = make_service_fn(move |_| {
        let data = data.clone();
        let attempts = attempts.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let data = data.clone();
                let attempts = attempts.clone();
                async move { Ok::<_, Infallible>(handle_truncating_first_whole_body(req, data, attempts)) }
            }))
        }
    });

    let server = Server::from_tcp(listener).expect("server from_tcp").serve(make_svc);
    let handle = tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{addr}/payload.bin"), handle)
}

fn handle_truncating_first_whole_body(
    req: Request<Body>,
    data: Arc<Vec<u8>>,
    attempts: Arc<AtomicU32>,
) -> Response<Body> {
    let total = data.len() as u64;
    let base = Response::builder().header(ACCEPT_RANGES, "bytes");

    match *req.method() {
        Method::HEAD => {
            return base
                .status(StatusCode::OK)
                .header(CONTENT_LENGTH, total.to_string())
                .body(Body::empty())
                .expect("head response");
        }
        Method::GET => {}
        _ => return base.status(StatusCode::METHOD_NOT_ALLOWED).body(Body::empty()).expect("405"),
    }

    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
    if attempt == 0 {
        // Stream half the body, then end the stream with an error instead of
        // the remaining bytes — a connection reset partway through a
        // single-request (no-Range) transfer.
        let half = data[..data.len() / 2].to_vec();
        let stream = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(bytes::Bytes::from(half)),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "simulated drop")),
        ]);
        return base
            .status(StatusCode::OK)
            .header(CONTENT_LENGTH, total.to_string())
            .body(Body::wrap_stream(stream))
            .expect("truncated body response");
    }

    base.status(StatusCode::OK)
        .header(CONTENT_LENGTH, total.to_string())
        .body(Body::from(data.as_ref().clone()))
        .expect("full body response")
}

/// Regression test: in single-request mode, a retry after a mid-stream
/// disconnect must not offset the rewritten bytes by the partial progress
/// from the failed attempt — the resumed response resends the whole body
/// from byte 0, not a continuation.
#[tokio::test]
async fn single_request_retry_does_not_offset_bytes_past_byte_zero() {
    let data = Arc::new(make_test_data(4096));
    let (url, _server) = spawn_server_truncating_first_whole_body(data.clone());

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("resumed.bin");

    let mut options = DownloadOptions::default();
    options.show_progress = false;

    let final_path = turbodl::download(&url, &destination, options).await.unwrap();
    assert_eq!(std::fs::read(&final_path).unwrap(), *data);
}

/// Regression test: a non-head chunk hitting a non-retryable error in
/// buffered multi-chunk mode must not deadlock the writer on the permanent
/// gap it leaves at `head_offset`, and siblings must be canceled rather than
/// left retrying. Wrapped in a timeout so a regression fails loudly instead
/// of hanging the test suite.
#[tokio::test]
async fn fatal_error_in_non_head_chunk_does_not_deadlock_buffered_writer() {
    // Must exceed the 1 MiB single-worker floor (spec.md §4.B) so `Fixed(4)`
    // actually yields 4 chunks instead of collapsing to one.
    let size = 2_000_000usize;
    let data = Arc::new(make_test_data(size));
    // Chunk 1 of 4 (size/4 == 500_000) always 404s.
    let (url, _server) = spawn_server_with_fatal_chunk(data.clone(), 500_000);

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("fatal.bin");

    let mut options = DownloadOptions::default();
    options.show_progress = false;
    options.max_connections = MaxConnections::Fixed(4);
    options.use_ram_buffer = turbodl::Tri::On;

    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        turbodl::download(&url, &destination, options),
    )
    .await
    .expect("download must not deadlock when a non-head chunk fails fatally");

    let err = outcome.unwrap_err();
    assert!(matches!(err, turbodl::TurboDlError::RemoteError { status: 404 }));
    assert!(!destination.exists());
}

fn md5_hex(data: &[u8]) -> String {
    use digest::Digest;
    use md5::Md5;
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
