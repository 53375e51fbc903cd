#![allow(missing_docs)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use clustermap::config::Config;
use clustermap::model::{GraphNode, NodeKind};
use clustermap::precalc::Precalculator;
use clustermap::serve::compress::{decode, Encoding};
use clustermap::serve::{build_router, AppState};
use clustermap::store::Store;
use http_body_util::BodyExt;
use tempfile::{tempdir, TempDir};
use tower::util::ServiceExt;

fn setup_with(config: Config) -> (TempDir, AppState, Router) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("pipeline.db"), 4).expect("open");
    store.migrate().expect("migrate");
    let nodes: Vec<GraphNode> = (0..50)
        .map(|i| GraphNode {
            id: format!("n{i:03}"),
            name: format!("node number {i}"),
            val: Some(i.to_string()),
            kind: Some(NodeKind::Post),
            pos_x: None,
            pos_y: None,
            pos_z: None,
        })
        .collect();
    store.upsert_nodes(&nodes).expect("seed");
    let precalc = Precalculator::new(store.clone(), config.layout.clone());
    let state = AppState::new(store, config, precalc, None);
    let router = build_router(state.clone());
    (dir, state, router)
}

fn setup() -> (TempDir, AppState, Router) {
    setup_with(Config::default())
}

async fn get_with_headers(
    router: &Router,
    uri: &str,
    headers: &[(&str, &str)],
) -> axum::http::Response<axum::body::Body> {
    let mut builder = Request::builder().uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    router
        .clone()
        .oneshot(builder.body(Body::empty()).expect("request"))
        .await
        .expect("response")
}

async fn body_bytes(response: axum::http::Response<axum::body::Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn brotli_preferred_on_equal_quality() {
    let (_dir, _state, router) = setup();
    let response = get_with_headers(
        &router,
        "/api/graph?max_nodes=50",
        &[("accept-encoding", "gzip;q=1.0, br;q=1.0")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok()),
        Some("br")
    );
    assert_eq!(
        response.headers().get("vary").and_then(|v| v.to_str().ok()),
        Some("Accept-Encoding")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_quality_brotli_falls_back_to_gzip() {
    let (_dir, _state, router) = setup();
    let response = get_with_headers(
        &router,
        "/api/graph?max_nodes=50",
        &[("accept-encoding", "br;q=0, gzip")],
    )
    .await;
    assert_eq!(
        response
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok()),
        Some("gzip")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_coding_sends_identity() {
    let (_dir, _state, router) = setup();
    let response = get_with_headers(
        &router,
        "/api/graph?max_nodes=50",
        &[("accept-encoding", "deflate")],
    )
    .await;
    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(
        response.headers().get("vary").and_then(|v| v.to_str().ok()),
        Some("Accept-Encoding")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encoded_bodies_decode_to_the_identity_body() {
    let (_dir, _state, router) = setup();
    let identity = body_bytes(get_with_headers(&router, "/api/graph?max_nodes=50", &[]).await).await;

    let gzipped = get_with_headers(
        &router,
        "/api/graph?max_nodes=50",
        &[("accept-encoding", "gzip")],
    )
    .await;
    assert_eq!(
        gzipped
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok()),
        Some("gzip")
    );
    let gz_body = body_bytes(gzipped).await;
    assert_eq!(decode(Encoding::Gzip, &gz_body).expect("gunzip"), identity);

    let brotlied = get_with_headers(
        &router,
        "/api/graph?max_nodes=50",
        &[("accept-encoding", "br")],
    )
    .await;
    let br_body = body_bytes(brotlied).await;
    assert_eq!(decode(Encoding::Brotli, &br_body).expect("unbrotli"), identity);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn etag_round_trip_yields_304() {
    let (_dir, _state, router) = setup();
    let first = get_with_headers(&router, "/api/graph?max_nodes=10", &[]).await;
    assert_eq!(first.status(), StatusCode::OK);
    let etag = first
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .expect("etag")
        .to_string();
    let cache_control = first
        .headers()
        .get("cache-control")
        .and_then(|v| v.to_str().ok())
        .expect("cache-control")
        .to_string();
    assert_eq!(
        cache_control,
        "public, max-age=60, stale-while-revalidate=300"
    );

    let second = get_with_headers(
        &router,
        "/api/graph?max_nodes=10",
        &[("if-none-match", &etag)],
    )
    .await;
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(
        second
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok()),
        Some(etag.as_str())
    );
    assert_eq!(
        second
            .headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
        Some(cache_control.as_str())
    );
    let body = body_bytes(second).await;
    assert!(body.is_empty(), "304 carries no body");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn etag_is_stable_across_encodings() {
    let (_dir, _state, router) = setup();
    let plain = get_with_headers(&router, "/api/graph?max_nodes=10", &[]).await;
    let gzipped = get_with_headers(
        &router,
        "/api/graph?max_nodes=10",
        &[("accept-encoding", "gzip")],
    )
    .await;
    assert_eq!(
        plain.headers().get("etag"),
        gzipped.headers().get("etag"),
        "the entity tag hashes the uncompressed body"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn per_ip_rate_limit_returns_429_with_retry_after() {
    let mut config = Config::default();
    config.rate_limit.per_ip_rps = 0.1;
    config.rate_limit.per_ip_burst = 2;
    let (_dir, state, router) = setup_with(config);

    for _ in 0..2 {
        let response = get_with_headers(&router, "/api/graph/version", &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let limited = get_with_headers(&router, "/api/graph/version", &[]).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = limited
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .expect("retry-after")
        .parse()
        .expect("seconds");
    assert!(retry_after >= 1);
    let body = body_bytes(limited).await;
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed["code"], "rate_limited");
    assert_eq!(
        state
            .metrics
            .rate_limited
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    // A different client address is unaffected.
    let other = get_with_headers(
        &router,
        "/api/graph/version",
        &[("x-forwarded-for", "203.0.113.9")],
    )
    .await;
    assert_eq!(other.status(), StatusCode::OK);
}
