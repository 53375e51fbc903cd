#![allow(missing_docs)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use clustermap::config::Config;
use clustermap::model::{GraphLink, GraphNode, NodeKind};
use clustermap::precalc::Precalculator;
use clustermap::serve::{build_router, AppState};
use clustermap::store::Store;
use http_body_util::BodyExt;
use tempfile::{tempdir, TempDir};
use tower::util::ServiceExt;

fn setup() -> (TempDir, AppState, Router) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("api.db"), 4).expect("open");
    store.migrate().expect("migrate");
    let config = Config::default();
    let precalc = Precalculator::new(store.clone(), config.layout.clone());
    let state = AppState::new(store, config, precalc, None);
    let router = build_router(state.clone());
    (dir, state, router)
}

fn node(id: &str, val: i64, kind: NodeKind) -> GraphNode {
    GraphNode {
        id: id.to_string(),
        name: id.to_string(),
        val: Some(val.to_string()),
        kind: Some(kind),
        pos_x: None,
        pos_y: None,
        pos_z: None,
    }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec();
    (status, body)
}

async fn post_json(router: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .expect("request"),
        )
        .await
        .expect("response");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec();
    (status, body)
}

fn seed_weighted_graph(state: &AppState, count: i64) {
    let nodes: Vec<GraphNode> = (0..count)
        .map(|i| node(&format!("n{i:05}"), i, NodeKind::Post))
        .collect();
    state.store.upsert_nodes(&nodes).expect("nodes");
    let links: Vec<GraphLink> = (0..count - 1)
        .map(|i| GraphLink {
            source: format!("n{i:05}"),
            target: format!("n{:05}", i + 1),
        })
        .collect();
    state.store.upsert_links(&links).expect("links");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graph_caps_are_honored() {
    let (_dir, state, router) = setup();
    seed_weighted_graph(&state, 300);

    let (status, body) = get(&router, "/api/graph?max_nodes=100&max_links=200").await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    let nodes = parsed["nodes"].as_array().expect("nodes");
    let links = parsed["links"].as_array().expect("links");
    assert_eq!(nodes.len(), 100);
    assert!(links.len() <= 200);
    // The top 100 by weight are vals 200..=299.
    for n in nodes {
        let val: i64 = n["val"].as_str().expect("val").parse().expect("int");
        assert!(val >= 200);
    }
    // Both endpoints of every link are in the returned node set.
    let ids: std::collections::BTreeSet<&str> =
        nodes.iter().map(|n| n["id"].as_str().unwrap()).collect();
    for l in links {
        assert!(ids.contains(l["source"].as_str().unwrap()));
        assert!(ids.contains(l["target"].as_str().unwrap()));
    }
    // No pagination block without page_size.
    assert!(parsed.get("pagination").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pagination_pages_are_disjoint_and_ordered() {
    let (_dir, state, router) = setup();
    seed_weighted_graph(&state, 25);

    let mut seen: Vec<String> = Vec::new();
    let mut uri = "/api/graph?page_size=10".to_string();
    loop {
        let (status, body) = get(&router, &uri).await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
        for n in parsed["nodes"].as_array().expect("nodes") {
            let id = n["id"].as_str().expect("id").to_string();
            assert!(!seen.contains(&id), "duplicate {id} across pages");
            seen.push(id);
        }
        let pagination = &parsed["pagination"];
        if !pagination["has_more"].as_bool().expect("has_more") {
            assert!(pagination.get("next_cursor").is_none());
            break;
        }
        let cursor = pagination["next_cursor"].as_str().expect("cursor");
        uri = format!("/api/graph?page_size=10&cursor={}", urlencode(cursor));
    }
    assert_eq!(seen.len(), 25);
    // Union equals the unpaginated prefix in the same order.
    let (_, body) = get(&router, "/api/graph?max_nodes=25").await;
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    let all: Vec<String> = parsed["nodes"]
        .as_array()
        .expect("nodes")
        .iter()
        .map(|n| n["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(seen, all);
}

fn urlencode(raw: &str) -> String {
    raw.replace('+', "%2B").replace('/', "%2F").replace('=', "%3D")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_cursor_is_a_validation_error() {
    let (_dir, _state, router) = setup();
    let (status, body) = get(&router, "/api/graph?page_size=5&cursor=garbage").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed["code"], "validation");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn type_filter_limits_results() {
    let (_dir, state, router) = setup();
    state
        .store
        .upsert_nodes(&[
            node("sub:rust", 10, NodeKind::Subreddit),
            node("user:alice", 90, NodeKind::User),
            node("t3_post", 50, NodeKind::Post),
        ])
        .expect("nodes");
    let (status, body) = get(&router, "/api/graph?types=subreddit,post").await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    let kinds: Vec<&str> = parsed["nodes"]
        .as_array()
        .expect("nodes")
        .iter()
        .map(|n| n["type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, ["post", "subreddit"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn search_orders_and_validates() {
    let (_dir, state, router) = setup();
    state
        .store
        .upsert_nodes(&[
            node("rust", 10, NodeKind::Subreddit),
            node("rustacean", 500, NodeKind::User),
            node("trust", 900, NodeKind::User),
        ])
        .expect("nodes");

    let (status, body) = get(&router, "/api/search?node=rust&limit=10").await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed["query"], "rust");
    assert_eq!(parsed["count"], 3);
    let ids: Vec<&str> = parsed["results"]
        .as_array()
        .expect("results")
        .iter()
        .map(|n| n["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["rust", "trust", "rustacean"]);

    let (status, _) = get(&router, "/api/search?node=").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn export_csv_schema_and_disposition() {
    let (_dir, state, router) = setup();
    state
        .store
        .upsert_nodes(&[node("a", 1, NodeKind::User), node("b", 2, NodeKind::User)])
        .expect("nodes");
    state
        .store
        .upsert_links(&[GraphLink {
            source: "a".to_string(),
            target: "b".to_string(),
        }])
        .expect("links");

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/export?format=csv")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-disposition")
            .and_then(|v| v.to_str().ok()),
        Some("attachment; filename=\"graph_export.csv\"")
    );
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let text = String::from_utf8(body.to_vec()).expect("utf8");
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("data_type,id,name,val,type,source,target")
    );
    let rest: Vec<&str> = lines.collect();
    assert_eq!(rest.len(), 3, "two node rows and one link row");
    assert!(rest.iter().any(|line| line.starts_with("node,b,b,2,user")));
    assert!(rest.iter().any(|line| line.starts_with("link,,,,,a,b")));

    let (status, _) = get(&router, "/api/export?format=xml").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn version_endpoint_tracks_commits() {
    let (_dir, state, router) = setup();
    let (status, body) = get(&router, "/api/graph/version").await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed["version_id"], 0);

    let version = state.store.open_version(false).expect("open");
    state
        .store
        .commit_version(version, 12, 7, 100, false)
        .expect("commit");
    // The cache still holds the pre-commit body; a new state invalidates it.
    state.cache.clear();
    let (_, body) = get(&router, "/api/graph/version").await;
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed["version_id"], version);
    assert_eq!(parsed["node_count"], 12);
    assert_eq!(parsed["link_count"], 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_community_is_404() {
    let (_dir, _state, router) = setup();
    let (status, body) = get(&router, "/api/communities/9999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed["code"], "not_found");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enqueue_twice_conflicts() {
    let (_dir, _state, router) = setup();
    let (status, body) =
        post_json(&router, "/api/crawl/jobs", serde_json::json!({"subreddit": "rust"})).await;
    assert_eq!(status, StatusCode::OK);
    let first: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert!(first["job_id"].as_i64().expect("id") > 0);

    let (status, body) =
        post_json(&router, "/api/crawl/jobs", serde_json::json!({"subreddit": "rust"})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(parsed["code"], "conflict");

    let (status, body) = get(&router, "/api/crawl/jobs?status=queued").await;
    assert_eq!(status, StatusCode::OK);
    let jobs: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(jobs.as_array().expect("jobs").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_missing_job_is_404() {
    let (_dir, _state, router) = setup();
    let (status, _) = post_json(&router, "/api/crawl/jobs/404/retry", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
