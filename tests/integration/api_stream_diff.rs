#![allow(missing_docs)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use clustermap::config::Config;
use clustermap::model::{parse_weight, DiffMessage};
use clustermap::precalc::{PrecalcOptions, Precalculator};
use clustermap::serve::diffsync::{apply_diff, ClientGraph};
use clustermap::serve::ws::Hub;
use clustermap::serve::{build_router, AppState};
use clustermap::store::{NewPost, Store};
use http_body_util::BodyExt;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tower::util::ServiceExt;

fn setup() -> (TempDir, AppState, Router, Arc<Precalculator>) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("stream.db"), 4).expect("open");
    store.migrate().expect("migrate");
    let config = Config::default();
    let precalc = Precalculator::new(store.clone(), config.layout.clone());
    let state = AppState::new(store, config, precalc.clone(), None);
    let router = build_router(state.clone());
    (dir, state, router, precalc)
}

fn seed_entities(store: &Store) {
    let rust = store
        .upsert_subreddit("rust", Some("Rust"), None, 800, None)
        .expect("sub");
    let alice = store.upsert_user("alice", None).expect("user");
    let bob = store.upsert_user("bob", None).expect("user");
    for (index, author) in [alice, bob, alice].into_iter().enumerate() {
        store
            .upsert_post(&NewPost {
                id: format!("t3_seed{index}"),
                subreddit_id: rust,
                author_id: Some(author),
                title: format!("seed {index}"),
                selftext: None,
                permalink: None,
                created_at: None,
                score: 5 * (index as i64 + 1),
                flair: None,
                url: None,
                is_self: true,
            })
            .expect("post");
    }
}

async fn get(router: &Router, uri: &str, accept: Option<&str>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().uri(uri);
    if let Some(accept) = accept {
        builder = builder.header("accept", accept);
    }
    let response = router
        .clone()
        .oneshot(builder.body(Body::empty()).expect("request"))
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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ndjson_streams_metadata_then_nodes_then_links() {
    let (_dir, state, router, precalc) = setup();
    seed_entities(&state.store);
    precalc
        .run(PrecalcOptions {
            full_rebuild: true,
            ..PrecalcOptions::default()
        })
        .await
        .expect("precalc");

    let (status, body) = get(&router, "/api/graph", Some("application/x-ndjson")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).expect("utf8");
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("line json"))
        .collect();
    assert!(lines.len() > 1);

    // Line 1 is metadata and its totals match the stream.
    assert_eq!(lines[0]["type"], "metadata");
    let total_nodes = lines[0]["totalNodes"].as_u64().expect("totalNodes") as usize;
    let total_links = lines[0]["totalLinks"].as_u64().expect("totalLinks") as usize;
    let node_lines: Vec<&serde_json::Value> =
        lines.iter().filter(|l| l["type"] == "node").collect();
    let link_lines: Vec<&serde_json::Value> =
        lines.iter().filter(|l| l["type"] == "link").collect();
    assert_eq!(node_lines.len(), total_nodes);
    assert_eq!(link_lines.len(), total_links);

    // All node lines precede all link lines, and node weights descend.
    let first_link = lines.iter().position(|l| l["type"] == "link");
    let last_node = lines.iter().rposition(|l| l["type"] == "node");
    if let (Some(first_link), Some(last_node)) = (first_link, last_node) {
        assert!(last_node < first_link);
    }
    let weights: Vec<u64> = node_lines
        .iter()
        .map(|l| parse_weight(l["data"]["val"].as_str()))
        .collect();
    let mut sorted = weights.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(weights, sorted);

    // A link only references nodes that were already streamed.
    let mut seen: std::collections::BTreeSet<&str> = std::collections::BTreeSet::new();
    for line in &lines {
        match line["type"].as_str() {
            Some("node") => {
                seen.insert(line["data"]["id"].as_str().expect("id"));
            }
            Some("link") => {
                assert!(seen.contains(line["data"]["source"].as_str().expect("source")));
                assert!(seen.contains(line["data"]["target"].as_str().expect("target")));
            }
            _ => {}
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn diff_apply_matches_full_read() {
    let (_dir, state, router, precalc) = setup();
    seed_entities(&state.store);
    let first = precalc
        .run(PrecalcOptions {
            full_rebuild: true,
            ..PrecalcOptions::default()
        })
        .await
        .expect("first run");
    let first_version = first.version_id.expect("version");

    // A client snapshots the world at the first version.
    let mut client = ClientGraph::from_full(
        state.store.all_nodes().expect("nodes"),
        state.store.all_links().expect("links"),
    );

    // The world moves on.
    let rust = state
        .store
        .subreddit_by_name("rust")
        .expect("get")
        .expect("sub")
        .id;
    let carol = state.store.upsert_user("carol", None).expect("user");
    state
        .store
        .upsert_post(&NewPost {
            id: "t3_new".to_string(),
            subreddit_id: rust,
            author_id: Some(carol),
            title: "breaking".to_string(),
            selftext: None,
            permalink: None,
            created_at: None,
            score: 400,
            flair: None,
            url: None,
            is_self: false,
        })
        .expect("post");
    precalc
        .run(PrecalcOptions::default())
        .await
        .expect("second run");
    state.cache.clear();

    // Catch up over the HTTP fallback and apply in order.
    let (status, body) = get(
        &router,
        &format!("/api/graph/diff?since={first_version}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages: Vec<DiffMessage> = serde_json::from_slice(&body).expect("diffs");
    assert!(!messages.is_empty());
    let mut last_version = first_version;
    for message in &messages {
        assert!(message.version_id > first_version);
        assert!(message.version_id >= last_version, "monotone version order");
        last_version = message.version_id;
        apply_diff(&mut client, message);
    }

    // The applied state equals a fresh full read.
    let expected = ClientGraph::from_full(
        state.store.all_nodes().expect("nodes"),
        state.store.all_links().expect("links"),
    );
    assert_eq!(client.nodes, expected.nodes);
    let mut got_links = client.links.clone();
    let mut want_links = expected.links.clone();
    got_links.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
    want_links.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
    assert_eq!(got_links, want_links);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hub_broadcasts_committed_versions_in_order() {
    let (_dir, state, _router, precalc) = setup();
    seed_entities(&state.store);

    let hub = Hub::new(state.store.clone());
    let mut rx = hub.subscribe();

    let first = precalc
        .run(PrecalcOptions {
            full_rebuild: true,
            ..PrecalcOptions::default()
        })
        .await
        .expect("run");
    let version_id = first.version_id.expect("version");
    hub.publish_version(version_id).await.expect("publish");

    let update = rx.recv().await.expect("update");
    assert_eq!(update.version_id, version_id);
    assert!(!update.frames.is_empty());
    for frame in &update.frames {
        let parsed: serde_json::Value = serde_json::from_str(frame).expect("frame json");
        assert_eq!(parsed["type"], "diff");
        assert_eq!(parsed["payload"]["version_id"], version_id);
    }
}
