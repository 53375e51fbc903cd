#![allow(missing_docs)]

use clustermap::model::{GraphLink, GraphNode, NodeKind};
use clustermap::store::{NodeSelection, PageCursor, PositionWrite, Store};
use tempfile::{tempdir, TempDir};

fn setup_store() -> (TempDir, Store) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("graph.db"), 2).expect("open");
    store.migrate().expect("migrate");
    (dir, store)
}

fn node(id: &str, val: Option<&str>, kind: NodeKind) -> GraphNode {
    GraphNode {
        id: id.to_string(),
        name: id.to_string(),
        val: val.map(str::to_string),
        kind: Some(kind),
        pos_x: None,
        pos_y: None,
        pos_z: None,
    }
}

fn link(source: &str, target: &str) -> GraphLink {
    GraphLink {
        source: source.to_string(),
        target: target.to_string(),
    }
}

fn selection(max_nodes: usize) -> NodeSelection {
    NodeSelection {
        max_nodes,
        types: None,
        with_positions: false,
    }
}

#[test]
fn top_nodes_order_by_weight_then_id() {
    let (_dir, store) = setup_store();
    store
        .upsert_nodes(&[
            node("c", Some("10"), NodeKind::User),
            node("a", Some("10"), NodeKind::User),
            node("b", Some("999"), NodeKind::User),
            node("z", Some("junk"), NodeKind::User),
            node("y", None, NodeKind::User),
        ])
        .expect("upsert");

    let nodes = store.top_nodes(&selection(10), None, 10).expect("select");
    let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    // 999 first, then the tied 10s by id, then the zero-weight stragglers.
    assert_eq!(ids, ["b", "a", "c", "y", "z"]);
}

#[test]
fn link_upserts_are_idempotent() {
    let (_dir, store) = setup_store();
    store
        .upsert_nodes(&[
            node("a", Some("1"), NodeKind::User),
            node("b", Some("1"), NodeKind::User),
        ])
        .expect("upsert");
    store
        .upsert_links(&[link("a", "b"), link("a", "b"), link("a", "b")])
        .expect("links");
    store.upsert_links(&[link("a", "b")]).expect("links again");
    assert_eq!(store.link_count().expect("count"), 1);
}

#[test]
fn slice_caps_nodes_and_links_with_member_endpoints() {
    let (_dir, store) = setup_store();
    let mut nodes = Vec::new();
    for i in 0..300 {
        nodes.push(node(
            &format!("n{i:04}"),
            Some(&i.to_string()),
            NodeKind::Post,
        ));
    }
    store.upsert_nodes(&nodes).expect("upsert");
    // A chain plus links out of the top set.
    let mut links = Vec::new();
    for i in 0..299 {
        links.push(link(&format!("n{i:04}"), &format!("n{:04}", i + 1)));
    }
    store.upsert_links(&links).expect("links");

    let slice = store
        .graph_slice(&selection(100), None, 100, 50)
        .expect("slice");
    assert_eq!(slice.nodes.len(), 100);
    assert!(slice.links.len() <= 50);
    // Top 100 by weight are vals 200..=299.
    for n in &slice.nodes {
        assert!(n.weight() >= 200, "unexpected node {}", n.id);
    }
    // Every link endpoint is a member of the returned node set.
    let ids: std::collections::BTreeSet<&str> =
        slice.nodes.iter().map(|n| n.id.as_str()).collect();
    for l in &slice.links {
        assert!(ids.contains(l.source.as_str()));
        assert!(ids.contains(l.target.as_str()));
    }
}

#[test]
fn pagination_partitions_the_prefix() {
    let (_dir, store) = setup_store();
    let mut nodes = Vec::new();
    for i in 0..25 {
        nodes.push(node(
            &format!("n{i:02}"),
            Some(&(i * 3).to_string()),
            NodeKind::User,
        ));
    }
    store.upsert_nodes(&nodes).expect("upsert");

    let mut seen = Vec::new();
    let mut cursor: Option<PageCursor> = None;
    let mut pages = 0;
    loop {
        let slice = store
            .graph_slice(&selection(25), cursor.as_ref(), 10, 100)
            .expect("page");
        pages += 1;
        for n in &slice.nodes {
            assert!(
                !seen.contains(&n.id),
                "pages must be disjoint, repeated {}",
                n.id
            );
            seen.push(n.id.clone());
        }
        if !slice.has_more {
            assert!(slice.next_cursor.is_none());
            break;
        }
        cursor = slice.next_cursor;
    }
    assert_eq!(pages, 3);
    // Union equals the unpaginated prefix, in the same order.
    let all = store.top_nodes(&selection(25), None, 25).expect("all");
    let all_ids: Vec<String> = all.into_iter().map(|n| n.id).collect();
    assert_eq!(seen, all_ids);
}

#[test]
fn type_filter_applies_before_ordering() {
    let (_dir, store) = setup_store();
    store
        .upsert_nodes(&[
            node("sub:a", Some("5"), NodeKind::Subreddit),
            node("user:b", Some("100"), NodeKind::User),
            node("post:c", Some("50"), NodeKind::Post),
        ])
        .expect("upsert");
    let filtered = store
        .top_nodes(
            &NodeSelection {
                max_nodes: 2,
                types: Some(vec![NodeKind::Subreddit, NodeKind::Post]),
                with_positions: false,
            },
            None,
            2,
        )
        .expect("select");
    let ids: Vec<&str> = filtered.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, ["post:c", "sub:a"]);
}

#[test]
fn delete_nodes_drops_incident_links() {
    let (_dir, store) = setup_store();
    store
        .upsert_nodes(&[
            node("a", None, NodeKind::User),
            node("b", None, NodeKind::User),
            node("c", None, NodeKind::User),
        ])
        .expect("upsert");
    store
        .upsert_links(&[link("a", "b"), link("b", "c"), link("a", "c")])
        .expect("links");
    store.delete_nodes(&["b".to_string()]).expect("delete");
    assert_eq!(store.node_count().expect("nodes"), 2);
    let remaining = store.all_links().expect("links");
    assert_eq!(remaining, vec![link("a", "c")]);
}

#[test]
fn prune_removes_dangling_links() {
    let (_dir, store) = setup_store();
    store
        .upsert_nodes(&[node("a", None, NodeKind::User)])
        .expect("upsert");
    store
        .upsert_links(&[link("a", "ghost"), link("ghost", "a")])
        .expect("links");
    assert_eq!(store.prune_dangling_links().expect("prune"), 2);
    assert_eq!(store.link_count().expect("count"), 0);
}

#[test]
fn batch_position_updates_round_trip() {
    let (_dir, store) = setup_store();
    assert!(store.has_position_columns());
    store
        .upsert_nodes(&[
            node("a", Some("1"), NodeKind::User),
            node("b", Some("2"), NodeKind::User),
        ])
        .expect("upsert");
    let written = store
        .batch_update_positions(&[
            PositionWrite {
                id: "a",
                pos: [1.0, 2.0, 3.0],
            },
            PositionWrite {
                id: "b",
                pos: [-4.0, 0.0, 9.5],
            },
            PositionWrite {
                id: "missing",
                pos: [0.0, 0.0, 0.0],
            },
        ])
        .expect("batch");
    assert_eq!(written, 2, "only matching rows count as writes");

    let nodes = store.nodes_by_ids(&["a".to_string(), "b".to_string()]).expect("get");
    assert_eq!(nodes[0].pos_x, Some(1.0));
    assert_eq!(nodes[1].pos_z, Some(9.5));
}

#[test]
fn position_columns_are_feature_gated() {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("old_schema.db"), 2).expect("open");
    // Migration 3 adds the position columns; stop short of it.
    store.migrate_to(2).expect("migrate");
    assert!(!store.has_position_columns());
    store
        .upsert_nodes(&[node("a", Some("1"), NodeKind::User)])
        .expect("upsert still works");
    assert!(store
        .batch_update_positions(&[PositionWrite {
            id: "a",
            pos: [0.0; 3],
        }])
        .is_err());

    // Applying the remaining migrations turns the feature on.
    store.migrate().expect("migrate rest");
    assert!(store.has_position_columns());
}

#[test]
fn search_orders_exact_match_first() {
    let (_dir, store) = setup_store();
    store
        .upsert_nodes(&[
            node("rust", Some("10"), NodeKind::Subreddit),
            node("rustacean", Some("500"), NodeKind::User),
            node("trust", Some("900"), NodeKind::User),
            node("unrelated", Some("9999"), NodeKind::User),
        ])
        .expect("upsert");
    let results = store.search_nodes("rust", 10).expect("search");
    let ids: Vec<&str> = results.iter().map(|n| n.id.as_str()).collect();
    // Exact match first, then the substring matches by weight descending.
    assert_eq!(ids, ["rust", "trust", "rustacean"]);

    // Case-insensitive.
    let results = store.search_nodes("RUST", 10).expect("search");
    assert_eq!(results[0].id, "rust");

    // Limit applies.
    let results = store.search_nodes("rust", 1).expect("search");
    assert_eq!(results.len(), 1);
}

#[test]
fn cursor_encoding_round_trips_and_rejects_garbage() {
    let cursor = PageCursor {
        weight: 12345,
        id: "user:someone".to_string(),
    };
    let decoded = PageCursor::decode(&cursor.encode()).expect("decode");
    assert_eq!(decoded, cursor);
    assert!(PageCursor::decode("not-base64!").is_err());
    assert!(PageCursor::decode("aGVsbG8=").is_err());
}
