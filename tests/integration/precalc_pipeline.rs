#![allow(missing_docs)]

use std::collections::BTreeMap;

use clustermap::config::LayoutConfig;
use clustermap::model::{DiffAction, EntityType, NodeKind, VersionStatus};
use clustermap::precalc::{PrecalcOptions, Precalculator};
use clustermap::store::{NewComment, NewPost, Store};
use tempfile::{tempdir, TempDir};

fn setup_store() -> (TempDir, Store) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("precalc.db"), 4).expect("open");
    store.migrate().expect("migrate");
    (dir, store)
}

fn seed_entities(store: &Store) {
    let rust = store
        .upsert_subreddit("rust", Some("Rust"), None, 1_000, None)
        .expect("sub");
    let golang = store
        .upsert_subreddit("golang", Some("Go"), None, 500, None)
        .expect("sub");
    let alice = store.upsert_user("alice", None).expect("user");
    let bob = store.upsert_user("bob", None).expect("user");

    for (index, (sub, author)) in [(rust, alice), (rust, bob), (golang, alice)]
        .into_iter()
        .enumerate()
    {
        store
            .upsert_post(&NewPost {
                id: format!("t3_post{index}"),
                subreddit_id: sub,
                author_id: Some(author),
                title: format!("post {index}"),
                selftext: None,
                permalink: None,
                created_at: None,
                score: 10 * (index as i64 + 1),
                flair: None,
                url: None,
                is_self: true,
            })
            .expect("post");
    }
    store
        .upsert_comment(&NewComment {
            id: "t1_c0".to_string(),
            post_id: "t3_post0".to_string(),
            author_id: Some(bob),
            subreddit_id: rust,
            parent_id: None,
            body: Some("nice".to_string()),
            created_at: None,
            score: 3,
            depth: 0,
        })
        .expect("comment");
}

fn layout_config() -> LayoutConfig {
    LayoutConfig {
        max_nodes: 100,
        iterations: 50,
        batch_size: 4,
        epsilon: 0.0,
        auto_tune: false,
    }
}

#[tokio::test]
async fn full_pipeline_commits_a_version() {
    let (_dir, store) = setup_store();
    seed_entities(&store);

    let engine = Precalculator::new(store.clone(), layout_config());
    let outcome = engine
        .run(PrecalcOptions {
            full_rebuild: true,
            ..PrecalcOptions::default()
        })
        .await
        .expect("precalc");

    assert!(!outcome.coalesced);
    assert!(outcome.layout_ran);
    assert!(outcome.node_count >= 7, "subs + users + posts + comment");
    assert!(outcome.link_count >= 5);
    assert!(outcome.diff_rows > 0);

    let version = store.current_version().expect("version").expect("some");
    assert_eq!(Some(version.id), outcome.version_id);
    assert_eq!(version.status, VersionStatus::Completed);
    assert!(version.is_full_rebuild);

    // Derived projection includes all entity kinds with weights.
    let nodes = store.all_nodes().expect("nodes");
    let by_id: BTreeMap<&str, _> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    assert_eq!(by_id["sub:rust"].val.as_deref(), Some("1000"));
    assert_eq!(by_id["sub:rust"].kind, Some(NodeKind::Subreddit));
    assert_eq!(by_id["user:alice"].val.as_deref(), Some("2"));
    assert!(by_id.contains_key("t3_post0"));
    assert!(by_id.contains_key("t1_c0"));

    // Positions were written for the selection.
    assert!(outcome.positions_written as i64 >= outcome.node_count);
    for node in &nodes {
        assert!(node.pos_x.is_some(), "node {} missing position", node.id);
    }

    // The state singleton tracks the commit.
    let state = store.precalc_state().expect("state");
    assert_eq!(state.current_version_id, outcome.version_id);
    assert!(state.last_full_precalc_at.is_some());
}

#[tokio::test]
async fn hierarchy_is_complete_and_parent_consistent() {
    let (_dir, store) = setup_store();
    seed_entities(&store);
    let engine = Precalculator::new(store.clone(), layout_config());
    engine
        .run(PrecalcOptions {
            full_rebuild: true,
            ..PrecalcOptions::default()
        })
        .await
        .expect("precalc");

    let assignments = store.hierarchy_assignments().expect("hierarchy");
    assert!(!assignments.is_empty());
    let node_ids: Vec<String> = store
        .all_nodes()
        .expect("nodes")
        .into_iter()
        .map(|n| n.id)
        .collect();
    let levels: Vec<i64> = {
        let mut levels: Vec<i64> = assignments.iter().map(|a| a.level).collect();
        levels.sort_unstable();
        levels.dedup();
        levels
    };

    // Every original node id appears at every level.
    for level in &levels {
        let at_level: Vec<&str> = assignments
            .iter()
            .filter(|a| a.level == *level)
            .map(|a| a.node_id.as_str())
            .collect();
        for id in &node_ids {
            assert!(
                at_level.contains(&id.as_str()),
                "node {id} missing at level {level}"
            );
        }
    }

    // The community at level k+1 is the parent of the community at level k.
    let by_key: BTreeMap<(String, i64), &clustermap::model::CommunityAssignment> = assignments
        .iter()
        .map(|a| ((a.node_id.clone(), a.level), a))
        .collect();
    for assignment in &assignments {
        if let Some(next) = by_key.get(&(assignment.node_id.clone(), assignment.level + 1)) {
            assert_eq!(
                assignment.parent_community_id,
                Some(next.community_id),
                "parent pointer mismatch for {} at level {}",
                assignment.node_id,
                assignment.level
            );
        } else {
            assert_eq!(assignment.parent_community_id, None);
        }
    }
}

#[tokio::test]
async fn incremental_run_emits_add_diffs_for_new_entities() {
    let (_dir, store) = setup_store();
    seed_entities(&store);
    let engine = Precalculator::new(store.clone(), layout_config());
    let first = engine
        .run(PrecalcOptions {
            full_rebuild: true,
            ..PrecalcOptions::default()
        })
        .await
        .expect("first run");
    let first_version = first.version_id.expect("version");

    // A new sighting between runs.
    let rust = store
        .subreddit_by_name("rust")
        .expect("get")
        .expect("sub")
        .id;
    let carol = store.upsert_user("carol", None).expect("user");
    store
        .upsert_post(&NewPost {
            id: "t3_fresh".to_string(),
            subreddit_id: rust,
            author_id: Some(carol),
            title: "fresh".to_string(),
            selftext: None,
            permalink: None,
            created_at: None,
            score: 77,
            flair: None,
            url: None,
            is_self: false,
        })
        .expect("post");

    let second = engine
        .run(PrecalcOptions::default())
        .await
        .expect("second run");
    assert!(second.version_id.expect("version") > first_version);

    let batches = store.diffs_since(first_version).expect("diffs");
    assert_eq!(batches.len(), 1);
    let diffs = &batches[0].diffs;
    assert!(diffs.iter().any(|d| {
        d.action == DiffAction::Add && d.entity_type == EntityType::Node && d.entity_id == "t3_fresh"
    }));
    assert!(diffs.iter().any(|d| {
        d.action == DiffAction::Add
            && d.entity_type == EntityType::Node
            && d.entity_id == "user:carol"
    }));
    // Incremental runs are additive: nothing is removed.
    assert!(diffs.iter().all(|d| d.action != DiffAction::Remove));
}

#[tokio::test]
async fn epsilon_filter_counts_writes_and_skips() {
    let (_dir, store) = setup_store();
    seed_entities(&store);
    let config = LayoutConfig {
        epsilon: 1e12,
        ..layout_config()
    };
    let engine = Precalculator::new(store.clone(), config);

    // First pass: every node is unplaced, displacement is infinite, all write.
    let first = engine
        .run(PrecalcOptions {
            full_rebuild: true,
            ..PrecalcOptions::default()
        })
        .await
        .expect("first");
    assert!(first.positions_written > 0);
    assert_eq!(first.positions_skipped, 0);

    // Second pass: nothing can move far enough to clear the threshold.
    let second = engine
        .run(PrecalcOptions {
            full_rebuild: true,
            ..PrecalcOptions::default()
        })
        .await
        .expect("second");
    assert_eq!(second.positions_written, 0);
    assert_eq!(second.positions_skipped, first.positions_written);
}

#[tokio::test]
async fn full_rebuild_clears_nodes_outside_the_selection() {
    let (_dir, store) = setup_store();
    seed_entities(&store);
    let engine = Precalculator::new(store.clone(), layout_config());
    let first = engine
        .run(PrecalcOptions {
            full_rebuild: true,
            ..PrecalcOptions::default()
        })
        .await
        .expect("first");
    assert!(first.node_count > 2);

    let second = engine
        .run(PrecalcOptions {
            full_rebuild: true,
            max_nodes: 2,
            ..PrecalcOptions::default()
        })
        .await
        .expect("second");
    assert_eq!(second.node_count, 2);

    let batches = store
        .diffs_since(first.version_id.expect("version"))
        .expect("diffs");
    let removes = batches[0]
        .diffs
        .iter()
        .filter(|d| d.action == DiffAction::Remove && d.entity_type == EntityType::Node)
        .count();
    assert_eq!(removes as i64, first.node_count - 2);

    // The survivors are the heaviest nodes.
    let nodes = store.all_nodes().expect("nodes");
    let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert!(ids.contains(&"sub:rust"));
}

#[test]
fn pending_and_failed_versions_stay_invisible() {
    let (_dir, store) = setup_store();
    let pending = store.open_version(false).expect("open");
    assert!(store.current_version().expect("current").is_none());
    store.fail_version(pending).expect("fail");
    assert!(store.current_version().expect("current").is_none());
    // And its diffs never surface.
    assert!(store.diffs_since(0).expect("diffs").is_empty());
}
