//! Diff message assembly and the client-side application contract.
//!
//! Both the websocket channel and the HTTP fallback (`GET /api/graph/diff`)
//! emit the same messages: per version, at most one message per action, in
//! add → update → remove order, version ids strictly increasing across
//! messages. `apply_diff` implements the merge contract clients follow; the
//! integration tests use it to prove diff application converges to a full
//! read.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::model::{DiffAction, EntityType, GraphLink, GraphNode, NodeKind};
use crate::store::{Store, VersionDiffs};

/// Wire shape re-exported for handlers.
pub use crate::model::DiffMessage;

/// Builds the ordered messages for one committed version.
///
/// Node payloads for adds and updates are enriched from the live graph rows
/// (the converged state clients are steered toward); removed entities only
/// need their ids.
pub fn build_messages(store: &Store, version: &VersionDiffs) -> Result<Vec<DiffMessage>> {
    let mut add_nodes: Vec<String> = Vec::new();
    let mut add_links: Vec<GraphLink> = Vec::new();
    let mut update_nodes: Vec<String> = Vec::new();
    let mut remove_nodes: Vec<String> = Vec::new();
    let mut remove_links: Vec<GraphLink> = Vec::new();

    for diff in &version.diffs {
        match (diff.action, diff.entity_type) {
            (DiffAction::Add, EntityType::Node) => add_nodes.push(diff.entity_id.clone()),
            (DiffAction::Update, EntityType::Node) => {
                if !update_nodes.contains(&diff.entity_id) {
                    update_nodes.push(diff.entity_id.clone());
                }
            }
            (DiffAction::Remove, EntityType::Node) => remove_nodes.push(diff.entity_id.clone()),
            (DiffAction::Add, EntityType::Link) => {
                if let Some(link) = parse_link_id(&diff.entity_id) {
                    add_links.push(link);
                }
            }
            (DiffAction::Remove, EntityType::Link) => {
                if let Some(link) = parse_link_id(&diff.entity_id) {
                    remove_links.push(link);
                }
            }
            (DiffAction::Update, EntityType::Link) => {}
        }
    }
    // A node both added and updated in one version collapses into the add.
    update_nodes.retain(|id| !add_nodes.contains(id));

    let version_id = version.version.id;
    let mut messages = Vec::new();
    if !add_nodes.is_empty() || !add_links.is_empty() {
        messages.push(DiffMessage {
            action: DiffAction::Add,
            nodes: store.nodes_by_ids(&add_nodes)?,
            links: add_links,
            version_id,
        });
    }
    if !update_nodes.is_empty() {
        messages.push(DiffMessage {
            action: DiffAction::Update,
            nodes: store.nodes_by_ids(&update_nodes)?,
            links: Vec::new(),
            version_id,
        });
    }
    if !remove_nodes.is_empty() || !remove_links.is_empty() {
        messages.push(DiffMessage {
            action: DiffAction::Remove,
            nodes: remove_nodes
                .into_iter()
                .map(|id| GraphNode {
                    name: id.clone(),
                    id,
                    val: None,
                    kind: None,
                    pos_x: None,
                    pos_y: None,
                    pos_z: None,
                })
                .collect(),
            links: remove_links,
            version_id,
        });
    }
    Ok(messages)
}

fn parse_link_id(entity_id: &str) -> Option<GraphLink> {
    let (source, target) = entity_id.split_once("->")?;
    Some(GraphLink {
        source: source.to_string(),
        target: target.to_string(),
    })
}

/// A client's materialized graph state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientGraph {
    pub nodes: BTreeMap<String, GraphNode>,
    pub links: Vec<GraphLink>,
}

impl ClientGraph {
    /// Seeds a client from a full read.
    pub fn from_full(nodes: Vec<GraphNode>, links: Vec<GraphLink>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|node| (node.id.clone(), node)).collect(),
            links,
        }
    }
}

/// Applies one diff message under the client contract:
/// - `add`: union nodes by id (last write wins); append links only when the
///   `(source, target)` pair is new.
/// - `remove`: drop listed nodes plus any links incident to them; drop
///   explicitly listed links.
/// - `update`: merge provided fields onto existing nodes; unknown ids are
///   ignored.
pub fn apply_diff(state: &mut ClientGraph, message: &DiffMessage) {
    match message.action {
        DiffAction::Add => {
            for node in &message.nodes {
                state.nodes.insert(node.id.clone(), node.clone());
            }
            let existing: FxHashMap<(&str, &str), ()> = state
                .links
                .iter()
                .map(|link| ((link.source.as_str(), link.target.as_str()), ()))
                .collect();
            let mut fresh = Vec::new();
            for link in &message.links {
                if !existing.contains_key(&(link.source.as_str(), link.target.as_str())) {
                    fresh.push(link.clone());
                }
            }
            state.links.extend(fresh);
        }
        DiffAction::Remove => {
            for node in &message.nodes {
                state.nodes.remove(&node.id);
                state
                    .links
                    .retain(|link| link.source != node.id && link.target != node.id);
            }
            for link in &message.links {
                state
                    .links
                    .retain(|existing| existing != link);
            }
        }
        DiffAction::Update => {
            for node in &message.nodes {
                if let Some(existing) = state.nodes.get_mut(&node.id) {
                    merge_node(existing, node);
                }
            }
        }
    }
}

/// Merges the provided fields of `incoming` onto `existing`.
fn merge_node(existing: &mut GraphNode, incoming: &GraphNode) {
    if !incoming.name.is_empty() {
        existing.name = incoming.name.clone();
    }
    if incoming.val.is_some() {
        existing.val = incoming.val.clone();
    }
    if incoming.kind.is_some() {
        existing.kind = incoming.kind.clone();
    }
    if incoming.pos_x.is_some() {
        existing.pos_x = incoming.pos_x;
    }
    if incoming.pos_y.is_some() {
        existing.pos_y = incoming.pos_y;
    }
    if incoming.pos_z.is_some() {
        existing.pos_z = incoming.pos_z;
    }
}

/// Strips kinds the caller did not ask for; shared by tests.
pub fn node_kind_list(raw: &str) -> Option<Vec<NodeKind>> {
    let kinds: Vec<NodeKind> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(NodeKind::parse)
        .collect();
    if kinds.is_empty() {
        None
    } else {
        Some(kinds)
    }
}
