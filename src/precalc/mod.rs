//! The graph precalculation engine.
//!
//! One run rebuilds (or incrementally refreshes) the materialized graph from
//! the source entities, lays out the selected subgraph in 3D, recomputes the
//! community hierarchy and bundles, and publishes everything as a new
//! committed version with diff rows. The engine is single-flighted: a
//! trigger while a run is in flight is coalesced into an acknowledgement.

pub mod layout;
pub mod louvain;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::LayoutConfig;
use crate::error::Result;
use crate::model::{
    parse_weight, Community, CommunityAssignment, CommunityBundle, DiffAction, EntityType,
    GraphLink, GraphNode, NodeKind,
};
use crate::store::{DiffRow, NodeSelection, PositionWrite, Store};

use layout::{displacement, run_layout, LayoutParams};

/// Hard cap on selected nodes.
pub const MAX_NODES_CAP: usize = 50_000;
/// Hard cap on selected links.
pub const MAX_LINKS_CAP: usize = 100_000;

/// Parameters for one run.
#[derive(Debug, Clone)]
pub struct PrecalcOptions {
    pub full_rebuild: bool,
    pub max_nodes: usize,
    pub max_links: usize,
    pub types: Option<Vec<NodeKind>>,
}

impl Default for PrecalcOptions {
    fn default() -> Self {
        Self {
            full_rebuild: false,
            max_nodes: MAX_NODES_CAP,
            max_links: MAX_LINKS_CAP,
            types: None,
        }
    }
}

/// What one trigger produced.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PrecalcOutcome {
    /// True when another run was already in flight and this trigger folded
    /// into it.
    pub coalesced: bool,
    pub version_id: Option<i64>,
    pub node_count: i64,
    pub link_count: i64,
    pub diff_rows: usize,
    pub positions_written: usize,
    pub positions_skipped: usize,
    pub layout_ran: bool,
    pub community_levels: usize,
    pub communities: usize,
    pub duration_ms: i64,
}

/// The single-flighted engine. Cheap to share; all clones observe one latch.
pub struct Precalculator {
    store: Store,
    layout: LayoutConfig,
    running: AtomicBool,
    events: broadcast::Sender<i64>,
}

impl Precalculator {
    pub fn new(store: Store, layout: LayoutConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            store,
            layout,
            running: AtomicBool::new(false),
            events,
        })
    }

    /// Committed version ids, for the websocket hub's fan-out loop.
    pub fn subscribe(&self) -> broadcast::Receiver<i64> {
        self.events.subscribe()
    }

    /// Triggers a run on the blocking pool. A concurrent trigger returns
    /// immediately with `coalesced = true`.
    pub async fn run(self: &Arc<Self>, options: PrecalcOptions) -> Result<PrecalcOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(PrecalcOutcome {
                coalesced: true,
                ..PrecalcOutcome::default()
            });
        }
        let engine = self.clone();
        let result = tokio::task::spawn_blocking(move || {
            // Released on every exit path, panics included.
            struct Latch<'a>(&'a AtomicBool);
            impl Drop for Latch<'_> {
                fn drop(&mut self) {
                    self.0.store(false, Ordering::Release);
                }
            }
            let _latch = Latch(&engine.running);
            engine.run_blocking(options)
        })
        .await?;
        if let Ok(outcome) = &result {
            if let Some(version_id) = outcome.version_id {
                // Nobody listening is fine; the hub subscribes lazily.
                let _ = self.events.send(version_id);
            }
        }
        result
    }

    fn run_blocking(&self, options: PrecalcOptions) -> Result<PrecalcOutcome> {
        let started = Instant::now();
        let max_nodes = options.max_nodes.clamp(1, MAX_NODES_CAP);
        let max_links = options.max_links.clamp(1, MAX_LINKS_CAP);

        let since = if options.full_rebuild {
            None
        } else {
            self.store.precalc_state()?.last_precalc_at
        };

        // 1. Candidate selection from the entity tables.
        let (mut derived_nodes, derived_links) = self.store.derive_graph_rows(since)?;
        if let Some(types) = &options.types {
            derived_nodes.retain(|node| {
                node.kind
                    .as_ref()
                    .map(|kind| types.contains(kind))
                    .unwrap_or(false)
            });
        }
        derived_nodes.sort_by(|a, b| b.weight().cmp(&a.weight()).then(a.id.cmp(&b.id)));
        derived_nodes.dedup_by(|a, b| a.id == b.id);
        derived_nodes.truncate(max_nodes);

        let mut links: Vec<GraphLink> = derived_links;
        links.sort_by(|a, b| a.source.cmp(&b.source).then(a.target.cmp(&b.target)));
        links.dedup();

        // 2. Open the pending version; all failures below mark it failed.
        let version_id = self.store.open_version(options.full_rebuild)?;
        match self.run_under_version(
            version_id,
            &options,
            derived_nodes,
            links,
            max_nodes,
            max_links,
            started,
        ) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(version_id, error = %err, "precalc failed, version abandoned");
                if let Err(fail_err) = self.store.fail_version(version_id) {
                    warn!(version_id, error = %fail_err, "could not mark version failed");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_under_version(
        &self,
        version_id: i64,
        options: &PrecalcOptions,
        nodes: Vec<GraphNode>,
        links: Vec<GraphLink>,
        max_nodes: usize,
        max_links: usize,
        started: Instant,
    ) -> Result<PrecalcOutcome> {
        let mut outcome = PrecalcOutcome {
            version_id: Some(version_id),
            ..PrecalcOutcome::default()
        };
        let mut diffs: Vec<DiffRow> = Vec::new();

        // 3. Merge nodes/links against the stored baseline.
        let old_nodes: FxHashMap<String, GraphNode> = self
            .store
            .all_nodes()?
            .into_iter()
            .map(|node| (node.id.clone(), node))
            .collect();
        let old_links: BTreeSet<(String, String)> = self
            .store
            .all_links()?
            .into_iter()
            .map(|link| (link.source, link.target))
            .collect();

        // A link joins the merged graph when both endpoints will exist in
        // it: the input set, plus the stored graph on incremental runs.
        let selected: FxHashSet<&str> = nodes.iter().map(|node| node.id.as_str()).collect();
        let mut links: Vec<GraphLink> = links
            .into_iter()
            .filter(|link| {
                let allowed = |id: &str| {
                    selected.contains(id)
                        || (!options.full_rebuild && old_nodes.contains_key(id))
                };
                allowed(&link.source) && allowed(&link.target)
            })
            .collect();
        links.truncate(max_links);

        let mut changed_nodes = Vec::new();
        for node in &nodes {
            match old_nodes.get(&node.id) {
                None => {
                    diffs.push(DiffRow {
                        action: DiffAction::Add,
                        entity_type: EntityType::Node,
                        entity_id: node.id.clone(),
                        old_val: None,
                        new_val: node.val.clone(),
                        old_pos: None,
                        new_pos: None,
                    });
                    changed_nodes.push(node.clone());
                }
                Some(old) => {
                    let changed = old.val != node.val
                        || old.name != node.name
                        || old.kind != node.kind;
                    if changed {
                        diffs.push(DiffRow {
                            action: DiffAction::Update,
                            entity_type: EntityType::Node,
                            entity_id: node.id.clone(),
                            old_val: old.val.clone(),
                            new_val: node.val.clone(),
                            old_pos: None,
                            new_pos: None,
                        });
                        changed_nodes.push(node.clone());
                    }
                }
            }
        }
        self.store.upsert_nodes(&changed_nodes)?;

        let mut new_links = Vec::new();
        for link in &links {
            if !old_links.contains(&(link.source.clone(), link.target.clone())) {
                diffs.push(DiffRow {
                    action: DiffAction::Add,
                    entity_type: EntityType::Link,
                    entity_id: format!("{}->{}", link.source, link.target),
                    old_val: None,
                    new_val: None,
                    old_pos: None,
                    new_pos: None,
                });
                new_links.push(link.clone());
            }
        }
        self.store.upsert_links(&new_links)?;

        // A full rebuild clears whatever fell outside the selected set;
        // incremental runs stay additive.
        if options.full_rebuild {
            let kept_links: FxHashSet<(String, String)> = links
                .iter()
                .map(|link| (link.source.clone(), link.target.clone()))
                .collect();
            let stale_nodes: Vec<String> = old_nodes
                .values()
                .filter(|node| !selected.contains(node.id.as_str()))
                .map(|node| node.id.clone())
                .collect();
            for (source, target) in &old_links {
                if !kept_links.contains(&(source.clone(), target.clone())) {
                    diffs.push(DiffRow {
                        action: DiffAction::Remove,
                        entity_type: EntityType::Link,
                        entity_id: format!("{source}->{target}"),
                        old_val: None,
                        new_val: None,
                        old_pos: None,
                        new_pos: None,
                    });
                }
            }
            let stale_link_rows: Vec<GraphLink> = old_links
                .iter()
                .filter(|(source, target)| {
                    !kept_links.contains(&(source.clone(), target.clone()))
                })
                .map(|(source, target)| GraphLink {
                    source: source.clone(),
                    target: target.clone(),
                })
                .collect();
            self.store.delete_links(&stale_link_rows)?;
            for id in &stale_nodes {
                let old = &old_nodes[id.as_str()];
                diffs.push(DiffRow {
                    action: DiffAction::Remove,
                    entity_type: EntityType::Node,
                    entity_id: id.clone(),
                    old_val: old.val.clone(),
                    new_val: None,
                    old_pos: position_of(old),
                    new_pos: None,
                });
            }
            self.store.delete_nodes(&stale_nodes)?;
        }

        // 4. Reload the merged selection: layout and communities run over
        // the current graph, not just this run's input set.
        let working_selection = NodeSelection {
            max_nodes,
            types: options.types.clone(),
            with_positions: true,
        };
        let working_nodes = self.store.top_nodes(&working_selection, None, max_nodes)?;
        let working_ids: Vec<&str> = working_nodes.iter().map(|node| node.id.as_str()).collect();
        let working_links = self.store.links_among(&working_ids, max_links)?;

        // 5. Layout, feature-gated on the position columns.
        if self.store.has_position_columns() {
            let (written, skipped, position_diffs) =
                self.run_layout_phase(version_id, &working_nodes, &working_links)?;
            outcome.positions_written = written;
            outcome.positions_skipped = skipped;
            outcome.layout_ran = true;
            diffs.extend(position_diffs);
        } else {
            info!("position columns absent, skipping layout");
        }

        // 6. Communities, centroids, bundles.
        let (levels, communities) = self.run_community_phase(&working_nodes, &working_links)?;
        outcome.community_levels = levels;
        outcome.communities = communities;

        // 7-8. Diff rows, then the atomic commit.
        outcome.diff_rows = diffs.len();
        self.store.insert_diffs(version_id, &diffs)?;
        let node_count = self.store.node_count()?;
        let link_count = self.store.link_count()?;
        let duration_ms = started.elapsed().as_millis() as i64;
        self.store.commit_version(
            version_id,
            node_count,
            link_count,
            duration_ms,
            options.full_rebuild,
        )?;
        outcome.node_count = node_count;
        outcome.link_count = link_count;
        outcome.duration_ms = duration_ms;
        info!(
            version_id,
            node_count,
            link_count,
            diff_rows = outcome.diff_rows,
            positions_written = outcome.positions_written,
            positions_skipped = outcome.positions_skipped,
            communities = outcome.communities,
            duration_ms,
            full_rebuild = options.full_rebuild,
            "precalc committed"
        );
        Ok(outcome)
    }

    /// Runs the force simulation over the heaviest `layout.max_nodes` of the
    /// selection and writes epsilon-passing positions in batches.
    fn run_layout_phase(
        &self,
        version_id: i64,
        nodes: &[GraphNode],
        links: &[GraphLink],
    ) -> Result<(usize, usize, Vec<DiffRow>)> {
        let subset = nodes.len().min(self.layout.max_nodes.max(1));
        let layout_nodes = &nodes[..subset];
        let index_of: FxHashMap<&str, usize> = layout_nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.as_str(), i))
            .collect();
        let seeds: Vec<Option<[f64; 3]>> = layout_nodes.iter().map(position_of).collect();
        let index_links: Vec<(usize, usize)> = links
            .iter()
            .filter_map(|link| {
                Some((
                    *index_of.get(link.source.as_str())?,
                    *index_of.get(link.target.as_str())?,
                ))
            })
            .collect();

        let result = run_layout(
            &seeds,
            &index_links,
            &LayoutParams {
                iterations: self.layout.iterations,
                auto_tune: self.layout.auto_tune,
                seed: version_id as u64,
            },
        );
        info!(
            nodes = subset,
            iterations = result.iterations_run,
            converged = result.converged,
            "layout finished"
        );

        let epsilon = self.layout.epsilon;
        let mut written = 0;
        let mut skipped = 0;
        let mut diffs = Vec::new();
        let mut batch: Vec<PositionWrite<'_>> = Vec::with_capacity(self.layout.batch_size);
        for (i, node) in layout_nodes.iter().enumerate() {
            let old_pos = seeds[i];
            let new_pos = result.positions[i];
            if displacement(old_pos, new_pos) < epsilon {
                skipped += 1;
                continue;
            }
            batch.push(PositionWrite {
                id: &node.id,
                pos: new_pos,
            });
            diffs.push(DiffRow {
                action: DiffAction::Update,
                entity_type: EntityType::Node,
                entity_id: node.id.clone(),
                old_val: None,
                new_val: None,
                old_pos,
                new_pos: Some(new_pos),
            });
            if batch.len() >= self.layout.batch_size.max(1) {
                written += self.store.batch_update_positions(&batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            written += self.store.batch_update_positions(&batch)?;
        }
        Ok((written, skipped, diffs))
    }

    /// Louvain over the selection, then centroid and bundle aggregation.
    /// Returns (levels, leaf community count).
    fn run_community_phase(
        &self,
        nodes: &[GraphNode],
        links: &[GraphLink],
    ) -> Result<(usize, usize)> {
        if nodes.is_empty() {
            self.store.replace_communities(&[], &[], &[])?;
            return Ok((0, 0));
        }
        let index_of: FxHashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.as_str(), i))
            .collect();
        let edges: Vec<(usize, usize, f64)> = links
            .iter()
            .filter_map(|link| {
                Some((
                    *index_of.get(link.source.as_str())?,
                    *index_of.get(link.target.as_str())?,
                    1.0,
                ))
            })
            .collect();
        let hierarchy = louvain::detect(nodes.len(), &edges);
        if hierarchy.levels.is_empty() {
            self.store.replace_communities(&[], &[], &[])?;
            return Ok((0, 0));
        }

        // Positions for centroids come from the freshly written rows.
        let ids: Vec<String> = nodes.iter().map(|node| node.id.clone()).collect();
        let positions: FxHashMap<String, [f64; 3]> = if self.store.has_position_columns() {
            self.store
                .nodes_by_ids(&ids)?
                .into_iter()
                .filter_map(|node| {
                    let pos = position_of(&node)?;
                    Some((node.id, pos))
                })
                .collect()
        } else {
            FxHashMap::default()
        };

        // Global community ids: each level's dense ids are offset so ids are
        // unique across the hierarchy.
        let mut offsets = Vec::with_capacity(hierarchy.levels.len());
        let mut next_id: i64 = 1;
        for level in &hierarchy.levels {
            offsets.push(next_id);
            next_id += level.community_count as i64;
        }

        let mut communities = Vec::new();
        let mut assignments = Vec::new();
        let leaf = &hierarchy.levels[0];

        for (level_index, level) in hierarchy.levels.iter().enumerate() {
            let offset = offsets[level_index];
            // Member lists per community at this level.
            let mut members: Vec<Vec<usize>> = vec![Vec::new(); level.community_count];
            for (node_index, &community) in level.assignment.iter().enumerate() {
                members[community].push(node_index);
            }
            // Centroids as arithmetic means of member positions.
            let mut centroids: Vec<Option<[f64; 3]>> = Vec::with_capacity(level.community_count);
            for community_members in &members {
                let mut sum = [0.0f64; 3];
                let mut count = 0usize;
                for &node_index in community_members {
                    if let Some(pos) = positions.get(&nodes[node_index].id) {
                        sum[0] += pos[0];
                        sum[1] += pos[1];
                        sum[2] += pos[2];
                        count += 1;
                    }
                }
                centroids.push(if count > 0 {
                    let n = count as f64;
                    Some([sum[0] / n, sum[1] / n, sum[2] / n])
                } else {
                    None
                });
            }

            for (community, community_members) in members.iter().enumerate() {
                // Label by the community's heaviest member.
                let label = community_members
                    .iter()
                    .max_by_key(|&&node_index| {
                        (parse_weight(nodes[node_index].val.as_deref()), std::cmp::Reverse(&nodes[node_index].id))
                    })
                    .map(|&node_index| nodes[node_index].name.clone())
                    .unwrap_or_default();
                communities.push(Community {
                    id: offset + community as i64,
                    label,
                    size: community_members.len() as i64,
                    modularity: level.modularity,
                });
            }

            let parent_level = hierarchy.levels.get(level_index + 1);
            for (node_index, &community) in level.assignment.iter().enumerate() {
                let parent_community_id = parent_level
                    .map(|parent| offsets[level_index + 1] + parent.assignment[node_index] as i64);
                let centroid = centroids[community];
                assignments.push(CommunityAssignment {
                    node_id: nodes[node_index].id.clone(),
                    level: level_index as i64,
                    community_id: offset + community as i64,
                    parent_community_id,
                    centroid_x: centroid.map(|c| c[0]),
                    centroid_y: centroid.map(|c| c[1]),
                    centroid_z: centroid.map(|c| c[2]),
                });
            }
        }

        // Bundles aggregate leaf-level inter-community links.
        let leaf_offset = offsets[0];
        let mut bundle_map: FxHashMap<(i64, i64), (f64, f64, usize)> = FxHashMap::default();
        for link in links {
            let (Some(&a), Some(&b)) = (
                index_of.get(link.source.as_str()),
                index_of.get(link.target.as_str()),
            ) else {
                continue;
            };
            let ca = leaf_offset + leaf.assignment[a] as i64;
            let cb = leaf_offset + leaf.assignment[b] as i64;
            if ca == cb {
                continue;
            }
            let strength = (parse_weight(nodes[a].val.as_deref()) as f64
                + parse_weight(nodes[b].val.as_deref()) as f64)
                / 2.0;
            let entry = bundle_map.entry((ca, cb)).or_insert((0.0, 0.0, 0));
            entry.0 += 1.0;
            entry.1 += strength;
            entry.2 += 1;
        }
        let leaf_centroid_of = |community_id: i64| -> Option<[f64; 3]> {
            assignments
                .iter()
                .find(|a| a.level == 0 && a.community_id == community_id)
                .and_then(|a| Some([a.centroid_x?, a.centroid_y?, a.centroid_z?]))
        };
        let mut bundles: Vec<CommunityBundle> = bundle_map
            .into_iter()
            .map(|((source, target), (weight, strength_sum, count))| {
                let control = match (leaf_centroid_of(source), leaf_centroid_of(target)) {
                    (Some(a), Some(b)) => Some([
                        (a[0] + b[0]) / 2.0,
                        (a[1] + b[1]) / 2.0,
                        (a[2] + b[2]) / 2.0,
                    ]),
                    _ => None,
                };
                CommunityBundle {
                    source_community_id: source,
                    target_community_id: target,
                    weight,
                    avg_strength: if count > 0 {
                        strength_sum / count as f64
                    } else {
                        0.0
                    },
                    control_x: control.map(|c| c[0]),
                    control_y: control.map(|c| c[1]),
                    control_z: control.map(|c| c[2]),
                }
            })
            .collect();
        bundles.sort_by_key(|bundle| (bundle.source_community_id, bundle.target_community_id));

        let community_count = leaf.community_count;
        self.store
            .replace_communities(&communities, &assignments, &bundles)?;
        Ok((hierarchy.levels.len(), community_count))
    }
}

fn position_of(node: &GraphNode) -> Option<[f64; 3]> {
    Some([node.pos_x?, node.pos_y?, node.pos_z?])
}

/// Convenience trigger used by the scheduler-owned background loop: a full
/// rebuild when the store has never precalculated, incremental otherwise.
pub async fn run_default(engine: &Arc<Precalculator>) -> Result<PrecalcOutcome> {
    let state = {
        let store = engine.store.clone();
        store.run(move |s| s.precalc_state()).await?
    };
    let options = PrecalcOptions {
        full_rebuild: state.last_full_precalc_at.is_none(),
        ..PrecalcOptions::default()
    };
    engine.run(options).await
}

impl std::fmt::Debug for Precalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Precalculator")
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
