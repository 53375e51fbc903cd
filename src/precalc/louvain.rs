//! Hierarchical Louvain community detection.
//!
//! One level runs greedy modularity optimization until no single-node move
//! improves modularity, then contracts communities into super-nodes and
//! repeats on the contracted graph. Determinism: nodes are scanned in
//! ascending index order and equal-gain moves resolve to the smaller
//! candidate community id.
//!
//! The adjacency is CSR-shaped parallel arrays; community ids at each level
//! are dense indices into that level's partition.

use rustc_hash::FxHashMap;

/// One level of the decomposition.
#[derive(Debug, Clone)]
pub struct Level {
    /// For each original node, its community at this level.
    pub assignment: Vec<usize>,
    /// Modularity of this partition over the original graph.
    pub modularity: f64,
    /// Number of communities at this level.
    pub community_count: usize,
}

/// The full hierarchy, leaf level first. Every original node appears in
/// every level's assignment.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    pub levels: Vec<Level>,
}

struct Csr {
    offsets: Vec<usize>,
    neighbors: Vec<usize>,
    weights: Vec<f64>,
    /// Self-loop weight per node (from contracted intra-community edges).
    loops: Vec<f64>,
    total_weight: f64,
}

impl Csr {
    fn build(node_count: usize, edges: &[(usize, usize, f64)]) -> Self {
        let mut degree = vec![0usize; node_count];
        let mut loops = vec![0.0f64; node_count];
        let mut total_weight = 0.0;
        for &(a, b, w) in edges {
            total_weight += w;
            if a == b {
                loops[a] += w;
                continue;
            }
            degree[a] += 1;
            degree[b] += 1;
        }
        let mut offsets = vec![0usize; node_count + 1];
        for i in 0..node_count {
            offsets[i + 1] = offsets[i] + degree[i];
        }
        let mut cursor = offsets.clone();
        let mut neighbors = vec![0usize; offsets[node_count]];
        let mut weights = vec![0.0f64; offsets[node_count]];
        for &(a, b, w) in edges {
            if a == b {
                continue;
            }
            neighbors[cursor[a]] = b;
            weights[cursor[a]] = w;
            cursor[a] += 1;
            neighbors[cursor[b]] = a;
            weights[cursor[b]] = w;
            cursor[b] += 1;
        }
        Self {
            offsets,
            neighbors,
            weights,
            loops,
            total_weight,
        }
    }

    fn node_count(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Weighted degree including self-loops (counted twice, as usual).
    fn strength(&self, node: usize) -> f64 {
        let mut sum = 2.0 * self.loops[node];
        for i in self.offsets[node]..self.offsets[node + 1] {
            sum += self.weights[i];
        }
        sum
    }
}

/// Runs hierarchical Louvain over an undirected weighted edge list.
///
/// `node_count` is the arena size; edge endpoints index into it. Returns at
/// least one level for any non-empty graph.
pub fn detect(node_count: usize, edges: &[(usize, usize, f64)]) -> Hierarchy {
    let mut levels = Vec::new();
    if node_count == 0 {
        return Hierarchy { levels };
    }

    // `membership[i]` maps original node i to its community in the graph
    // currently being contracted.
    let mut graph = Csr::build(node_count, edges);
    let mut membership: Vec<usize> = (0..node_count).collect();

    loop {
        let (partition, improved) = one_level(&graph);
        let partition = renumber(partition);
        let community_count = partition.iter().copied().max().map_or(0, |m| m + 1);

        // Project the contracted partition back onto original nodes.
        let assignment: Vec<usize> = membership.iter().map(|&m| partition[m]).collect();
        let modularity = modularity_of(&graph, &partition);
        let is_first = levels.is_empty();
        if !improved && !is_first {
            break;
        }
        levels.push(Level {
            assignment: assignment.clone(),
            modularity,
            community_count,
        });
        if !improved || community_count == graph.node_count() {
            break;
        }
        graph = contract(&graph, &partition, community_count);
        membership = assignment;
    }

    Hierarchy { levels }
}

/// One pass of greedy modularity moves. Returns the local partition and
/// whether any move improved modularity.
fn one_level(graph: &Csr) -> (Vec<usize>, bool) {
    let n = graph.node_count();
    let total = graph.total_weight.max(f64::MIN_POSITIVE);
    let two_m = 2.0 * total;

    let mut community: Vec<usize> = (0..n).collect();
    let mut community_strength: Vec<f64> = (0..n).map(|i| graph.strength(i)).collect();
    let node_strength: Vec<f64> = community_strength.clone();

    let mut improved_any = false;
    let mut moved = true;
    let mut rounds = 0;
    while moved && rounds < 32 {
        moved = false;
        rounds += 1;
        for node in 0..n {
            let current = community[node];
            let strength = node_strength[node];
            community_strength[current] -= strength;

            // Weight from `node` to each adjacent community.
            let mut weight_to: FxHashMap<usize, f64> = FxHashMap::default();
            weight_to.insert(current, 0.0);
            for i in graph.offsets[node]..graph.offsets[node + 1] {
                let neighbor = graph.neighbors[i];
                *weight_to.entry(community[neighbor]).or_insert(0.0) += graph.weights[i];
            }

            // Best gain; ties break toward the smaller community id.
            let mut best = current;
            let mut best_gain = gain(
                weight_to.get(&current).copied().unwrap_or(0.0),
                community_strength[current],
                strength,
                two_m,
            );
            let mut candidates: Vec<(usize, f64)> =
                weight_to.iter().map(|(&c, &w)| (c, w)).collect();
            candidates.sort_unstable_by_key(|(c, _)| *c);
            for (candidate, weight) in candidates {
                if candidate == current {
                    continue;
                }
                let candidate_gain =
                    gain(weight, community_strength[candidate], strength, two_m);
                if candidate_gain > best_gain + 1e-12
                    || (candidate_gain > best_gain - 1e-12 && candidate < best && candidate_gain > 1e-12)
                {
                    best = candidate;
                    best_gain = candidate_gain;
                }
            }

            community_strength[best] += strength;
            if best != current {
                community[node] = best;
                moved = true;
                improved_any = true;
            }
        }
    }
    (community, improved_any)
}

/// Modularity gain of joining a community, up to terms constant per node.
fn gain(weight_to_community: f64, community_strength: f64, node_strength: f64, two_m: f64) -> f64 {
    weight_to_community / two_m - community_strength * node_strength / (two_m * two_m)
}

fn renumber(partition: Vec<usize>) -> Vec<usize> {
    let mut mapping: FxHashMap<usize, usize> = FxHashMap::default();
    let mut next = 0;
    partition
        .into_iter()
        .map(|community| {
            *mapping.entry(community).or_insert_with(|| {
                let id = next;
                next += 1;
                id
            })
        })
        .collect()
}

fn modularity_of(graph: &Csr, partition: &[usize]) -> f64 {
    let total = graph.total_weight.max(f64::MIN_POSITIVE);
    let two_m = 2.0 * total;
    let community_count = partition.iter().copied().max().map_or(0, |m| m + 1);
    let mut internal = vec![0.0f64; community_count];
    let mut strength = vec![0.0f64; community_count];
    for node in 0..graph.node_count() {
        let c = partition[node];
        strength[c] += graph.strength(node);
        internal[c] += 2.0 * graph.loops[node];
        for i in graph.offsets[node]..graph.offsets[node + 1] {
            if partition[graph.neighbors[i]] == c {
                internal[c] += graph.weights[i];
            }
        }
    }
    (0..community_count)
        .map(|c| internal[c] / two_m - (strength[c] / two_m).powi(2))
        .sum()
}

fn contract(graph: &Csr, partition: &[usize], community_count: usize) -> Csr {
    let mut merged: FxHashMap<(usize, usize), f64> = FxHashMap::default();
    for node in 0..graph.node_count() {
        let a = partition[node];
        if graph.loops[node] > 0.0 {
            *merged.entry((a, a)).or_insert(0.0) += graph.loops[node];
        }
        for i in graph.offsets[node]..graph.offsets[node + 1] {
            let neighbor = graph.neighbors[i];
            if neighbor < node {
                continue;
            }
            let b = partition[neighbor];
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            *merged.entry((lo, hi)).or_insert(0.0) += graph.weights[i];
        }
    }
    let mut edges: Vec<(usize, usize, f64)> = merged
        .into_iter()
        .map(|((a, b), w)| (a, b, w))
        .collect();
    edges.sort_unstable_by_key(|&(a, b, _)| (a, b));
    Csr::build(community_count, &edges)
}
