use crate::graph::export;
use crate::graph::known::{category_of, priority_of, static_dependencies};
use crate::graph::{DependencyEdge, EdgeKind, GraphFormat, GraphNode, GraphSnapshot, GraphView};
use crate::types::{FileId, Link, LinkKind};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

#[derive(Default)]
struct GraphState {
    /// Files known to exist.
    nodes: BTreeSet<FileId>,
    /// Dynamic out-edges per source file, as last parsed.
    dynamic: BTreeMap<FileId, Vec<(FileId, LinkKind)>>,
}

impl GraphState {
    /// Static edges between registered files plus every dynamic edge.
    fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges = BTreeSet::new();
        for from in &self.nodes {
            for to in static_dependencies(from) {
                if self.nodes.contains(&to) {
                    edges.insert(DependencyEdge {
                        from: from.clone(),
                        to,
                        kind: EdgeKind::Static,
                        link_kind: LinkKind::Reference,
                    });
                }
            }
        }
        for (from, targets) in &self.dynamic {
            for (to, link_kind) in targets {
                edges.insert(DependencyEdge {
                    from: from.clone(),
                    to: to.clone(),
                    kind: EdgeKind::Dynamic,
                    link_kind: *link_kind,
                });
            }
        }
        edges.into_iter().collect()
    }
}

/// File dependency graph: static edges from the well-known table, dynamic
/// edges from parsed links.
#[derive(Default)]
pub struct DependencyGraph {
    state: RwLock<GraphState>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // === Membership ===

    pub fn register_file(&self, id: &FileId) {
        self.state.write().nodes.insert(id.clone());
    }

    /// Forget a file and its dynamic out-edges. Edges pointing at it stay,
    /// and it shows as a missing node.
    pub fn remove_file(&self, id: &FileId) {
        let mut state = self.state.write();
        state.nodes.remove(id);
        state.dynamic.remove(id);
    }

    pub fn contains(&self, id: &FileId) -> bool {
        self.state.read().nodes.contains(id)
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    // === Dynamic edges ===

    pub fn add_dynamic_edge(&self, from: &FileId, to: &FileId, link_kind: LinkKind) {
        let mut state = self.state.write();
        let targets = state.dynamic.entry(from.clone()).or_default();
        match targets.iter_mut().find(|(t, _)| t == to) {
            Some(existing) => existing.1 = existing.1.max(link_kind),
            None => targets.push((to.clone(), link_kind)),
        }
    }

    /// Replace every dynamic out-edge of `id` with `links`.
    pub fn rebuild_dynamic_edges(&self, id: &FileId, links: &[Link]) {
        let targets = dynamic_targets(id, links);
        let mut state = self.state.write();
        state.nodes.insert(id.clone());
        if targets.is_empty() {
            state.dynamic.remove(id);
        } else {
            state.dynamic.insert(id.clone(), targets);
        }
    }

    /// Drop all dynamic edges and re-register from scratch.
    pub fn reset<'a>(&self, files: impl IntoIterator<Item = (&'a FileId, &'a [Link])>) {
        let mut fresh = GraphState::default();
        for (id, links) in files {
            fresh.nodes.insert(id.clone());
            let targets = dynamic_targets(id, links);
            if !targets.is_empty() {
                fresh.dynamic.insert(id.clone(), targets);
            }
        }
        *self.state.write() = fresh;
    }

    // === Queries ===

    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.state.read().edges()
    }

    /// Edges out of `id`: what it depends on.
    pub fn get_dependencies(&self, id: &FileId) -> Vec<DependencyEdge> {
        self.edges().into_iter().filter(|e| e.from == *id).collect()
    }

    /// Edges into `id`: what depends on it.
    pub fn get_dependents(&self, id: &FileId) -> Vec<DependencyEdge> {
        self.edges().into_iter().filter(|e| e.to == *id).collect()
    }

    /// Dependencies first. `ids` restricts the ordered set (default: every
    /// registered file); only edges with both ends in the set count.
    ///
    /// Topological when possible, ties broken by (priority, id). When cycles
    /// prevent that, falls back to a plain (priority, id) sort instead of
    /// refusing.
    pub fn compute_loading_order(&self, ids: Option<&[FileId]>) -> Vec<FileId> {
        let state = self.state.read();
        let set: BTreeSet<FileId> = match ids {
            Some(ids) => ids.iter().cloned().collect(),
            None => state.nodes.clone(),
        };

        let mut pairs: BTreeSet<(FileId, FileId)> = BTreeSet::new();
        for edge in state.edges() {
            if edge.from != edge.to && set.contains(&edge.from) && set.contains(&edge.to) {
                pairs.insert((edge.from, edge.to));
            }
        }
        drop(state);

        match kahn(&set, &pairs) {
            Some(order) => order,
            None => {
                log::debug!("Dependency cycle among {} file(s); loading by priority", set.len());
                let mut fallback: Vec<FileId> = set.into_iter().collect();
                fallback.sort_by_cached_key(|id| (priority_of(id), id.clone()));
                fallback
            }
        }
    }

    pub fn has_cycle(&self) -> bool {
        !self.detect_cycles().is_empty()
    }

    /// Distinct cycles over every edge. Each is an open list rotated to
    /// start at its smallest id: `[A, B]` for `A -> B -> A`.
    pub fn detect_cycles(&self) -> Vec<Vec<FileId>> {
        find_cycles(&self.edges())
    }

    /// Cycles made only of transclusion edges.
    pub fn transclusion_cycles(&self) -> Vec<Vec<FileId>> {
        let edges: Vec<_> = self
            .edges()
            .into_iter()
            .filter(|e| e.link_kind == LinkKind::Transclusion)
            .collect();
        find_cycles(&edges)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let (registered, edges) = {
            let state = self.state.read();
            (state.nodes.clone(), state.edges())
        };

        let mut ids: BTreeSet<FileId> = registered.clone();
        for edge in &edges {
            ids.insert(edge.from.clone());
            ids.insert(edge.to.clone());
        }
        let nodes = ids
            .into_iter()
            .map(|id| GraphNode {
                priority: priority_of(&id),
                category: category_of(&id).to_string(),
                exists: registered.contains(&id),
                id,
            })
            .collect();

        let cycles = find_cycles(&edges);
        GraphSnapshot { nodes, edges, cycles }
    }

    pub fn export(&self, format: GraphFormat) -> GraphView {
        let snapshot = self.snapshot();
        match format {
            GraphFormat::Raw => GraphView::Raw(snapshot),
            GraphFormat::Diagram => GraphView::Diagram(export::to_mermaid(&snapshot)),
        }
    }
}

/// A self-reference is not a dependency; a self-transclusion is kept so
/// it shows up as a cycle.
fn dynamic_targets(id: &FileId, links: &[Link]) -> Vec<(FileId, LinkKind)> {
    links
        .iter()
        .filter(|l| l.target_id != *id || l.kind == LinkKind::Transclusion)
        .map(|l| (l.target_id.clone(), l.kind))
        .collect()
}

/// Kahn's algorithm with a ready set ordered by (priority, id). `None` on a
/// cycle.
fn kahn(set: &BTreeSet<FileId>, pairs: &BTreeSet<(FileId, FileId)>) -> Option<Vec<FileId>> {
    let mut pending: HashMap<&FileId, usize> = set.iter().map(|id| (id, 0)).collect();
    let mut dependents: HashMap<&FileId, Vec<&FileId>> = HashMap::new();
    for (from, to) in pairs {
        *pending.entry(from).or_default() += 1;
        dependents.entry(to).or_default().push(from);
    }

    let mut ready: BTreeSet<(u32, &FileId)> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| (priority_of(id), *id))
        .collect();

    let mut order = Vec::with_capacity(set.len());
    while let Some(next) = ready.pop_first() {
        let (_, id) = next;
        order.push(id.clone());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(n) = pending.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.insert((priority_of(dependent), *dependent));
                }
            }
        }
    }

    (order.len() == set.len()).then_some(order)
}

fn find_cycles(edges: &[DependencyEdge]) -> Vec<Vec<FileId>> {
    let mut adjacency: BTreeMap<&FileId, BTreeSet<&FileId>> = BTreeMap::new();
    for edge in edges {
        adjacency.entry(&edge.from).or_default().insert(&edge.to);
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut found = BTreeSet::new();
    let starts: Vec<&FileId> = adjacency.keys().copied().collect();
    for start in starts {
        if !visited.contains(start) {
            find_cycles_dfs(start, &adjacency, &mut visited, &mut rec_stack, &mut Vec::new(), &mut found);
        }
    }
    found.into_iter().collect()
}

fn find_cycles_dfs<'a>(
    node: &'a FileId,
    adjacency: &BTreeMap<&'a FileId, BTreeSet<&'a FileId>>,
    visited: &mut HashSet<&'a FileId>,
    rec_stack: &mut HashSet<&'a FileId>,
    path: &mut Vec<&'a FileId>,
    cycles: &mut BTreeSet<Vec<FileId>>,
) {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    for &next in adjacency.get(node).into_iter().flatten() {
        if !visited.contains(next) {
            find_cycles_dfs(next, adjacency, visited, rec_stack, path, cycles);
        } else if rec_stack.contains(next) {
            if let Some(pos) = path.iter().position(|&x| x == next) {
                cycles.insert(canonical_rotation(&path[pos..]));
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
}

/// Rotate so the smallest id comes first.
fn canonical_rotation(cycle: &[&FileId]) -> Vec<FileId> {
    let start = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(i, _)| i)
        .unwrap_or(0);
    cycle[start..]
        .iter()
        .chain(cycle[..start].iter())
        .map(|id| (*id).clone())
        .collect()
}
