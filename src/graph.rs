//! The build graph: one node per source file or side artifact, with edges
//! from each consumer to the nodes it depends on.
//!
//! The graph is kept acyclic.  Every edge insertion checks reachability first
//! and is rejected, without modifying the graph, if it would close a cycle.

use crate::error::CycleError;
use crate::hash::ContentHash;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);
impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for NodeId {
    fn from(index: usize) -> Self {
        NodeId(index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// A file under the source root.
    Source,
    /// The index'th side output of the producer's chain.
    Side { producer: NodeId, index: usize },
}

/// The emitted result of building a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub source: String,
    /// Output path relative to the output root; None when nothing was
    /// written because the content was empty.
    pub output: Option<String>,
    pub content: Arc<Vec<u8>>,
    pub hash: ContentHash,
    /// Paths of the nodes this artifact was built against.
    pub depends_on: Vec<String>,
}

#[derive(Debug)]
pub struct Node {
    pub path: String,
    pub kind: NodeKind,
    /// Index into the rule table; None for passthrough copies.
    pub rule: Option<usize>,
    deps: Vec<NodeId>,
    dependents: Vec<NodeId>,
    artifact: Option<Artifact>,
    pub dirty: bool,
    removed: bool,
}

impl Node {
    pub fn deps(&self) -> &[NodeId] {
        &self.deps
    }

    pub fn dependents(&self) -> &[NodeId] {
        &self.dependents
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }
}

#[derive(Default)]
pub struct BuildGraph {
    nodes: Vec<Node>,
    by_path: FxHashMap<String, NodeId>,
    /// Side nodes per producer, in side output order.
    sides: FxHashMap<NodeId, Vec<NodeId>>,
}

impl BuildGraph {
    pub fn new() -> Self {
        BuildGraph::default()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Ids of the nodes in the graph, skipping removed ones.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| !self.nodes[id.0].removed)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        !self.nodes[id.0].removed
    }

    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn path(&self, id: NodeId) -> &str {
        &self.nodes[id.0].path
    }

    /// Add a node depending on `deps`.  If `path` already has a node, its
    /// kind and rule are kept and `deps` are added to its dependencies.
    /// New nodes start dirty.
    pub fn add_node(
        &mut self,
        path: &str,
        kind: NodeKind,
        rule: Option<usize>,
        deps: &[NodeId],
    ) -> Result<NodeId, CycleError> {
        if let Some(id) = self.lookup(path) {
            for &dep in deps {
                if !self.nodes[id.0].deps.contains(&dep) && self.reaches(dep, id) {
                    return Err(self.cycle(id, dep));
                }
            }
            for &dep in deps {
                self.add_edge(id, dep)?;
            }
            return Ok(id);
        }
        let id = NodeId(self.nodes.len());
        let mut uniq: Vec<NodeId> = Vec::with_capacity(deps.len());
        for &dep in deps {
            if !uniq.contains(&dep) {
                uniq.push(dep);
            }
        }
        // A fresh node has no dependents, so none of these edges can close a
        // cycle.
        for &dep in &uniq {
            self.nodes[dep.0].dependents.push(id);
        }
        self.nodes.push(Node {
            path: path.to_string(),
            kind: kind.clone(),
            rule,
            deps: uniq,
            dependents: Vec::new(),
            artifact: None,
            dirty: true,
            removed: false,
        });
        self.by_path.insert(path.to_string(), id);
        if let NodeKind::Side { producer, .. } = kind {
            let nodes = &self.nodes;
            let sides = self.sides.entry(producer).or_default();
            sides.push(id);
            sides.sort_by_key(|side| match nodes[side.0].kind {
                NodeKind::Side { index, .. } => index,
                NodeKind::Source => 0,
            });
        }
        Ok(id)
    }

    /// Whether `to` is reachable from `from` following dependency edges.
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut seen = FxHashSet::default();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            for &dep in &self.nodes[id.0].deps {
                if dep == to {
                    return true;
                }
                if seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        false
    }

    fn cycle(&self, consumer: NodeId, producer: NodeId) -> CycleError {
        CycleError {
            from: self.path(consumer).to_string(),
            to: self.path(producer).to_string(),
        }
    }

    /// Make `consumer` depend on `producer`.  Returns whether the edge is
    /// new.
    pub fn add_edge(&mut self, consumer: NodeId, producer: NodeId) -> Result<bool, CycleError> {
        if self.nodes[consumer.0].deps.contains(&producer) {
            return Ok(false);
        }
        if self.reaches(producer, consumer) {
            return Err(self.cycle(consumer, producer));
        }
        self.nodes[consumer.0].deps.push(producer);
        self.nodes[producer.0].dependents.push(consumer);
        Ok(true)
    }

    /// Replace the dependencies of `id` with `deps`.  Either every edge is
    /// valid and the set is replaced, or nothing changes.
    pub fn set_deps(&mut self, id: NodeId, deps: &[NodeId]) -> Result<(), CycleError> {
        let mut wanted: Vec<NodeId> = Vec::with_capacity(deps.len());
        for &dep in deps {
            if !wanted.contains(&dep) {
                wanted.push(dep);
            }
        }
        let old = self.nodes[id.0].deps.clone();
        for &dep in &wanted {
            if !old.contains(&dep) && self.reaches(dep, id) {
                return Err(self.cycle(id, dep));
            }
        }
        for &dep in &old {
            if !wanted.contains(&dep) {
                self.nodes[dep.0].dependents.retain(|&d| d != id);
            }
        }
        for &dep in &wanted {
            if !old.contains(&dep) {
                self.nodes[dep.0].dependents.push(id);
            }
        }
        self.nodes[id.0].deps = wanted;
        Ok(())
    }

    /// Mark the node and everything affected by it dirty.  Returns the
    /// number of nodes marked.
    pub fn mark_dirty(&mut self, id: NodeId) -> usize {
        let affected = self.affected_set(id);
        for &id in &affected {
            self.nodes[id.0].dirty = true;
        }
        affected.len()
    }

    pub fn clear_dirty(&mut self, id: NodeId) {
        self.nodes[id.0].dirty = false;
    }

    /// The node plus everything that transitively depends on it, producers
    /// before consumers.
    pub fn affected_set(&self, id: NodeId) -> Vec<NodeId> {
        self.affected_set_many(&[id])
    }

    pub fn affected_set_many(&self, ids: &[NodeId]) -> Vec<NodeId> {
        let mut set = FxHashSet::default();
        let mut queue: VecDeque<NodeId> = ids.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if !set.insert(id) {
                continue;
            }
            queue.extend(self.nodes[id.0].dependents.iter().copied());
            // Side nodes are products of their producer: rebuilding the
            // producer rebuilds them.
            queue.extend(self.side_nodes(id).iter().copied());
        }
        self.topo_order()
            .into_iter()
            .filter(|id| set.contains(id))
            .collect()
    }

    /// All nodes ordered so that every node comes after its dependencies.
    /// Ties are broken by node id, so the order is deterministic.
    pub fn topo_order(&self) -> Vec<NodeId> {
        let mut waiting: Vec<usize> = self.nodes.iter().map(|n| n.deps.len()).collect();
        let mut ready: BTreeSet<NodeId> = self
            .ids()
            .filter(|id| waiting[id.0] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &dependent in &self.nodes[id.0].dependents {
                waiting[dependent.0] -= 1;
                if waiting[dependent.0] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    pub fn set_artifact(&mut self, id: NodeId, artifact: Artifact) {
        let node = &mut self.nodes[id.0];
        node.artifact = Some(artifact);
        node.dirty = false;
    }

    pub fn clear_artifact(&mut self, id: NodeId) {
        self.nodes[id.0].artifact = None;
    }

    /// Side nodes produced by `producer`, in side output order.
    pub fn side_nodes(&self, producer: NodeId) -> &[NodeId] {
        self.sides.get(&producer).map_or(&[], |sides| sides.as_slice())
    }

    /// Artifacts of the side nodes produced by `producer`.
    pub fn side_artifacts(&self, producer: NodeId) -> Vec<&Artifact> {
        self.side_nodes(producer)
            .iter()
            .filter_map(|id| self.nodes[id.0].artifact.as_ref())
            .collect()
    }

    /// Remove a node along with the side nodes it produced, and every edge
    /// touching them.  Their ids are not reused; a later `add_node` for the
    /// same path makes a fresh node.
    pub fn remove(&mut self, id: NodeId) {
        let mut doomed = vec![id];
        doomed.extend(self.side_nodes(id).iter().copied());
        for id in doomed {
            if self.nodes[id.0].removed {
                continue;
            }
            for dep in std::mem::take(&mut self.nodes[id.0].deps) {
                self.nodes[dep.0].dependents.retain(|&d| d != id);
            }
            for dependent in std::mem::take(&mut self.nodes[id.0].dependents) {
                self.nodes[dependent.0].deps.retain(|&d| d != id);
            }
            if let NodeKind::Side { producer, .. } = self.nodes[id.0].kind {
                if let Some(sides) = self.sides.get_mut(&producer) {
                    sides.retain(|&s| s != id);
                }
            }
            let node = &mut self.nodes[id.0];
            node.artifact = None;
            node.removed = true;
            self.by_path.remove(&node.path);
        }
        self.sides.remove(&id);
    }
}
