//! Build scheduling: which nodes of a build are waiting, ready, running or
//! finished.  Knows the graph's shape but nothing about chains or files.

use crate::graph::{BuildGraph, NodeId, NodeKind};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting on dependencies in the same build.
    Want,
    /// All dependencies done; waiting for a worker.
    Ready,
    Running,
    Done,
    Failed,
    /// Not built because a dependency failed.
    Skipped,
}

const STATES: usize = 6;

impl NodeState {
    fn index(self) -> usize {
        match self {
            NodeState::Want => 0,
            NodeState::Ready => 1,
            NodeState::Running => 2,
            NodeState::Done => 3,
            NodeState::Failed => 4,
            NodeState::Skipped => 5,
        }
    }
}

/// Number of nodes in each state, for progress display.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateCounts([usize; STATES]);

impl StateCounts {
    pub fn get(&self, state: NodeState) -> usize {
        self.0[state.index()]
    }

    pub fn add(&mut self, state: NodeState, delta: isize) {
        let count = &mut self.0[state.index()];
        *count = count.wrapping_add_signed(delta);
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    /// Nodes that reached a final state.
    pub fn finished(&self) -> usize {
        self.get(NodeState::Done) + self.get(NodeState::Failed) + self.get(NodeState::Skipped)
    }
}

/// The nodes a side node or source node waits on: its dependencies, plus
/// the producer for a side node.
fn prerequisites(graph: &BuildGraph, id: NodeId) -> Vec<NodeId> {
    let node = graph.node(id);
    let mut deps = node.deps().to_vec();
    if let NodeKind::Side { producer, .. } = node.kind {
        deps.push(producer);
    }
    deps
}

fn followers(graph: &BuildGraph, id: NodeId) -> Vec<NodeId> {
    let mut ids = graph.node(id).dependents().to_vec();
    ids.extend(graph.side_nodes(id));
    ids
}

pub struct Work {
    states: FxHashMap<NodeId, NodeState>,
    /// Count of unfinished prerequisites within this build, per node.
    waiting: FxHashMap<NodeId, usize>,
    ready: VecDeque<NodeId>,
    /// Bumped when a running node is restarted; results carrying an older
    /// generation are stale.
    generations: FxHashMap<NodeId, u64>,
    counts: StateCounts,
}

impl Work {
    /// Schedule `nodes`, which must be ordered producers first.
    /// Prerequisites outside the set are taken as already built.
    pub fn new(graph: &BuildGraph, nodes: &[NodeId]) -> Self {
        let mut work = Work {
            states: FxHashMap::default(),
            waiting: FxHashMap::default(),
            ready: VecDeque::new(),
            generations: FxHashMap::default(),
            counts: StateCounts::default(),
        };
        for &id in nodes {
            work.states.insert(id, NodeState::Want);
            work.counts.add(NodeState::Want, 1);
        }
        for &id in nodes {
            let waiting = prerequisites(graph, id)
                .into_iter()
                .filter(|dep| work.states.contains_key(dep))
                .count();
            work.waiting.insert(id, waiting);
            if waiting == 0 {
                work.set_state(id, NodeState::Ready);
                work.ready.push_back(id);
            }
        }
        work
    }

    fn set_state(&mut self, id: NodeId, state: NodeState) {
        if let Some(old) = self.states.insert(id, state) {
            self.counts.add(old, -1);
        }
        self.counts.add(state, 1);
    }

    pub fn state(&self, id: NodeId) -> Option<NodeState> {
        self.states.get(&id).copied()
    }

    pub fn counts(&self) -> &StateCounts {
        &self.counts
    }

    /// Whether every node reached a final state.
    pub fn is_done(&self) -> bool {
        self.counts.finished() == self.counts.total()
    }

    /// Take the next ready node, marking it running.
    pub fn next_ready(&mut self) -> Option<NodeId> {
        let id = self.ready.pop_front()?;
        self.set_state(id, NodeState::Running);
        Some(id)
    }

    pub fn generation(&self, id: NodeId) -> u64 {
        self.generations.get(&id).copied().unwrap_or(0)
    }

    pub fn is_current(&self, id: NodeId, generation: u64) -> bool {
        self.state(id) == Some(NodeState::Running) && self.generation(id) == generation
    }

    /// Add `id` to a build in progress, e.g. a file first referenced by a
    /// node that changed mid-build.  Returns false if it is already part of
    /// the build.
    pub fn add(&mut self, graph: &BuildGraph, id: NodeId) -> bool {
        if self.states.contains_key(&id) {
            return false;
        }
        self.set_state(id, NodeState::Want);
        self.schedule(graph, id);
        true
    }

    /// Requeue a node whose input changed before it finished.  A running
    /// node gets a new generation, so its in-flight result is stale.  The
    /// node waits again on whatever prerequisites are not done yet, since
    /// the change may have added some.  Returns false, changing nothing, if
    /// the node isn't waiting or running in this build.
    pub fn restart(&mut self, graph: &BuildGraph, id: NodeId) -> bool {
        match self.state(id) {
            Some(NodeState::Running) => *self.generations.entry(id).or_insert(0) += 1,
            Some(NodeState::Want) | Some(NodeState::Ready) => {}
            _ => return false,
        }
        self.ready.retain(|&r| r != id);
        self.schedule(graph, id);
        true
    }

    fn schedule(&mut self, graph: &BuildGraph, id: NodeId) {
        let waiting = prerequisites(graph, id)
            .into_iter()
            .filter(|&dep| {
                matches!(
                    self.state(dep),
                    Some(NodeState::Want) | Some(NodeState::Ready) | Some(NodeState::Running)
                )
            })
            .count();
        self.waiting.insert(id, waiting);
        if waiting == 0 {
            self.set_state(id, NodeState::Ready);
            self.ready.push_front(id);
        } else {
            self.set_state(id, NodeState::Want);
        }
    }

    /// Record a node's outcome.  On success, followers whose prerequisites
    /// are all done become ready; on failure every transitive follower in
    /// the build is skipped.  Returns the skipped nodes.
    pub fn finished(&mut self, graph: &BuildGraph, id: NodeId, success: bool) -> Vec<NodeId> {
        if !success {
            self.set_state(id, NodeState::Failed);
            let mut skipped = Vec::new();
            let mut stack = followers(graph, id);
            while let Some(f) = stack.pop() {
                match self.state(f) {
                    Some(NodeState::Want) | Some(NodeState::Ready) => {
                        self.set_state(f, NodeState::Skipped);
                        self.ready.retain(|&r| r != f);
                        skipped.push(f);
                        stack.extend(followers(graph, f));
                    }
                    _ => {}
                }
            }
            return skipped;
        }
        self.set_state(id, NodeState::Done);
        for f in followers(graph, id) {
            if self.state(f) != Some(NodeState::Want) {
                continue;
            }
            let waiting = match self.waiting.get_mut(&f) {
                Some(waiting) => waiting,
                None => continue,
            };
            *waiting = waiting.saturating_sub(1);
            if *waiting == 0 {
                self.set_state(f, NodeState::Ready);
                self.ready.push_back(f);
            }
        }
        Vec::new()
    }
}
