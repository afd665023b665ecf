//! Node arena and graph views.
//!
//! The graph is an arena of nodes addressed by `NodeId` plus an alive mask.
//! Removing a node flips its mask bit; edges are unlinked explicitly. Cloning
//! a graph clones the arena, so a per-path working copy is one `Vec` clone
//! rather than a deep copy of nested records.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::node::{BasicBlock, BlockId, Node, NodeId, OpKind};

/// Graph-shape errors. These indicate a malformed upstream graph and are
/// never retried.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("node {0} does not exist or was removed")]
    UnknownNode(NodeId),

    #[error("graph contains a cycle reachable from the alive node set")]
    Cyclic,

    #[error("node {node} has {got} predecessors, operator {op} requires {want}")]
    WrongArity {
        node: NodeId,
        op: OpKind,
        want: usize,
        got: usize,
    },

    #[error("node {node} ({op}) has no predecessor")]
    MissingPredecessor { node: NodeId, op: OpKind },
}

/// A dataflow graph with control-flow annotations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemGraph {
    nodes: Vec<Node>,
    alive: Vec<bool>,
    #[serde(default)]
    pub blocks: Vec<BasicBlock>,
    #[serde(default)]
    block_alive: Vec<bool>,
    #[serde(default)]
    pub inputs: Vec<NodeId>,
    #[serde(default)]
    pub outputs: Vec<NodeId>,
}

impl SystemGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node to the arena and mirror the edge into its predecessors'
    /// successor lists.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        for &p in &node.preds {
            if let Some(pred) = self.nodes.get_mut(p.index()) {
                pred.succs.push(id);
            }
        }
        self.nodes.push(node);
        self.alive.push(true);
        id
    }

    pub fn add_block(&mut self, block: BasicBlock) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(block);
        self.block_alive.push(true);
        id
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        if !self.is_alive(id) {
            return Err(GraphError::UnknownNode(id));
        }
        Ok(&self.nodes[id.index()])
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        if !self.is_alive(id) {
            return Err(GraphError::UnknownNode(id));
        }
        Ok(&mut self.nodes[id.index()])
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.alive.get(id.index()).copied().unwrap_or(false)
    }

    pub fn is_block_alive(&self, id: BlockId) -> bool {
        self.block_alive.get(id.index()).copied().unwrap_or(false)
    }

    /// Ids of all alive nodes, in arena order.
    pub fn alive_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.alive
            .iter()
            .enumerate()
            .filter(|(_, &a)| a)
            .map(|(i, _)| NodeId(i as u32))
    }

    pub fn alive_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.block_alive
            .iter()
            .enumerate()
            .filter(|(_, &a)| a)
            .map(|(i, _)| BlockId(i as u32))
    }

    pub fn alive_count(&self) -> usize {
        self.alive.iter().filter(|&&a| a).count()
    }

    /// Kill a node without touching edges. Callers are expected to run
    /// `prune_dead_edges` once a removal batch is complete.
    pub fn kill(&mut self, id: NodeId) {
        if let Some(slot) = self.alive.get_mut(id.index()) {
            *slot = false;
        }
    }

    pub fn kill_block(&mut self, id: BlockId) {
        if let Some(slot) = self.block_alive.get_mut(id.index()) {
            *slot = false;
        }
    }

    /// Kill a node and remove it from its neighbours' edge lists.
    pub fn remove_and_unlink(&mut self, id: NodeId) {
        self.kill(id);
        let node = self.nodes[id.index()].clone();
        for p in node.preds {
            if self.is_alive(p) {
                self.nodes[p.index()].succs.retain(|&s| s != id);
            }
        }
        for s in node.succs {
            if self.is_alive(s) {
                self.nodes[s.index()].preds.retain(|&p| p != id);
            }
        }
    }

    /// Drop every edge whose endpoint is dead, and every dead id from the
    /// block node lists and the input/output lists.
    pub fn prune_dead_edges(&mut self) {
        let alive = self.alive.clone();
        let ok = |id: &NodeId| alive.get(id.index()).copied().unwrap_or(false);
        for (i, node) in self.nodes.iter_mut().enumerate() {
            if !alive[i] {
                continue;
            }
            node.succs.retain(ok);
            node.preds.retain(ok);
        }
        for block in &mut self.blocks {
            block.nodes.retain(ok);
        }
        self.inputs.retain(ok);
        self.outputs.retain(ok);
    }

    /// Insert `node` between `after` and all of `after`'s current
    /// successors. Used to splice noise sources onto a node's output.
    pub fn splice_after(&mut self, after: NodeId, mut node: Node) -> Result<NodeId, GraphError> {
        if !self.is_alive(after) {
            return Err(GraphError::UnknownNode(after));
        }
        let succs = std::mem::take(&mut self.nodes[after.index()].succs);
        let id = NodeId(self.nodes.len() as u32);
        for &s in &succs {
            for p in &mut self.nodes[s.index()].preds {
                if *p == after {
                    *p = id;
                }
            }
        }
        node.preds = vec![after];
        node.succs = succs;
        self.nodes.push(node);
        self.alive.push(true);
        self.nodes[after.index()].succs = vec![id];
        Ok(id)
    }

    /// Topological order of the alive nodes: repeatedly emit nodes whose
    /// unresolved-predecessor count is zero.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut remaining: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                if self.alive[i] {
                    n.preds.iter().filter(|p| self.is_alive(**p)).count()
                } else {
                    0
                }
            })
            .collect();

        let mut ready: Vec<NodeId> = self
            .alive_nodes()
            .filter(|id| remaining[id.index()] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.alive_count());

        while let Some(id) = ready.pop() {
            order.push(id);
            for &s in &self.nodes[id.index()].succs {
                if !self.is_alive(s) {
                    continue;
                }
                remaining[s.index()] = remaining[s.index()].saturating_sub(1);
                if remaining[s.index()] == 0 {
                    ready.push(s);
                }
            }
        }

        if order.len() != self.alive_count() {
            return Err(GraphError::Cyclic);
        }
        Ok(order)
    }

    /// The minimal subgraph computing `root`: `root` plus its transitive
    /// predecessors, with successor edges restricted to the kept set.
    pub fn ancestors_subgraph(&self, root: NodeId) -> Result<SystemGraph, GraphError> {
        if !self.is_alive(root) {
            return Err(GraphError::UnknownNode(root));
        }
        let mut keep = BTreeSet::new();
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            if !keep.insert(id) {
                continue;
            }
            for &p in &self.nodes[id.index()].preds {
                if self.is_alive(p) {
                    pending.push(p);
                }
            }
        }

        let mut sub = self.clone();
        for id in sub.all_ids() {
            if sub.is_alive(id) && !keep.contains(&id) {
                sub.kill(id);
            }
        }
        sub.prune_dead_edges();
        Ok(sub)
    }

    /// Check the structural invariants: every non-`input`/`const` node has
    /// at least one predecessor, fixed-arity operators have the right
    /// predecessor count, and the alive subgraph is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        for id in self.alive_nodes() {
            let node = &self.nodes[id.index()];
            match node.op.arity() {
                Some(want) if node.preds.len() != want => {
                    return Err(GraphError::WrongArity {
                        node: id,
                        op: node.op,
                        want,
                        got: node.preds.len(),
                    });
                }
                None if node.preds.is_empty() => {
                    return Err(GraphError::MissingPredecessor {
                        node: id,
                        op: node.op,
                    });
                }
                _ => {}
            }
        }
        self.topo_order().map(|_| ())
    }

    fn all_ids(&self) -> Vec<NodeId> {
        (0..self.nodes.len() as u32).map(NodeId).collect()
    }
}


#[cfg(test)]
impl Node {
    fn bare_for_test() -> Node {
        Node::op(OpKind::Abs, Vec::new())
    }
}
