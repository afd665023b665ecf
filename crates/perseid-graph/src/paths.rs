//! Execution-path extraction.
//!
//! Branches over `TRUE`/`FALSE` comparators are decided statically first;
//! they never fork. Then, for every combination of branch directions across
//! the conditional forks, produce one control-flow-free dataflow DAG:
//! 1. Keep only the chosen successor edge of each fork block.
//! 2. Rebuild block predecessor lists from the surviving successor edges.
//! 3. Sweep unreachable blocks (and their nodes) to a fixed point.
//! 4. Rewrite each phi into a passthrough of its single surviving input,
//!    then splice it out.
//! 5. Delete the resolved branch nodes.
//! 6. Capture each dangling conditional comparison's operand subtree — it is
//!    re-evaluated later to resolve the fork inside a subdomain.
//! 7. Eliminate dead code (non-outputs with no successors) to a fixed point.
//! 8. Record the direction taken at each surviving fork, keyed by the
//!    fork's comparison node.
//!
//! Combinations that collapse to the same decisions map (because later
//! blocks became unreachable) are deduplicated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::graph::{GraphError, SystemGraph};
use crate::node::{BlockId, CmpKind, NodeId, OpKind};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("branch node {0} has no comparison predecessor")]
    BranchWithoutCmp(NodeId),

    #[error("comparison node {0} carries no comparison code")]
    MissingCmpCode(NodeId),

    #[error("fork block b{} has {got} successors, a conditional fork requires 2", block.0)]
    MalformedFork { block: BlockId, got: usize },

    #[error("phi node {0} has no surviving incoming path")]
    UnresolvedPhi(NodeId),
}

/// One control-flow-resolved version of the computation graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPath {
    /// Direction taken at each surviving fork, keyed by the fork's
    /// comparison node.
    pub decisions: BTreeMap<NodeId, bool>,
    /// The resolved, acyclic dataflow graph.
    pub graph: SystemGraph,
    /// Minimal operand subgraph of each surviving fork's comparison.
    pub cmp_trees: BTreeMap<NodeId, SystemGraph>,
}

impl ExecutionPath {
    /// The ordered fork ids of this path (ascending comparison-node id).
    pub fn forks(&self) -> Vec<NodeId> {
        self.decisions.keys().copied().collect()
    }
}

/// Extract one execution path per reachable combination of branch
/// directions.
pub fn extract_paths(source: &SystemGraph) -> Result<Vec<ExecutionPath>, PathError> {
    let mut source = source.clone();
    resolve_unconditional_forks(&mut source)?;
    let forks = conditional_forks(&source)?;

    let mut paths: Vec<ExecutionPath> = Vec::new();
    for choice in 0u64..(1u64 << forks.len()) {
        let take_true = |f: usize| (choice >> f) & 1 == 1;
        let mut g = source.clone();

        // Step 1: keep only the chosen successor edge of each fork block.
        for (f, &(block, _)) in forks.iter().enumerate() {
            let succs = &mut g.blocks[block.index()].succs;
            let kept = if take_true(f) { succs[0] } else { succs[1] };
            *succs = vec![kept];
        }

        // Step 2: predecessor info is stale now; rebuild it from the
        // surviving successor edges.
        rebuild_block_preds(&mut g);

        // Step 3: sweep blocks that became unreachable, with their nodes.
        sweep_unreachable_blocks(&mut g);
        g.prune_dead_edges();

        // Step 4: splice out phi nodes.
        resolve_phis(&mut g)?;

        // Step 5: delete the branch nodes; their direction is fixed.
        let branches: Vec<NodeId> = g
            .alive_nodes()
            .filter(|&id| g.node(id).map(|n| n.op == OpKind::Br).unwrap_or(false))
            .collect();
        for id in branches {
            g.remove_and_unlink(id);
        }

        // Step 6: capture the operand subtree of every dangling conditional
        // comparison before dead-code elimination claims it.
        let mut cmp_trees = BTreeMap::new();
        for id in g.alive_nodes().collect::<Vec<_>>() {
            let node = g.node(id)?;
            if node.op != OpKind::Cmp || !node.succs.is_empty() {
                continue;
            }
            let code = node.cmp.ok_or(PathError::MissingCmpCode(id))?;
            if !code.is_unconditional() {
                cmp_trees.insert(id, g.ancestors_subgraph(id)?);
            }
        }

        // Step 7: dead-code elimination to a fixed point.
        eliminate_dead_code(&mut g);
        g.prune_dead_edges();

        // Step 8: record the direction of each fork whose block survived.
        let mut decisions = BTreeMap::new();
        for (f, &(block, cmp)) in forks.iter().enumerate() {
            if g.is_block_alive(block) {
                decisions.insert(cmp, take_true(f));
            }
        }

        // Combinations differing only in unreachable forks collapse here.
        if paths.iter().any(|p| p.decisions == decisions) {
            continue;
        }
        cmp_trees.retain(|id, _| decisions.contains_key(id));
        paths.push(ExecutionPath {
            decisions,
            graph: g,
            cmp_trees,
        });
    }

    Ok(paths)
}

/// Prune the untaken edge of every branch over a `TRUE`/`FALSE`
/// comparator. These never fork, so their direction is fixed before any
/// combination is enumerated.
fn resolve_unconditional_forks(g: &mut SystemGraph) -> Result<(), PathError> {
    let blocks: Vec<BlockId> = g.alive_blocks().collect();
    for block in blocks {
        let nodes = g.blocks[block.index()].nodes.clone();
        for id in nodes {
            if !g.is_alive(id) || g.node(id)?.op != OpKind::Br {
                continue;
            }
            let cmp_id = g
                .node(id)?
                .preds
                .first()
                .copied()
                .ok_or(PathError::BranchWithoutCmp(id))?;
            let code = g
                .node(cmp_id)?
                .cmp
                .ok_or(PathError::MissingCmpCode(cmp_id))?;
            if !code.is_unconditional() {
                continue;
            }
            let succs = &mut g.blocks[block.index()].succs;
            if succs.len() == 2 {
                let kept = if code == CmpKind::True { succs[0] } else { succs[1] };
                *succs = vec![kept];
            }
        }
    }
    Ok(())
}

/// Blocks holding a conditional branch, with the branch's comparison node,
/// ordered by block id.
fn conditional_forks(g: &SystemGraph) -> Result<Vec<(BlockId, NodeId)>, PathError> {
    let mut forks = Vec::new();
    for block in g.alive_blocks() {
        for &id in &g.blocks[block.index()].nodes {
            if !g.is_alive(id) || g.node(id)?.op != OpKind::Br {
                continue;
            }
            let cmp_id = g
                .node(id)?
                .preds
                .first()
                .copied()
                .ok_or(PathError::BranchWithoutCmp(id))?;
            let code = g
                .node(cmp_id)?
                .cmp
                .ok_or(PathError::MissingCmpCode(cmp_id))?;
            if code.is_unconditional() {
                continue;
            }
            let succ_count = g.blocks[block.index()].succs.len();
            if succ_count != 2 {
                return Err(PathError::MalformedFork {
                    block,
                    got: succ_count,
                });
            }
            forks.push((block, cmp_id));
        }
    }
    forks.sort();
    Ok(forks)
}

fn rebuild_block_preds(g: &mut SystemGraph) {
    for block in &mut g.blocks {
        block.preds.clear();
    }
    let edges: Vec<(BlockId, BlockId)> = g
        .alive_blocks()
        .flat_map(|b| {
            g.blocks[b.index()]
                .succs
                .iter()
                .map(move |&s| (b, s))
                .collect::<Vec<_>>()
        })
        .collect();
    for (from, to) in edges {
        g.blocks[to.index()].preds.push(from);
    }
}

/// Repeatedly delete blocks with no predecessors (other than the entry
/// block) together with the nodes they contain.
fn sweep_unreachable_blocks(g: &mut SystemGraph) {
    let entry = BlockId(0);
    loop {
        let dead: Vec<BlockId> = g
            .alive_blocks()
            .filter(|&b| b != entry && g.blocks[b.index()].preds.is_empty())
            .collect();
        if dead.is_empty() {
            return;
        }
        for b in dead {
            let nodes = g.blocks[b.index()].nodes.clone();
            for id in nodes {
                g.kill(id);
            }
            let succs = g.blocks[b.index()].succs.clone();
            for s in succs {
                g.blocks[s.index()].preds.retain(|&p| p != b);
            }
            g.kill_block(b);
        }
    }
}

/// Rewrite each phi into a passthrough of the input arriving from its single
/// surviving predecessor block, then splice the passthroughs out. Two phases
/// so a phi feeding another phi resolves before either is removed.
fn resolve_phis(g: &mut SystemGraph) -> Result<(), PathError> {
    let phis: Vec<NodeId> = g
        .alive_nodes()
        .filter(|&id| g.node(id).map(|n| n.op == OpKind::Phi).unwrap_or(false))
        .collect();

    // Phase 1: reduce every phi to a single-predecessor passthrough.
    for &id in &phis {
        let phi = g.node(id)?.clone();
        let surviving = phi
            .phi_inputs
            .iter()
            .find(|&&(block, value)| g.is_block_alive(block) && g.is_alive(value))
            .map(|&(_, value)| value)
            .ok_or(PathError::UnresolvedPhi(id))?;

        for &p in &phi.preds {
            if p != surviving && g.is_alive(p) {
                g.node_mut(p)?.succs.retain(|&s| s != id);
            }
        }
        g.node_mut(id)?.preds = vec![surviving];
    }

    // Phase 2: splice each passthrough out, forwarding uses entry by entry
    // so edge multiplicity stays consistent.
    for &id in &phis {
        let phi = g.node(id)?.clone();
        let source = phi.preds[0];
        g.node_mut(source)?.succs.retain(|&s| s != id);
        for &s in &phi.succs {
            if !g.is_alive(s) {
                continue;
            }
            if let Some(slot) = g.node_mut(s)?.preds.iter_mut().find(|p| **p == id) {
                *slot = source;
            }
            g.node_mut(source)?.succs.push(s);
        }
        g.kill(id);
    }
    Ok(())
}

/// Delete non-output nodes with no successors until none remain.
fn eliminate_dead_code(g: &mut SystemGraph) {
    loop {
        let dangling: Vec<NodeId> = g
            .alive_nodes()
            .filter(|&id| {
                g.node(id)
                    .map(|n| n.op != OpKind::Output && n.succs.is_empty())
                    .unwrap_or(false)
            })
            .collect();
        if dangling.is_empty() {
            return;
        }
        for id in dangling {
            g.remove_and_unlink(id);
        }
    }
}
