//! Distribution propagation over a resolved dataflow graph.
//!
//! Walks the alive nodes in topological order and computes one coefficient
//! map per node. The graph must be a single resolved execution path:
//! branches and phis are fatal here, and `div` (with the other nonlinear
//! unaries) is outside what the polynomial algebra can express.

use std::collections::BTreeMap;

use perseid_graph::{GraphError, NodeId, OpKind, SystemGraph};
use perseid_pce::{algebra, AlgebraError, Cmatrix, CoeffMap, VarId, VarSet};

#[derive(Debug, thiserror::Error)]
pub enum PropagateError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Algebra(#[from] AlgebraError),

    #[error("operator {op} at node {node} is unsupported in propagation")]
    UnsupportedOp { node: NodeId, op: OpKind },

    #[error("node {node} is a control-flow artifact ({op}); the graph was not path-resolved")]
    UnresolvedControlFlow { node: NodeId, op: OpKind },

    #[error("node {node} ({op}) has {got} predecessors, expected {want}")]
    Arity {
        node: NodeId,
        op: OpKind,
        want: usize,
        got: usize,
    },

    #[error("input node {0} is not in the graph's declared input list")]
    UndeclaredInput(NodeId),

    #[error("no distribution supplied for variable {var} (node {node})")]
    MissingDistribution { node: NodeId, var: VarId },

    #[error("const node {0} carries no value")]
    MissingConst(NodeId),

    #[error("noise node {0} carries no source symbol")]
    MissingNoiseSymbol(NodeId),

    #[error("operand {pred} of node {node} has no distribution (comparison used as data?)")]
    MissingOperand { node: NodeId, pred: NodeId },
}

/// Propagate input and noise distributions through the graph, producing one
/// coefficient map per node. Comparison nodes yield no map (fork resolution
/// reads their operands instead); everything else dispatches on its
/// operator.
pub fn propagate(
    graph: &SystemGraph,
    input_vars: &BTreeMap<NodeId, VarId>,
    dists: &BTreeMap<VarId, CoeffMap>,
    vars: &VarSet,
    cmatrix: &Cmatrix,
) -> Result<BTreeMap<NodeId, CoeffMap>, PropagateError> {
    let order = graph.topo_order()?;
    let mut maps: BTreeMap<NodeId, CoeffMap> = BTreeMap::new();

    for id in order {
        let node = graph.node(id)?;
        let map = match node.op {
            OpKind::Input => {
                check_arity(id, node.op, 0, node.preds.len())?;
                let var = *input_vars
                    .get(&id)
                    .ok_or(PropagateError::UndeclaredInput(id))?;
                lookup(dists, id, var)?.clone()
            }
            OpKind::Const => {
                check_arity(id, node.op, 0, node.preds.len())?;
                let value = node.value.ok_or(PropagateError::MissingConst(id))?;
                CoeffMap::constant(value)
            }
            OpKind::Add => {
                check_arity(id, node.op, 2, node.preds.len())?;
                algebra::add(
                    operand(&maps, id, node.preds[0])?,
                    operand(&maps, id, node.preds[1])?,
                )
            }
            OpKind::Sub => {
                check_arity(id, node.op, 2, node.preds.len())?;
                algebra::sub(
                    operand(&maps, id, node.preds[0])?,
                    operand(&maps, id, node.preds[1])?,
                )
            }
            OpKind::Mul => {
                check_arity(id, node.op, 2, node.preds.len())?;
                algebra::mul(
                    operand(&maps, id, node.preds[0])?,
                    operand(&maps, id, node.preds[1])?,
                    vars,
                    cmatrix,
                )?
            }
            OpKind::Noise => {
                check_arity(id, node.op, 1, node.preds.len())?;
                let source = node.noise.ok_or(PropagateError::MissingNoiseSymbol(id))?;
                let dist = lookup(dists, id, VarId::Noise(source))?;
                algebra::add(operand(&maps, id, node.preds[0])?, dist)
            }
            OpKind::Output => {
                check_arity(id, node.op, 1, node.preds.len())?;
                operand(&maps, id, node.preds[0])?.clone()
            }
            // Fork resolution evaluates the operand maps directly.
            OpKind::Cmp => continue,
            OpKind::Div | OpKind::Abs | OpKind::Sqrt => {
                return Err(PropagateError::UnsupportedOp { node: id, op: node.op });
            }
            OpKind::Br | OpKind::Phi => {
                return Err(PropagateError::UnresolvedControlFlow { node: id, op: node.op });
            }
        };
        maps.insert(id, map);
    }

    Ok(maps)
}

fn check_arity(node: NodeId, op: OpKind, want: usize, got: usize) -> Result<(), PropagateError> {
    if got != want {
        return Err(PropagateError::Arity { node, op, want, got });
    }
    Ok(())
}

fn operand<'m>(
    maps: &'m BTreeMap<NodeId, CoeffMap>,
    node: NodeId,
    pred: NodeId,
) -> Result<&'m CoeffMap, PropagateError> {
    maps.get(&pred)
        .ok_or(PropagateError::MissingOperand { node, pred })
}

fn lookup<'d>(
    dists: &'d BTreeMap<VarId, CoeffMap>,
    node: NodeId,
    var: VarId,
) -> Result<&'d CoeffMap, PropagateError> {
    dists
        .get(&var)
        .ok_or(PropagateError::MissingDistribution { node, var })
}
