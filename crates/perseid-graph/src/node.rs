use serde::{Deserialize, Serialize};

/// Index of a node in the graph arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Index of a basic block in the graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of a quantization noise source: the id of the node whose
/// output the source perturbs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct NoiseId(pub u32);

impl std::fmt::Display for NoiseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Operator of a dataflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Input,
    Const,
    Add,
    Sub,
    Mul,
    Div,
    Abs,
    Sqrt,
    Cmp,
    Br,
    Phi,
    Noise,
    Output,
}

impl OpKind {
    /// Operators that distort a local polynomial approximation badly enough
    /// that their noise source cannot share a basis with other sources.
    pub fn is_strongly_nonlinear(self) -> bool {
        matches!(self, OpKind::Abs | OpKind::Sqrt)
    }

    /// Control-flow artifacts that must disappear during path extraction.
    pub fn is_branch_artifact(self) -> bool {
        matches!(self, OpKind::Cmp | OpKind::Br | OpKind::Phi)
    }

    /// Number of predecessors the operator requires, if fixed.
    pub fn arity(self) -> Option<usize> {
        match self {
            OpKind::Input | OpKind::Const => Some(0),
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::Cmp => Some(2),
            OpKind::Abs | OpKind::Sqrt | OpKind::Noise | OpKind::Output | OpKind::Br => Some(1),
            OpKind::Phi => None,
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpKind::Input => "input",
            OpKind::Const => "const",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Abs => "abs",
            OpKind::Sqrt => "sqrt",
            OpKind::Cmp => "cmp",
            OpKind::Br => "br",
            OpKind::Phi => "phi",
            OpKind::Noise => "noise",
            OpKind::Output => "output",
        };
        f.write_str(name)
    }
}

/// Comparison operator codes, as delivered by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CmpKind {
    Lt,
    Lte,
    Eq,
    Neq,
    Gt,
    Gte,
    True,
    False,
}

impl CmpKind {
    /// `TRUE`/`FALSE` comparators never fork: their branch direction is
    /// fixed regardless of the inputs.
    pub fn is_unconditional(self) -> bool {
        matches!(self, CmpKind::True | CmpKind::False)
    }

    /// Evaluate the comparison on concrete operand values.
    pub fn eval(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpKind::Lt => lhs < rhs,
            CmpKind::Lte => lhs <= rhs,
            CmpKind::Eq => lhs == rhs,
            CmpKind::Neq => lhs != rhs,
            CmpKind::Gt => lhs > rhs,
            CmpKind::Gte => lhs >= rhs,
            CmpKind::True => true,
            CmpKind::False => false,
        }
    }
}

/// One dataflow node. Predecessor order is significant for non-commutative
/// operators (`sub`, `div`, `cmp`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: OpKind,
    #[serde(default)]
    pub preds: Vec<NodeId>,
    #[serde(default)]
    pub succs: Vec<NodeId>,
    /// Constant value; `const` nodes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Comparison code; `cmp` nodes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmp: Option<CmpKind>,
    /// Noise source symbol; `noise` nodes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise: Option<NoiseId>,
    /// Incoming (block, value) pairs; `phi` nodes only. The value ids are
    /// mirrored in `preds`, in the same order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phi_inputs: Vec<(BlockId, NodeId)>,
}

impl Node {
    pub fn input() -> Self {
        Self::bare(OpKind::Input)
    }

    pub fn constant(value: f64) -> Self {
        Self {
            value: Some(value),
            ..Self::bare(OpKind::Const)
        }
    }

    pub fn op(op: OpKind, preds: Vec<NodeId>) -> Self {
        Self {
            preds,
            ..Self::bare(op)
        }
    }

    pub fn cmp(kind: CmpKind, preds: Vec<NodeId>) -> Self {
        Self {
            preds,
            cmp: Some(kind),
            ..Self::bare(OpKind::Cmp)
        }
    }

    pub fn branch(cmp: NodeId) -> Self {
        Self::op(OpKind::Br, vec![cmp])
    }

    pub fn phi(inputs: Vec<(BlockId, NodeId)>) -> Self {
        Self {
            preds: inputs.iter().map(|(_, n)| *n).collect(),
            phi_inputs: inputs,
            ..Self::bare(OpKind::Phi)
        }
    }

    pub fn noise(source: NoiseId, pred: NodeId) -> Self {
        Self {
            preds: vec![pred],
            noise: Some(source),
            ..Self::bare(OpKind::Noise)
        }
    }

    pub fn output(pred: NodeId) -> Self {
        Self::op(OpKind::Output, vec![pred])
    }

    fn bare(op: OpKind) -> Self {
        Self {
            op,
            preds: Vec::new(),
            succs: Vec::new(),
            value: None,
            cmp: None,
            noise: None,
            phi_inputs: Vec::new(),
        }
    }
}

/// A basic block: the nodes executed together under one control-flow unit.
/// For a conditional block, `succs[0]` is the taken-if-true target and
/// `succs[1]` the taken-if-false target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    #[serde(default)]
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub preds: Vec<BlockId>,
    #[serde(default)]
    pub succs: Vec<BlockId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmp_eval() {
        assert!(CmpKind::Lt.eval(1.0, 2.0));
        assert!(!CmpKind::Lt.eval(2.0, 1.0));
        assert!(CmpKind::Gte.eval(2.0, 2.0));
        assert!(CmpKind::True.eval(f64::NAN, 0.0));
        assert!(!CmpKind::False.eval(0.0, 0.0));
    }

    #[test]
    fn test_unconditional_cmps() {
        assert!(CmpKind::True.is_unconditional());
        assert!(CmpKind::False.is_unconditional());
        assert!(!CmpKind::Lt.is_unconditional());
    }

    #[test]
    fn test_cmp_codes_serialize_uppercase() {
        assert_eq!(serde_json::to_string(&CmpKind::Lte).unwrap(), "\"LTE\"");
        assert_eq!(serde_json::to_string(&CmpKind::True).unwrap(), "\"TRUE\"");
        let parsed: CmpKind = serde_json::from_str("\"NEQ\"").unwrap();
        assert_eq!(parsed, CmpKind::Neq);
    }

    #[test]
    fn test_node_constructors() {
        let c = Node::constant(3.5);
        assert_eq!(c.op, OpKind::Const);
        assert_eq!(c.value, Some(3.5));

        let add = Node::op(OpKind::Add, vec![NodeId(0), NodeId(1)]);
        assert_eq!(add.preds.len(), 2);

        let phi = Node::phi(vec![(BlockId(1), NodeId(4)), (BlockId(2), NodeId(7))]);
        assert_eq!(phi.preds, vec![NodeId(4), NodeId(7)]);
    }
}
