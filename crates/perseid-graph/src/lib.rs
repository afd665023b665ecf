//! Dataflow IR for quantization-noise analysis.
//!
//! A computation is a node arena with control-flow annotations (basic
//! blocks, branches, phis). Before any distribution propagation, the
//! control flow is resolved into per-branch execution paths: plain acyclic
//! dataflow graphs plus the comparison subtrees needed to decide each fork
//! inside an arbitrary probability subdomain.

pub mod graph;
pub mod node;
pub mod paths;

pub use graph::{GraphError, SystemGraph};
pub use node::{BasicBlock, BlockId, CmpKind, Node, NodeId, NoiseId, OpKind};
pub use paths::{extract_paths, ExecutionPath, PathError};
