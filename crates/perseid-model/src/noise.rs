//! Quantization noise sources.
//!
//! A noise source is identified by the node whose output it perturbs; its
//! amplitude `q = 2^(-wl) / 2` stays symbolic until a word-length vector is
//! supplied. The registry is the one shared mutable structure workers touch
//! while discovering sources, so insertion is a single critical section and
//! two workers discovering the same source agree on one symbol.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use perseid_graph::{GraphError, Node, NodeId, NoiseId, OpKind, SystemGraph};
use perseid_pce::{BasisTerm, Coeff, CoeffMap, VarId};

/// Shared registry of discovered noise sources. Reports sources in
/// ascending id order, which is the canonical word-length vector order.
#[derive(Debug, Default)]
pub struct NoiseRegistry {
    sources: Mutex<BTreeSet<NoiseId>>,
}

impl NoiseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a source; returns false if it was already known.
    pub fn register(&self, source: NoiseId) -> bool {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source)
    }

    pub fn contains(&self, source: NoiseId) -> bool {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&source)
    }

    pub fn sources(&self) -> Vec<NoiseId> {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The quantization amplitude for a word length: half an ulp, `2^(-wl) / 2`.
pub fn quantizer_amplitude(word_length: u32) -> f64 {
    (2.0f64).powi(-(word_length as i32)) / 2.0
}

/// The distribution of one noise source: uniform with symbolic amplitude,
/// `{ψ_q: q}`.
pub fn amplitude_distribution(source: NoiseId) -> CoeffMap {
    let mut map = CoeffMap::new();
    map.insert(
        BasisTerm::from_pairs([(VarId::Noise(source), 1)]),
        Coeff::amplitude(source),
    );
    map
}

/// Nodes eligible for noise injection: everything alive except outputs and
/// constants (constants are quantized once at compile time) and noise nodes
/// already spliced in.
pub fn eligible_nodes(graph: &SystemGraph) -> Vec<NodeId> {
    graph
        .alive_nodes()
        .filter(|&id| {
            graph
                .node(id)
                .map(|n| !matches!(n.op, OpKind::Output | OpKind::Const | OpKind::Noise))
                .unwrap_or(false)
        })
        .collect()
}

/// Splice a noise node onto each listed node's output, registering every
/// source. Returns the sources in splice order.
pub fn splice_noise(
    graph: &mut SystemGraph,
    nodes: &[NodeId],
    registry: &NoiseRegistry,
) -> Result<Vec<NoiseId>, GraphError> {
    let mut sources = Vec::with_capacity(nodes.len());
    for &node in nodes {
        let source = NoiseId(node.0);
        graph.splice_after(node, Node::noise(source, node))?;
        registry.register(source);
        sources.push(source);
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amplitude_halves_per_bit() {
        assert!((quantizer_amplitude(0) - 0.5).abs() < 1e-15);
        assert!((quantizer_amplitude(1) - 0.25).abs() < 1e-15);
        assert!((quantizer_amplitude(8) - 1.0 / 512.0).abs() < 1e-15);
    }

    #[test]
    fn test_registry_dedups() {
        let registry = NoiseRegistry::new();
        assert!(registry.register(NoiseId(3)));
        assert!(!registry.register(NoiseId(3)));
        assert!(registry.register(NoiseId(1)));
        assert_eq!(registry.sources(), vec![NoiseId(1), NoiseId(3)]);
    }

    #[test]
    fn test_splice_rewires_and_registers() {
        let mut g = SystemGraph::new();
        let a = g.add_node(Node::input());
        let b = g.add_node(Node::input());
        let addn = g.add_node(Node::op(OpKind::Add, vec![a, b]));
        let out = g.add_node(Node::output(addn));
        g.inputs = vec![a, b];
        g.outputs = vec![out];

        let registry = NoiseRegistry::new();
        let sources = splice_noise(&mut g, &[addn], &registry).unwrap();
        assert_eq!(sources, vec![NoiseId(addn.0)]);
        assert!(registry.contains(NoiseId(addn.0)));

        // add → noise → out.
        let spliced = g.node(addn).unwrap().succs[0];
        let noise = g.node(spliced).unwrap();
        assert_eq!(noise.op, OpKind::Noise);
        assert_eq!(noise.noise, Some(NoiseId(addn.0)));
        assert_eq!(noise.succs, vec![out]);
        assert_eq!(g.node(out).unwrap().preds, vec![spliced]);
        g.validate().unwrap();
    }

    #[test]
    fn test_eligibility_excludes_outputs_and_consts() {
        let mut g = SystemGraph::new();
        let a = g.add_node(Node::input());
        let c = g.add_node(Node::constant(2.0));
        let m = g.add_node(Node::op(OpKind::Mul, vec![a, c]));
        let out = g.add_node(Node::output(m));
        g.inputs = vec![a];
        g.outputs = vec![out];

        assert_eq!(eligible_nodes(&g), vec![a, m]);
    }

    #[test]
    fn test_amplitude_distribution_shape() {
        let dist = amplitude_distribution(NoiseId(5));
        assert_eq!(dist.len(), 1);
        let term = BasisTerm::from_pairs([(VarId::Noise(NoiseId(5)), 1)]);
        let amps = [(NoiseId(5), quantizer_amplitude(4))].into_iter().collect();
        let value = dist.coeff(&term).eval(&amps).unwrap();
        assert!((value - 1.0 / 32.0).abs() < 1e-15);
    }
}
