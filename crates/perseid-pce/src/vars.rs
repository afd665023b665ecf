//! Random-variable identifiers and basis-term bookkeeping.
//!
//! A coefficient map is keyed by [`BasisTerm`]s — structural records of which
//! variable carries which polynomial degree — rather than by positional basis
//! indexes. Maps built against different C-matrices (for example one per
//! noise group) therefore combine soundly as long as their variable sets
//! overlap consistently. A [`VarSet`] bridges the structural terms and the
//! positional degree tuples a C-matrix is indexed by.

use perseid_graph::NoiseId;
use serde::{Deserialize, Serialize};

use crate::legendre;

/// A random variable: either a program input or an injected quantization
/// noise source. Inputs order before noises; both order by index, which
/// fixes the canonical variable ordering everywhere (including the
/// word-length vector).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum VarId {
    Input(u16),
    Noise(NoiseId),
}

impl std::fmt::Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarId::Input(i) => write!(f, "x{i}"),
            VarId::Noise(id) => write!(f, "{id}"),
        }
    }
}

/// An ordered set of random variables. The order is canonical (ascending
/// [`VarId`]) and positions in it correspond to positions in the degree
/// tuples of a C-matrix of the same dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarSet {
    vars: Vec<VarId>,
}

impl VarSet {
    pub fn new(vars: impl IntoIterator<Item = VarId>) -> Self {
        let mut vars: Vec<VarId> = vars.into_iter().collect();
        vars.sort_unstable();
        vars.dedup();
        Self { vars }
    }

    pub fn dim(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn vars(&self) -> &[VarId] {
        &self.vars
    }

    pub fn contains(&self, var: VarId) -> bool {
        self.index_of(var).is_some()
    }

    pub fn index_of(&self, var: VarId) -> Option<usize> {
        self.vars.binary_search(&var).ok()
    }

    /// The structural term for a positional degree tuple of this set.
    pub fn term_from_degrees(&self, degrees: &[u8]) -> BasisTerm {
        BasisTerm::from_pairs(
            self.vars
                .iter()
                .zip(degrees)
                .filter(|(_, &d)| d > 0)
                .map(|(&v, &d)| (v, d)),
        )
    }

    /// The positional degree tuple of a structural term, or `None` if the
    /// term references a variable outside this set.
    pub fn degrees_of(&self, term: &BasisTerm) -> Option<Vec<u8>> {
        let mut degrees = vec![0u8; self.vars.len()];
        for &(var, d) in term.pairs() {
            degrees[self.index_of(var)?] = d;
        }
        Some(degrees)
    }
}

/// One element of the orthogonal basis, recorded structurally: the sorted
/// list of (variable, degree) pairs with zero degrees omitted. The empty
/// term is the constant element.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BasisTerm(Vec<(VarId, u8)>);

impl BasisTerm {
    /// The constant basis element.
    pub fn constant() -> Self {
        Self(Vec::new())
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (VarId, u8)>) -> Self {
        let mut pairs: Vec<(VarId, u8)> = pairs.into_iter().filter(|(_, d)| *d > 0).collect();
        pairs.sort_unstable();
        Self(pairs)
    }

    pub fn is_constant(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pairs(&self) -> &[(VarId, u8)] {
        &self.0
    }

    pub fn total_degree(&self) -> u32 {
        self.0.iter().map(|(_, d)| *d as u32).sum()
    }

    pub fn degree_of(&self, var: VarId) -> u8 {
        self.0
            .iter()
            .find(|(v, _)| *v == var)
            .map(|(_, d)| *d)
            .unwrap_or(0)
    }

    /// `E[ψ²]` of this element under the uniform product density; separable
    /// across variables.
    pub fn expectance(&self) -> f64 {
        self.0
            .iter()
            .map(|&(_, d)| legendre::pair_expectation(d, d))
            .product()
    }

    /// Evaluate the element at a point, or `None` if the point misses a
    /// variable the term references.
    pub fn eval(&self, point: &std::collections::BTreeMap<VarId, f64>) -> Option<f64> {
        let mut acc = 1.0;
        for &(var, d) in &self.0 {
            acc *= legendre::eval(d, *point.get(&var)?);
        }
        Some(acc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_var_ordering_inputs_before_noises() {
        let mut vars = vec![
            VarId::Noise(NoiseId(0)),
            VarId::Input(3),
            VarId::Input(0),
            VarId::Noise(NoiseId(7)),
        ];
        vars.sort_unstable();
        assert_eq!(
            vars,
            vec![
                VarId::Input(0),
                VarId::Input(3),
                VarId::Noise(NoiseId(0)),
                VarId::Noise(NoiseId(7)),
            ]
        );
    }

    #[test]
    fn test_varset_dedups_and_sorts() {
        let set = VarSet::new([VarId::Input(1), VarId::Input(0), VarId::Input(1)]);
        assert_eq!(set.dim(), 2);
        assert_eq!(set.index_of(VarId::Input(1)), Some(1));
        assert!(!set.contains(VarId::Input(2)));
    }

    #[test]
    fn test_term_degree_roundtrip() {
        let set = VarSet::new([VarId::Input(0), VarId::Input(1), VarId::Noise(NoiseId(4))]);
        let term = set.term_from_degrees(&[2, 0, 1]);
        assert_eq!(
            term.pairs(),
            &[(VarId::Input(0), 2), (VarId::Noise(NoiseId(4)), 1)]
        );
        assert_eq!(set.degrees_of(&term), Some(vec![2, 0, 1]));
        assert_eq!(term.total_degree(), 3);
    }

    #[test]
    fn test_degrees_of_unknown_variable() {
        let set = VarSet::new([VarId::Input(0)]);
        let term = BasisTerm::from_pairs([(VarId::Input(5), 1)]);
        assert_eq!(set.degrees_of(&term), None);
    }

    #[test]
    fn test_constant_term() {
        let term = BasisTerm::constant();
        assert!(term.is_constant());
        assert_eq!(term.total_degree(), 0);
        assert!((term.expectance() - 1.0).abs() < 1e-12);
        assert_eq!(term.eval(&BTreeMap::new()), Some(1.0));
    }

    #[test]
    fn test_term_expectance_separable() {
        // Degrees (1, 2): E = 1/3 · 1/5.
        let term = BasisTerm::from_pairs([(VarId::Input(0), 1), (VarId::Input(1), 2)]);
        assert!((term.expectance() - 1.0 / 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_term_eval() {
        let term = BasisTerm::from_pairs([(VarId::Input(0), 1)]);
        let mut point = BTreeMap::new();
        point.insert(VarId::Input(0), 0.25);
        assert_eq!(term.eval(&point), Some(0.25));
        point.clear();
        assert_eq!(term.eval(&point), None);
    }
}
