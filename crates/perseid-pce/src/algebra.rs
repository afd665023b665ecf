//! Sparse coefficient-map algebra.
//!
//! A [`CoeffMap`] represents one signal's polynomial-chaos expansion: basis
//! term → coefficient, zero entries pruned, absent key meaning zero. `add`,
//! `sub` and `mul` are the only primitives distribution propagation needs;
//! they agree with ordinary polynomial arithmetic modulo truncation at the
//! basis order, which is the accepted approximation of the method.

use std::collections::BTreeMap;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::cmatrix::Cmatrix;
use crate::coeff::Coeff;
use crate::vars::{BasisTerm, VarId, VarSet};

#[derive(Debug, thiserror::Error)]
pub enum AlgebraError {
    #[error("C-matrix covers {matrix} variables, the operand set has {vars}")]
    DimensionMismatch { vars: usize, matrix: usize },

    #[error("coefficient map references variable {0}, absent from the C-matrix variable set")]
    UnknownVariable(VarId),

    #[error("basis term of total degree {degree} exceeds the C-matrix order {order}")]
    TermOutsideBasis { degree: u32, order: u32 },
}

/// Basis term → coefficient, zero-pruned. Serializes as a sorted pair
/// sequence because the keys are structural.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoeffMap {
    entries: BTreeMap<BasisTerm, Coeff>,
}

impl CoeffMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The expansion of a constant signal: `{1: value}`.
    pub fn constant(value: f64) -> Self {
        let mut map = Self::new();
        map.insert(BasisTerm::constant(), Coeff::constant(value));
        map
    }

    /// The expansion of a variable uniform on [-1, 1]: `{ψ_var: 1}`.
    pub fn uniform(var: VarId) -> Self {
        let mut map = Self::new();
        map.insert(BasisTerm::from_pairs([(var, 1)]), Coeff::constant(1.0));
        map
    }

    /// Insert a term, dropping it when the coefficient is numerically zero.
    pub fn insert(&mut self, term: BasisTerm, coeff: Coeff) {
        if coeff.is_zero() {
            self.entries.remove(&term);
        } else {
            self.entries.insert(term, coeff);
        }
    }

    pub fn get(&self, term: &BasisTerm) -> Option<&Coeff> {
        self.entries.get(term)
    }

    /// The coefficient of a term, zero when absent.
    pub fn coeff(&self, term: &BasisTerm) -> Coeff {
        self.entries.get(term).cloned().unwrap_or_default()
    }

    /// The coefficient of the constant basis element: the signal's mean.
    pub fn mean(&self) -> Coeff {
        self.coeff(&BasisTerm::constant())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BasisTerm, &Coeff)> {
        self.entries.iter()
    }

    pub fn terms(&self) -> impl Iterator<Item = &BasisTerm> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluate the expansion at a concrete point of the variable domain.
    /// `None` when a coefficient is symbolic or the point misses a variable.
    pub fn eval_numeric(&self, point: &BTreeMap<VarId, f64>) -> Option<f64> {
        let mut acc = 0.0;
        for (term, coeff) in &self.entries {
            acc += coeff.constant_value()? * term.eval(point)?;
        }
        Some(acc)
    }
}

impl FromIterator<(BasisTerm, Coeff)> for CoeffMap {
    fn from_iter<T: IntoIterator<Item = (BasisTerm, Coeff)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (term, coeff) in iter {
            map.insert(term, coeff);
        }
        map
    }
}

impl Serialize for CoeffMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

impl<'de> Deserialize<'de> for CoeffMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(BasisTerm, Coeff)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

/// Term-wise sum of two expansions.
pub fn add(a: &CoeffMap, b: &CoeffMap) -> CoeffMap {
    let mut out = a.clone();
    for (term, coeff) in b.iter() {
        out.insert(term.clone(), out.coeff(term).add(coeff));
    }
    out
}

/// Term-wise difference of two expansions.
pub fn sub(a: &CoeffMap, b: &CoeffMap) -> CoeffMap {
    let mut out = a.clone();
    for (term, coeff) in b.iter() {
        out.insert(term.clone(), out.coeff(term).sub(coeff));
    }
    out
}

/// Product of two expansions, folded back onto the basis through the
/// structure constants: `c_k = Σ A_a · B_b · C[(a, b, k)]`.
pub fn mul(a: &CoeffMap, b: &CoeffMap, vars: &VarSet, cm: &Cmatrix) -> Result<CoeffMap, AlgebraError> {
    if vars.dim() != cm.dim() {
        return Err(AlgebraError::DimensionMismatch {
            vars: vars.dim(),
            matrix: cm.dim(),
        });
    }

    let mut acc: BTreeMap<u32, Coeff> = BTreeMap::new();
    for (term_a, coeff_a) in a.iter() {
        let ia = position(term_a, vars, cm)?;
        for (term_b, coeff_b) in b.iter() {
            let product = coeff_a.mul(coeff_b);
            if product.is_zero() {
                continue;
            }
            let ib = position(term_b, vars, cm)?;
            for &(k, value) in cm.pairs(ia, ib) {
                let entry = acc.entry(k).or_default();
                *entry = entry.add(&product.scale(value));
            }
        }
    }

    Ok(acc
        .into_iter()
        .map(|(k, coeff)| (vars.term_from_degrees(cm.basis().degrees(k as usize)), coeff))
        .collect())
}

fn position(term: &BasisTerm, vars: &VarSet, cm: &Cmatrix) -> Result<usize, AlgebraError> {
    let degrees = vars.degrees_of(term).ok_or_else(|| {
        let missing = term
            .pairs()
            .iter()
            .map(|&(v, _)| v)
            .find(|&v| !vars.contains(v))
            .unwrap_or(VarId::Input(0));
        AlgebraError::UnknownVariable(missing)
    })?;
    cm.index_of_degrees(&degrees)
        .ok_or(AlgebraError::TermOutsideBasis {
            degree: term.total_degree(),
            order: cm.order(),
        })
}
