//! Symbolic coefficients.
//!
//! A PCE coefficient is not always a plain number: the coefficient a noise
//! source contributes is its amplitude `q_i = 2^(-wl_i) / 2`, which must stay
//! symbolic until a word-length vector is supplied. Propagation only ever
//! adds, subtracts and multiplies coefficients, so sparse polynomials over
//! the amplitude variables are closed under everything the engine does.

use std::collections::BTreeMap;

use perseid_graph::NoiseId;
use serde::{Deserialize, Serialize};

/// Magnitudes below this are treated as numerically zero.
pub const EPSILON: f64 = 1e-13;

/// A product of amplitude variables: sorted `(source, exponent)` pairs with
/// zero exponents omitted. The empty monomial is the constant `1`.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Monomial(Vec<(NoiseId, u32)>);

impl Monomial {
    pub fn one() -> Self {
        Self(Vec::new())
    }

    pub fn amplitude(source: NoiseId) -> Self {
        Self(vec![(source, 1)])
    }

    pub fn is_one(&self) -> bool {
        self.0.is_empty()
    }

    pub fn mul(&self, other: &Monomial) -> Monomial {
        let mut exps: BTreeMap<NoiseId, u32> = self.0.iter().copied().collect();
        for &(id, e) in &other.0 {
            *exps.entry(id).or_insert(0) += e;
        }
        Monomial(exps.into_iter().collect())
    }

    pub fn sources(&self) -> impl Iterator<Item = NoiseId> + '_ {
        self.0.iter().map(|&(id, _)| id)
    }

    /// Substitute concrete amplitudes. `Err` carries the first source
    /// missing from the substitution.
    pub fn eval(&self, amplitudes: &BTreeMap<NoiseId, f64>) -> Result<f64, NoiseId> {
        let mut acc = 1.0;
        for &(id, e) in &self.0 {
            let a = amplitudes.get(&id).ok_or(id)?;
            acc *= a.powi(e as i32);
        }
        Ok(acc)
    }
}

/// A sparse polynomial over noise-amplitude variables, kept canonical:
/// terms sorted by monomial, exact zeros dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coeff {
    terms: Vec<(Monomial, f64)>,
}

impl Coeff {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn constant(value: f64) -> Self {
        Self::from_terms([(Monomial::one(), value)])
    }

    /// The amplitude variable of one noise source, `q_i` with coefficient 1.
    pub fn amplitude(source: NoiseId) -> Self {
        Self::from_terms([(Monomial::amplitude(source), 1.0)])
    }

    fn from_terms(terms: impl IntoIterator<Item = (Monomial, f64)>) -> Self {
        let mut merged: BTreeMap<Monomial, f64> = BTreeMap::new();
        for (m, v) in terms {
            *merged.entry(m).or_insert(0.0) += v;
        }
        merged.retain(|_, v| *v != 0.0);
        Self {
            terms: merged.into_iter().collect(),
        }
    }

    pub fn terms(&self) -> &[(Monomial, f64)] {
        &self.terms
    }

    /// True when every term is below [`EPSILON`] in magnitude.
    pub fn is_zero(&self) -> bool {
        self.terms.iter().all(|(_, v)| v.abs() < EPSILON)
    }

    /// The numeric value of a coefficient with no effective symbolic part,
    /// or `None` if an amplitude term survives.
    pub fn constant_value(&self) -> Option<f64> {
        let mut value = 0.0;
        for (m, v) in &self.terms {
            if m.is_one() {
                value = *v;
            } else if v.abs() >= EPSILON {
                return None;
            }
        }
        Some(value)
    }

    pub fn add(&self, other: &Coeff) -> Coeff {
        Self::from_terms(
            self.terms
                .iter()
                .chain(other.terms.iter())
                .map(|(m, v)| (m.clone(), *v)),
        )
    }

    pub fn sub(&self, other: &Coeff) -> Coeff {
        self.add(&other.neg())
    }

    pub fn neg(&self) -> Coeff {
        Self {
            terms: self.terms.iter().map(|(m, v)| (m.clone(), -v)).collect(),
        }
    }

    pub fn scale(&self, factor: f64) -> Coeff {
        Self::from_terms(self.terms.iter().map(|(m, v)| (m.clone(), v * factor)))
    }

    pub fn mul(&self, other: &Coeff) -> Coeff {
        let mut products = Vec::with_capacity(self.terms.len() * other.terms.len());
        for (ma, va) in &self.terms {
            for (mb, vb) in &other.terms {
                products.push((ma.mul(mb), va * vb));
            }
        }
        Self::from_terms(products)
    }

    /// Every noise source referenced by a surviving term.
    pub fn sources(&self) -> impl Iterator<Item = NoiseId> + '_ {
        self.terms.iter().flat_map(|(m, _)| m.sources())
    }

    /// Substitute concrete amplitudes for every amplitude variable.
    pub fn eval(&self, amplitudes: &BTreeMap<NoiseId, f64>) -> Result<f64, NoiseId> {
        let mut acc = 0.0;
        for (m, v) in &self.terms {
            acc += v * m.eval(amplitudes)?;
        }
        Ok(acc)
    }
}
