//! Multivariate orthogonal basis enumeration.
//!
//! A basis element for `dim` variables is the product of one univariate
//! Legendre polynomial per variable; elements are enumerated by ascending
//! total degree, with per-variable degrees summing to at most `order`.

use serde::{Deserialize, Serialize};

use crate::legendre::{self, MAX_ORDER};

#[derive(Debug, thiserror::Error)]
pub enum BasisError {
    #[error("unsupported basis order {0} (maximum {MAX_ORDER})")]
    UnsupportedOrder(u32),

    #[error("failed to access the C-matrix preload directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed C-matrix preload: {0}")]
    Preload(#[from] serde_json::Error),
}

/// The ordered basis for a fixed dimension and order, with the expectation
/// of each element's square.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Basis {
    dim: usize,
    order: u32,
    degrees: Vec<Vec<u8>>,
    expectances: Vec<f64>,
}

impl Basis {
    pub fn generate(dim: usize, order: u32) -> Result<Self, BasisError> {
        if order > MAX_ORDER {
            return Err(BasisError::UnsupportedOrder(order));
        }

        let mut degrees = Vec::new();
        for total in 0..=order {
            append_tuples_with_sum(dim, total as u8, &mut Vec::new(), &mut degrees);
        }

        let expectances = degrees
            .iter()
            .map(|tuple| {
                tuple
                    .iter()
                    .map(|&d| legendre::pair_expectation(d, d))
                    .product()
            })
            .collect();

        Ok(Self {
            dim,
            order,
            degrees,
            expectances,
        })
    }

    /// Number of basis elements: C(dim + order, order).
    pub fn size_for(dim: usize, order: u32) -> usize {
        let mut size = 1usize;
        for i in 1..=order as usize {
            size = size * (dim + i) / i;
        }
        size
    }

    pub fn len(&self) -> usize {
        self.degrees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.degrees.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    /// Per-variable degrees of the `k`-th basis element.
    pub fn degrees(&self, k: usize) -> &[u8] {
        &self.degrees[k]
    }

    pub fn all_degrees(&self) -> &[Vec<u8>] {
        &self.degrees
    }

    /// `E[ψ_k²]` under the uniform product density.
    pub fn expectance(&self, k: usize) -> f64 {
        self.expectances[k]
    }

    /// Evaluate the `k`-th basis element at a point of `dim` coordinates.
    pub fn eval_element(&self, k: usize, point: &[f64]) -> f64 {
        self.degrees[k]
            .iter()
            .zip(point)
            .map(|(&d, &x)| legendre::eval(d, x))
            .product()
    }
}

/// Append every `dim`-tuple of degrees summing to exactly `total`, in
/// lexicographic order.
fn append_tuples_with_sum(dim: usize, total: u8, prefix: &mut Vec<u8>, out: &mut Vec<Vec<u8>>) {
    if dim == 0 {
        if total == 0 {
            out.push(prefix.clone());
        }
        return;
    }
    for d in 0..=total {
        prefix.push(d);
        append_tuples_with_sum(dim - 1, total - d, prefix, out);
        prefix.pop();
    }
}
