//! Polynomial-chaos machinery for quantization-noise analysis.
//!
//! Signals are represented as finite expansions over a multivariate
//! Legendre basis of the input and noise random variables. This crate
//! provides the basis itself, the precomputed triple-product structure
//! constants that make expansion products cheap, the symbolic coefficient
//! type that keeps noise amplitudes un-instantiated until a word-length
//! vector is supplied, and the sparse map algebra the propagation engine
//! is built on.

pub mod algebra;
pub mod basis;
pub mod cmatrix;
pub mod coeff;
pub mod legendre;
pub mod vars;

pub use algebra::{add, mul, sub, AlgebraError, CoeffMap};
pub use basis::{Basis, BasisError};
pub use cmatrix::{Cmatrix, CmatrixCache, CmatrixStats};
pub use coeff::{Coeff, Monomial, EPSILON};
pub use vars::{BasisTerm, VarId, VarSet};
