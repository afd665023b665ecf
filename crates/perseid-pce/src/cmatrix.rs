//! Triple-product structure constants ("C-matrix").
//!
//! `mul` of two coefficient maps folds the product back onto the basis via
//! `c_k = Σ_{a,b} A_a B_b · E[ψ_a ψ_b ψ_k] / E[ψ_k²]`. All nonzero
//! normalized triple expectations are precomputed here, exploiting
//! separability: the multivariate expectation is the product of univariate
//! Legendre triple expectations, and any variable whose three local degrees
//! sum to an odd number kills the whole entry.
//!
//! Generation cost grows with `C(dim+order, order)³`, so structures are
//! cached by `(dim, order)` and optionally persisted to a preload directory.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::basis::{Basis, BasisError};
use crate::legendre;

/// Structure constants for one `(dim, order)` pair. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "CmatrixRecord", into = "CmatrixRecord")]
pub struct Cmatrix {
    basis: Basis,
    /// `(a, b) → [(k, E[ψ_a ψ_b ψ_k] / E[ψ_k²])]`, covering every ordered
    /// pair; each bucket is sorted by `k`.
    pairs: BTreeMap<(u32, u32), Vec<(u32, f64)>>,
    /// Positional index of each degree tuple in the basis.
    degree_index: BTreeMap<Vec<u8>, u32>,
}

/// Serialized layout: the basis plus the flat nonzero entry list. The pair
/// and degree indexes are rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CmatrixRecord {
    basis: Basis,
    entries: Vec<(u32, u32, u32, f64)>,
}

/// Occupancy summary of a generated C-matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CmatrixStats {
    pub basis_len: usize,
    pub dense_triples: usize,
    pub nonzero_entries: usize,
    pub fill_ratio: f64,
}

impl Cmatrix {
    pub fn generate(dim: usize, order: u32) -> Result<Self, BasisError> {
        let basis = Basis::generate(dim, order)?;
        let univariate = legendre::triple_table(order);
        let n = basis.len();

        let mut pairs: BTreeMap<(u32, u32), Vec<(u32, f64)>> = BTreeMap::new();
        for i in 0..n {
            for j in i..n {
                for k in j..n {
                    let Some(value) = triple_value(&basis, &univariate, dim, i, j, k) else {
                        continue;
                    };
                    for (a, b, r) in distinct_permutations(i, j, k) {
                        pairs
                            .entry((a as u32, b as u32))
                            .or_default()
                            .push((r as u32, value / basis.expectance(r)));
                    }
                }
            }
        }
        for bucket in pairs.values_mut() {
            bucket.sort_unstable_by_key(|&(k, _)| k);
        }

        let degree_index = build_degree_index(&basis);
        Ok(Self {
            basis,
            pairs,
            degree_index,
        })
    }

    pub fn basis(&self) -> &Basis {
        &self.basis
    }

    pub fn dim(&self) -> usize {
        self.basis.dim()
    }

    pub fn order(&self) -> u32 {
        self.basis.order()
    }

    /// All `(k, value)` entries for the ordered pair `(a, b)`.
    pub fn pairs(&self, a: usize, b: usize) -> &[(u32, f64)] {
        self.pairs
            .get(&(a as u32, b as u32))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The normalized entry for a full triple, zero if absent.
    pub fn value(&self, a: usize, b: usize, k: usize) -> f64 {
        self.pairs(a, b)
            .iter()
            .find(|&&(r, _)| r as usize == k)
            .map(|&(_, v)| v)
            .unwrap_or(0.0)
    }

    /// Basis position of a positional degree tuple, if it is in the basis.
    pub fn index_of_degrees(&self, degrees: &[u8]) -> Option<usize> {
        self.degree_index.get(degrees).map(|&i| i as usize)
    }

    pub fn stats(&self) -> CmatrixStats {
        let basis_len = self.basis.len();
        let dense_triples = basis_len * basis_len * basis_len;
        let nonzero_entries = self.pairs.values().map(Vec::len).sum();
        CmatrixStats {
            basis_len,
            dense_triples,
            nonzero_entries,
            fill_ratio: nonzero_entries as f64 / dense_triples as f64,
        }
    }
}

/// Joint expectation `E[ψ_i ψ_j ψ_k]`, or `None` when a parity constraint
/// or a vanishing univariate factor kills it.
fn triple_value(
    basis: &Basis,
    univariate: &BTreeMap<(u8, u8, u8), f64>,
    dim: usize,
    i: usize,
    j: usize,
    k: usize,
) -> Option<f64> {
    let mut value = 1.0;
    for v in 0..dim {
        let mut t = [basis.degrees(i)[v], basis.degrees(j)[v], basis.degrees(k)[v]];
        if (t[0] as u32 + t[1] as u32 + t[2] as u32) % 2 == 1 {
            return None;
        }
        t.sort_unstable();
        value *= univariate.get(&(t[0], t[1], t[2]))?;
    }
    Some(value)
}

fn distinct_permutations(i: usize, j: usize, k: usize) -> Vec<(usize, usize, usize)> {
    let mut perms = vec![
        (i, j, k),
        (i, k, j),
        (j, i, k),
        (j, k, i),
        (k, i, j),
        (k, j, i),
    ];
    perms.sort_unstable();
    perms.dedup();
    perms
}

fn build_degree_index(basis: &Basis) -> BTreeMap<Vec<u8>, u32> {
    basis
        .all_degrees()
        .iter()
        .enumerate()
        .map(|(i, tuple)| (tuple.clone(), i as u32))
        .collect()
}

impl From<CmatrixRecord> for Cmatrix {
    fn from(record: CmatrixRecord) -> Self {
        let mut pairs: BTreeMap<(u32, u32), Vec<(u32, f64)>> = BTreeMap::new();
        for (a, b, k, value) in record.entries {
            pairs.entry((a, b)).or_default().push((k, value));
        }
        for bucket in pairs.values_mut() {
            bucket.sort_unstable_by_key(|&(k, _)| k);
        }
        let degree_index = build_degree_index(&record.basis);
        Self {
            basis: record.basis,
            pairs,
            degree_index,
        }
    }
}

impl From<Cmatrix> for CmatrixRecord {
    fn from(matrix: Cmatrix) -> Self {
        let mut entries = Vec::new();
        for (&(a, b), bucket) in &matrix.pairs {
            for &(k, value) in bucket {
                entries.push((a, b, k, value));
            }
        }
        Self {
            basis: matrix.basis,
            entries,
        }
    }
}

/// Explicit structure cache keyed by `(dim, order)`, optionally backed by a
/// preload directory where each structure is stored as `d{dim}o{order}.json`.
/// Never ambient: components receive the cache by reference.
#[derive(Debug, Default)]
pub struct CmatrixCache {
    dir: Option<PathBuf>,
    cached: Mutex<BTreeMap<(usize, u32), Arc<Cmatrix>>>,
}

impl CmatrixCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Fetch the structure for `(dim, order)`, preferring (in order) the
    /// in-memory cache, the preload directory, and fresh generation. The
    /// generated structure is persisted back to the directory when one is
    /// configured.
    pub fn get(&self, dim: usize, order: u32) -> Result<Arc<Cmatrix>, BasisError> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(matrix) = cached.get(&(dim, order)) {
            return Ok(Arc::clone(matrix));
        }

        let matrix = Arc::new(self.load_or_generate(dim, order)?);
        cached.insert((dim, order), Arc::clone(&matrix));
        Ok(matrix)
    }

    fn load_or_generate(&self, dim: usize, order: u32) -> Result<Cmatrix, BasisError> {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("d{dim}o{order}.json"));
            if path.is_file() {
                let matrix: Cmatrix = serde_json::from_reader(BufReader::new(File::open(&path)?))?;
                if matrix.dim() == dim && matrix.order() == order {
                    tracing::debug!(dim, order, path = %path.display(), "loaded C-matrix preload");
                    return Ok(matrix);
                }
                tracing::warn!(
                    path = %path.display(),
                    "preload does not match its file name, regenerating"
                );
            }
        }

        let matrix = Cmatrix::generate(dim, order)?;
        let stats = matrix.stats();
        tracing::info!(
            dim,
            order,
            basis_len = stats.basis_len,
            nonzero = stats.nonzero_entries,
            fill = stats.fill_ratio,
            "generated C-matrix"
        );

        if let Some(dir) = &self.dir {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("d{dim}o{order}.json"));
            serde_json::to_writer(BufWriter::new(File::create(&path)?), &matrix)?;
        }
        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_triple_is_one() {
        let cm = Cmatrix::generate(1, 2).unwrap();
        assert!((cm.value(0, 0, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_known_univariate_entries() {
        // P1·P1 = 1/3 + (2/3)·P2 on the Legendre basis.
        let cm = Cmatrix::generate(1, 2).unwrap();
        assert!((cm.value(1, 1, 0) - 1.0 / 3.0).abs() < 1e-12);
        assert!((cm.value(1, 1, 2) - 2.0 / 3.0).abs() < 1e-12);
        // Odd-degree triples vanish.
        assert_eq!(cm.value(1, 1, 1), 0.0);
        assert_eq!(cm.value(0, 1, 2), 0.0);
    }

    #[test]
    fn test_entries_cover_all_permutations() {
        let cm = Cmatrix::generate(2, 2).unwrap();
        // Pick any nonzero triple and check its transposed pair agrees.
        let mut checked = 0;
        for a in 0..cm.basis().len() {
            for b in 0..cm.basis().len() {
                for &(k, value) in cm.pairs(a, b) {
                    assert!(
                        (cm.value(b, a, k as usize) - value).abs() < 1e-12,
                        "entry ({a},{b},{k}) not mirrored"
                    );
                    checked += 1;
                }
            }
        }
        assert!(checked > 0);
    }

    #[test]
    fn test_parity_rules_out_cross_variable_odd_terms() {
        let cm = Cmatrix::generate(2, 2).unwrap();
        let basis = cm.basis();
        // The element with degrees (1, 1) times the constant cannot project
        // onto the element with degrees (1, 0).
        let find = |degrees: &[u8]| cm.index_of_degrees(degrees).unwrap();
        assert_eq!(cm.value(find(&[1, 1]), find(&[0, 0]), find(&[1, 0])), 0.0);
        assert_eq!(basis.degrees(find(&[1, 1])), &[1, 1]);
    }

    #[test]
    fn test_degree_index_matches_enumeration() {
        let cm = Cmatrix::generate(3, 2).unwrap();
        for (i, tuple) in cm.basis().all_degrees().iter().enumerate() {
            assert_eq!(cm.index_of_degrees(tuple), Some(i));
        }
        assert_eq!(cm.index_of_degrees(&[9, 9, 9]), None);
    }

    #[test]
    fn test_serde_roundtrip_preserves_entries() {
        let cm = Cmatrix::generate(2, 2).unwrap();
        let json = serde_json::to_string(&cm).unwrap();
        let back: Cmatrix = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stats(), cm.stats());
        for a in 0..cm.basis().len() {
            for b in 0..cm.basis().len() {
                assert_eq!(back.pairs(a, b), cm.pairs(a, b));
            }
        }
    }

    #[test]
    fn test_cache_returns_shared_structure() {
        let cache = CmatrixCache::new();
        let first = cache.get(2, 2).unwrap();
        let second = cache.get(2, 2).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_cache_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = CmatrixCache::with_dir(dir.path());
            cache.get(1, 3).unwrap();
        }
        assert!(dir.path().join("d1o3.json").is_file());

        // A fresh cache over the same directory loads instead of generating.
        let cache = CmatrixCache::with_dir(dir.path());
        let loaded = cache.get(1, 3).unwrap();
        let generated = Cmatrix::generate(1, 3).unwrap();
        assert_eq!(loaded.stats(), generated.stats());
    }

    #[test]
    fn test_unsupported_order_is_fatal() {
        assert!(matches!(
            Cmatrix::generate(1, 11),
            Err(BasisError::UnsupportedOrder(11))
        ));
    }

    #[test]
    fn test_zero_dim_matrix() {
        let cm = Cmatrix::generate(0, 2).unwrap();
        assert_eq!(cm.basis().len(), 1);
        assert!((cm.value(0, 0, 0) - 1.0).abs() < 1e-12);
    }
}
