//! Checkpointed solution store.
//!
//! One JSON record per `(path, subdomain, group)` unit plus one noise
//! bundle describing how to reinterpret them. The in-memory registry is
//! append-only; a record present when the engine starts is authoritative
//! and its unit is never recomputed (resumable batch semantics — there is
//! no mid-unit checkpointing).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use perseid_graph::{NodeId, NoiseId};
use perseid_pce::{BasisTerm, CoeffMap};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("checkpoint directory access failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed checkpoint record: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Identity of one unit of work.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SolutionKey {
    pub path: usize,
    pub subdomain: usize,
    pub group: usize,
}

impl std::fmt::Display for SolutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}s{}g{}", self.path, self.subdomain, self.group)
    }
}

/// The result of one unit: the subdomain's clean output expansions, the
/// expansions with this group's noise injected, and the subdomain weight.
/// Written once by the worker that computed it, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialSolution {
    pub clean_outputs: BTreeMap<NodeId, CoeffMap>,
    pub noised_outputs: BTreeMap<NodeId, CoeffMap>,
    pub weight: f64,
}

/// Snapshot of the noise-variable registry needed to reinterpret stored
/// solutions: the sources in canonical (word-length vector) order and the
/// expectances of every basis term the noised expansions use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseBundle {
    pub sources: Vec<NoiseId>,
    pub expectances: Vec<(BasisTerm, f64)>,
}

const BUNDLE_FILE: &str = "noise_bundle.json";

/// Partial-solution registry, optionally mirrored to a directory.
#[derive(Debug, Default)]
pub struct SolutionStore {
    dir: Option<PathBuf>,
    records: Mutex<BTreeMap<SolutionKey, PartialSolution>>,
    bundle: Mutex<Option<NoiseBundle>>,
}

impl SolutionStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a checkpoint directory, loading every record already in it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir: PathBuf = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut records = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(key) = parse_solution_name(&path) else {
                continue;
            };
            let solution: PartialSolution =
                serde_json::from_reader(BufReader::new(File::open(&path)?))?;
            records.insert(key, solution);
        }

        let bundle_path = dir.join(BUNDLE_FILE);
        let bundle = if bundle_path.is_file() {
            Some(serde_json::from_reader(BufReader::new(File::open(
                &bundle_path,
            )?))?)
        } else {
            None
        };

        if !records.is_empty() {
            tracing::info!(
                records = records.len(),
                dir = %dir.display(),
                "loaded persisted partial solutions"
            );
        }
        Ok(Self {
            dir: Some(dir),
            records: Mutex::new(records),
            bundle: Mutex::new(bundle),
        })
    }

    pub fn contains(&self, key: SolutionKey) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
    }

    pub fn get(&self, key: SolutionKey) -> Option<PartialSolution> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Persist a unit's result, file first, then the registry. Prior
    /// entries are authoritative and never overwritten.
    pub fn insert(&self, key: SolutionKey, solution: PartialSolution) -> Result<(), StoreError> {
        if self.contains(key) {
            return Ok(());
        }
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("solution_{}_{}_{}.json", key.path, key.subdomain, key.group));
            serde_json::to_writer(BufWriter::new(File::create(path)?), &solution)?;
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, solution);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<(SolutionKey, PartialSolution)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub fn set_bundle(&self, bundle: NoiseBundle) -> Result<(), StoreError> {
        if let Some(dir) = &self.dir {
            let path = dir.join(BUNDLE_FILE);
            serde_json::to_writer(BufWriter::new(File::create(path)?), &bundle)?;
        }
        *self.bundle.lock().unwrap_or_else(PoisonError::into_inner) = Some(bundle);
        Ok(())
    }

    pub fn bundle(&self) -> Option<NoiseBundle> {
        self.bundle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn parse_solution_name(path: &Path) -> Option<SolutionKey> {
    let name = path.file_name()?.to_str()?;
    let indices = name.strip_prefix("solution_")?.strip_suffix(".json")?;
    let mut parts = indices.split('_');
    let key = SolutionKey {
        path: parts.next()?.parse().ok()?,
        subdomain: parts.next()?.parse().ok()?,
        group: parts.next()?.parse().ok()?,
    };
    parts.next().is_none().then_some(key)
}
