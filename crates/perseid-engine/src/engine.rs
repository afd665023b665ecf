//! The propagation engine.
//!
//! `compute()` runs the whole pipeline: execution-path extraction, fork
//! partitioning (memoized per fork set), ME-gPC smoothness refinement,
//! noise grouping, and one propagation unit per
//! `(path, subdomain, group)` triple. The partitioning phases run
//! single-threaded because each split depends on previously propagated
//! coefficients; the units are independent and fan out over a bounded
//! worker pool. Units already present in the solution store are skipped,
//! so a second run over the same checkpoint directory does no propagation
//! work.
//!
//! Noised outputs combine across groups as
//! `noised = clean + Σ_g (noised_g − clean)`, which adds each group's
//! deviation exactly once even though the groups' expansions span
//! different basis dimensions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel;
use perseid_graph::{
    extract_paths, GraphError, NodeId, NoiseId, PathError, SystemGraph,
};
use perseid_model::{
    amplitude_distribution, eligible_nodes, partition_groups, propagate, quantizer_amplitude,
    splice_noise, DomainPartitioner, ForkPartition, MegpcParams, NoiseRegistry, PartitionError,
    PropagateError, RefinedSubdomain, Subdomain,
};
use perseid_pce::{
    algebra, BasisError, BasisTerm, CmatrixCache, Coeff, CoeffMap, VarId, VarSet,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{ConfigError, EngineConfig};
use crate::store::{NoiseBundle, PartialSolution, SolutionKey, SolutionStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Basis(#[from] BasisError),

    #[error(transparent)]
    Propagate(#[from] PropagateError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker pool construction failed: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("model queried before compute() completed")]
    NotComputed,

    #[error("node {0} is not an output of the analyzed graph")]
    UnknownOutput(NodeId),

    #[error("word-length vector has {got} entries, the model has {expected} noise sources")]
    WordLengthVector { expected: usize, got: usize },

    #[error("stored solution lacks output {0}; the checkpoint does not match this graph")]
    MissingOutput(NodeId),

    #[error("noise source {0} is absent from the computed source set")]
    UnknownNoiseSource(NoiseId),
}

/// Work accounting for one `compute()` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub paths: usize,
    pub subdomains: usize,
    pub units_run: usize,
    pub units_skipped: usize,
}

/// Per-output aggregates across all partial solutions.
#[derive(Debug, Clone, Default)]
struct OutputAccum {
    clean_mean: f64,
    clean_second_moment: f64,
    /// Weighted mean of the noised−clean deviation, amplitudes symbolic.
    noise_mean: Coeff,
    /// Per-subdomain deviation expansions with their weights, retained for
    /// on-demand noise-variance queries.
    deviations: Vec<(f64, CoeffMap)>,
}

struct Computed {
    outputs: BTreeMap<NodeId, OutputAccum>,
    sources: Vec<NoiseId>,
    path_weights: Vec<f64>,
    stats: RunStats,
}

/// One independent propagation unit.
struct Unit {
    key: SolutionKey,
    graph: Arc<SystemGraph>,
    vars: VarSet,
    refined: Arc<RefinedSubdomain>,
    group: Arc<Vec<NodeId>>,
}

/// Quantization-noise model of one dataflow graph.
pub struct Engine {
    config: EngineConfig,
    graph: SystemGraph,
    input_dists: BTreeMap<VarId, CoeffMap>,
    cache: CmatrixCache,
    registry: NoiseRegistry,
    computed: Option<Computed>,
}

impl Engine {
    pub fn new(graph: SystemGraph, config: EngineConfig) -> Self {
        let input_dists = graph
            .inputs
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let var = VarId::Input(i as u16);
                (var, CoeffMap::uniform(var))
            })
            .collect();
        let cache = match &config.checkpoint_dir {
            Some(dir) => CmatrixCache::with_dir(dir.join("cmatrix")),
            None => CmatrixCache::new(),
        };
        Self {
            config,
            graph,
            input_dists,
            cache,
            registry: NoiseRegistry::new(),
            computed: None,
        }
    }

    /// Override the distribution of one input (by position in the graph's
    /// input list). Inputs default to uniform on [-1, 1].
    pub fn set_input_distribution(&mut self, input: usize, dist: CoeffMap) {
        self.input_dists.insert(VarId::Input(input as u16), dist);
    }

    /// Run the full model. Idempotent: a second call returns immediately.
    pub fn compute(&mut self) -> Result<(), EngineError> {
        if self.computed.is_some() {
            return Ok(());
        }
        self.config.validate()?;
        self.graph.validate()?;

        let store = match &self.config.checkpoint_dir {
            Some(dir) => SolutionStore::open(dir)?,
            None => SolutionStore::in_memory(),
        };

        let input_vars: BTreeMap<NodeId, VarId> = self
            .graph
            .inputs
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, VarId::Input(i as u16)))
            .collect();

        let paths = extract_paths(&self.graph)?;
        tracing::info!(paths = paths.len(), "execution paths extracted");

        let params = MegpcParams {
            j_lim: self.config.j_lim,
            theta_1: self.config.theta_1,
            theta_2: self.config.theta_2,
            alpha: self.config.alpha,
        };

        // Partitioning runs single-threaded: splitting decisions depend on
        // previously propagated coefficients. Fork recursions are shared
        // between paths with the same fork set.
        let mut stats = RunStats {
            paths: paths.len(),
            ..RunStats::default()
        };
        let mut path_weights = Vec::with_capacity(paths.len());
        let mut units: Vec<Unit> = Vec::new();
        let mut fork_memo: BTreeMap<Vec<NodeId>, Vec<ForkPartition>> = BTreeMap::new();

        for (path_index, path) in paths.iter().enumerate() {
            // An input feeding only a fork's comparison is dead code in the
            // path graph but still steers the fork, so the comparison
            // subtrees contribute variables too.
            let mut used: BTreeSet<NodeId> = path.graph.inputs.iter().copied().collect();
            for tree in path.cmp_trees.values() {
                used.extend(tree.inputs.iter().copied());
            }
            let path_vars =
                VarSet::new(used.iter().filter_map(|id| input_vars.get(id).copied()));
            let cmatrix = self.cache.get(path_vars.dim(), self.config.order)?;
            let mut partitioner = DomainPartitioner::new(
                params.clone(),
                &path_vars,
                &cmatrix,
                &input_vars,
                ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(path_index as u64)),
            );

            let forks = path.forks();
            if !fork_memo.contains_key(&forks) {
                let initial = Subdomain::initial(&path_vars, &self.input_dists);
                let partitions =
                    partitioner.partition_forks(&forks, &path.cmp_trees, initial)?;
                fork_memo.insert(forks.clone(), partitions);
            }
            let selected: Vec<Subdomain> = fork_memo
                .get(&forks)
                .into_iter()
                .flatten()
                .filter(|p| p.decisions == path.decisions)
                .map(|p| p.subdomain.clone())
                .collect();

            let mut refined: Vec<RefinedSubdomain> = Vec::new();
            for subdomain in selected {
                refined.extend(partitioner.refine(&path.graph, subdomain)?);
            }
            path_weights.push(refined.iter().map(|r| r.subdomain.weight).sum());
            stats.subdomains += refined.len();

            let mut group_rng = ChaCha8Rng::seed_from_u64(
                self.config
                    .seed
                    .wrapping_add(0x9e37_79b9_7f4a_7c15)
                    .wrapping_add(path_index as u64),
            );
            let eligible = eligible_nodes(&path.graph);
            let mut groups =
                partition_groups(&path.graph, &eligible, self.config.max_group_size, &mut group_rng);
            if groups.is_empty() {
                // Nothing to quantize; one empty group still carries the
                // subdomain's clean result through the store.
                groups.push(Vec::new());
            }
            // Sources are fixed by the work list, so resumed runs that skip
            // every unit still report the full canonical set.
            for group in &groups {
                for &node in group {
                    self.registry.register(NoiseId(node.0));
                }
            }
            tracing::debug!(
                path = path_index,
                subdomains = refined.len(),
                groups = groups.len(),
                "planned propagation units"
            );

            let shared_graph = Arc::new(path.graph.clone());
            let shared_groups: Vec<Arc<Vec<NodeId>>> =
                groups.into_iter().map(Arc::new).collect();
            for (subdomain_index, one) in refined.into_iter().enumerate() {
                let shared = Arc::new(one);
                for (group_index, group) in shared_groups.iter().enumerate() {
                    let key = SolutionKey {
                        path: path_index,
                        subdomain: subdomain_index,
                        group: group_index,
                    };
                    if store.contains(key) {
                        stats.units_skipped += 1;
                        continue;
                    }
                    units.push(Unit {
                        key,
                        graph: Arc::clone(&shared_graph),
                        vars: path_vars.clone(),
                        refined: Arc::clone(&shared),
                        group: Arc::clone(group),
                    });
                }
            }
        }

        stats.units_run = units.len();
        tracing::info!(
            units = units.len(),
            skipped = stats.units_skipped,
            "propagation work list built"
        );

        self.run_units(&units, &store)?;

        let sources = self.registry.sources();
        store.set_bundle(noise_bundle(&store, &sources))?;

        let outputs = self.aggregate(&store)?;
        self.computed = Some(Computed {
            outputs,
            sources,
            path_weights,
            stats,
        });
        Ok(())
    }

    /// Fan the fixed work list out over the bounded pool. Workers persist
    /// their own results; completions drain through a channel, and a failed
    /// unit leaves its key absent and aborts the run once the pool settles.
    fn run_units(&self, units: &[Unit], store: &SolutionStore) -> Result<(), EngineError> {
        if units.is_empty() {
            return Ok(());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()?;
        let in_flight = AtomicUsize::new(0);
        let (tx, rx) = channel::unbounded::<(SolutionKey, Result<(), EngineError>)>();

        let order = self.config.order;
        let cache = &self.cache;
        let registry = &self.registry;
        let in_flight_ref = &in_flight;
        let input_vars: BTreeMap<NodeId, VarId> = self
            .graph
            .inputs
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, VarId::Input(i as u16)))
            .collect();
        let input_vars_ref = &input_vars;

        pool.scope(|scope| {
            for unit in units {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    in_flight_ref.fetch_add(1, Ordering::Relaxed);
                    let result = run_unit(unit, order, cache, registry, input_vars_ref, store);
                    let remaining = in_flight_ref.fetch_sub(1, Ordering::Relaxed) - 1;
                    tracing::debug!(key = %unit.key, in_flight = remaining, "unit finished");
                    let _ = tx.send((unit.key, result));
                });
            }
        });
        drop(tx);

        for (key, result) in rx.try_iter() {
            if let Err(error) = result {
                tracing::warn!(key = %key, %error, "propagation unit failed");
                return Err(error);
            }
        }
        Ok(())
    }

    /// Order-independent summation over all partial solutions: weighted
    /// clean mean and second moment, weighted noised-deviation mean, and
    /// the retained deviation expansions.
    fn aggregate(
        &self,
        store: &SolutionStore,
    ) -> Result<BTreeMap<NodeId, OutputAccum>, EngineError> {
        let mut by_subdomain: BTreeMap<(usize, usize), Vec<PartialSolution>> = BTreeMap::new();
        for (key, solution) in store.records() {
            by_subdomain
                .entry((key.path, key.subdomain))
                .or_default()
                .push(solution);
        }

        let mut outputs: BTreeMap<NodeId, OutputAccum> = self
            .graph
            .outputs
            .iter()
            .map(|&o| (o, OutputAccum::default()))
            .collect();

        for solutions in by_subdomain.values() {
            let Some(first) = solutions.first() else {
                continue;
            };
            let weight = first.weight;
            for (&output, accum) in outputs.iter_mut() {
                // An output can be dead on some paths; those contribute no
                // mass to it.
                let Some(clean) = first.clean_outputs.get(&output) else {
                    continue;
                };
                let mut deviation = CoeffMap::new();
                for solution in solutions {
                    let noised = solution
                        .noised_outputs
                        .get(&output)
                        .ok_or(EngineError::MissingOutput(output))?;
                    deviation = algebra::add(&deviation, &algebra::sub(noised, clean));
                }

                accum.clean_mean += weight * numeric(clean.mean());
                accum.clean_second_moment += weight * second_moment_numeric(clean);
                accum.noise_mean = accum.noise_mean.add(&deviation.mean().scale(weight));
                accum.deviations.push((weight, deviation));
            }
        }
        Ok(outputs)
    }

    /// Mean of an output's clean signal.
    pub fn signal_mean(&self, output: NodeId) -> Result<f64, EngineError> {
        Ok(self.accum(output)?.clean_mean)
    }

    /// Variance of an output's clean signal: the weighted second moment
    /// minus the squared aggregated mean.
    pub fn signal_variance(&self, output: NodeId) -> Result<f64, EngineError> {
        let accum = self.accum(output)?;
        Ok(accum.clean_second_moment - accum.clean_mean * accum.clean_mean)
    }

    /// Mean of the quantization deviation (noised − clean) for a concrete
    /// word-length vector. Signed: the bias direction is preserved.
    pub fn noise_mean(&self, word_lengths: &[u32], output: NodeId) -> Result<f64, EngineError> {
        let amplitudes = self.amplitudes(word_lengths)?;
        let accum = self.accum(output)?;
        eval_coeff(&accum.noise_mean, &amplitudes)
    }

    /// Variance of the quantization deviation for a concrete word-length
    /// vector.
    pub fn noise_variance(&self, word_lengths: &[u32], output: NodeId) -> Result<f64, EngineError> {
        let amplitudes = self.amplitudes(word_lengths)?;
        let accum = self.accum(output)?;
        let mean = eval_coeff(&accum.noise_mean, &amplitudes)?;
        let mut second = 0.0;
        for (weight, deviation) in &accum.deviations {
            for (term, coeff) in deviation.iter() {
                let value = eval_coeff(coeff, &amplitudes)?;
                second += weight * value * value * term.expectance();
            }
        }
        Ok(second - mean * mean)
    }

    /// The noise sources in canonical order: ascending id, one word-length
    /// vector entry each.
    pub fn noise_sources(&self) -> Result<&[NoiseId], EngineError> {
        Ok(&self.computed()?.sources)
    }

    /// Total probability mass of each execution path's terminal subdomains.
    pub fn path_weights(&self) -> Result<&[f64], EngineError> {
        Ok(&self.computed()?.path_weights)
    }

    pub fn run_stats(&self) -> Result<RunStats, EngineError> {
        Ok(self.computed()?.stats)
    }

    fn computed(&self) -> Result<&Computed, EngineError> {
        self.computed.as_ref().ok_or(EngineError::NotComputed)
    }

    fn accum(&self, output: NodeId) -> Result<&OutputAccum, EngineError> {
        self.computed()?
            .outputs
            .get(&output)
            .ok_or(EngineError::UnknownOutput(output))
    }

    fn amplitudes(&self, word_lengths: &[u32]) -> Result<BTreeMap<NoiseId, f64>, EngineError> {
        let sources = &self.computed()?.sources;
        if word_lengths.len() != sources.len() {
            return Err(EngineError::WordLengthVector {
                expected: sources.len(),
                got: word_lengths.len(),
            });
        }
        Ok(sources
            .iter()
            .zip(word_lengths)
            .map(|(&id, &wl)| (id, quantizer_amplitude(wl)))
            .collect())
    }
}

/// One propagation unit: splice the group's noise into a working copy of
/// the path graph, propagate under the widened variable set, and persist
/// the partial solution before reporting completion.
fn run_unit(
    unit: &Unit,
    order: u32,
    cache: &CmatrixCache,
    registry: &NoiseRegistry,
    input_vars: &BTreeMap<NodeId, VarId>,
    store: &SolutionStore,
) -> Result<(), EngineError> {
    let mut graph = (*unit.graph).clone();
    let sources = splice_noise(&mut graph, &unit.group, registry)?;

    let mut all_vars: Vec<VarId> = unit.vars.vars().to_vec();
    all_vars.extend(sources.iter().map(|&s| VarId::Noise(s)));
    let noised_vars = VarSet::new(all_vars);
    let cmatrix = cache.get(noised_vars.dim(), order)?;

    let mut dists = unit.refined.subdomain.distributions.clone();
    for &source in &sources {
        dists.insert(VarId::Noise(source), amplitude_distribution(source));
    }

    let propagation = propagate(&graph, input_vars, &dists, &noised_vars, &cmatrix)?;

    let mut clean_outputs = BTreeMap::new();
    let mut noised_outputs = BTreeMap::new();
    for &output in &graph.outputs {
        let clean = unit
            .refined
            .propagation
            .get(&output)
            .cloned()
            .ok_or(EngineError::MissingOutput(output))?;
        let noised = propagation
            .get(&output)
            .cloned()
            .ok_or(EngineError::MissingOutput(output))?;
        clean_outputs.insert(output, clean);
        noised_outputs.insert(output, noised);
    }

    store.insert(
        unit.key,
        PartialSolution {
            clean_outputs,
            noised_outputs,
            weight: unit.refined.subdomain.weight,
        },
    )?;
    Ok(())
}

/// The registry snapshot persisted next to the solutions: sources in
/// canonical order plus the expectance of every basis term the noised
/// expansions reference.
fn noise_bundle(store: &SolutionStore, sources: &[NoiseId]) -> NoiseBundle {
    let mut terms: BTreeMap<BasisTerm, f64> = BTreeMap::new();
    for (_, solution) in store.records() {
        for map in solution.noised_outputs.values() {
            for (term, _) in map.iter() {
                terms
                    .entry(term.clone())
                    .or_insert_with(|| term.expectance());
            }
        }
    }
    NoiseBundle {
        sources: sources.to_vec(),
        expectances: terms.into_iter().collect(),
    }
}

fn numeric(coeff: Coeff) -> f64 {
    coeff.constant_value().unwrap_or(0.0)
}

/// Weighted sum of squared coefficients times base self-expectations —
/// the second moment of a numeric expansion.
fn second_moment_numeric(map: &CoeffMap) -> f64 {
    map.iter()
        .map(|(term, coeff)| {
            let c = coeff.constant_value().unwrap_or(0.0);
            c * c * term.expectance()
        })
        .sum()
}

fn eval_coeff(coeff: &Coeff, amplitudes: &BTreeMap<NoiseId, f64>) -> Result<f64, EngineError> {
    coeff
        .eval(amplitudes)
        .map_err(EngineError::UnknownNoiseSource)
}
