//! Adaptive multi-element domain decomposition (ME-gPC).
//!
//! A single global expansion cannot follow a signal through a data-dependent
//! branch, and loses accuracy where the response is strongly nonlinear. Both
//! problems are solved by splitting the probability domain: each subdomain
//! carries locally rescaled input distributions and a probability weight
//! `j_k`, and splitting always replaces a subdomain by two children with
//! halved weight, so the weights of the terminal set partition the parent's
//! mass exactly.
//!
//! Fork resolution samples the comparison operands; smoothness follows the
//! adaptivity criteria of Wan & Karniadakis (2005): a subdomain splits when
//! the energy fraction `eta` in the top-degree basis terms, damped by
//! `j_k`, exceeds `theta_1`, and only along variables whose anisotropy
//! ratio is within `theta_2` of the dominant one.

use std::collections::BTreeMap;

use perseid_graph::{GraphError, NodeId, SystemGraph};
use perseid_pce::{CoeffMap, Cmatrix, VarId, VarSet};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::linalg::{self, LinalgError};
use crate::propagate::{propagate, PropagateError};

/// Coefficients this small are dropped from a re-fitted local polynomial.
const REFIT_EPSILON: f64 = 1e-12;

/// Attempts at drawing a non-singular random design matrix.
const REFIT_ATTEMPTS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error(transparent)]
    Propagate(#[from] PropagateError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Linalg(#[from] LinalgError),

    #[error("no comparison subtree recorded for fork {0}")]
    MissingCmpTree(NodeId),

    #[error("fork comparison {0} carries no comparison code")]
    MissingCmpCode(NodeId),

    #[error("fork comparison {0} does not have two operands")]
    MalformedCmp(NodeId),

    #[error("operand {pred} of fork {fork} was not propagated")]
    MissingOperand { fork: NodeId, pred: NodeId },

    #[error("subdomain carries no distribution for variable {0}")]
    MissingDistribution(VarId),

    #[error("numeric evaluation hit a symbolic coefficient; fork resolution needs clean maps")]
    SymbolicCoefficient,
}

/// Smoothness and fork-forcing knobs.
#[derive(Debug, Clone)]
pub struct MegpcParams {
    /// Minimum subdomain weight before an ambiguous fork is decided by
    /// majority instead of splitting further.
    pub j_lim: f64,
    /// Split threshold on `eta^alpha · j_k`.
    pub theta_1: f64,
    /// Fraction of the dominant anisotropy ratio a variable must reach to
    /// be split.
    pub theta_2: f64,
    /// Exponent damping the energy fraction.
    pub alpha: f64,
}

/// One region of the probability domain: locally rescaled distributions,
/// the region bounds per variable, and the probability weight `j_k`.
#[derive(Debug, Clone)]
pub struct Subdomain {
    pub distributions: BTreeMap<VarId, CoeffMap>,
    pub bounds: BTreeMap<VarId, (f64, f64)>,
    pub weight: f64,
}

impl Subdomain {
    /// The full domain: every variable of the set on [-1, 1] with weight 1,
    /// distributions taken from `dists` (uniform when absent).
    pub fn initial(vars: &VarSet, dists: &BTreeMap<VarId, CoeffMap>) -> Self {
        let distributions = vars
            .vars()
            .iter()
            .map(|&v| {
                (
                    v,
                    dists.get(&v).cloned().unwrap_or_else(|| CoeffMap::uniform(v)),
                )
            })
            .collect();
        let bounds = vars.vars().iter().map(|&v| (v, (-1.0, 1.0))).collect();
        Self {
            distributions,
            bounds,
            weight: 1.0,
        }
    }
}

/// A terminal subdomain of the fork-resolution recursion, with the
/// direction every fork takes on it.
#[derive(Debug, Clone)]
pub struct ForkPartition {
    pub decisions: BTreeMap<NodeId, bool>,
    pub subdomain: Subdomain,
}

/// A smoothness-refined subdomain carrying its clean propagation.
#[derive(Debug, Clone)]
pub struct RefinedSubdomain {
    pub subdomain: Subdomain,
    pub propagation: BTreeMap<NodeId, CoeffMap>,
}

enum ForkOutcome {
    Decided(bool),
    Ambiguous { majority: bool },
}

/// Recursive domain splitter for one execution path's variable set. All
/// randomness comes from the seeded generator handed in, so partition
/// layouts are reproducible across runs.
pub struct DomainPartitioner<'a> {
    params: MegpcParams,
    vars: &'a VarSet,
    cmatrix: &'a Cmatrix,
    input_vars: &'a BTreeMap<NodeId, VarId>,
    rng: ChaCha8Rng,
}

impl<'a> DomainPartitioner<'a> {
    pub fn new(
        params: MegpcParams,
        vars: &'a VarSet,
        cmatrix: &'a Cmatrix,
        input_vars: &'a BTreeMap<NodeId, VarId>,
        rng: ChaCha8Rng,
    ) -> Self {
        Self {
            params,
            vars,
            cmatrix,
            input_vars,
            rng,
        }
    }

    /// Split the initial domain until every fork's direction is constant on
    /// every subdomain. Once a subdomain's weight reaches `j_lim`, ambiguous
    /// forks are decided by sample majority instead of recursing further.
    pub fn partition_forks(
        &mut self,
        forks: &[NodeId],
        cmp_trees: &BTreeMap<NodeId, SystemGraph>,
        initial: Subdomain,
    ) -> Result<Vec<ForkPartition>, PartitionError> {
        if forks.is_empty() {
            return Ok(vec![ForkPartition {
                decisions: BTreeMap::new(),
                subdomain: initial,
            }]);
        }

        let mut pending = vec![(vec![None::<bool>; forks.len()], initial)];
        let mut resolved = Vec::new();
        while let Some((mut decisions, sub)) = pending.pop() {
            let mut needs_split = false;
            for (i, fork) in forks.iter().enumerate() {
                if decisions[i].is_some() {
                    continue;
                }
                let tree = cmp_trees
                    .get(fork)
                    .ok_or(PartitionError::MissingCmpTree(*fork))?;
                match self.resolve_fork(*fork, tree, &sub)? {
                    ForkOutcome::Decided(d) => decisions[i] = Some(d),
                    ForkOutcome::Ambiguous { majority } => {
                        if sub.weight > self.params.j_lim {
                            needs_split = true;
                            break;
                        }
                        decisions[i] = Some(majority);
                    }
                }
            }

            if needs_split {
                for child in self.split_all(&sub)? {
                    pending.push((decisions.clone(), child));
                }
                tracing::debug!(pending = pending.len(), "split subdomain for fork ambiguity");
            } else {
                let map: BTreeMap<NodeId, bool> = forks
                    .iter()
                    .zip(&decisions)
                    .filter_map(|(f, d)| d.map(|v| (*f, v)))
                    .collect();
                debug_assert_eq!(map.len(), forks.len());
                resolved.push(ForkPartition {
                    decisions: map,
                    subdomain: sub,
                });
            }
        }
        Ok(resolved)
    }

    /// Refine a fully-decided subdomain until every propagated map is
    /// smooth enough, carrying the clean propagation along.
    pub fn refine(
        &mut self,
        graph: &SystemGraph,
        initial: Subdomain,
    ) -> Result<Vec<RefinedSubdomain>, PartitionError> {
        let propagation = propagate(
            graph,
            self.input_vars,
            &initial.distributions,
            self.vars,
            self.cmatrix,
        )?;
        let mut pending = vec![RefinedSubdomain {
            subdomain: initial,
            propagation,
        }];
        let mut done = Vec::new();

        while let Some(current) = pending.pop() {
            let split_vars = self.smoothness_split_vars(&current);
            if split_vars.is_empty() {
                done.push(current);
                continue;
            }
            tracing::debug!(vars = split_vars.len(), "splitting subdomain for smoothness");
            for child in self.split_on_vars(&current.subdomain, &split_vars)? {
                let propagation = propagate(
                    graph,
                    self.input_vars,
                    &child.distributions,
                    self.vars,
                    self.cmatrix,
                )?;
                pending.push(RefinedSubdomain {
                    subdomain: child,
                    propagation,
                });
            }
        }
        Ok(done)
    }

    /// Propagate the subdomain's distributions through the fork's
    /// comparison subtree and sample both operands, one point per basis
    /// element.
    fn resolve_fork(
        &mut self,
        fork: NodeId,
        tree: &SystemGraph,
        sub: &Subdomain,
    ) -> Result<ForkOutcome, PartitionError> {
        let maps = propagate(
            tree,
            self.input_vars,
            &sub.distributions,
            self.vars,
            self.cmatrix,
        )?;
        let node = tree.node(fork)?;
        let code = node.cmp.ok_or(PartitionError::MissingCmpCode(fork))?;
        if node.preds.len() != 2 {
            return Err(PartitionError::MalformedCmp(fork));
        }
        let lhs = maps.get(&node.preds[0]).ok_or(PartitionError::MissingOperand {
            fork,
            pred: node.preds[0],
        })?;
        let rhs = maps.get(&node.preds[1]).ok_or(PartitionError::MissingOperand {
            fork,
            pred: node.preds[1],
        })?;

        let samples = self.cmatrix.basis().len();
        let mut satisfied = 0usize;
        for _ in 0..samples {
            let point = self.sample_point();
            let l = lhs
                .eval_numeric(&point)
                .ok_or(PartitionError::SymbolicCoefficient)?;
            let r = rhs
                .eval_numeric(&point)
                .ok_or(PartitionError::SymbolicCoefficient)?;
            if code.eval(l, r) {
                satisfied += 1;
            }
        }

        Ok(if satisfied == samples {
            ForkOutcome::Decided(true)
        } else if satisfied == 0 {
            ForkOutcome::Decided(false)
        } else {
            ForkOutcome::Ambiguous {
                majority: satisfied * 2 >= samples,
            }
        })
    }

    fn sample_point(&mut self) -> BTreeMap<VarId, f64> {
        self.vars
            .vars()
            .iter()
            .map(|&v| (v, self.rng.gen_range(-1.0..1.0)))
            .collect()
    }

    fn split_all(&mut self, sub: &Subdomain) -> Result<Vec<Subdomain>, PartitionError> {
        let vars: Vec<VarId> = sub.distributions.keys().copied().collect();
        self.split_on_vars(sub, &vars)
    }

    /// Split along every listed variable in turn; `2^k` children, each with
    /// weight `j_k / 2^k`.
    fn split_on_vars(
        &mut self,
        sub: &Subdomain,
        vars: &[VarId],
    ) -> Result<Vec<Subdomain>, PartitionError> {
        let mut parts = vec![sub.clone()];
        for &var in vars {
            let mut next = Vec::with_capacity(parts.len() * 2);
            for part in &parts {
                let [low, high] = self.split_on(part, var)?;
                next.push(low);
                next.push(high);
            }
            parts = next;
        }
        Ok(parts)
    }

    /// Halve one variable's domain. Each child's local polynomial for the
    /// variable is re-fitted by evaluating the parent polynomial at the
    /// midpoint-rescaled coordinate over random design points and solving
    /// the square system against the basis (Wan & Karniadakis 2005).
    fn split_on(&mut self, sub: &Subdomain, var: VarId) -> Result<[Subdomain; 2], PartitionError> {
        let dist = sub
            .distributions
            .get(&var)
            .ok_or(PartitionError::MissingDistribution(var))?;
        let n = self.cmatrix.basis().len();

        let mut fitted: Option<[CoeffMap; 2]> = None;
        let mut last_error = LinalgError::Singular;
        for _ in 0..REFIT_ATTEMPTS {
            let points: Vec<BTreeMap<VarId, f64>> = (0..n).map(|_| self.sample_point()).collect();
            let design: Vec<Vec<f64>> = points
                .iter()
                .map(|p| {
                    let coords: Vec<f64> =
                        self.vars.vars().iter().map(|v| p[v]).collect();
                    (0..n)
                        .map(|k| self.cmatrix.basis().eval_element(k, &coords))
                        .collect()
                })
                .collect();

            match self.refit_halves(dist, var, &points, &design) {
                Ok(maps) => {
                    fitted = Some(maps);
                    break;
                }
                Err(PartitionError::Linalg(e)) => last_error = e,
                Err(other) => return Err(other),
            }
        }
        let [low_fit, high_fit] = fitted.ok_or(PartitionError::Linalg(last_error))?;

        let (lo, hi) = sub.bounds.get(&var).copied().unwrap_or((-1.0, 1.0));
        let mid = (lo + hi) / 2.0;
        let mut low = sub.clone();
        low.weight /= 2.0;
        low.bounds.insert(var, (lo, mid));
        low.distributions.insert(var, low_fit);
        let mut high = sub.clone();
        high.weight /= 2.0;
        high.bounds.insert(var, (mid, hi));
        high.distributions.insert(var, high_fit);
        Ok([low, high])
    }

    fn refit_halves(
        &self,
        dist: &CoeffMap,
        var: VarId,
        points: &[BTreeMap<VarId, f64>],
        design: &[Vec<f64>],
    ) -> Result<[CoeffMap; 2], PartitionError> {
        let mut halves = Vec::with_capacity(2);
        for &(lower, upper) in &[(-1.0, 0.0), (0.0, 1.0)] {
            let rhs: Vec<f64> = points
                .iter()
                .map(|p| {
                    let mut rescaled = p.clone();
                    let x = rescaled.get(&var).copied().unwrap_or(0.0);
                    rescaled.insert(var, x * (upper - lower) / 2.0 + (upper + lower) / 2.0);
                    dist.eval_numeric(&rescaled)
                        .ok_or(PartitionError::SymbolicCoefficient)
                })
                .collect::<Result<_, _>>()?;
            let coeffs = linalg::solve(design.to_vec(), rhs)?;
            let mut map = CoeffMap::new();
            for (k, &c) in coeffs.iter().enumerate() {
                if c.abs() >= REFIT_EPSILON {
                    map.insert(
                        self.vars.term_from_degrees(self.cmatrix.basis().degrees(k)),
                        perseid_pce::Coeff::constant(c),
                    );
                }
            }
            halves.push(map);
        }
        let high = halves.pop().ok_or(PartitionError::SymbolicCoefficient)?;
        let low = halves.pop().ok_or(PartitionError::SymbolicCoefficient)?;
        Ok([low, high])
    }

    /// Variables to split for smoothness, empty when every propagated map
    /// passes. The first failing map selects the variables.
    fn smoothness_split_vars(&self, refined: &RefinedSubdomain) -> Vec<VarId> {
        let vars: Vec<VarId> = refined.subdomain.distributions.keys().copied().collect();
        for map in refined.propagation.values() {
            if !self.needs_split(map, refined.subdomain.weight) {
                continue;
            }
            let ratios: Vec<f64> = vars.iter().map(|&v| self.anisotropy(map, v)).collect();
            let max = ratios.iter().cloned().fold(0.0f64, f64::max);
            return vars
                .iter()
                .zip(&ratios)
                .filter(|(_, &r)| r >= self.params.theta_2 * max)
                .map(|(&v, _)| v)
                .collect();
        }
        Vec::new()
    }

    /// First adaptivity criterion: the fraction of non-constant energy in
    /// top-degree terms, damped by alpha and weighted by `j_k`. A zero
    /// denominator means the signal is constant on the subdomain, which
    /// needs no split.
    fn needs_split(&self, map: &CoeffMap, weight: f64) -> bool {
        let order = self.cmatrix.order();
        let mut top = 0.0;
        let mut total = 0.0;
        for (term, coeff) in map.iter() {
            if term.is_constant() {
                continue;
            }
            let energy = coeff.constant_value().unwrap_or(0.0).powi(2) * term.expectance();
            total += energy;
            if term.total_degree() == order {
                top += energy;
            }
        }
        if total == 0.0 {
            return false;
        }
        let eta = top / total;
        eta.powf(self.params.alpha) * weight >= self.params.theta_1
    }

    /// Second adaptivity criterion: the energy of the variable's pure
    /// top-degree term relative to all top-degree energy.
    fn anisotropy(&self, map: &CoeffMap, var: VarId) -> f64 {
        let order = self.cmatrix.order();
        let mut own = 0.0;
        let mut top = 0.0;
        for (term, coeff) in map.iter() {
            if term.is_constant() || term.total_degree() != order {
                continue;
            }
            let energy = coeff.constant_value().unwrap_or(0.0).powi(2) * term.expectance();
            top += energy;
            if term.degree_of(var) as u32 == order {
                own = energy;
            }
        }
        if top == 0.0 {
            return 0.0;
        }
        own / top
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perseid_graph::{CmpKind, Node, OpKind};
    use perseid_pce::Cmatrix;
    use rand::SeedableRng;

    fn params(j_lim: f64, theta_1: f64) -> MegpcParams {
        MegpcParams {
            j_lim,
            theta_1,
            theta_2: 0.75,
            alpha: 1.0,
        }
    }

    /// One input `a`, comparison `a < threshold`.
    fn cmp_tree(threshold: f64, code: CmpKind) -> (SystemGraph, NodeId, NodeId) {
        let mut g = SystemGraph::new();
        let a = g.add_node(Node::input());
        let c = g.add_node(Node::constant(threshold));
        let cmp = g.add_node(Node::cmp(code, vec![a, c]));
        g.inputs = vec![a];
        (g, a, cmp)
    }

    fn setup(
        graph: &SystemGraph,
    ) -> (BTreeMap<NodeId, VarId>, BTreeMap<VarId, CoeffMap>, VarSet) {
        let input_vars: BTreeMap<NodeId, VarId> = graph
            .inputs
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, VarId::Input(i as u16)))
            .collect();
        let dists = input_vars
            .values()
            .map(|&v| (v, CoeffMap::uniform(v)))
            .collect();
        let vars = VarSet::new(input_vars.values().copied());
        (input_vars, dists, vars)
    }

    fn weights_sum(parts: &[ForkPartition]) -> f64 {
        parts.iter().map(|p| p.subdomain.weight).sum()
    }

    #[test]
    fn test_no_forks_single_partition() {
        let (tree, _, _) = cmp_tree(0.0, CmpKind::Lt);
        let (input_vars, dists, vars) = setup(&tree);
        let cm = Cmatrix::generate(1, 2).unwrap();
        let mut part = DomainPartitioner::new(
            params(0.1, 0.5),
            &vars,
            &cm,
            &input_vars,
            ChaCha8Rng::seed_from_u64(1),
        );
        let initial = Subdomain::initial(&vars, &dists);
        let parts = part
            .partition_forks(&[], &BTreeMap::new(), initial)
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].subdomain.weight, 1.0);
        assert!(parts[0].decisions.is_empty());
    }

    #[test]
    fn test_always_true_fork_never_splits() {
        // a < 5 holds on all of [-1, 1]: decided without any split.
        let (tree, _, cmp) = cmp_tree(5.0, CmpKind::Lt);
        let (input_vars, dists, vars) = setup(&tree);
        let cm = Cmatrix::generate(1, 2).unwrap();
        let mut part = DomainPartitioner::new(
            params(0.1, 0.5),
            &vars,
            &cm,
            &input_vars,
            ChaCha8Rng::seed_from_u64(1),
        );
        let trees = [(cmp, tree.clone())].into_iter().collect();
        let initial = Subdomain::initial(&vars, &dists);
        let parts = part.partition_forks(&[cmp], &trees, initial).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].subdomain.weight, 1.0);
        assert_eq!(parts[0].decisions[&cmp], true);
    }

    #[test]
    fn test_ambiguous_fork_splits_and_conserves_mass() {
        // a < 0 is ambiguous on the full domain; one split resolves it.
        let (tree, _, cmp) = cmp_tree(0.0, CmpKind::Lt);
        let (input_vars, dists, vars) = setup(&tree);
        let cm = Cmatrix::generate(1, 2).unwrap();
        let mut part = DomainPartitioner::new(
            params(0.1, 0.5),
            &vars,
            &cm,
            &input_vars,
            ChaCha8Rng::seed_from_u64(7),
        );
        let trees = [(cmp, tree.clone())].into_iter().collect();
        let initial = Subdomain::initial(&vars, &dists);
        let parts = part.partition_forks(&[cmp], &trees, initial).unwrap();

        assert!(parts.len() >= 2);
        assert!((weights_sum(&parts) - 1.0).abs() < 1e-12);
        let true_mass: f64 = parts
            .iter()
            .filter(|p| p.decisions[&cmp])
            .map(|p| p.subdomain.weight)
            .sum();
        assert!((true_mass - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_j_lim_forces_majority_without_split() {
        let (tree, _, cmp) = cmp_tree(0.0, CmpKind::Lt);
        let (input_vars, dists, vars) = setup(&tree);
        let cm = Cmatrix::generate(1, 2).unwrap();
        // j_lim = 1.0: the initial subdomain is already at the floor.
        let mut part = DomainPartitioner::new(
            params(1.0, 0.5),
            &vars,
            &cm,
            &input_vars,
            ChaCha8Rng::seed_from_u64(7),
        );
        let trees = [(cmp, tree.clone())].into_iter().collect();
        let initial = Subdomain::initial(&vars, &dists);
        let parts = part.partition_forks(&[cmp], &trees, initial).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].subdomain.weight, 1.0);
        assert!(parts[0].decisions.contains_key(&cmp));
    }

    #[test]
    fn test_split_rescales_local_distribution() {
        let (tree, _, _) = cmp_tree(0.0, CmpKind::Lt);
        let (input_vars, dists, vars) = setup(&tree);
        let cm = Cmatrix::generate(1, 2).unwrap();
        let mut part = DomainPartitioner::new(
            params(0.1, 0.5),
            &vars,
            &cm,
            &input_vars,
            ChaCha8Rng::seed_from_u64(3),
        );
        let initial = Subdomain::initial(&vars, &dists);
        let var = VarId::Input(0);
        let [low, high] = part.split_on(&initial, var).unwrap();

        assert_eq!(low.bounds[&var], (-1.0, 0.0));
        assert_eq!(high.bounds[&var], (0.0, 1.0));
        assert_eq!(low.weight, 0.5);

        // Left half of a uniform variable: ξ/2 − 1/2 at local ξ.
        let point: BTreeMap<VarId, f64> = [(var, 0.6)].into_iter().collect();
        let v = low.distributions[&var].eval_numeric(&point).unwrap();
        assert!((v - (0.6 / 2.0 - 0.5)).abs() < 1e-9, "got {v}");
        let v = high.distributions[&var].eval_numeric(&point).unwrap();
        assert!((v - (0.6 / 2.0 + 0.5)).abs() < 1e-9, "got {v}");
    }

    #[test]
    fn test_refine_leaves_linear_graph_alone() {
        let mut g = SystemGraph::new();
        let a = g.add_node(Node::input());
        let b = g.add_node(Node::input());
        let sum = g.add_node(Node::op(OpKind::Add, vec![a, b]));
        let out = g.add_node(Node::output(sum));
        g.inputs = vec![a, b];
        g.outputs = vec![out];

        let (input_vars, dists, vars) = setup(&g);
        let cm = Cmatrix::generate(2, 2).unwrap();
        let mut part = DomainPartitioner::new(
            params(0.1, 0.5),
            &vars,
            &cm,
            &input_vars,
            ChaCha8Rng::seed_from_u64(11),
        );
        let refined = part
            .refine(&g, Subdomain::initial(&vars, &dists))
            .unwrap();
        assert_eq!(refined.len(), 1);
        assert_eq!(refined[0].subdomain.weight, 1.0);
    }

    #[test]
    fn test_refine_splits_square_until_smooth() {
        // a·a concentrates all non-constant energy at the top degree, so the
        // initial domain must split; the halves are smooth enough to stop.
        let mut g = SystemGraph::new();
        let a = g.add_node(Node::input());
        let sq = g.add_node(Node::op(OpKind::Mul, vec![a, a]));
        let out = g.add_node(Node::output(sq));
        g.inputs = vec![a];
        g.outputs = vec![out];

        let (input_vars, dists, vars) = setup(&g);
        let cm = Cmatrix::generate(1, 2).unwrap();
        let mut part = DomainPartitioner::new(
            params(0.05, 0.3),
            &vars,
            &cm,
            &input_vars,
            ChaCha8Rng::seed_from_u64(13),
        );
        let refined = part
            .refine(&g, Subdomain::initial(&vars, &dists))
            .unwrap();

        assert_eq!(refined.len(), 2);
        let total: f64 = refined.iter().map(|r| r.subdomain.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
        // Refined propagations stay consistent with the split distributions.
        for r in &refined {
            assert!(r.propagation.contains_key(&out));
        }
    }
}
