//! Noise-group partitioning.
//!
//! Every extra noise variable in a PCE computation multiplies the basis
//! size, so sources are injected in bounded-size groups. Strongly nonlinear
//! operators are forced into singleton groups up front; the rest of the
//! candidate set is bisected recursively with a randomized
//! Fiduccia–Mattheyses min-cut heuristic until every group fits.
//!
//! Nets are hyperedges `{n} ∪ (succs(n) ∩ set)`, one per node, and the cut
//! size counts nets spanning both sides. A pass moves each node at most
//! once, highest gain first, subject to a balance tolerance, and commits
//! the best positive prefix of the move sequence.

use perseid_graph::{NodeId, SystemGraph};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Randomized restarts per bisection.
const TRIALS: usize = 256;

/// Gain bucket bound; gains are clamped into `[-MAX_GAIN, MAX_GAIN]` for
/// move ordering, and the same constant floors the balance tolerance.
const MAX_GAIN: i64 = 3;

/// Partition the candidate nodes into disjoint groups of at most
/// `max_size` members. Strongly nonlinear nodes come back as singletons
/// regardless of `max_size`.
pub fn partition_groups(
    graph: &SystemGraph,
    candidates: &[NodeId],
    max_size: usize,
    rng: &mut ChaCha8Rng,
) -> Vec<Vec<NodeId>> {
    let mut finals: Vec<Vec<NodeId>> = Vec::new();
    let mut rest: Vec<NodeId> = Vec::new();
    for &id in candidates {
        match graph.node(id) {
            Ok(node) if node.op.is_strongly_nonlinear() => finals.push(vec![id]),
            Ok(_) => rest.push(id),
            Err(_) => {}
        }
    }

    let mut pending = vec![rest];
    while let Some(set) = pending.pop() {
        if set.is_empty() {
            continue;
        }
        if set.len() <= max_size {
            finals.push(set);
            continue;
        }
        let (left, right) = bisect(graph, &set, rng);
        tracing::debug!(
            from = set.len(),
            left = left.len(),
            right = right.len(),
            "bisected noise candidate set"
        );
        pending.push(left);
        pending.push(right);
    }
    finals
}

/// Best bipartition over the randomized trials, by cut size.
fn bisect(graph: &SystemGraph, set: &[NodeId], rng: &mut ChaCha8Rng) -> (Vec<NodeId>, Vec<NodeId>) {
    let nets = build_nets(graph, set);
    let mut best: Option<(Vec<bool>, usize)> = None;
    for _ in 0..TRIALS {
        let (side, cut) = fm_trial(set, &nets, rng);
        if best.as_ref().map(|&(_, c)| cut < c).unwrap_or(true) {
            best = Some((side, cut));
        }
    }
    let (side, _) = best.unwrap_or_else(|| (vec![false; set.len()], 0));
    let left = set
        .iter()
        .zip(&side)
        .filter(|(_, &s)| !s)
        .map(|(&n, _)| n)
        .collect();
    let right = set
        .iter()
        .zip(&side)
        .filter(|(_, &s)| s)
        .map(|(&n, _)| n)
        .collect();
    (left, right)
}

struct Nets {
    /// Members of each net, as positions in the working set. Net `i` is the
    /// node `i` plus its in-set successors.
    members: Vec<Vec<usize>>,
    /// Nets touching each node.
    touching: Vec<Vec<usize>>,
}

fn build_nets(graph: &SystemGraph, set: &[NodeId]) -> Nets {
    let position = |id: NodeId| set.iter().position(|&n| n == id);
    let mut members = Vec::with_capacity(set.len());
    for &id in set {
        let mut net = vec![position(id).unwrap_or(0)];
        if let Ok(node) = graph.node(id) {
            for &s in &node.succs {
                if let Some(p) = position(s) {
                    net.push(p);
                }
            }
        }
        net.sort_unstable();
        net.dedup();
        members.push(net);
    }
    let mut touching = vec![Vec::new(); set.len()];
    for (net, nodes) in members.iter().enumerate() {
        for &n in nodes {
            touching[n].push(net);
        }
    }
    Nets { members, touching }
}

/// One randomized FM run: random balanced start, then gain passes until no
/// pass improves the cut.
fn fm_trial(set: &[NodeId], nets: &Nets, rng: &mut ChaCha8Rng) -> (Vec<bool>, usize) {
    let n = set.len();
    let mut side = initial_bipartition(n, rng);
    loop {
        let moves = evaluate_pass(nets, &side);
        if moves.is_empty() {
            return (side.clone(), cut_size(nets, &side));
        }
        for m in moves {
            side[m] = !side[m];
        }
    }
}

fn initial_bipartition(n: usize, rng: &mut ChaCha8Rng) -> Vec<bool> {
    let mut order: Vec<usize> = (0..n).collect();
    loop {
        let k = rng.gen_range(1..n);
        if !balanced(k, n - k) {
            continue;
        }
        order.shuffle(rng);
        let mut side = vec![false; n];
        for &i in order.iter().take(k) {
            side[i] = true;
        }
        return side;
    }
}

/// Sides are balanced when both are populated and their difference is
/// within `max(MAX_GAIN, 20% of the mean side size)`.
fn balanced(a: usize, b: usize) -> bool {
    if a == 0 || b == 0 {
        return false;
    }
    let tolerance = (MAX_GAIN as f64).max((a + b) as f64 / 2.0 * 0.2);
    (a as f64 - b as f64).abs() <= tolerance
}

/// Tentatively move every node once, best gain first, and return the prefix
/// with the highest positive cumulative gain. Empty when no prefix improves.
fn evaluate_pass(nets: &Nets, side: &[bool]) -> Vec<usize> {
    let n = side.len();
    let mut work = side.to_vec();
    let mut locked = vec![false; n];
    let mut sequence = Vec::new();
    let mut cumulative = Vec::new();
    let mut total = 0i64;

    loop {
        let mut counts = [0usize; 2];
        for &s in work.iter() {
            counts[s as usize] += 1;
        }

        // Highest clamped gain whose move keeps the sides balanced.
        let mut pick: Option<(i64, usize, i64)> = None;
        for node in 0..n {
            if locked[node] {
                continue;
            }
            let (from, to) = if work[node] { (1, 0) } else { (0, 1) };
            if !balanced(counts[from] - 1, counts[to] + 1) {
                continue;
            }
            let gain = node_gain(nets, &work, node);
            let bucket = gain.clamp(-MAX_GAIN, MAX_GAIN);
            if pick.as_ref().map(|&(b, _, _)| bucket > b).unwrap_or(true) {
                pick = Some((bucket, node, gain));
            }
        }
        let Some((_, node, gain)) = pick else { break };

        work[node] = !work[node];
        locked[node] = true;
        total += gain;
        sequence.push(node);
        cumulative.push(total);
    }

    let Some((best_at, &best)) = cumulative
        .iter()
        .enumerate()
        .max_by_key(|&(i, &g)| (g, std::cmp::Reverse(i)))
    else {
        return Vec::new();
    };
    if best <= 0 {
        return Vec::new();
    }
    sequence.truncate(best_at + 1);
    sequence
}

/// FM gain: +1 for each net the node is alone on its side of (the move
/// uncuts it), −1 for each net entirely on the node's side (the move cuts
/// it).
fn node_gain(nets: &Nets, side: &[bool], node: usize) -> i64 {
    let mut gain = 0;
    for &net in &nets.touching[node] {
        let own = side[node];
        let others_on_own = nets.members[net]
            .iter()
            .any(|&m| m != node && side[m] == own);
        let any_on_other = nets.members[net].iter().any(|&m| side[m] != own);
        if !others_on_own {
            gain += 1;
        }
        if !any_on_other {
            gain -= 1;
        }
    }
    gain
}

/// Number of nets with members on both sides.
fn cut_size(nets: &Nets, side: &[bool]) -> usize {
    nets.members
        .iter()
        .filter(|net| {
            net.iter().any(|&m| side[m]) && net.iter().any(|&m| !side[m])
        })
        .count()
}
