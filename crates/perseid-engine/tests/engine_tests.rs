//! End-to-end model scenarios.

use perseid_engine::{Engine, EngineConfig, EngineError};
use perseid_graph::{BasicBlock, BlockId, CmpKind, Node, NodeId, NoiseId, OpKind, SystemGraph};
use perseid_model::quantizer_amplitude;
use perseid_pce::{BasisTerm, Coeff, CoeffMap, VarId};

fn config() -> EngineConfig {
    EngineConfig {
        order: 2,
        max_group_size: 4,
        j_lim: 0.1,
        theta_1: 0.5,
        theta_2: 0.75,
        alpha: 1.0,
        workers: 2,
        seed: 42,
        checkpoint_dir: None,
    }
}

/// `out = a + b` over two uniform inputs.
fn add_graph() -> (SystemGraph, NodeId) {
    let mut g = SystemGraph::new();
    let a = g.add_node(Node::input());
    let b = g.add_node(Node::input());
    let sum = g.add_node(Node::op(OpKind::Add, vec![a, b]));
    let out = g.add_node(Node::output(sum));
    g.inputs = vec![a, b];
    g.outputs = vec![out];
    (g, out)
}

/// A uniform variable shifted by `offset`: `{1: offset, ψ: 1}`.
fn shifted_uniform(var: VarId, offset: f64) -> CoeffMap {
    let mut map = CoeffMap::constant(offset);
    map.insert(BasisTerm::from_pairs([(var, 1)]), Coeff::constant(1.0));
    map
}

#[test]
fn test_add_scenario_means_and_variances() {
    let (graph, out) = add_graph();
    let mut engine = Engine::new(graph, config());
    engine.set_input_distribution(0, shifted_uniform(VarId::Input(0), 1.0));
    engine.set_input_distribution(1, shifted_uniform(VarId::Input(1), 2.0));
    engine.compute().unwrap();

    // Mean of the sum is the sum of the means; same for the variances
    // (uniform on [-1, 1] has variance 1/3).
    assert!((engine.signal_mean(out).unwrap() - 3.0).abs() < 1e-9);
    assert!((engine.signal_variance(out).unwrap() - 2.0 / 3.0).abs() < 1e-9);

    let stats = engine.run_stats().unwrap();
    assert_eq!(stats.paths, 1);
    assert_eq!(stats.subdomains, 1);
    assert_eq!(engine.path_weights().unwrap(), &[1.0]);
}

#[test]
fn test_queries_fail_before_compute() {
    let (graph, out) = add_graph();
    let engine = Engine::new(graph, config());
    assert!(matches!(
        engine.signal_mean(out),
        Err(EngineError::NotComputed)
    ));
    assert!(matches!(
        engine.noise_variance(&[8, 8, 8], out),
        Err(EngineError::NotComputed)
    ));
}

#[test]
fn test_unknown_output_rejected() {
    let (graph, _) = add_graph();
    let mut engine = Engine::new(graph, config());
    engine.compute().unwrap();
    assert!(matches!(
        engine.signal_mean(NodeId(999)),
        Err(EngineError::UnknownOutput(NodeId(999)))
    ));
}

#[test]
fn test_word_length_vector_length_checked() {
    let (graph, out) = add_graph();
    let mut engine = Engine::new(graph, config());
    engine.compute().unwrap();
    // Three eligible nodes (a, b, add) means three noise sources.
    assert_eq!(engine.noise_sources().unwrap().len(), 3);
    assert!(matches!(
        engine.noise_mean(&[8], out),
        Err(EngineError::WordLengthVector {
            expected: 3,
            got: 1
        })
    ));
}

#[test]
fn test_single_source_noise_moments() {
    // out = a with one quantizer on the input: the deviation is exactly the
    // injected noise, uniform with amplitude 2^(-wl)/2.
    let mut g = SystemGraph::new();
    let a = g.add_node(Node::input());
    let out = g.add_node(Node::output(a));
    g.inputs = vec![a];
    g.outputs = vec![out];

    let mut engine = Engine::new(g, config());
    engine.compute().unwrap();

    assert_eq!(engine.noise_sources().unwrap(), &[NoiseId(0)]);
    let mean = engine.noise_mean(&[4], out).unwrap();
    assert!(mean.abs() < 1e-12, "uniform noise is unbiased, got {mean}");
    let variance = engine.noise_variance(&[4], out).unwrap();
    let amplitude = quantizer_amplitude(4);
    assert!((variance - amplitude * amplitude / 3.0).abs() < 1e-15);
}

#[test]
fn test_group_splitting_matches_joint_on_linear_graph() {
    // Design assumption behind the cross-group combination rule: on a
    // purely linear graph, injecting the sources one group at a time must
    // reproduce the joint single-group result exactly.
    let wlv = [6, 7, 8];

    let (graph, out) = add_graph();
    let mut joint = Engine::new(graph, config());
    joint.compute().unwrap();

    let (graph, _) = add_graph();
    let mut split = Engine::new(
        graph,
        EngineConfig {
            max_group_size: 1,
            ..config()
        },
    );
    split.compute().unwrap();

    assert_eq!(joint.noise_sources().unwrap(), split.noise_sources().unwrap());
    let jm = joint.noise_mean(&wlv, out).unwrap();
    let sm = split.noise_mean(&wlv, out).unwrap();
    assert!((jm - sm).abs() < 1e-12, "means diverge: {jm} vs {sm}");
    let jv = joint.noise_variance(&wlv, out).unwrap();
    let sv = split.noise_variance(&wlv, out).unwrap();
    assert!((jv - sv).abs() < 1e-12, "variances diverge: {jv} vs {sv}");
}

/// `a < 0` decides between `a + a` and `a · a`.
fn branchy_graph() -> (SystemGraph, NodeId) {
    let mut g = SystemGraph::new();
    let a = g.add_node(Node::input());
    let zero = g.add_node(Node::constant(0.0));
    let cmp = g.add_node(Node::cmp(CmpKind::Lt, vec![a, zero]));
    let br = g.add_node(Node::branch(cmp));
    let doubled = g.add_node(Node::op(OpKind::Add, vec![a, a]));
    let squared = g.add_node(Node::op(OpKind::Mul, vec![a, a]));
    let phi = g.add_node(Node::phi(vec![(BlockId(1), doubled), (BlockId(2), squared)]));
    let out = g.add_node(Node::output(phi));

    g.add_block(BasicBlock {
        nodes: vec![a, zero, cmp, br],
        preds: vec![],
        succs: vec![BlockId(1), BlockId(2)],
    });
    g.add_block(BasicBlock {
        nodes: vec![doubled],
        preds: vec![BlockId(0)],
        succs: vec![BlockId(3)],
    });
    g.add_block(BasicBlock {
        nodes: vec![squared],
        preds: vec![BlockId(0)],
        succs: vec![BlockId(3)],
    });
    g.add_block(BasicBlock {
        nodes: vec![phi, out],
        preds: vec![BlockId(1), BlockId(2)],
        succs: vec![],
    });
    g.inputs = vec![a];
    g.outputs = vec![out];
    (g, out)
}

#[test]
fn test_branch_scenario_weights_and_moments() {
    let (graph, out) = branchy_graph();
    let mut engine = Engine::new(graph, config());
    engine.compute().unwrap();

    let stats = engine.run_stats().unwrap();
    assert_eq!(stats.paths, 2);
    // The fork splits the domain in half; each path owns one half.
    let weights = engine.path_weights().unwrap();
    assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    for &w in weights {
        assert!((w - 0.5).abs() < 1e-12);
    }

    // E[out] = ∫₋₁⁰ 2x·½ dx + ∫₀¹ x²·½ dx = −½ + 1/6 = −1/3.
    assert!((engine.signal_mean(out).unwrap() - (-1.0 / 3.0)).abs() < 1e-9);
    // E[out²] = 2/3 + 1/10 = 23/30; Var = 23/30 − 1/9.
    let expected = 23.0 / 30.0 - 1.0 / 9.0;
    assert!((engine.signal_variance(out).unwrap() - expected).abs() < 1e-9);

    // Quantization moments stay finite and the variance is nonnegative.
    let n = engine.noise_sources().unwrap().len();
    let wlv = vec![10; n];
    let variance = engine.noise_variance(&wlv, out).unwrap();
    assert!(variance >= -1e-15, "got {variance}");
}

#[test]
fn test_fork_on_selector_only_input() {
    // `s` drives only the comparison; the data path uses `a`. The selector
    // is dead code inside each path graph but still steers the fork, so its
    // distribution must stay in play for fork resolution.
    let mut g = SystemGraph::new();
    let a = g.add_node(Node::input());
    let s = g.add_node(Node::input());
    let zero = g.add_node(Node::constant(0.0));
    let cmp = g.add_node(Node::cmp(CmpKind::Lt, vec![s, zero]));
    let br = g.add_node(Node::branch(cmp));
    let doubled = g.add_node(Node::op(OpKind::Add, vec![a, a]));
    let squared = g.add_node(Node::op(OpKind::Mul, vec![a, a]));
    let phi = g.add_node(Node::phi(vec![(BlockId(1), doubled), (BlockId(2), squared)]));
    let out = g.add_node(Node::output(phi));

    g.add_block(BasicBlock {
        nodes: vec![a, s, zero, cmp, br],
        preds: vec![],
        succs: vec![BlockId(1), BlockId(2)],
    });
    g.add_block(BasicBlock {
        nodes: vec![doubled],
        preds: vec![BlockId(0)],
        succs: vec![BlockId(3)],
    });
    g.add_block(BasicBlock {
        nodes: vec![squared],
        preds: vec![BlockId(0)],
        succs: vec![BlockId(3)],
    });
    g.add_block(BasicBlock {
        nodes: vec![phi, out],
        preds: vec![BlockId(1), BlockId(2)],
        succs: vec![],
    });
    g.inputs = vec![a, s];
    g.outputs = vec![out];

    let mut engine = Engine::new(g, config());
    engine.compute().unwrap();

    let weights = engine.path_weights().unwrap();
    assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);

    // E[out] = ½·E[2a] + ½·E[a²] = 0 + 1/6.
    assert!((engine.signal_mean(out).unwrap() - 1.0 / 6.0).abs() < 1e-9);
    // E[out²] = ½·4/3 + ½·1/5 = 23/30.
    let expected = 23.0 / 30.0 - 1.0 / 36.0;
    assert!((engine.signal_variance(out).unwrap() - expected).abs() < 1e-9);
}

#[test]
fn test_true_comparator_single_undivided_path() {
    // A TRUE comparator never forks: one path, nothing to decide, no
    // domain splitting for fork resolution.
    let mut g = SystemGraph::new();
    let a = g.add_node(Node::input());
    let cmp = g.add_node(Node::cmp(CmpKind::True, vec![a, a]));
    let br = g.add_node(Node::branch(cmp));
    let doubled = g.add_node(Node::op(OpKind::Add, vec![a, a]));
    let out = g.add_node(Node::output(doubled));
    let _ = br;

    g.add_block(BasicBlock {
        nodes: vec![a, cmp, br],
        preds: vec![],
        succs: vec![BlockId(1)],
    });
    g.add_block(BasicBlock {
        nodes: vec![doubled, out],
        preds: vec![BlockId(0)],
        succs: vec![],
    });
    g.inputs = vec![a];
    g.outputs = vec![out];

    let mut engine = Engine::new(g, config());
    engine.compute().unwrap();

    let stats = engine.run_stats().unwrap();
    assert_eq!(stats.paths, 1);
    assert_eq!(stats.subdomains, 1);
    assert_eq!(engine.path_weights().unwrap(), &[1.0]);
    assert!((engine.signal_mean(out).unwrap()).abs() < 1e-12);
    assert!((engine.signal_variance(out).unwrap() - 4.0 / 3.0).abs() < 1e-9);
}

#[test]
fn test_idempotent_resume_skips_all_units() {
    let dir = tempfile::tempdir().unwrap();
    let checkpointed = EngineConfig {
        checkpoint_dir: Some(dir.path().to_path_buf()),
        ..config()
    };
    let wlv = [8, 8, 8];

    let (graph, out) = add_graph();
    let mut first = Engine::new(graph, checkpointed.clone());
    first.compute().unwrap();
    let first_stats = first.run_stats().unwrap();
    assert!(first_stats.units_run > 0);
    assert_eq!(first_stats.units_skipped, 0);

    let (graph, _) = add_graph();
    let mut second = Engine::new(graph, checkpointed);
    second.compute().unwrap();
    let second_stats = second.run_stats().unwrap();
    assert_eq!(second_stats.units_run, 0, "resume must do no propagation");
    assert_eq!(second_stats.units_skipped, first_stats.units_run);

    // The aggregated answers are identical.
    assert_eq!(
        first.signal_mean(out).unwrap(),
        second.signal_mean(out).unwrap()
    );
    assert_eq!(
        first.signal_variance(out).unwrap(),
        second.signal_variance(out).unwrap()
    );
    assert_eq!(
        first.noise_variance(&wlv, out).unwrap(),
        second.noise_variance(&wlv, out).unwrap()
    );
    assert_eq!(
        first.noise_sources().unwrap(),
        second.noise_sources().unwrap()
    );
}

#[test]
fn test_unsupported_order_fails_before_any_work() {
    let (graph, _) = add_graph();
    let mut engine = Engine::new(
        graph,
        EngineConfig {
            order: 11,
            ..config()
        },
    );
    assert!(matches!(
        engine.compute(),
        Err(EngineError::Config(_))
    ));
}

#[test]
fn test_div_aborts_the_run() {
    let mut g = SystemGraph::new();
    let a = g.add_node(Node::input());
    let b = g.add_node(Node::input());
    let d = g.add_node(Node::op(OpKind::Div, vec![a, b]));
    let out = g.add_node(Node::output(d));
    g.inputs = vec![a, b];
    g.outputs = vec![out];

    let mut engine = Engine::new(g, config());
    let err = engine.compute().unwrap_err();
    match err {
        EngineError::Partition(_) | EngineError::Propagate(_) => {}
        other => panic!("expected a propagation failure, got {other:?}"),
    }
}
