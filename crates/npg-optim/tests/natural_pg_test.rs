//! End-to-end checks of the Fisher-vector product and the natural gradient
//! on a small feed-forward policy over variable-length rollouts.

use approx::assert_relative_eq;
use npg_core::prelude::*;
use npg_core::replay::TapeReader;
use npg_core::GeneratorTape;
use npg_nn::prelude::*;
use npg_nn::test_utils::{rollouts_for_test, two_layer_policy};
use npg_optim::{policy_gradient, ConjugateGradient, NaturalPG};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn random_direction<P: Policy>(policy: &P, rng: &mut StdRng, scale: f64) -> ParameterGradient {
    policy
        .parameters()
        .iter()
        .map(|p| {
            let (rows, cols) = p.shape();
            let values = Tensor::from_fn(rows, cols, |_, _| {
                let v: f64 = StandardNormal.sample(&mut *rng);
                v * scale
            });
            (p.id(), values)
        })
        .collect()
}

fn setup(seed: u64) -> (NaturalPG<LayerBlock, Softmax>, RolloutSet, StdRng) {
    let mut rng = StdRng::seed_from_u64(seed);
    let rollouts = rollouts_for_test(&mut rng);
    let npg = NaturalPG::new(two_layer_policy(&mut rng), Softmax::new(2))
        .with_config(NaturalPgConfig::new().with_iters(14));
    (npg, rollouts, rng)
}

#[test]
fn test_fisher_deterministic() {
    init_logger();
    let (npg, rollouts, mut rng) = setup(1);
    let direction = random_direction(npg.policy(), &mut rng, 1.0);
    let stored = npg.store_policy_outputs(&rollouts).unwrap();

    let first = npg.apply_fisher(&rollouts, &direction, &stored).unwrap();
    let mag1 = first.dot(&first);
    for _ in 0..20 {
        let second = npg.apply_fisher(&rollouts, &direction, &stored).unwrap();
        let mag2 = second.dot(&second);
        let correlation = first.dot(&second) / (mag1 * mag2).sqrt();
        assert!(correlation >= 1.0 - 1e-3, "correlation is too low: {}", correlation);
    }
}

#[test]
fn test_fisher_quadratic_form_matches_kl() {
    init_logger();
    let (mut npg, rollouts, mut rng) = setup(2);
    let direction = random_direction(npg.policy(), &mut rng, 1e-4);
    let stored = npg.store_policy_outputs(&rollouts).unwrap();

    let applied = npg.apply_fisher(&rollouts, &direction, &stored).unwrap();
    let actual = 0.5 * direction.dot(&applied);

    direction
        .add_to_params(&mut npg.policy_mut().parameters_mut())
        .unwrap();
    let expected = npg.mean_kl(&rollouts, &stored).unwrap();

    assert!(actual > 0.0);
    assert_relative_eq!(actual, expected, max_relative = 1e-3);
}

#[test]
fn test_fisher_is_symmetric() {
    init_logger();
    let (npg, rollouts, mut rng) = setup(3);
    let u = random_direction(npg.policy(), &mut rng, 1.0);
    let v = random_direction(npg.policy(), &mut rng, 1.0);
    let stored = npg.store_policy_outputs(&rollouts).unwrap();

    let fu = npg.apply_fisher(&rollouts, &u, &stored).unwrap();
    let fv = npg.apply_fisher(&rollouts, &v, &stored).unwrap();
    assert_relative_eq!(v.dot(&fu), u.dot(&fv), max_relative = 1e-9);
    assert!(u.dot(&fu) >= 0.0);
}

#[test]
fn test_conjugate_gradients_solve_fisher_system() {
    init_logger();
    let (npg, rollouts, _) = setup(4);
    let ids = npg.params().to_vec();
    let grad = policy_gradient(
        npg.space(),
        npg.policy(),
        &ids,
        npg.strategy(),
        &rollouts,
        None,
    )
    .unwrap();

    let solved = npg.run(&rollouts).unwrap();
    let stored = npg.store_policy_outputs(&rollouts).unwrap();
    let product = npg.apply_fisher(&rollouts, &solved, &stored).unwrap();

    assert_eq!(product.len(), grad.len());
    for (id, expected) in &grad {
        let actual = product.get(*id).unwrap();
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() <= 1e-3, "F x = {} but g = {}", a, e);
        }
    }
}

#[test]
fn test_explicit_solver_matches_run() {
    init_logger();
    let (npg, rollouts, _) = setup(5);
    let ids = npg.params().to_vec();
    let grad = policy_gradient(npg.space(), npg.policy(), &ids, npg.strategy(), &rollouts, None)
        .unwrap();
    let stored = npg.store_policy_outputs(&rollouts).unwrap();
    let op = |v: &ParameterGradient| npg.apply_fisher(&rollouts, v, &stored);

    let explicit = ConjugateGradient::new(14).solve(&op, &grad).unwrap();
    let natural = npg.run(&rollouts).unwrap();
    for (id, x) in &natural {
        for (a, b) in x.iter().zip(explicit.get(*id).unwrap().iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-9);
        }
    }
}

/// Wraps a tape and counts how often it is read.
struct CountingTape {
    inner: ReferenceTape,
    reads: Arc<AtomicUsize>,
}

impl Tape for CountingTape {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn read_tape(&self, start: usize, end: Option<usize>) -> Result<TapeReader> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_tape(start, end)
    }
}

#[test]
fn test_empty_params_short_circuit() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(6);
    let reads = Arc::new(AtomicUsize::new(0));
    let counting = |tape: ReferenceTape| -> Arc<dyn Tape> {
        Arc::new(CountingTape {
            inner: tape,
            reads: Arc::clone(&reads),
        })
    };
    let batch = RolloutBatch::from_flat(&[0.5, 0.1, -0.3], vec![true]).unwrap();
    let reward = RolloutBatch::from_flat(&[1.0], vec![true]).unwrap();
    let action = RolloutBatch::from_flat(&[1.0, 0.0], vec![true]).unwrap();
    let rollouts = RolloutSet::new(
        counting(ReferenceTape::from_batches(vec![batch]).unwrap()),
        counting(ReferenceTape::from_batches(vec![reward]).unwrap()),
        counting(ReferenceTape::from_batches(vec![action]).unwrap()),
    );

    let npg = NaturalPG::new(two_layer_policy(&mut rng), Softmax::new(2)).with_params(Vec::new());
    let result = npg.run(&rollouts).unwrap();
    assert!(result.is_empty());
    assert_eq!(reads.load(Ordering::SeqCst), 0);
}

/// A policy that cannot be copied.
#[derive(Debug)]
struct Unclonable {
    inner: LayerBlock,
}

impl Policy for Unclonable {
    fn parameters(&self) -> Vec<&Parameter> {
        self.inner.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.inner.parameters_mut()
    }

    fn input_size(&self) -> usize {
        self.inner.input_size()
    }

    fn output_size(&self) -> usize {
        self.inner.output_size()
    }

    fn try_clone(&self) -> Result<Self> {
        Err(NpgError::non_clonable("holds an external handle"))
    }

    fn step<T: Numeric>(
        &self,
        graph: &npg_autodiff::Graph<T>,
        vars: &ParamVars,
        input: npg_autodiff::NodeId,
        state: Option<npg_autodiff::NodeId>,
    ) -> Result<npg_nn::StepOutput> {
        self.inner.step(graph, vars, input, state)
    }
}

#[test]
fn test_non_clonable_policy_aborts_run() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(7);
    let rollouts = rollouts_for_test(&mut rng);
    let policy = Unclonable {
        inner: two_layer_policy(&mut rng),
    };
    let err = NaturalPG::new(policy, Softmax::new(2))
        .run(&rollouts)
        .unwrap_err();
    assert!(matches!(err, NpgError::NonClonablePolicy { .. }));
}

#[test]
fn test_stream_errors_propagate() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(8);
    let good = rollouts_for_test(&mut rng);
    let failing = GeneratorTape::new(good.num_steps(), |t| {
        Err(NpgError::stream_read(format!("storage lost at {}", t)))
    });
    let rollouts = RolloutSet::new(Arc::new(failing), good.rewards.clone(), good.sampled_outs.clone());
    let err = NaturalPG::new(two_layer_policy(&mut rng), Softmax::new(2))
        .run(&rollouts)
        .unwrap_err();
    assert!(err.is_stream_error());
}

#[test]
fn test_truncated_strategy_runs() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(9);
    let rollouts = rollouts_for_test(&mut rng);
    let npg = NaturalPG::new(ElmanBlock::new(&mut rng, 3, 3, 2), Softmax::new(2))
        .with_strategy(TruncatedBptt::new(4).unwrap())
        .with_config(NaturalPgConfig::new().with_iters(3));
    let natural = npg.run(&rollouts).unwrap();
    assert_eq!(natural.len(), 5);
    assert!(natural.norm().is_finite());
}

#[test]
fn test_wide_sampled_actions_rejected() {
    init_logger();
    let mut rng = StdRng::seed_from_u64(10);
    let good = rollouts_for_test(&mut rng);
    let widened = good
        .sampled_outs
        .read_all()
        .unwrap()
        .map(|batch| {
            let batch = batch.unwrap();
            RolloutBatch::new(batch.packed.insert_column(2, 0.0), batch.present).unwrap()
        })
        .collect();
    let rollouts = RolloutSet::new(
        good.inputs.clone(),
        good.rewards.clone(),
        Arc::new(ReferenceTape::from_batches(widened).unwrap()),
    );
    let err = NaturalPG::new(two_layer_policy(&mut rng), Softmax::new(2))
        .run(&rollouts)
        .unwrap_err();
    assert!(matches!(err, NpgError::ShapeMismatch { .. }));
}
