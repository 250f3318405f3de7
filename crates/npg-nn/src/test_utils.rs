//! Shared fixtures for tests across the workspace.

use crate::block::LayerBlock;
use crate::layer::{Dense, Layer, Net};
use npg_core::replay::{RolloutBatch, TapeWriter};
use npg_core::rollout::RolloutSet;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use std::sync::Arc;

fn normal_values<R: Rng + ?Sized>(rng: &mut R, n: usize) -> Vec<f64> {
    (0..n).map(|_| StandardNormal.sample(&mut *rng)).collect()
}

fn uniform_values<R: Rng + ?Sized>(rng: &mut R, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.gen::<f64>()).collect()
}

/// Rollouts with two sequences of length 3 and one of length 11.
///
/// Slots 0 and 2 are present for the first 3 timesteps, then only slot 2
/// for 8 more. Inputs have 3 Gaussian features, rewards are uniform in
/// `[0, 1)` and sampled actions are one-hot over 2 categories.
pub fn rollouts_for_test<R: Rng + ?Sized>(rng: &mut R) -> RolloutSet {
    let mut inputs = TapeWriter::new();
    let mut rewards = TapeWriter::new();
    let mut sampled = TapeWriter::new();

    let mut push = |present: Vec<bool>, input: Vec<f64>, reward: Vec<f64>, action: Vec<f64>| {
        inputs
            .write(RolloutBatch::from_flat(&input, present.clone()).expect("input batch"))
            .expect("input tape");
        rewards
            .write(RolloutBatch::from_flat(&reward, present.clone()).expect("reward batch"))
            .expect("reward tape");
        sampled
            .write(RolloutBatch::from_flat(&action, present).expect("sampled batch"))
            .expect("sampled tape");
    };

    for i in 0..3 {
        let mut action = vec![0.0; 4];
        action[i % 2] = 1.0;
        action[(i + 1) % 2 + 2] = 1.0;
        push(
            vec![true, false, true],
            normal_values(rng, 6),
            uniform_values(rng, 2),
            action,
        );
    }
    for i in 0..8 {
        let mut action = vec![0.0; 2];
        action[i % 2] = 1.0;
        push(
            vec![false, false, true],
            normal_values(rng, 3),
            uniform_values(rng, 1),
            action,
        );
    }

    RolloutSet::new(
        Arc::new(inputs.finish()),
        Arc::new(rewards.finish()),
        Arc::new(sampled.finish()),
    )
}

/// `Dense(3, 2) -> Tanh -> Dense(2, 2)` with Gaussian weights and biases.
pub fn two_layer_policy<R: Rng + ?Sized>(rng: &mut R) -> LayerBlock {
    let mut first = Dense::new(rng, 3, 2);
    let mut second = Dense::new(rng, 2, 2);
    for bias in [&mut first.biases, &mut second.biases] {
        for v in bias.value_mut().iter_mut() {
            *v = StandardNormal.sample(&mut *rng);
        }
    }
    let net = Net::new()
        .with_layer(Layer::Dense(first))
        .with_layer(Layer::Tanh)
        .with_layer(Layer::Dense(second));
    LayerBlock::new(net).expect("two-layer net has dense layers")
}
