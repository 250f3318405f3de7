//! Regularization terms for the policy-gradient objective.
//!
//! A regularizer maps a batch of distribution parameters to one term per
//! row, to be maximized alongside the expected reward. Terms encourage
//! exploration by rewarding spread-out action distributions.

use npg_autodiff::{Graph, NodeId};
use npg_core::error::{NpgError, Result};
use npg_core::replay::Tape;
use npg_core::types::Tensor;
use npg_nn::action_space::ActionSpace;
use npg_nn::apply::sequence_mean;

/// A per-row regularization term.
pub trait Regularizer: Send + Sync {
    /// Records the term for each row of `params` as an `n x 1` column.
    fn regularize(&self, graph: &Graph, params: NodeId) -> NodeId;
}

/// Scaled entropy of the action distribution.
#[derive(Debug, Clone)]
pub struct EntropyReg<A> {
    /// Distribution the entropy is taken under
    pub space: A,
    /// Strength of the term; 0.01 is a reasonable start
    pub coeff: f64,
}

impl<A: ActionSpace> EntropyReg<A> {
    /// Creates the regularizer.
    pub fn new(space: A, coeff: f64) -> Self {
        Self { space, coeff }
    }
}

impl<A: ActionSpace> Regularizer for EntropyReg<A> {
    fn regularize(&self, graph: &Graph, params: NodeId) -> NodeId {
        graph.scale(self.space.entropy(graph, params), self.coeff)
    }
}

/// Negative reciprocal of the entropy.
///
/// The term goes to minus infinity as the entropy approaches zero.
#[derive(Debug, Clone)]
pub struct InvEntropyReg<A> {
    /// Distribution the entropy is taken under
    pub space: A,
    /// Strength of the term
    pub coeff: f64,
}

impl<A: ActionSpace> InvEntropyReg<A> {
    /// Creates the regularizer.
    pub fn new(space: A, coeff: f64) -> Self {
        Self { space, coeff }
    }
}

impl<A: ActionSpace> Regularizer for InvEntropyReg<A> {
    fn regularize(&self, graph: &Graph, params: NodeId) -> NodeId {
        let entropy = self.space.entropy(graph, params);
        graph.scale(graph.pow(entropy, -1.0), -self.coeff)
    }
}

/// Negative divergence `KL(base || policy)` from a fixed base distribution.
///
/// Keeps actions that are likely under the base distribution from becoming
/// too unlikely under the policy.
#[derive(Debug, Clone)]
pub struct KLReg<A> {
    space: A,
    base: Tensor,
    coeff: f64,
}

impl<A: ActionSpace> KLReg<A> {
    /// Creates the regularizer. `base` is one row of distribution parameters.
    pub fn new(space: A, base: Tensor, coeff: f64) -> Result<Self> {
        if base.nrows() != 1 || base.ncols() != space.param_size() {
            return Err(NpgError::shape_mismatch(
                format!("(1, {})", space.param_size()),
                format!("{:?}", base.shape()),
            ));
        }
        Ok(Self { space, base, coeff })
    }

    /// The base distribution parameters.
    pub fn base(&self) -> &Tensor {
        &self.base
    }

    /// Strength of the term.
    pub fn coeff(&self) -> f64 {
        self.coeff
    }
}

impl<A: ActionSpace> Regularizer for KLReg<A> {
    fn regularize(&self, graph: &Graph, params: NodeId) -> NodeId {
        let rows = graph.shape(params).map_or(0, |(r, _)| r);
        let repeated = Tensor::from_fn(rows, self.base.ncols(), |_, j| self.base[(0, j)]);
        let base = graph.constant(repeated);
        graph.scale(self.space.kl(graph, base, params), -self.coeff)
    }
}

/// Average regularization term over every present entry of a tape of
/// distribution parameters. Zero when nothing is present.
pub fn average_reg(outputs: &dyn Tape, reg: &dyn Regularizer) -> Result<f64> {
    let graph: Graph = Graph::no_grad();
    let mut terms = Vec::new();
    for batch in outputs.read_all()? {
        let batch = batch?;
        let n = batch.num_present();
        if n == 0 {
            continue;
        }
        let params = graph.constant(batch.packed);
        terms.push((reg.regularize(&graph, params), n));
    }
    match sequence_mean(&graph, &terms) {
        Some(mean) => graph
            .get_value(mean)
            .map(|v| v[(0, 0)])
            .ok_or_else(|| NpgError::invalid_state("regularizer mean missing from graph")),
        None => Ok(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use npg_core::replay::{RolloutBatch, TapeWriter};
    use npg_nn::action_space::Softmax;

    fn logits_tape() -> npg_core::replay::ReferenceTape {
        let mut writer = TapeWriter::new();
        writer
            .write(RolloutBatch::from_flat(&[0.0, 0.0, 1.0, 0.0], vec![true, true]).unwrap())
            .unwrap();
        writer
            .write(RolloutBatch::from_flat(&[], vec![false, false]).unwrap())
            .unwrap();
        writer
            .write(RolloutBatch::from_flat(&[0.0, 2.0], vec![false, true]).unwrap())
            .unwrap();
        writer.finish()
    }

    fn binary_entropy(logit_gap: f64) -> f64 {
        let p = 1.0 / (1.0 + (-logit_gap).exp());
        -(p * p.ln() + (1.0 - p) * (1.0 - p).ln())
    }

    #[test]
    fn test_entropy_reg_average() {
        let reg = EntropyReg::new(Softmax::new(2), 0.5);
        let avg = average_reg(&logits_tape(), &reg).unwrap();
        let expected =
            0.5 * (binary_entropy(0.0) + binary_entropy(1.0) + binary_entropy(2.0)) / 3.0;
        assert_relative_eq!(avg, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_inv_entropy_reg() {
        let reg = InvEntropyReg::new(Softmax::new(2), 2.0);
        let graph: Graph = Graph::new();
        let params = graph.constant(Tensor::from_row_slice(1, 2, &[0.0, 0.0]));
        let term = graph.get_value(reg.regularize(&graph, params)).unwrap();
        assert_relative_eq!(term[(0, 0)], -2.0 / 2.0_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_kl_reg_zero_at_base() {
        let base = Tensor::from_row_slice(1, 2, &[0.3, -0.1]);
        let reg = KLReg::new(Softmax::new(2), base, 1.0).unwrap();
        let graph: Graph = Graph::new();
        let params = graph.constant(Tensor::from_row_slice(2, 2, &[0.3, -0.1, 1.0, 0.0]));
        let term = graph.get_value(reg.regularize(&graph, params)).unwrap();
        assert_eq!(term.shape(), (2, 1));
        assert_relative_eq!(term[(0, 0)], 0.0, epsilon = 1e-15);
        assert!(term[(1, 0)] < 0.0);
    }

    #[test]
    fn test_kl_reg_base_shape_checked() {
        let base = Tensor::zeros(1, 3);
        assert!(matches!(
            KLReg::new(Softmax::new(2), base, 1.0),
            Err(NpgError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_average_reg_empty_tape() {
        let tape = TapeWriter::new().finish();
        let reg = EntropyReg::new(Softmax::new(2), 1.0);
        assert_eq!(average_reg(&tape, &reg).unwrap(), 0.0);
    }
}
