//! Action spaces: probability distributions over actions parameterized by
//! policy outputs.
//!
//! Every function records its result on the caller's graph and returns a
//! column with one value per row of distribution parameters. Callers do the
//! averaging.

use crate::policy::Policy;
use npg_autodiff::{Graph, NodeId};
use npg_core::error::{NpgError, Result};
use npg_core::types::constants::LN_2PI;
use npg_core::types::Numeric;

/// A family of distributions with differentiable entropy and divergence.
pub trait ActionSpace: Send + Sync {
    /// Width of one row of distribution parameters.
    fn param_size(&self) -> usize;

    /// Width of one sampled action.
    fn action_size(&self) -> usize;

    /// Differential entropy of each row of `params`.
    fn entropy<T: Numeric>(&self, graph: &Graph<T>, params: NodeId) -> NodeId;

    /// Forward divergence `KL(P || Q)` row by row.
    ///
    /// Differentiable in both arguments.
    fn kl<T: Numeric>(&self, graph: &Graph<T>, p: NodeId, q: NodeId) -> NodeId;

    /// Log-density of each sampled action under the matching row of `params`.
    fn log_prob<T: Numeric>(&self, graph: &Graph<T>, params: NodeId, sampled: NodeId) -> NodeId;
}

/// Categorical distribution over `size` actions, parameterized by logits.
///
/// Sampled actions are one-hot rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Softmax {
    size: usize,
}

impl Softmax {
    /// Creates a categorical distribution over `size` actions.
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl ActionSpace for Softmax {
    fn param_size(&self) -> usize {
        self.size
    }

    fn action_size(&self) -> usize {
        self.size
    }

    fn entropy<T: Numeric>(&self, graph: &Graph<T>, params: NodeId) -> NodeId {
        let log_probs = graph.log_softmax(params);
        let weighted = graph.mul(graph.exp(log_probs), log_probs);
        graph.neg(graph.sum_axis(weighted, 1))
    }

    fn kl<T: Numeric>(&self, graph: &Graph<T>, p: NodeId, q: NodeId) -> NodeId {
        let log_p = graph.log_softmax(p);
        let log_q = graph.log_softmax(q);
        let weighted = graph.mul(graph.exp(log_p), graph.sub(log_p, log_q));
        graph.sum_axis(weighted, 1)
    }

    fn log_prob<T: Numeric>(&self, graph: &Graph<T>, params: NodeId, sampled: NodeId) -> NodeId {
        let log_probs = graph.log_softmax(params);
        graph.sum_axis(graph.mul(log_probs, sampled), 1)
    }
}

/// Diagonal Gaussian over `size`-dimensional actions.
///
/// Parameter rows hold the means followed by the log standard deviations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagGaussian {
    size: usize,
}

impl DiagGaussian {
    /// Creates a Gaussian over `size`-dimensional actions.
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    fn split<T: Numeric>(&self, graph: &Graph<T>, params: NodeId) -> (NodeId, NodeId) {
        (
            graph.columns(params, 0, self.size),
            graph.columns(params, self.size, self.size),
        )
    }
}

impl ActionSpace for DiagGaussian {
    fn param_size(&self) -> usize {
        2 * self.size
    }

    fn action_size(&self) -> usize {
        self.size
    }

    fn entropy<T: Numeric>(&self, graph: &Graph<T>, params: NodeId) -> NodeId {
        // sum_j log(sigma_j) + d/2 * (1 + ln 2pi)
        let (_, log_std) = self.split(graph, params);
        let total = graph.sum_axis(log_std, 1);
        graph.shift(total, 0.5 * self.size as f64 * (1.0 + LN_2PI))
    }

    fn kl<T: Numeric>(&self, graph: &Graph<T>, p: NodeId, q: NodeId) -> NodeId {
        // sum_j log(sq/sp) + (sp^2 + (mp - mq)^2) / (2 sq^2) - 1/2
        let (mean_p, log_std_p) = self.split(graph, p);
        let (mean_q, log_std_q) = self.split(graph, q);
        let var_p = graph.exp(graph.scale(log_std_p, 2.0));
        let inv_var_q = graph.exp(graph.scale(log_std_q, -2.0));
        let diff = graph.sub(mean_p, mean_q);
        let spread = graph.add(var_p, graph.mul(diff, diff));
        let ratio = graph.scale(graph.mul(spread, inv_var_q), 0.5);
        let per_dim = graph.shift(graph.add(graph.sub(log_std_q, log_std_p), ratio), -0.5);
        graph.sum_axis(per_dim, 1)
    }

    fn log_prob<T: Numeric>(&self, graph: &Graph<T>, params: NodeId, sampled: NodeId) -> NodeId {
        // sum_j -(x - m)^2 / (2 s^2) - log(s) - ln(2pi)/2
        let (mean, log_std) = self.split(graph, params);
        let diff = graph.sub(sampled, mean);
        let inv_var = graph.exp(graph.scale(log_std, -2.0));
        let quad = graph.scale(graph.mul(graph.mul(diff, diff), inv_var), -0.5);
        let per_dim = graph.shift(graph.sub(quad, log_std), -0.5 * LN_2PI);
        graph.sum_axis(per_dim, 1)
    }
}

/// Checks that every output row of `policy` is one row of `space`'s
/// distribution parameters.
pub fn check_policy_output<P: Policy, A: ActionSpace>(policy: &P, space: &A) -> Result<()> {
    if policy.output_size() != space.param_size() {
        return Err(NpgError::shape_mismatch(
            format!("{} distribution parameters per row", space.param_size()),
            format!("policy output of width {}", policy.output_size()),
        ));
    }
    Ok(())
}

/// Checks the width of a batch of sampled actions.
pub fn check_action_width<A: ActionSpace>(space: &A, width: usize) -> Result<()> {
    if width != space.action_size() {
        return Err(NpgError::shape_mismatch(
            format!("sampled actions of width {}", space.action_size()),
            format!("width {}", width),
        ));
    }
    Ok(())
}
