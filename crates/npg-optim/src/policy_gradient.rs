//! Vanilla policy-gradient estimator.
//!
//! Differentiates the mean over every present entry of
//! `reward * log pi(sampled action)`, plus an optional regularization term,
//! with respect to the chosen parameters. The policy is applied to the
//! rollout inputs exactly once.

use crate::regularizer::Regularizer;
use log::debug;
use npg_autodiff::{backward, Graph};
use npg_core::error::{NpgError, Result};
use npg_core::gradient::{ParamId, ParameterGradient};
use npg_core::replay::next_batch;
use npg_core::rollout::RolloutSet;
use npg_core::types::Tensor;
use npg_nn::action_space::{check_action_width, check_policy_output, ActionSpace};
use npg_nn::apply::{sequence_mean, ApplyStrategy};
use npg_nn::policy::{ParamVars, Policy};

/// Computes the policy gradient for `params`.
///
/// Every id in `params` must belong to `policy`, and the policy must emit
/// `space`'s distribution parameters. The rewards and sampled action
/// streams are read in lockstep with the policy outputs and must share
/// their presence masks.
pub fn policy_gradient<P, A, S>(
    space: &A,
    policy: &P,
    params: &[ParamId],
    strategy: &S,
    rollouts: &RolloutSet,
    regularizer: Option<&dyn Regularizer>,
) -> Result<ParameterGradient>
where
    P: Policy,
    A: ActionSpace,
    S: ApplyStrategy,
{
    check_policy_output(policy, space)?;
    let graph: Graph = Graph::new();
    let vars = ParamVars::bind(&graph, &policy.parameters());
    for &id in params {
        if vars.get(id).is_none() {
            return Err(NpgError::unknown_parameter(id));
        }
    }

    let steps = strategy.apply(&graph, policy, &vars, rollouts.inputs.read_all()?)?;
    let mut rewards = rollouts.rewards.read_all()?;
    let mut sampled = rollouts.sampled_outs.read_all()?;

    let mut terms = Vec::with_capacity(steps.len());
    for (t, step) in steps.iter().enumerate() {
        let reward = next_batch(&mut rewards, t)?;
        let action = next_batch(&mut sampled, t)?;
        if reward.present != step.present || action.present != step.present {
            return Err(NpgError::stream_read(format!(
                "presence masks disagree at timestep {}",
                t
            )));
        }
        let n = step.num_present();
        if n == 0 {
            continue;
        }
        if reward.packed.ncols() != 1 {
            return Err(NpgError::shape_mismatch(
                "one reward per sequence",
                format!("{} columns at timestep {}", reward.packed.ncols(), t),
            ));
        }
        check_action_width(space, action.packed.ncols())?;

        let log_prob = space.log_prob(&graph, step.output, graph.constant(action.packed));
        let mut term = graph.mul(log_prob, graph.constant(reward.packed));
        if let Some(reg) = regularizer {
            term = graph.add(term, reg.regularize(&graph, step.output));
        }
        terms.push((term, n));
    }
    if rewards.next().is_some() || sampled.next().is_some() {
        return Err(NpgError::stream_read(
            "reward or action stream outlasts the inputs",
        ));
    }

    let grads = match sequence_mean(&graph, &terms) {
        Some(objective) => backward(&graph, objective, None),
        None => Default::default(),
    };

    let mut out = ParameterGradient::new();
    for &id in params {
        let node = vars.get(id).ok_or_else(|| NpgError::unknown_parameter(id))?;
        let grad = match grads.get(&node) {
            Some(g) => g.clone(),
            None => {
                let (rows, cols) = graph
                    .shape(node)
                    .ok_or_else(|| NpgError::invalid_state("parameter node missing"))?;
                Tensor::zeros(rows, cols)
            }
        };
        out.insert(id, grad);
    }
    debug!(
        "policy gradient over {} timesteps, norm {:.6e}",
        steps.len(),
        out.norm()
    );
    Ok(out)
}
