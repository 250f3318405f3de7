//! Natural policy gradient orchestrator.
//!
//! One call to [`NaturalPG::run`] performs a full update-direction
//! computation:
//!
//! 1. The vanilla policy gradient `g` (one application of the policy)
//! 2. The policy outputs for the rollout inputs, frozen on a tape
//! 3. Conjugate Gradients on `F x = g`, one Fisher-vector product per
//!    iteration, each re-reading the inputs and the frozen outputs
//!
//! The returned `x` is the natural gradient. Taking a step along it is left
//! to the caller.

use crate::conjugate_gradient::ConjugateGradient;
use crate::fisher::{self, FisherOperator};
use crate::policy_gradient::policy_gradient;
use crate::regularizer::Regularizer;
use log::info;
use npg_core::config::NaturalPgConfig;
use npg_core::error::{NpgError, Result};
use npg_core::gradient::{ParamId, ParameterGradient};
use npg_core::replay::{ReferenceTape, Tape};
use npg_core::rollout::RolloutSet;
use npg_nn::action_space::{check_policy_output, ActionSpace};
use npg_nn::apply::{ApplyStrategy, Bptt};
use npg_nn::policy::{param_ids, Policy};
use std::fmt;

/// Natural policy gradients for a policy and an action space.
pub struct NaturalPG<P, A, S = Bptt> {
    policy: P,
    params: Vec<ParamId>,
    space: A,
    strategy: S,
    config: NaturalPgConfig,
    regularizer: Option<Box<dyn Regularizer>>,
}

impl<P: Policy, A: ActionSpace> NaturalPG<P, A, Bptt> {
    /// Creates an orchestrator training every parameter of `policy` with
    /// plain back-propagation through time.
    pub fn new(policy: P, space: A) -> Self {
        let params = param_ids(&policy);
        Self {
            policy,
            params,
            space,
            strategy: Bptt,
            config: NaturalPgConfig::default(),
            regularizer: None,
        }
    }
}

impl<P, A, S> NaturalPG<P, A, S>
where
    P: Policy,
    A: ActionSpace,
    S: ApplyStrategy,
{
    /// Restricts training to `params`. An empty list disables training.
    pub fn with_params(mut self, params: Vec<ParamId>) -> Self {
        self.params = params;
        self
    }

    /// Replaces the sequence application strategy.
    pub fn with_strategy<S2: ApplyStrategy>(self, strategy: S2) -> NaturalPG<P, A, S2> {
        NaturalPG {
            policy: self.policy,
            params: self.params,
            space: self.space,
            strategy,
            config: self.config,
            regularizer: self.regularizer,
        }
    }

    /// Replaces the solver configuration.
    pub fn with_config(mut self, config: NaturalPgConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a regularization term to the vanilla gradient objective.
    pub fn with_regularizer<R: Regularizer + 'static>(mut self, regularizer: R) -> Self {
        self.regularizer = Some(Box::new(regularizer));
        self
    }

    /// The policy being trained.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Mutable access for applying an update between runs.
    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    /// Releases the policy.
    pub fn into_policy(self) -> P {
        self.policy
    }

    /// The trained parameters.
    pub fn params(&self) -> &[ParamId] {
        &self.params
    }

    /// The action space the policy parameterizes.
    pub fn space(&self) -> &A {
        &self.space
    }

    /// The sequence application strategy.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// The solver configuration.
    pub fn config(&self) -> &NaturalPgConfig {
        &self.config
    }

    /// Computes the natural gradient for `rollouts`, keyed by the trained
    /// parameters.
    ///
    /// With no trained parameters the result is empty and no stream is read.
    /// Unknown parameters and a policy whose output width does not match the
    /// action space are rejected before any stream is read.
    pub fn run(&self, rollouts: &RolloutSet) -> Result<ParameterGradient> {
        self.config.validate()?;
        if self.params.is_empty() {
            return Ok(ParameterGradient::new());
        }
        self.check_params()?;

        let grad = policy_gradient(
            &self.space,
            &self.policy,
            &self.params,
            &self.strategy,
            rollouts,
            self.regularizer.as_deref(),
        )?;
        info!("policy gradient norm {:.6e}", grad.norm());
        if grad.is_empty() {
            return Ok(grad);
        }

        let old_outputs = self.store_policy_outputs(rollouts)?;
        let op = FisherOperator::new(
            &self.policy,
            &self.space,
            &self.strategy,
            rollouts.inputs.as_ref(),
            &old_outputs,
        );
        let iters = self.config.effective_iters();
        let natural = ConjugateGradient::new(iters).solve(&op, &grad)?;
        info!(
            "natural gradient norm {:.6e} after {} iterations",
            natural.norm(),
            iters
        );
        Ok(natural)
    }

    /// Computes the Fisher-vector product `F direction` against outputs
    /// stored by [`store_policy_outputs`](Self::store_policy_outputs).
    pub fn apply_fisher(
        &self,
        rollouts: &RolloutSet,
        direction: &ParameterGradient,
        old_outputs: &dyn Tape,
    ) -> Result<ParameterGradient> {
        FisherOperator::new(
            &self.policy,
            &self.space,
            &self.strategy,
            rollouts.inputs.as_ref(),
            old_outputs,
        )
        .apply(direction)
    }

    /// Applies the policy to the rollout inputs and freezes the outputs.
    pub fn store_policy_outputs(&self, rollouts: &RolloutSet) -> Result<ReferenceTape> {
        check_policy_output(&self.policy, &self.space)?;
        fisher::store_policy_outputs(
            &self.policy,
            &self.strategy,
            rollouts.inputs.as_ref(),
            self.config.queue_capacity,
        )
    }

    /// Mean `KL(old || current policy)` over the rollout inputs.
    pub fn mean_kl(&self, rollouts: &RolloutSet, old_outputs: &dyn Tape) -> Result<f64> {
        fisher::mean_kl(
            &self.policy,
            &self.space,
            &self.strategy,
            rollouts.inputs.as_ref(),
            old_outputs,
        )
    }

    fn check_params(&self) -> Result<()> {
        check_policy_output(&self.policy, &self.space)?;
        let owned = param_ids(&self.policy);
        match self.params.iter().find(|id| !owned.contains(*id)) {
            Some(id) => Err(NpgError::unknown_parameter(id)),
            None => Ok(()),
        }
    }
}

impl<P, A, S> fmt::Debug for NaturalPG<P, A, S>
where
    P: fmt::Debug,
    A: fmt::Debug,
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NaturalPG")
            .field("policy", &self.policy)
            .field("params", &self.params)
            .field("space", &self.space)
            .field("strategy", &self.strategy)
            .field("config", &self.config)
            .field("regularized", &self.regularizer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npg_core::gradient::Parameter;
    use npg_core::types::Tensor;
    use npg_nn::action_space::{DiagGaussian, Softmax};
    use npg_nn::apply::TruncatedBptt;
    use npg_nn::test_utils::{rollouts_for_test, two_layer_policy};
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_builder() {
        let mut rng = StdRng::seed_from_u64(3);
        let npg = NaturalPG::new(two_layer_policy(&mut rng), Softmax::new(2))
            .with_config(NaturalPgConfig::new().with_iters(4))
            .with_strategy(TruncatedBptt::new(2).unwrap());
        assert_eq!(npg.params().len(), 4);
        assert_eq!(npg.config().effective_iters(), 4);
        assert_eq!(npg.strategy().window(), 2);
        assert!(format!("{:?}", npg).contains("regularized: false"));
    }

    #[test]
    fn test_unregistered_parameter_rejected() {
        let mut rng = StdRng::seed_from_u64(4);
        let stranger = Parameter::new(Tensor::zeros(1, 1));
        let npg = NaturalPG::new(two_layer_policy(&mut rng), Softmax::new(2))
            .with_params(vec![stranger.id()]);
        let rollouts = rollouts_for_test(&mut rng);
        assert!(matches!(
            npg.run(&rollouts),
            Err(NpgError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut rng = StdRng::seed_from_u64(5);
        let npg = NaturalPG::new(two_layer_policy(&mut rng), Softmax::new(2))
            .with_config(NaturalPgConfig::new().with_queue_capacity(0));
        let rollouts = rollouts_for_test(&mut rng);
        assert!(matches!(
            npg.run(&rollouts),
            Err(NpgError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_subset_of_params() {
        let mut rng = StdRng::seed_from_u64(6);
        let policy = two_layer_policy(&mut rng);
        let last = param_ids(&policy)[3];
        let npg = NaturalPG::new(policy, Softmax::new(2)).with_params(vec![last]);
        let rollouts = rollouts_for_test(&mut rng);
        let natural = npg.run(&rollouts).unwrap();
        assert_eq!(natural.keys().collect::<Vec<_>>(), vec![last]);
    }

    #[test]
    fn test_output_width_checked_at_setup() {
        let mut rng = StdRng::seed_from_u64(7);
        let rollouts = rollouts_for_test(&mut rng);

        let narrow = NaturalPG::new(two_layer_policy(&mut rng), DiagGaussian::new(2));
        assert!(matches!(
            narrow.run(&rollouts),
            Err(NpgError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            narrow.store_policy_outputs(&rollouts),
            Err(NpgError::ShapeMismatch { .. })
        ));

        let wide = NaturalPG::new(two_layer_policy(&mut rng), Softmax::new(1));
        assert!(matches!(
            wide.run(&rollouts),
            Err(NpgError::ShapeMismatch { .. })
        ));
    }
}
