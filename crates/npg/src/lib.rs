//! Natural policy gradients for recurrent, distribution-producing policies.
//!
//! This crate re-exports the workspace:
//!
//! - [`core`]: numeric modes, parameters, replay streams, configuration
//! - [`autodiff`]: the computation graph and reverse-mode differentiation
//! - [`nn`]: policies, sequence application and action spaces
//! - [`optim`]: policy gradients, Fisher-vector products, Conjugate
//!   Gradients and [`NaturalPG`](optim::NaturalPG)
//!
//! # Example
//!
//! ```rust,no_run
//! use npg::prelude::*;
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! # fn run(rollouts: RolloutSet) -> Result<()> {
//! let mut rng = StdRng::seed_from_u64(0);
//! let net = Net::new()
//!     .with_layer(Layer::Dense(Dense::new(&mut rng, 3, 8)))
//!     .with_layer(Layer::Tanh)
//!     .with_layer(Layer::Dense(Dense::new(&mut rng, 8, 2)));
//! let mut npg = NaturalPG::new(LayerBlock::new(net)?, Softmax::new(2))
//!     .with_config(NaturalPgConfig::new().with_iters(10));
//!
//! let mut step = npg.run(&rollouts)?;
//! step.scale(0.01);
//! step.add_to_params(&mut npg.policy_mut().parameters_mut())?;
//! # Ok(())
//! # }
//! ```

pub use nalgebra;
pub use npg_autodiff as autodiff;
pub use npg_core as core;
pub use npg_nn as nn;
pub use npg_optim as optim;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use npg_autodiff::{backward, Graph, NodeId};
    pub use npg_core::prelude::*;
    pub use npg_nn::prelude::*;
    pub use npg_optim::{
        ConjugateGradient, EntropyReg, FisherOperator, InvEntropyReg, KLReg, LinearOperator,
        NaturalPG, Regularizer,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use npg_nn::test_utils::{rollouts_for_test, two_layer_policy};
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_prelude_pipeline() {
        let mut rng = StdRng::seed_from_u64(12);
        let rollouts = rollouts_for_test(&mut rng);
        let npg = NaturalPG::new(two_layer_policy(&mut rng), Softmax::new(2))
            .with_regularizer(EntropyReg::new(Softmax::new(2), 0.01))
            .with_config(NaturalPgConfig::new().with_iters(3));
        let step = npg.run(&rollouts).unwrap();
        assert_eq!(step.len(), npg.params().len());
    }
}
