//! Natural policy gradients.
//!
//! This crate turns rollouts and a policy into an update direction that
//! accounts for the geometry of the policy's output distribution:
//!
//! - **Policy gradient**: the vanilla reward-weighted log-likelihood
//!   gradient, with optional [regularizers](regularizer)
//! - **Fisher-vector products**: `F v` without forming `F`, by
//!   forward-over-reverse differentiation of the mean KL divergence
//! - **Conjugate Gradients**: solves `F x = g` from products alone
//! - **Orchestration**: [`NaturalPG`] runs the three in sequence
//!
//! # Example
//!
//! ```rust,no_run
//! use npg_core::prelude::*;
//! use npg_nn::prelude::*;
//! use npg_optim::NaturalPG;
//!
//! # fn run(policy: LayerBlock, rollouts: RolloutSet) -> Result<()> {
//! let npg = NaturalPG::new(policy, Softmax::new(2))
//!     .with_config(NaturalPgConfig::new().with_iters(14));
//! let direction = npg.run(&rollouts)?;
//! # Ok(())
//! # }
//! ```

pub mod conjugate_gradient;
pub mod fisher;
pub mod natural_gradient;
pub mod policy_gradient;
pub mod regularizer;

pub use conjugate_gradient::{ConjugateGradient, LinearOperator};
pub use fisher::{make_fwd_diff, mean_kl, store_policy_outputs, FisherOperator, ForwardPolicy};
pub use natural_gradient::NaturalPG;
pub use policy_gradient::policy_gradient;
pub use regularizer::{average_reg, EntropyReg, InvEntropyReg, KLReg, Regularizer};
