//! Policies, sequence application and action spaces.
//!
//! A [`Policy`] maps one timestep of packed inputs (and, for recurrent
//! blocks, a state) to distribution parameters. An [`ApplyStrategy`] unrolls
//! a policy over a replayed input stream, and an [`ActionSpace`] turns the
//! resulting parameters into entropies, divergences and log-densities.
//!
//! Everything here records onto a caller-owned [`Graph`](npg_autodiff::Graph)
//! and is generic over the numeric mode, so the same code serves plain
//! gradients and Fisher-vector products.

pub mod action_space;
pub mod apply;
pub mod block;
pub mod layer;
pub mod policy;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use action_space::{check_action_width, check_policy_output, ActionSpace, DiagGaussian, Softmax};
pub use apply::{apply_to_tape, sequence_mean, ApplyStrategy, Bptt, PolicyStep, TruncatedBptt};
pub use block::{ElmanBlock, LayerBlock};
pub use layer::{Dense, Layer, Net};
pub use policy::{param_ids, ParamVars, Policy, StepOutput};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::action_space::{ActionSpace, DiagGaussian, Softmax};
    pub use crate::apply::{apply_to_tape, ApplyStrategy, Bptt, PolicyStep, TruncatedBptt};
    pub use crate::block::{ElmanBlock, LayerBlock};
    pub use crate::layer::{Dense, Layer, Net};
    pub use crate::policy::{ParamVars, Policy};
}
