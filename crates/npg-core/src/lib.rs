//! Core types for natural policy gradients.
//!
//! This crate holds everything the differentiation, network and solver
//! crates share:
//!
//! - **Numeric modes**: the [`Numeric`] contract with plain `f64` and
//!   [`Dual`] implementations
//! - **Parameters**: identity-keyed tensors and [`ParameterGradient`]
//! - **Replay streams**: re-readable, batched, presence-masked sequences
//!   behind the [`Tape`] trait
//! - **Configuration**: [`NaturalPgConfig`]
//!
//! # Modules
//!
//! - [`config`]: Solver configuration
//! - [`dual`]: Dual numbers
//! - [`error`]: Error type shared by the workspace
//! - [`gradient`]: Parameters and parameter-indexed vectors
//! - [`replay`]: Replay streams
//! - [`rollout`]: Trajectory collections
//! - [`types`]: Tensor aliases and the numeric contract

pub mod config;
pub mod dual;
pub mod error;
pub mod gradient;
pub mod replay;
pub mod rollout;
pub mod types;

pub use config::{NaturalPgConfig, DEFAULT_CONJ_GRAD_ITERS};
pub use dual::Dual;
pub use error::{NpgError, Result};
pub use gradient::{ParamId, Parameter, ParameterGradient};
pub use replay::{
    next_batch, GeneratorTape, ReferenceTape, RolloutBatch, Tape, TapeReader, TapeWriter,
    DEFAULT_QUEUE_CAPACITY,
};
pub use rollout::RolloutSet;
pub use types::{DMatrix, Numeric, Tensor};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::NaturalPgConfig;
    pub use crate::dual::Dual;
    pub use crate::error::{NpgError, Result};
    pub use crate::gradient::{ParamId, Parameter, ParameterGradient};
    pub use crate::replay::{ReferenceTape, RolloutBatch, Tape, TapeReader, TapeWriter};
    pub use crate::rollout::RolloutSet;
    pub use crate::types::{Numeric, Tensor};
}
