//! Error types for natural gradient computations.
//!
//! Every failure inside the Fisher-vector product, the replay streams or the
//! solver is reported through [`NpgError`] and propagated synchronously to the
//! caller. Nothing is retried or masked at this layer.

use thiserror::Error;

/// Errors that can occur while computing a natural gradient.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NpgError {
    /// The policy cannot be duplicated into a derivative-augmented copy.
    ///
    /// Raised when a policy holds state outside its parameters, or when the
    /// copy it produces does not preserve topology and parameter values.
    #[error("Policy cannot be cloned for forward differentiation: {reason}")]
    NonClonablePolicy {
        /// Description of why cloning failed
        reason: String,
    },

    /// A replay stream could not deliver the requested data.
    ///
    /// Covers invalid ranges, producer failures and streams whose lengths or
    /// presence masks disagree.
    #[error("Replay stream read failed: {reason}")]
    StreamRead {
        /// Description of the read failure
        reason: String,
    },

    /// Tensor shapes disagree with what the contract requires.
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape
        expected: String,
        /// Actual shape
        actual: String,
    },

    /// A parameter identity is not owned by the policy.
    #[error("Unknown parameter: {id}")]
    UnknownParameter {
        /// Display form of the offending identity
        id: String,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the rejected value
        reason: String,
    },

    /// An internal invariant was violated.
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// Description of the violated invariant
        reason: String,
    },
}

impl NpgError {
    /// Create a NonClonablePolicy error with a custom reason.
    pub fn non_clonable<S: Into<String>>(reason: S) -> Self {
        Self::NonClonablePolicy {
            reason: reason.into(),
        }
    }

    /// Create a StreamRead error with a custom reason.
    pub fn stream_read<S: Into<String>>(reason: S) -> Self {
        Self::StreamRead {
            reason: reason.into(),
        }
    }

    /// Create a ShapeMismatch error.
    pub fn shape_mismatch<S1, S2>(expected: S1, actual: S2) -> Self
    where
        S1: std::fmt::Display,
        S2: std::fmt::Display,
    {
        Self::ShapeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an UnknownParameter error.
    pub fn unknown_parameter<S: std::fmt::Display>(id: S) -> Self {
        Self::UnknownParameter { id: id.to_string() }
    }

    /// Create an InvalidConfig error with a custom reason.
    pub fn invalid_config<S: Into<String>>(reason: S) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an InvalidState error with a custom reason.
    pub fn invalid_state<S: Into<String>>(reason: S) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Whether this error originated from a replay stream.
    pub fn is_stream_error(&self) -> bool {
        matches!(self, Self::StreamRead { .. })
    }
}

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, NpgError>;
