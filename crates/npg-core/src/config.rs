//! Solver configuration.

use crate::error::{NpgError, Result};
use crate::replay::DEFAULT_QUEUE_CAPACITY;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of Conjugate Gradient iterations used when none is configured.
pub const DEFAULT_CONJ_GRAD_ITERS: usize = 10;

/// Configuration for the natural policy gradient solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NaturalPgConfig {
    /// Conjugate Gradient iterations; 0 selects [`DEFAULT_CONJ_GRAD_ITERS`]
    pub iters: usize,
    /// Bounded queue size between a tape producer and its consumer
    pub queue_capacity: usize,
}

impl Default for NaturalPgConfig {
    fn default() -> Self {
        Self {
            iters: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl NaturalPgConfig {
    /// Creates a configuration with default parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of Conjugate Gradient iterations.
    pub fn with_iters(mut self, iters: usize) -> Self {
        self.iters = iters;
        self
    }

    /// Sets the capacity of cached-output tapes.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Iteration count after applying the default.
    pub fn effective_iters(&self) -> usize {
        if self.iters == 0 {
            DEFAULT_CONJ_GRAD_ITERS
        } else {
            self.iters
        }
    }

    /// Rejects configurations the solver cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(NpgError::invalid_config(
                "queue capacity must be at least 1",
            ));
        }
        Ok(())
    }
}
