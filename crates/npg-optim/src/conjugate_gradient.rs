//! Conjugate Gradients over parameter-indexed vectors.
//!
//! Solves `A x = b` for a symmetric positive (semi-)definite operator `A`
//! that is only available through products `A v`. Vectors are
//! [`ParameterGradient`]s: the inner product sums the element-wise dot
//! products of all entries, and scaling and addition act per parameter.
//!
//! The iteration count is the only stopping rule. The loop ends early only
//! when the residual is exactly zero or a search direction has zero
//! curvature, since neither admits another step.

use log::{debug, warn};
use npg_core::config::DEFAULT_CONJ_GRAD_ITERS;
use npg_core::error::{NpgError, Result};
use npg_core::gradient::ParameterGradient;

/// An implicit linear map on parameter-indexed vectors.
pub trait LinearOperator {
    /// Computes `A v`.
    fn apply(&self, v: &ParameterGradient) -> Result<ParameterGradient>;
}

impl<F> LinearOperator for F
where
    F: Fn(&ParameterGradient) -> Result<ParameterGradient>,
{
    fn apply(&self, v: &ParameterGradient) -> Result<ParameterGradient> {
        self(v)
    }
}

/// Fixed-iteration Conjugate Gradient solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConjugateGradient {
    iters: usize,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self::new(DEFAULT_CONJ_GRAD_ITERS)
    }
}

impl ConjugateGradient {
    /// Creates a solver running `iters` iterations.
    pub fn new(iters: usize) -> Self {
        Self { iters }
    }

    /// Number of iterations each solve runs.
    pub fn iters(&self) -> usize {
        self.iters
    }

    /// Solves `op(x) = rhs` starting from `x = 0`.
    ///
    /// Each iteration evaluates `op` once. An empty `rhs` returns an empty
    /// solution without evaluating `op`.
    pub fn solve<L>(&self, op: &L, rhs: &ParameterGradient) -> Result<ParameterGradient>
    where
        L: LinearOperator + ?Sized,
    {
        self.solve_from(op, rhs, None)
    }

    /// Solves `op(x) = rhs`, refining `initial` when given.
    ///
    /// A starting estimate costs one extra evaluation of `op` to form the
    /// initial residual. It must have the same entries as `rhs`.
    pub fn solve_from<L>(
        &self,
        op: &L,
        rhs: &ParameterGradient,
        initial: Option<&ParameterGradient>,
    ) -> Result<ParameterGradient>
    where
        L: LinearOperator + ?Sized,
    {
        if rhs.is_empty() {
            return Ok(ParameterGradient::new());
        }

        let (mut x, mut residual) = match initial {
            Some(start) => {
                check_same_entries(rhs, start)?;
                let mut residual = rhs.clone();
                residual.add_scaled(-1.0, &op.apply(start)?);
                (start.clone(), residual)
            }
            None => (rhs.zeros_like(), rhs.clone()),
        };
        let mut direction = residual.clone();
        let mut rr = residual.dot(&residual);

        for i in 0..self.iters {
            if rr == 0.0 {
                debug!("conjugate gradients converged exactly after {} iterations", i);
                break;
            }
            let product = op.apply(&direction)?;
            let curvature = direction.dot(&product);
            if curvature == 0.0 {
                warn!("zero curvature along search direction at iteration {}", i);
                break;
            }
            let alpha = rr / curvature;
            x.add_scaled(alpha, &direction);
            residual.add_scaled(-alpha, &product);

            let next_rr = residual.dot(&residual);
            debug!("cg iteration {}: residual norm {:.6e}", i, next_rr.sqrt());
            direction.scale(next_rr / rr);
            direction.add_scaled(1.0, &residual);
            rr = next_rr;
        }
        Ok(x)
    }
}

fn check_same_entries(rhs: &ParameterGradient, start: &ParameterGradient) -> Result<()> {
    if rhs.len() != start.len() {
        return Err(NpgError::shape_mismatch(
            format!("{} entries", rhs.len()),
            format!("{} entries", start.len()),
        ));
    }
    for (id, t) in rhs {
        let s = start.get(*id).ok_or_else(|| NpgError::unknown_parameter(id))?;
        if s.shape() != t.shape() {
            return Err(NpgError::shape_mismatch(
                format!("{:?} for {}", t.shape(), id),
                format!("{:?}", s.shape()),
            ));
        }
    }
    Ok(())
}
