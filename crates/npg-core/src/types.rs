//! Type definitions and the arithmetic contract shared by all numeric modes.
//!
//! Policy application and the reverse-mode pass are written once, generic over
//! [`Numeric`]. Two modes implement the contract:
//!
//! - `f64`: plain values, used for the vanilla gradient and cached outputs.
//! - [`Dual`](crate::dual::Dual): a value with one directional derivative,
//!   used inside the Fisher-vector product.

use nalgebra::Scalar as NalgebraScalar;
use num_traits::{One, Zero};
use std::fmt::{Debug, Display};
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

/// Dense matrix over plain values.
///
/// Batches are stored with one row per present sequence and one column per
/// feature. Parameters and gradients use the same type.
pub type Tensor = nalgebra::DMatrix<f64>;

/// Dense matrix over an arbitrary numeric mode.
pub type DMatrix<T> = nalgebra::DMatrix<T>;

/// Arithmetic contract for numeric modes.
///
/// Anything written against this trait runs unchanged under plain and dual
/// arithmetic.
pub trait Numeric:
    NalgebraScalar
    + Copy
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + Display
    + Debug
    + Send
    + Sync
{
    /// Embed a plain constant (zero directional derivative).
    fn from_f64(v: f64) -> Self;

    /// The real (value) part.
    fn real(self) -> f64;

    /// Natural exponential.
    fn exp(self) -> Self;

    /// Natural logarithm.
    fn ln(self) -> Self;

    /// Hyperbolic tangent.
    fn tanh(self) -> Self;

    /// Square root.
    fn sqrt(self) -> Self;

    /// Power with a constant exponent.
    fn powf(self, exponent: f64) -> Self;

    /// Multiply by a plain constant.
    fn scale(self, factor: f64) -> Self {
        self * Self::from_f64(factor)
    }
}

impl Numeric for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }

    fn real(self) -> f64 {
        self
    }

    fn exp(self) -> Self {
        f64::exp(self)
    }

    fn ln(self) -> Self {
        f64::ln(self)
    }

    fn tanh(self) -> Self {
        f64::tanh(self)
    }

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    fn powf(self, exponent: f64) -> Self {
        f64::powf(self, exponent)
    }
}

/// Lift a plain matrix into any numeric mode with zero derivatives.
pub fn lift<T: Numeric>(values: &Tensor) -> DMatrix<T> {
    values.map(T::from_f64)
}

/// Drop every derivative, keeping only the real parts.
pub fn real_part<T: Numeric>(values: &DMatrix<T>) -> Tensor {
    values.map(|v| v.real())
}

/// Numerical constants.
pub mod constants {
    /// `ln(2π)`, used by Gaussian densities.
    pub const LN_2PI: f64 = 1.837_877_066_409_345_3;
}
