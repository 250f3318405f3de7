//! Dual numbers for forward-mode differentiation.
//!
//! A [`Dual`] carries a value together with exactly one directional
//! derivative. Propagating duals through a computation yields the directional
//! derivative of every intermediate along the seeded direction.
//!
//! A matrix of duals is the Dual-Number Vector of the Fisher-vector product:
//! a value matrix paired with a single tangent matrix of the same shape. The
//! helpers below convert between the two representations.

use crate::types::{Numeric, Tensor};
use nalgebra::DMatrix;
use num_traits::{One, Zero};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

/// A value with one directional derivative.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Dual {
    /// The real value
    pub value: f64,
    /// The derivative along the seeded direction
    pub deriv: f64,
}

impl Dual {
    /// Creates a dual number.
    pub fn new(value: f64, deriv: f64) -> Self {
        Self { value, deriv }
    }

    /// Creates a dual number with zero derivative.
    pub fn constant(value: f64) -> Self {
        Self { value, deriv: 0.0 }
    }
}

impl fmt::Display for Dual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}ε", self.value, self.deriv)
    }
}

impl Add for Dual {
    type Output = Dual;

    fn add(self, rhs: Dual) -> Dual {
        Dual::new(self.value + rhs.value, self.deriv + rhs.deriv)
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Dual) {
        self.value += rhs.value;
        self.deriv += rhs.deriv;
    }
}

impl Sub for Dual {
    type Output = Dual;

    fn sub(self, rhs: Dual) -> Dual {
        Dual::new(self.value - rhs.value, self.deriv - rhs.deriv)
    }
}

impl Mul for Dual {
    type Output = Dual;

    fn mul(self, rhs: Dual) -> Dual {
        Dual::new(
            self.value * rhs.value,
            self.deriv * rhs.value + self.value * rhs.deriv,
        )
    }
}

impl Div for Dual {
    type Output = Dual;

    fn div(self, rhs: Dual) -> Dual {
        let denom = rhs.value * rhs.value;
        Dual::new(
            self.value / rhs.value,
            (self.deriv * rhs.value - self.value * rhs.deriv) / denom,
        )
    }
}

impl Neg for Dual {
    type Output = Dual;

    fn neg(self) -> Dual {
        Dual::new(-self.value, -self.deriv)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Dual::constant(0.0)
    }

    fn is_zero(&self) -> bool {
        self.value == 0.0 && self.deriv == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Dual::constant(1.0)
    }
}

impl Numeric for Dual {
    fn from_f64(v: f64) -> Self {
        Dual::constant(v)
    }

    fn real(self) -> f64 {
        self.value
    }

    fn exp(self) -> Self {
        let e = self.value.exp();
        Dual::new(e, self.deriv * e)
    }

    fn ln(self) -> Self {
        Dual::new(self.value.ln(), self.deriv / self.value)
    }

    fn tanh(self) -> Self {
        let t = self.value.tanh();
        Dual::new(t, self.deriv * (1.0 - t * t))
    }

    fn sqrt(self) -> Self {
        let s = self.value.sqrt();
        Dual::new(s, self.deriv / (2.0 * s))
    }

    fn powf(self, exponent: f64) -> Self {
        Dual::new(
            self.value.powf(exponent),
            self.deriv * exponent * self.value.powf(exponent - 1.0),
        )
    }

    fn scale(self, factor: f64) -> Self {
        Dual::new(self.value * factor, self.deriv * factor)
    }
}

/// Pairs a value matrix with its tangent matrix.
///
/// # Panics
///
/// Panics if the shapes differ.
pub fn dual_matrix(values: &Tensor, tangents: &Tensor) -> DMatrix<Dual> {
    assert_eq!(
        values.shape(),
        tangents.shape(),
        "values and tangents must share a shape"
    );
    values.zip_map(tangents, Dual::new)
}

/// Splits a dual matrix into its value and tangent parts.
pub fn split_dual(m: &DMatrix<Dual>) -> (Tensor, Tensor) {
    (m.map(|d| d.value), m.map(|d| d.deriv))
}

/// Extracts the tangent part of a dual matrix.
pub fn tangent_part(m: &DMatrix<Dual>) -> Tensor {
    m.map(|d| d.deriv)
}
