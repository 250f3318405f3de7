//! Property tests for dual-number arithmetic and parameter-indexed vectors.

use approx::assert_relative_eq;
use npg_core::prelude::*;
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_dual_matches_finite_difference(x in 0.1f64..3.0, v in -2.0f64..2.0) {
        // f(x) = exp(x) * tanh(x) / x
        let f = |x: f64| x.exp() * x.tanh() / x;
        let d = Dual::new(x, v);
        let y = Numeric::exp(d) * Numeric::tanh(d) / d;

        let h = 1e-6;
        let fd = (f(x + h) - f(x - h)) / (2.0 * h) * v;
        prop_assert!((y.value - f(x)).abs() < 1e-12);
        prop_assert!((y.deriv - fd).abs() < 1e-5 * (1.0 + fd.abs()));
    }

    #[test]
    fn prop_dual_constants_carry_no_tangent(a in -10.0f64..10.0, b in -10.0f64..10.0) {
        let c = Dual::constant(a) * Dual::constant(b) + Dual::constant(a);
        prop_assert_eq!(c.deriv, 0.0);
    }

    #[test]
    fn prop_gradient_dot_is_symmetric(
        xs in proptest::collection::vec(-5.0f64..5.0, 6),
        ys in proptest::collection::vec(-5.0f64..5.0, 6),
    ) {
        let a = Parameter::new(Tensor::zeros(2, 2));
        let b = Parameter::new(Tensor::zeros(1, 2));
        let g: ParameterGradient = vec![
            (a.id(), Tensor::from_row_slice(2, 2, &xs[..4])),
            (b.id(), Tensor::from_row_slice(1, 2, &xs[4..])),
        ]
        .into_iter()
        .collect();
        let h: ParameterGradient = vec![
            (a.id(), Tensor::from_row_slice(2, 2, &ys[..4])),
            (b.id(), Tensor::from_row_slice(1, 2, &ys[4..])),
        ]
        .into_iter()
        .collect();
        let expected: f64 = xs.iter().zip(&ys).map(|(x, y)| x * y).sum();
        prop_assert!((g.dot(&h) - h.dot(&g)).abs() < 1e-12);
        prop_assert!((g.dot(&h) - expected).abs() < 1e-9);
    }
}

#[test]
fn test_dual_chain_rule() {
    let x = Dual::new(0.3, 1.0);
    let y = Numeric::ln(Numeric::powf(x, 2.0) + Dual::constant(1.0));
    assert_relative_eq!(y.deriv, 2.0 * 0.3 / (0.09 + 1.0), epsilon = 1e-12);
}
