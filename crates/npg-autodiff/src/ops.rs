//! Operations for the computation graph.
//!
//! This module defines the operations that can be performed in the
//! computation graph, including their forward and backward computations.
//! Every operation is generic over the numeric mode, so the same backward
//! rule differentiates plain values and dual numbers alike.

use npg_core::types::{DMatrix, Numeric};
use std::fmt::Debug;

/// Trait for operations in the computation graph.
pub trait Op<T: Numeric>: Debug {
    /// Performs the forward computation.
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T>;

    /// Computes the gradient with respect to each input.
    ///
    /// # Arguments
    /// * `grad_output` - The gradient flowing from the output
    /// * `inputs` - The input values used in the forward pass
    /// * `output` - The output value from the forward pass
    ///
    /// # Returns
    /// A vector of gradients, one for each input
    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>>;

    /// Returns the name of this operation.
    fn name(&self) -> &str;
}

/// Enumeration of operation types for easier matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Add,
    Sub,
    Multiply,
    MatMul,
    Transpose,
    Sum,
    Mean,
    Pow,
    Exp,
    Log,
    Tanh,
    Sigmoid,
    ReLU,
    Negate,
    Scale,
    Shift,
    LogSoftmax,
    GatherRows,
    Columns,
}

pub(crate) fn elementwise<T: Numeric>(
    a: &DMatrix<T>,
    b: &DMatrix<T>,
    f: impl FnMut(T, T) -> T,
) -> DMatrix<T> {
    assert_eq!(a.shape(), b.shape(), "element-wise operands differ in shape");
    a.zip_map(b, f)
}

pub(crate) fn matmul<T: Numeric>(a: &DMatrix<T>, b: &DMatrix<T>) -> DMatrix<T> {
    assert_eq!(a.ncols(), b.nrows(), "matrix product dimensions disagree");
    DMatrix::from_fn(a.nrows(), b.ncols(), |i, j| {
        let mut acc = T::zero();
        for k in 0..a.ncols() {
            acc += a[(i, k)] * b[(k, j)];
        }
        acc
    })
}

pub(crate) fn sum_all<T: Numeric>(m: &DMatrix<T>) -> T {
    m.iter().fold(T::zero(), |acc, &x| acc + x)
}

pub(crate) fn column_sums<T: Numeric>(m: &DMatrix<T>) -> DMatrix<T> {
    DMatrix::from_fn(1, m.ncols(), |_, j| {
        (0..m.nrows()).fold(T::zero(), |acc, i| acc + m[(i, j)])
    })
}

pub(crate) fn row_sums<T: Numeric>(m: &DMatrix<T>) -> DMatrix<T> {
    DMatrix::from_fn(m.nrows(), 1, |i, _| {
        (0..m.ncols()).fold(T::zero(), |acc, j| acc + m[(i, j)])
    })
}

/// Element-wise addition operation.
#[derive(Debug, Clone)]
pub struct Add;

impl<T: Numeric> Op<T> for Add {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 2, "Add requires exactly 2 inputs");
        elementwise(&inputs[0], &inputs[1], |a, b| a + b)
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        _inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        vec![grad_output.clone(), grad_output.clone()]
    }

    fn name(&self) -> &str {
        "Add"
    }
}

/// Element-wise subtraction operation.
#[derive(Debug, Clone)]
pub struct Sub;

impl<T: Numeric> Op<T> for Sub {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 2, "Sub requires exactly 2 inputs");
        elementwise(&inputs[0], &inputs[1], |a, b| a - b)
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        _inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        vec![grad_output.clone(), grad_output.map(|g| -g)]
    }

    fn name(&self) -> &str {
        "Sub"
    }
}

/// Element-wise multiplication operation.
#[derive(Debug, Clone)]
pub struct Multiply;

impl<T: Numeric> Op<T> for Multiply {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 2, "Multiply requires exactly 2 inputs");
        elementwise(&inputs[0], &inputs[1], |a, b| a * b)
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        // d/dx (x * y) = y
        // d/dy (x * y) = x
        vec![
            elementwise(grad_output, &inputs[1], |g, y| g * y),
            elementwise(grad_output, &inputs[0], |g, x| g * x),
        ]
    }

    fn name(&self) -> &str {
        "Multiply"
    }
}

/// Matrix multiplication operation.
#[derive(Debug, Clone)]
pub struct MatMul;

impl<T: Numeric> Op<T> for MatMul {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 2, "MatMul requires exactly 2 inputs");
        matmul(&inputs[0], &inputs[1])
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        // d/dA (A * B) = grad_output * B^T
        // d/dB (A * B) = A^T * grad_output
        vec![
            matmul(grad_output, &inputs[1].transpose()),
            matmul(&inputs[0].transpose(), grad_output),
        ]
    }

    fn name(&self) -> &str {
        "MatMul"
    }
}

/// Matrix transpose operation.
#[derive(Debug, Clone)]
pub struct Transpose;

impl<T: Numeric> Op<T> for Transpose {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Transpose requires exactly 1 input");
        inputs[0].transpose()
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        _inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        vec![grad_output.transpose()]
    }

    fn name(&self) -> &str {
        "Transpose"
    }
}

/// Sum operation.
#[derive(Debug, Clone)]
pub struct Sum {
    /// Optional axis to sum along (None means sum all elements)
    pub axis: Option<usize>,
}

impl Sum {
    /// Creates a new Sum operation that sums all elements.
    pub fn all() -> Self {
        Self { axis: None }
    }

    /// Creates a new Sum operation along a specific axis.
    ///
    /// Axis 0 collapses rows into a `1 x ncols` result, axis 1 collapses
    /// columns into an `nrows x 1` result.
    pub fn along_axis(axis: usize) -> Self {
        assert!(axis < 2, "Sum axis must be 0 or 1");
        Self { axis: Some(axis) }
    }
}

impl<T: Numeric> Op<T> for Sum {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Sum requires exactly 1 input");
        let input = &inputs[0];
        match self.axis {
            None => DMatrix::from_element(1, 1, sum_all(input)),
            Some(0) => column_sums(input),
            Some(_) => row_sums(input),
        }
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        let (rows, cols) = inputs[0].shape();
        let grad = match self.axis {
            None => DMatrix::from_element(rows, cols, grad_output[(0, 0)]),
            Some(0) => DMatrix::from_fn(rows, cols, |_, j| grad_output[(0, j)]),
            Some(_) => DMatrix::from_fn(rows, cols, |i, _| grad_output[(i, 0)]),
        };
        vec![grad]
    }

    fn name(&self) -> &str {
        "Sum"
    }
}

/// Mean of all elements.
#[derive(Debug, Clone)]
pub struct Mean;

impl Mean {
    /// Creates a new Mean operation over all elements.
    pub fn all() -> Self {
        Mean
    }
}

impl<T: Numeric> Op<T> for Mean {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Mean requires exactly 1 input");
        let input = &inputs[0];
        assert!(!input.is_empty(), "Mean of an empty tensor");
        let n = input.len() as f64;
        DMatrix::from_element(1, 1, sum_all(input).scale(1.0 / n))
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        let (rows, cols) = inputs[0].shape();
        let n = (rows * cols) as f64;
        vec![DMatrix::from_element(
            rows,
            cols,
            grad_output[(0, 0)].scale(1.0 / n),
        )]
    }

    fn name(&self) -> &str {
        "Mean"
    }
}

/// Negation operation.
#[derive(Debug, Clone)]
pub struct Negate;

impl<T: Numeric> Op<T> for Negate {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Negate requires exactly 1 input");
        inputs[0].map(|x| -x)
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        _inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        vec![grad_output.map(|g| -g)]
    }

    fn name(&self) -> &str {
        "Negate"
    }
}

/// Multiplication by a plain constant.
#[derive(Debug, Clone)]
pub struct Scale {
    /// Constant multiplier
    pub factor: f64,
}

impl<T: Numeric> Op<T> for Scale {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Scale requires exactly 1 input");
        inputs[0].map(|x| x.scale(self.factor))
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        _inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        vec![grad_output.map(|g| g.scale(self.factor))]
    }

    fn name(&self) -> &str {
        "Scale"
    }
}

/// Addition of a plain constant.
#[derive(Debug, Clone)]
pub struct Shift {
    /// Constant added to every entry
    pub offset: f64,
}

impl<T: Numeric> Op<T> for Shift {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Shift requires exactly 1 input");
        let offset = T::from_f64(self.offset);
        inputs[0].map(|x| x + offset)
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        _inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        vec![grad_output.clone()]
    }

    fn name(&self) -> &str {
        "Shift"
    }
}

/// ReLU (Rectified Linear Unit) activation.
#[derive(Debug, Clone)]
pub struct ReLU;

impl<T: Numeric> Op<T> for ReLU {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "ReLU requires exactly 1 input");
        inputs[0].map(|x| if x.real() > 0.0 { x } else { T::zero() })
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        // Gradient is 1 where input > 0, else 0
        vec![elementwise(grad_output, &inputs[0], |g, x| {
            if x.real() > 0.0 {
                g
            } else {
                T::zero()
            }
        })]
    }

    fn name(&self) -> &str {
        "ReLU"
    }
}

/// Exponential operation.
#[derive(Debug, Clone)]
pub struct Exp;

impl<T: Numeric> Op<T> for Exp {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Exp requires exactly 1 input");
        inputs[0].map(|x| x.exp())
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        _inputs: &[DMatrix<T>],
        output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        // d/dx exp(x) = exp(x)
        vec![elementwise(grad_output, output, |g, y| g * y)]
    }

    fn name(&self) -> &str {
        "Exp"
    }
}

/// Natural logarithm operation.
#[derive(Debug, Clone)]
pub struct Log;

impl<T: Numeric> Op<T> for Log {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Log requires exactly 1 input");
        inputs[0].map(|x| x.ln())
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        // d/dx log(x) = 1/x
        vec![elementwise(grad_output, &inputs[0], |g, x| g / x)]
    }

    fn name(&self) -> &str {
        "Log"
    }
}

/// Power operation (x^n for constant n).
#[derive(Debug, Clone)]
pub struct Pow {
    /// Constant exponent
    pub exponent: f64,
}

impl<T: Numeric> Op<T> for Pow {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Pow requires exactly 1 input");
        inputs[0].map(|x| x.powf(self.exponent))
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        // d/dx x^n = n * x^(n-1)
        vec![elementwise(grad_output, &inputs[0], |g, x| {
            g * x.powf(self.exponent - 1.0).scale(self.exponent)
        })]
    }

    fn name(&self) -> &str {
        "Pow"
    }
}

/// Sigmoid activation function.
#[derive(Debug, Clone)]
pub struct Sigmoid;

impl<T: Numeric> Op<T> for Sigmoid {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Sigmoid requires exactly 1 input");
        inputs[0].map(|x| T::one() / (T::one() + (-x).exp()))
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        _inputs: &[DMatrix<T>],
        output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        // d/dx sigmoid(x) = sigmoid(x) * (1 - sigmoid(x))
        vec![elementwise(grad_output, output, |g, s| g * s * (T::one() - s))]
    }

    fn name(&self) -> &str {
        "Sigmoid"
    }
}

/// Hyperbolic tangent activation function.
#[derive(Debug, Clone)]
pub struct Tanh;

impl<T: Numeric> Op<T> for Tanh {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Tanh requires exactly 1 input");
        inputs[0].map(|x| x.tanh())
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        _inputs: &[DMatrix<T>],
        output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        // d/dx tanh(x) = 1 - tanh(x)^2
        vec![elementwise(grad_output, output, |g, t| g * (T::one() - t * t))]
    }

    fn name(&self) -> &str {
        "Tanh"
    }
}

/// Row-wise log-softmax.
///
/// Each row is shifted by its largest real part before exponentiation.
#[derive(Debug, Clone)]
pub struct LogSoftmax;

impl<T: Numeric> Op<T> for LogSoftmax {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "LogSoftmax requires exactly 1 input");
        let input = &inputs[0];
        let mut output = input.clone();
        for i in 0..input.nrows() {
            let max = (0..input.ncols())
                .map(|j| input[(i, j)].real())
                .fold(f64::NEG_INFINITY, f64::max);
            let shift = T::from_f64(max);
            let total = (0..input.ncols())
                .fold(T::zero(), |acc, j| acc + (input[(i, j)] - shift).exp());
            let log_norm = shift + total.ln();
            for j in 0..input.ncols() {
                output[(i, j)] = input[(i, j)] - log_norm;
            }
        }
        output
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        _inputs: &[DMatrix<T>],
        output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        // d/dx_j = g_j - softmax_j * sum_k g_k
        let totals = row_sums(grad_output);
        let grad = DMatrix::from_fn(output.nrows(), output.ncols(), |i, j| {
            grad_output[(i, j)] - output[(i, j)].exp() * totals[(i, 0)]
        });
        vec![grad]
    }

    fn name(&self) -> &str {
        "LogSoftmax"
    }
}

/// Assembles a matrix from rows of several inputs.
///
/// Output row `k` is row `sources[k].1` of input `sources[k].0`. All inputs
/// must share a column count. The backward pass scatters each output row
/// back to where it came from, summing rows that were picked more than once.
#[derive(Debug, Clone)]
pub struct GatherRows {
    /// `(input position, row)` for each output row
    pub sources: Vec<(usize, usize)>,
    /// Shared column count
    pub cols: usize,
}

impl<T: Numeric> Op<T> for GatherRows {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        for input in inputs {
            assert_eq!(input.ncols(), self.cols, "GatherRows inputs differ in width");
        }
        DMatrix::from_fn(self.sources.len(), self.cols, |k, j| {
            let (input, row) = self.sources[k];
            inputs[input][(row, j)]
        })
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        let mut grads: Vec<DMatrix<T>> = inputs
            .iter()
            .map(|x| DMatrix::from_element(x.nrows(), x.ncols(), T::zero()))
            .collect();
        for (k, &(input, row)) in self.sources.iter().enumerate() {
            for j in 0..self.cols {
                grads[input][(row, j)] += grad_output[(k, j)];
            }
        }
        grads
    }

    fn name(&self) -> &str {
        "GatherRows"
    }
}

/// Selects the contiguous column block `start..start + len`.
#[derive(Debug, Clone)]
pub struct Columns {
    /// First selected column
    pub start: usize,
    /// Number of selected columns
    pub len: usize,
}

impl<T: Numeric> Op<T> for Columns {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        assert_eq!(inputs.len(), 1, "Columns requires exactly 1 input");
        let input = &inputs[0];
        assert!(
            self.start + self.len <= input.ncols(),
            "column block out of range"
        );
        DMatrix::from_fn(input.nrows(), self.len, |i, j| input[(i, self.start + j)])
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        let (rows, cols) = inputs[0].shape();
        let grad = DMatrix::from_fn(rows, cols, |i, j| {
            if j >= self.start && j < self.start + self.len {
                grad_output[(i, j - self.start)]
            } else {
                T::zero()
            }
        });
        vec![grad]
    }

    fn name(&self) -> &str {
        "Columns"
    }
}
