//! Broadcasting support for tensor operations.
//!
//! Two-dimensional broadcasting only: a dimension of size 1 is repeated to
//! match the other operand. The common case is adding a `1 x n` bias row to
//! an `m x n` batch.

use crate::ops::{column_sums, elementwise, row_sums, Op};
use npg_core::error::{NpgError, Result};
use npg_core::types::{DMatrix, Numeric};

/// Result of a broadcast operation.
#[derive(Debug, Clone)]
pub struct BroadcastResult<T: Numeric> {
    /// The broadcasted tensors
    pub tensors: Vec<DMatrix<T>>,
    /// The output shape after broadcasting
    pub output_shape: (usize, usize),
    /// Information needed to reverse the broadcast in backward pass
    pub broadcast_info: Vec<BroadcastInfo>,
}

/// Information about how a tensor was broadcasted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastInfo {
    /// Original shape of the tensor
    pub original_shape: (usize, usize),
    /// Axes that were repeated, with the repeat count
    pub repeated_axes: Vec<(usize, usize)>,
}

/// Broadcasts two tensors to a common shape.
pub fn broadcast_binary<T: Numeric>(a: &DMatrix<T>, b: &DMatrix<T>) -> Result<BroadcastResult<T>> {
    let output_shape = broadcast_shape(a.shape(), b.shape())?;

    let (broadcast_a, info_a) = broadcast_to(a, output_shape)?;
    let (broadcast_b, info_b) = broadcast_to(b, output_shape)?;

    Ok(BroadcastResult {
        tensors: vec![broadcast_a, broadcast_b],
        output_shape,
        broadcast_info: vec![info_a, info_b],
    })
}

fn broadcast_dim(a: usize, b: usize) -> Option<usize> {
    if a == b {
        Some(a)
    } else if a == 1 {
        Some(b)
    } else if b == 1 {
        Some(a)
    } else {
        None
    }
}

/// Computes the output shape for broadcasting two shapes.
pub fn broadcast_shape(shape_a: (usize, usize), shape_b: (usize, usize)) -> Result<(usize, usize)> {
    match (
        broadcast_dim(shape_a.0, shape_b.0),
        broadcast_dim(shape_a.1, shape_b.1),
    ) {
        (Some(rows), Some(cols)) => Ok((rows, cols)),
        _ => Err(NpgError::shape_mismatch(
            format!("a shape broadcastable with {:?}", shape_a),
            format!("{:?}", shape_b),
        )),
    }
}

/// Broadcasts a tensor to a target shape.
pub fn broadcast_to<T: Numeric>(
    tensor: &DMatrix<T>,
    target_shape: (usize, usize),
) -> Result<(DMatrix<T>, BroadcastInfo)> {
    let original_shape = tensor.shape();
    let (orig_rows, orig_cols) = original_shape;
    let (target_rows, target_cols) = target_shape;

    let mut repeated_axes = Vec::new();
    if orig_rows != target_rows {
        if orig_rows != 1 {
            return Err(NpgError::shape_mismatch(
                format!("{:?}", target_shape),
                format!("{:?}", original_shape),
            ));
        }
        repeated_axes.push((0, target_rows));
    }
    if orig_cols != target_cols {
        if orig_cols != 1 {
            return Err(NpgError::shape_mismatch(
                format!("{:?}", target_shape),
                format!("{:?}", original_shape),
            ));
        }
        repeated_axes.push((1, target_cols));
    }

    let result = if repeated_axes.is_empty() {
        tensor.clone()
    } else {
        DMatrix::from_fn(target_rows, target_cols, |i, j| {
            let r = if orig_rows == 1 { 0 } else { i };
            let c = if orig_cols == 1 { 0 } else { j };
            tensor[(r, c)]
        })
    };

    Ok((
        result,
        BroadcastInfo {
            original_shape,
            repeated_axes,
        },
    ))
}

/// Reverses a broadcast operation for the backward pass.
///
/// This sums over the axes that were broadcasted to get gradients
/// in the original shape.
pub fn unbroadcast<T: Numeric>(grad: &DMatrix<T>, info: &BroadcastInfo) -> DMatrix<T> {
    let mut result = grad.clone();
    for &(axis, _repeat_count) in info.repeated_axes.iter().rev() {
        result = match axis {
            0 => column_sums(&result),
            _ => row_sums(&result),
        };
    }
    result
}

fn broadcast_operands<T: Numeric>(name: &str, inputs: &[DMatrix<T>]) -> BroadcastResult<T> {
    assert_eq!(inputs.len(), 2, "{} requires exactly 2 inputs", name);
    broadcast_binary(&inputs[0], &inputs[1])
        .unwrap_or_else(|e| panic!("{}: {}", name, e))
}

/// Broadcast-aware element-wise addition.
#[derive(Debug, Clone)]
pub struct BroadcastAdd;

impl<T: Numeric> Op<T> for BroadcastAdd {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        let b = broadcast_operands("BroadcastAdd", inputs);
        elementwise(&b.tensors[0], &b.tensors[1], |x, y| x + y)
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        let b = broadcast_operands("BroadcastAdd", inputs);
        vec![
            unbroadcast(grad_output, &b.broadcast_info[0]),
            unbroadcast(grad_output, &b.broadcast_info[1]),
        ]
    }

    fn name(&self) -> &str {
        "BroadcastAdd"
    }
}

/// Broadcast-aware element-wise multiplication.
#[derive(Debug, Clone)]
pub struct BroadcastMultiply;

impl<T: Numeric> Op<T> for BroadcastMultiply {
    fn forward(&self, inputs: &[DMatrix<T>]) -> DMatrix<T> {
        let b = broadcast_operands("BroadcastMultiply", inputs);
        elementwise(&b.tensors[0], &b.tensors[1], |x, y| x * y)
    }

    fn backward(
        &self,
        grad_output: &DMatrix<T>,
        inputs: &[DMatrix<T>],
        _output: &DMatrix<T>,
    ) -> Vec<DMatrix<T>> {
        let b = broadcast_operands("BroadcastMultiply", inputs);
        let grad_a = elementwise(grad_output, &b.tensors[1], |g, y| g * y);
        let grad_b = elementwise(grad_output, &b.tensors[0], |g, x| g * x);
        vec![
            unbroadcast(&grad_a, &b.broadcast_info[0]),
            unbroadcast(&grad_b, &b.broadcast_info[1]),
        ]
    }

    fn name(&self) -> &str {
        "BroadcastMultiply"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npg_core::Tensor;

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape((3, 4), (1, 4)).unwrap(), (3, 4));
        assert_eq!(broadcast_shape((3, 1), (3, 4)).unwrap(), (3, 4));
        assert_eq!(broadcast_shape((1, 1), (2, 5)).unwrap(), (2, 5));
        assert!(broadcast_shape((3, 4), (2, 4)).is_err());
    }

    #[test]
    fn test_broadcast_add_bias_row() {
        let x = Tensor::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let bias = Tensor::from_row_slice(1, 3, &[10.0, 20.0, 30.0]);
        let out = BroadcastAdd.forward(&[x.clone(), bias.clone()]);
        assert_eq!(
            out,
            Tensor::from_row_slice(2, 3, &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0])
        );

        let grads = BroadcastAdd.backward(&Tensor::from_element(2, 3, 1.0), &[x, bias], &out);
        assert_eq!(grads[0], Tensor::from_element(2, 3, 1.0));
        assert_eq!(grads[1], Tensor::from_element(1, 3, 2.0));
    }

    #[test]
    fn test_broadcast_multiply_column() {
        let x = Tensor::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let scale = Tensor::from_row_slice(2, 1, &[2.0, -1.0]);
        let out = BroadcastMultiply.forward(&[x.clone(), scale.clone()]);
        assert_eq!(out, Tensor::from_row_slice(2, 2, &[2.0, 4.0, -3.0, -4.0]));

        let grads =
            BroadcastMultiply.backward(&Tensor::from_element(2, 2, 1.0), &[x, scale], &out);
        assert_eq!(grads[0], Tensor::from_row_slice(2, 2, &[2.0, 2.0, -1.0, -1.0]));
        assert_eq!(grads[1], Tensor::from_row_slice(2, 1, &[3.0, 7.0]));
    }

    #[test]
    fn test_unbroadcast_scalar() {
        let grad = Tensor::from_element(3, 2, 1.0);
        let info = BroadcastInfo {
            original_shape: (1, 1),
            repeated_axes: vec![(0, 3), (1, 2)],
        };
        assert_eq!(unbroadcast(&grad, &info), Tensor::from_element(1, 1, 6.0));
    }
}
