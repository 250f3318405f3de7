//! Backward pass implementation for automatic differentiation.
//!
//! This module implements the backpropagation algorithm to compute
//! gradients through the computation graph. Running it on a
//! `Graph<Dual>` propagates a tangent alongside every gradient, which is
//! how Hessian-vector style products are obtained without a second pass.

use crate::graph::{Graph, NodeId};
use npg_core::types::{DMatrix, Numeric, Tensor};
use std::collections::HashMap;

/// Type alias for gradient storage.
pub type GradientMap<T = f64> = HashMap<NodeId, DMatrix<T>>;

/// Performs backward pass (backpropagation) through the graph.
///
/// # Arguments
/// * `graph` - The computation graph
/// * `output_node` - The node to compute gradients from
/// * `grad_output` - The initial gradient (ones shaped like the output when `None`)
///
/// # Returns
/// A map from node IDs to their gradients. Only nodes that require a
/// gradient and are reachable from the output appear in it.
pub fn backward<T: Numeric>(
    graph: &Graph<T>,
    output_node: NodeId,
    grad_output: Option<DMatrix<T>>,
) -> GradientMap<T> {
    let mut gradients = GradientMap::new();

    let initial_grad = match grad_output {
        Some(grad) => grad,
        None => match graph.shape(output_node) {
            Some((rows, cols)) => DMatrix::from_element(rows, cols, T::one()),
            None => return gradients,
        },
    };
    gradients.insert(output_node, initial_grad);

    // Node ids are assigned in evaluation order, so walking them backwards
    // visits every consumer before its inputs.
    for node_id in graph.topological_order().into_iter().rev() {
        if node_id > output_node {
            continue;
        }
        let node_grad = match gradients.get(&node_id) {
            Some(grad) => grad.clone(),
            None => continue,
        };

        let node_rc = match graph.get_node(node_id) {
            Some(n) => n,
            None => continue,
        };
        let node = node_rc.borrow();
        if node.is_leaf() || !node.requires_grad {
            continue;
        }
        let op = match &node.op {
            Some(op) => op,
            None => continue,
        };

        let input_values: Vec<DMatrix<T>> = node
            .inputs
            .iter()
            .filter_map(|&input_id| graph.get_value(input_id))
            .collect();
        if input_values.len() != node.inputs.len() {
            continue;
        }

        let input_grads = op.backward(&node_grad, &input_values, &node.value);

        for (&input_id, grad) in node.inputs.iter().zip(input_grads) {
            if !graph.requires_grad(input_id) {
                continue;
            }
            gradients
                .entry(input_id)
                .and_modify(|g| *g = g.zip_map(&grad, |a, b| a + b))
                .or_insert(grad);
        }
    }

    gradients
}

/// Computes the gradient of a scalar output with respect to specified inputs.
///
/// # Returns
/// A map containing gradients for the requested input nodes
pub fn grad<T: Numeric>(
    graph: &Graph<T>,
    output_node: NodeId,
    input_nodes: &[NodeId],
) -> GradientMap<T> {
    let mut all_grads = backward(graph, output_node, None);
    input_nodes
        .iter()
        .filter_map(|id| all_grads.remove(id).map(|g| (*id, g)))
        .collect()
}

/// Checks gradients using central finite differences.
///
/// `build` records a scalar function of its input variable on a fresh graph
/// and returns the output node. The function is rebuilt for every
/// perturbation.
///
/// # Returns
/// The maximum relative error between analytical and numerical gradients
pub fn check_gradients<F>(value: &Tensor, build: F, epsilon: f64) -> f64
where
    F: Fn(&Graph<f64>, NodeId) -> NodeId,
{
    let evaluate = |input: Tensor| -> f64 {
        let graph = Graph::new();
        let x = graph.variable(input);
        let out = build(&graph, x.id);
        graph.get_value(out).map(|v| v[(0, 0)]).unwrap_or(f64::NAN)
    };

    let graph = Graph::new();
    let x = graph.variable(value.clone());
    let out = build(&graph, x.id);
    let analytical = grad(&graph, out, &[x.id])
        .remove(&x.id)
        .unwrap_or_else(|| Tensor::zeros(value.nrows(), value.ncols()));

    let mut max_error: f64 = 0.0;
    for i in 0..value.nrows() {
        for j in 0..value.ncols() {
            let mut plus = value.clone();
            plus[(i, j)] += epsilon;
            let mut minus = value.clone();
            minus[(i, j)] -= epsilon;

            let numerical = (evaluate(plus) - evaluate(minus)) / (2.0 * epsilon);
            let exact = analytical[(i, j)];
            let denom = numerical.abs().max(exact.abs()).max(1e-8);
            max_error = max_error.max((numerical - exact).abs() / denom);
        }
    }

    max_error
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use npg_core::Dual;

    #[test]
    fn test_backward_single_node() {
        let graph = Graph::new();
        let x = graph.variable(Tensor::from_element(2, 2, 3.0));

        let grads = backward(&graph, x.id, None);

        assert_eq!(grads.len(), 1);
        assert_eq!(grads[&x.id][(0, 0)], 1.0);
    }

    #[test]
    fn test_backward_chain() {
        let graph = Graph::new();

        // (x + y) * 2
        let x = graph.variable(Tensor::from_element(1, 1, 3.0));
        let y = graph.variable(Tensor::from_element(1, 1, 4.0));
        let two = graph.constant(Tensor::from_element(1, 1, 2.0));
        let sum = graph.add(x.id, y.id);
        let prod = graph.mul(sum, two);

        assert_eq!(graph.get_value(prod).unwrap()[(0, 0)], 14.0);

        let grads = backward(&graph, prod, None);
        assert_eq!(grads[&x.id][(0, 0)], 2.0);
        assert_eq!(grads[&y.id][(0, 0)], 2.0);
        assert!(!grads.contains_key(&two));
    }

    #[test]
    fn test_backward_relu() {
        let graph = Graph::new();
        let x = graph.variable(Tensor::from_row_slice(2, 2, &[-1.0, 2.0, -3.0, 4.0]));
        let relu_node = graph.relu(x.id);

        let grads = backward(&graph, relu_node, Some(Tensor::from_element(2, 2, 1.0)));

        let expected = Tensor::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 1.0]);
        assert_eq!(grads[&x.id], expected);
    }

    #[test]
    fn test_grad_function() {
        let graph = Graph::new();
        let x = graph.variable(Tensor::from_element(1, 1, 2.0));
        let y = graph.variable(Tensor::from_element(1, 1, 3.0));
        let z = graph.add(x.id, y.id);

        let grads = grad(&graph, z, &[x.id]);

        assert_eq!(grads.len(), 1);
        assert!(grads.contains_key(&x.id));
        assert!(!grads.contains_key(&y.id));
    }

    #[test]
    fn test_gradient_accumulation() {
        let graph = Graph::new();
        let x = graph.variable(Tensor::from_element(1, 1, 5.0));
        let z = graph.add(x.id, x.id);

        let grads = backward(&graph, z, None);
        assert_eq!(grads[&x.id][(0, 0)], 2.0);
    }

    #[test]
    fn test_nodes_after_output_are_ignored() {
        let graph = Graph::new();
        let x = graph.variable(Tensor::from_element(1, 1, 2.0));
        let y = graph.scale(x.id, 3.0);
        let _later = graph.mul(y, y);

        let grads = backward(&graph, y, None);
        assert_eq!(grads[&x.id][(0, 0)], 3.0);
    }

    #[test]
    fn test_check_gradients_matmul_tanh() {
        let value = Tensor::from_row_slice(2, 2, &[0.3, -0.2, 0.5, 0.1]);
        let weights = Tensor::from_row_slice(2, 3, &[1.0, -1.0, 0.5, 0.2, 0.3, -0.4]);
        let error = check_gradients(
            &value,
            |g, x| {
                let w = g.constant(weights.clone());
                let h = g.tanh(g.matmul(x, w));
                g.mean(g.log_softmax(h))
            },
            1e-6,
        );
        assert!(error < 1e-5, "relative error {}", error);
    }

    #[test]
    fn test_dual_backward_gives_hessian_vector_product() {
        // f(x) = sum(x^3); grad = 3x^2; directional derivative of the
        // gradient along v is 6 x v.
        let graph: Graph<Dual> = Graph::new();
        let x = graph.variable(DMatrix::from_row_slice(
            1,
            2,
            &[Dual::new(1.5, 1.0), Dual::new(-0.5, 2.0)],
        ));
        let y = graph.sum(graph.pow(x.id, 3.0));

        let grads = backward(&graph, y, Some(DMatrix::from_element(1, 1, Dual::new(1.0, 0.0))));
        let g = &grads[&x.id];
        assert_relative_eq!(g[(0, 0)].value, 3.0 * 1.5 * 1.5, epsilon = 1e-12);
        assert_relative_eq!(g[(0, 0)].deriv, 6.0 * 1.5 * 1.0, epsilon = 1e-12);
        assert_relative_eq!(g[(0, 1)].deriv, 6.0 * -0.5 * 2.0, epsilon = 1e-12);
    }
}
