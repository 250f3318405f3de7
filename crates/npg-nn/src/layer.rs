//! Feed-forward layers.

use crate::policy::ParamVars;
use npg_autodiff::{Graph, NodeId};
use npg_core::error::{NpgError, Result};
use npg_core::gradient::Parameter;
use npg_core::types::{Numeric, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Fully connected layer computing `x · W + b`.
#[derive(Debug)]
pub struct Dense {
    /// `input_size x output_size`
    pub weights: Parameter,
    /// `1 x output_size`
    pub biases: Parameter,
}

impl Dense {
    /// Creates a layer with weights drawn from `N(0, 1/input_size)` and zero
    /// biases.
    pub fn new<R: Rng + ?Sized>(rng: &mut R, input_size: usize, output_size: usize) -> Self {
        let std_dev = 1.0 / (input_size.max(1) as f64).sqrt();
        let weights = Tensor::from_fn(input_size, output_size, |_, _| {
            let v: f64 = StandardNormal.sample(&mut *rng);
            v * std_dev
        });
        Self {
            weights: Parameter::named(weights, "weights"),
            biases: Parameter::named(Tensor::zeros(1, output_size), "biases"),
        }
    }

    /// Creates a layer from explicit values.
    pub fn from_values(weights: Tensor, biases: Tensor) -> Result<Self> {
        if biases.nrows() != 1 || biases.ncols() != weights.ncols() {
            return Err(NpgError::shape_mismatch(
                format!("(1, {})", weights.ncols()),
                format!("{:?}", biases.shape()),
            ));
        }
        Ok(Self {
            weights: Parameter::named(weights, "weights"),
            biases: Parameter::named(biases, "biases"),
        })
    }

    /// Number of input columns.
    pub fn input_size(&self) -> usize {
        self.weights.value().nrows()
    }

    /// Number of output columns.
    pub fn output_size(&self) -> usize {
        self.weights.value().ncols()
    }

    /// Records the layer on `graph`.
    pub fn apply<T: Numeric>(&self, graph: &Graph<T>, vars: &ParamVars, x: NodeId) -> Result<NodeId> {
        let w = vars.node(&self.weights)?;
        let b = vars.node(&self.biases)?;
        Ok(graph.broadcast_add(graph.matmul(x, w), b))
    }

    /// Copies the layer under fresh parameter identities.
    pub fn duplicate(&self) -> Self {
        Self {
            weights: self.weights.duplicate(),
            biases: self.biases.duplicate(),
        }
    }
}

/// One stage of a feed-forward network.
#[derive(Debug)]
pub enum Layer {
    Dense(Dense),
    Tanh,
    Sigmoid,
    ReLU,
}

impl Layer {
    /// Records the layer on `graph`.
    pub fn apply<T: Numeric>(&self, graph: &Graph<T>, vars: &ParamVars, x: NodeId) -> Result<NodeId> {
        match self {
            Layer::Dense(dense) => dense.apply(graph, vars, x),
            Layer::Tanh => Ok(graph.tanh(x)),
            Layer::Sigmoid => Ok(graph.sigmoid(x)),
            Layer::ReLU => Ok(graph.relu(x)),
        }
    }

    fn duplicate(&self) -> Self {
        match self {
            Layer::Dense(dense) => Layer::Dense(dense.duplicate()),
            Layer::Tanh => Layer::Tanh,
            Layer::Sigmoid => Layer::Sigmoid,
            Layer::ReLU => Layer::ReLU,
        }
    }
}

/// A stack of layers applied in order.
#[derive(Debug, Default)]
pub struct Net {
    layers: Vec<Layer>,
}

impl Net {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer.
    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// The layers in application order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Width of the first dense layer's input.
    pub fn input_size(&self) -> Option<usize> {
        self.layers.iter().find_map(|l| match l {
            Layer::Dense(d) => Some(d.input_size()),
            _ => None,
        })
    }

    /// Width of the last dense layer's output.
    pub fn output_size(&self) -> Option<usize> {
        self.layers.iter().rev().find_map(|l| match l {
            Layer::Dense(d) => Some(d.output_size()),
            _ => None,
        })
    }

    /// Every dense layer's parameters, in layer order.
    pub fn parameters(&self) -> Vec<&Parameter> {
        self.layers
            .iter()
            .filter_map(|l| match l {
                Layer::Dense(d) => Some([&d.weights, &d.biases]),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Mutable access to the parameters, in the same order.
    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers
            .iter_mut()
            .filter_map(|l| match l {
                Layer::Dense(d) => Some([&mut d.weights, &mut d.biases]),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Records every layer on `graph`.
    pub fn apply<T: Numeric>(&self, graph: &Graph<T>, vars: &ParamVars, x: NodeId) -> Result<NodeId> {
        self.layers
            .iter()
            .try_fold(x, |node, layer| layer.apply(graph, vars, node))
    }

    /// Copies the network under fresh parameter identities.
    pub fn duplicate(&self) -> Self {
        Self {
            layers: self.layers.iter().map(Layer::duplicate).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_dense_forward() {
        let dense = Dense::from_values(
            Tensor::from_row_slice(2, 1, &[1.0, -2.0]),
            Tensor::from_row_slice(1, 1, &[0.5]),
        )
        .unwrap();
        let graph = Graph::new();
        let vars = ParamVars::bind(&graph, &[&dense.weights, &dense.biases]);
        let x = graph.constant(Tensor::from_row_slice(2, 2, &[1.0, 1.0, 3.0, 1.0]));
        let y = dense.apply(&graph, &vars, x).unwrap();
        assert_eq!(
            graph.get_value(y).unwrap(),
            Tensor::from_row_slice(2, 1, &[-0.5, 1.5])
        );
    }

    #[test]
    fn test_bias_shape_checked() {
        let err = Dense::from_values(Tensor::zeros(2, 3), Tensor::zeros(1, 2)).unwrap_err();
        assert!(matches!(err, NpgError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_gaussian_init_scale() {
        let mut rng = StdRng::seed_from_u64(7);
        let dense = Dense::new(&mut rng, 400, 50);
        let w = dense.weights.value();
        let mean = w.mean();
        let var = w.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / w.len() as f64;
        assert_relative_eq!(var, 1.0 / 400.0, max_relative = 0.1);
        assert!(dense.biases.value().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_net_sizes_and_duplicate() {
        let mut rng = StdRng::seed_from_u64(1);
        let net = Net::new()
            .with_layer(Layer::Dense(Dense::new(&mut rng, 3, 2)))
            .with_layer(Layer::Tanh)
            .with_layer(Layer::Dense(Dense::new(&mut rng, 2, 4)));
        assert_eq!(net.input_size(), Some(3));
        assert_eq!(net.output_size(), Some(4));
        assert_eq!(net.parameters().len(), 4);

        let copy = net.duplicate();
        for (a, b) in net.parameters().iter().zip(copy.parameters()) {
            assert_ne!(a.id(), b.id());
            assert_eq!(a.value(), b.value());
        }
    }

    #[test]
    fn test_missing_binding() {
        let mut rng = StdRng::seed_from_u64(3);
        let dense = Dense::new(&mut rng, 2, 2);
        let graph: Graph = Graph::new();
        let x = graph.constant(Tensor::zeros(1, 2));
        assert!(dense.apply(&graph, &ParamVars::new(), x).is_err());
    }
}
