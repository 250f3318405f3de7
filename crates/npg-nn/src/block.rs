//! Concrete policy blocks.

use crate::layer::{Dense, Net};
use crate::policy::{ParamVars, Policy, StepOutput};
use npg_autodiff::{Graph, NodeId};
use npg_core::error::{NpgError, Result};
use npg_core::gradient::Parameter;
use npg_core::types::{Numeric, Tensor};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// A feed-forward network applied independently at every timestep.
#[derive(Debug)]
pub struct LayerBlock {
    net: Net,
}

impl LayerBlock {
    /// Wraps a network. The network needs at least one dense layer.
    pub fn new(net: Net) -> Result<Self> {
        if net.input_size().is_none() {
            return Err(NpgError::invalid_config(
                "a layer block needs at least one dense layer",
            ));
        }
        Ok(Self { net })
    }

    /// The wrapped network.
    pub fn net(&self) -> &Net {
        &self.net
    }
}

impl Policy for LayerBlock {
    fn parameters(&self) -> Vec<&Parameter> {
        self.net.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.net.parameters_mut()
    }

    fn input_size(&self) -> usize {
        self.net.input_size().unwrap_or(0)
    }

    fn output_size(&self) -> usize {
        self.net.output_size().unwrap_or(0)
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            net: self.net.duplicate(),
        })
    }

    fn step<T: Numeric>(
        &self,
        graph: &Graph<T>,
        vars: &ParamVars,
        input: NodeId,
        _state: Option<NodeId>,
    ) -> Result<StepOutput> {
        Ok(StepOutput {
            output: self.net.apply(graph, vars, input)?,
            state: None,
        })
    }
}

/// An Elman recurrent block.
///
/// ```text
/// h' = tanh(x · Wx + h · Wh + b)
/// y  = h' · Wo + c
/// ```
#[derive(Debug)]
pub struct ElmanBlock {
    /// Input to hidden projection with hidden biases
    pub input: Dense,
    /// `hidden x hidden` recurrent weights
    pub recurrent: Parameter,
    /// Hidden to output projection
    pub output: Dense,
}

impl ElmanBlock {
    /// Creates a block with Gaussian-initialized weights.
    pub fn new<R: Rng + ?Sized>(
        rng: &mut R,
        input_size: usize,
        hidden_size: usize,
        output_size: usize,
    ) -> Self {
        let std_dev = 1.0 / (hidden_size.max(1) as f64).sqrt();
        let recurrent = Tensor::from_fn(hidden_size, hidden_size, |_, _| {
            let v: f64 = StandardNormal.sample(&mut *rng);
            v * std_dev
        });
        Self {
            input: Dense::new(rng, input_size, hidden_size),
            recurrent: Parameter::named(recurrent, "recurrent"),
            output: Dense::new(rng, hidden_size, output_size),
        }
    }

    /// Width of the recurrent state.
    pub fn hidden_size(&self) -> usize {
        self.recurrent.value().nrows()
    }
}

impl Policy for ElmanBlock {
    fn parameters(&self) -> Vec<&Parameter> {
        vec![
            &self.input.weights,
            &self.input.biases,
            &self.recurrent,
            &self.output.weights,
            &self.output.biases,
        ]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![
            &mut self.input.weights,
            &mut self.input.biases,
            &mut self.recurrent,
            &mut self.output.weights,
            &mut self.output.biases,
        ]
    }

    fn input_size(&self) -> usize {
        self.input.input_size()
    }

    fn output_size(&self) -> usize {
        self.output.output_size()
    }

    fn state_size(&self) -> usize {
        self.hidden_size()
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            input: self.input.duplicate(),
            recurrent: self.recurrent.duplicate(),
            output: self.output.duplicate(),
        })
    }

    fn step<T: Numeric>(
        &self,
        graph: &Graph<T>,
        vars: &ParamVars,
        input: NodeId,
        state: Option<NodeId>,
    ) -> Result<StepOutput> {
        let state = state.ok_or_else(|| {
            NpgError::invalid_state("recurrent block stepped without a state")
        })?;
        let wh = vars.node(&self.recurrent)?;
        let projected = self.input.apply(graph, vars, input)?;
        let hidden = graph.tanh(graph.add(projected, graph.matmul(state, wh)));
        Ok(StepOutput {
            output: self.output.apply(graph, vars, hidden)?,
            state: Some(hidden),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Layer;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_layer_block_requires_dense() {
        let net = Net::new().with_layer(Layer::Tanh);
        assert!(LayerBlock::new(net).is_err());
    }

    #[test]
    fn test_elman_step() {
        let mut rng = StdRng::seed_from_u64(11);
        let block = ElmanBlock::new(&mut rng, 2, 3, 2);
        assert_eq!(block.state_size(), 3);
        assert_eq!(block.parameters().len(), 5);

        let graph = Graph::new();
        let vars = ParamVars::bind(&graph, &block.parameters());
        let x = graph.constant(Tensor::from_row_slice(1, 2, &[0.5, -1.0]));
        let h = graph.constant(Tensor::zeros(1, 3));
        let out = block.step(&graph, &vars, x, Some(h)).unwrap();

        let expected_hidden = (Tensor::from_row_slice(1, 2, &[0.5, -1.0])
            * block.input.weights.value()
            + block.input.biases.value())
        .map(f64::tanh);
        let hidden = graph.get_value(out.state.unwrap()).unwrap();
        for (a, b) in hidden.iter().zip(expected_hidden.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
        assert_eq!(graph.shape(out.output), Some((1, 2)));
    }

    #[test]
    fn test_elman_requires_state() {
        let mut rng = StdRng::seed_from_u64(2);
        let block = ElmanBlock::new(&mut rng, 1, 2, 1);
        let graph: Graph = Graph::new();
        let vars = ParamVars::bind(&graph, &block.parameters());
        let x = graph.constant(Tensor::zeros(1, 1));
        assert!(matches!(
            block.step(&graph, &vars, x, None),
            Err(NpgError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_clone_preserves_values() {
        let mut rng = StdRng::seed_from_u64(5);
        let block = ElmanBlock::new(&mut rng, 2, 2, 2);
        let copy = block.try_clone().unwrap();
        for (a, b) in block.parameters().iter().zip(copy.parameters()) {
            assert_ne!(a.id(), b.id());
            assert_eq!(a.value(), b.value());
        }
    }
}
