//! Applying a policy to a replayed input stream.
//!
//! A strategy walks the stream in timestep order, feeds each batch of
//! present sequences through [`Policy::step`] and records the outputs on a
//! caller-owned graph. The numeric mode of the graph decides whether the
//! outputs are plain values or carry a directional derivative.
//!
//! Recurrent state follows the presence masks: a slot present at both `t-1`
//! and `t` keeps its state row, a slot that becomes present starts from a
//! zero row, and a slot that drops out loses its row.

use crate::policy::{ParamVars, Policy};
use log::trace;
use npg_autodiff::{Graph, NodeId};
use npg_core::error::{NpgError, Result};
use npg_core::replay::{RolloutBatch, Tape};
use npg_core::types::{lift, DMatrix, Numeric};

/// Output of one timestep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStep {
    /// Distribution parameters, one row per present sequence
    pub output: NodeId,
    /// Presence mask of the timestep
    pub present: Vec<bool>,
}

impl PolicyStep {
    /// Number of present sequences.
    pub fn num_present(&self) -> usize {
        self.present.iter().filter(|&&p| p).count()
    }
}

/// How a policy is unrolled over a sequence.
pub trait ApplyStrategy: Send + Sync {
    /// Records the policy's outputs for every timestep of `inputs`.
    fn apply<T, P, I>(
        &self,
        graph: &Graph<T>,
        policy: &P,
        vars: &ParamVars,
        inputs: I,
    ) -> Result<Vec<PolicyStep>>
    where
        T: Numeric,
        P: Policy,
        I: Iterator<Item = Result<RolloutBatch>>;
}

/// Plain back-propagation through time over the whole sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bptt;

impl ApplyStrategy for Bptt {
    fn apply<T, P, I>(
        &self,
        graph: &Graph<T>,
        policy: &P,
        vars: &ParamVars,
        inputs: I,
    ) -> Result<Vec<PolicyStep>>
    where
        T: Numeric,
        P: Policy,
        I: Iterator<Item = Result<RolloutBatch>>,
    {
        unroll(graph, policy, vars, inputs, None)
    }
}

/// Back-propagation through time truncated to a fixed window.
///
/// The recurrent state is detached every `window` timesteps, so gradients
/// never flow further back than one window.
///
/// Under dual arithmetic a detached state keeps its tangent: directional
/// derivatives still cross window boundaries while adjoints stop at them.
/// The Fisher-vector product computed with this strategy is therefore not
/// exactly symmetric.
#[derive(Debug, Clone, Copy)]
pub struct TruncatedBptt {
    window: usize,
}

impl TruncatedBptt {
    /// Creates a strategy with the given window length.
    pub fn new(window: usize) -> Result<Self> {
        if window == 0 {
            return Err(NpgError::invalid_config("truncation window must be at least 1"));
        }
        Ok(Self { window })
    }

    /// Number of timesteps between detachments.
    pub fn window(&self) -> usize {
        self.window
    }
}

impl ApplyStrategy for TruncatedBptt {
    fn apply<T, P, I>(
        &self,
        graph: &Graph<T>,
        policy: &P,
        vars: &ParamVars,
        inputs: I,
    ) -> Result<Vec<PolicyStep>>
    where
        T: Numeric,
        P: Policy,
        I: Iterator<Item = Result<RolloutBatch>>,
    {
        unroll(graph, policy, vars, inputs, Some(self.window))
    }
}

/// Reads the whole tape and applies the policy with `strategy`.
pub fn apply_to_tape<T, P, S>(
    graph: &Graph<T>,
    policy: &P,
    vars: &ParamVars,
    strategy: &S,
    tape: &dyn Tape,
) -> Result<Vec<PolicyStep>>
where
    T: Numeric,
    P: Policy,
    S: ApplyStrategy,
{
    strategy.apply(graph, policy, vars, tape.read_all()?)
}

/// Recurrent state rows aligned with the previous timestep's mask.
struct CarriedState {
    node: NodeId,
    present: Vec<bool>,
}

fn unroll<T, P, I>(
    graph: &Graph<T>,
    policy: &P,
    vars: &ParamVars,
    inputs: I,
    window: Option<usize>,
) -> Result<Vec<PolicyStep>>
where
    T: Numeric,
    P: Policy,
    I: Iterator<Item = Result<RolloutBatch>>,
{
    let state_size = policy.state_size();
    let mut carried: Option<CarriedState> = None;
    let mut steps = Vec::new();
    let mut batch_size: Option<usize> = None;

    for (t, batch) in inputs.enumerate() {
        let batch = batch?;
        match batch_size {
            Some(size) if size != batch.batch_size() => {
                return Err(NpgError::stream_read(format!(
                    "batch size changed from {} to {} at timestep {}",
                    size,
                    batch.batch_size(),
                    t
                )));
            }
            _ => batch_size = Some(batch.batch_size()),
        }

        if batch.num_present() == 0 {
            let empty = DMatrix::from_element(0, policy.output_size(), T::zero());
            steps.push(PolicyStep {
                output: graph.constant(empty),
                present: batch.present,
            });
            carried = None;
            continue;
        }
        if batch.packed.ncols() != policy.input_size() {
            return Err(NpgError::shape_mismatch(
                format!("{} input columns", policy.input_size()),
                format!("{} at timestep {}", batch.packed.ncols(), t),
            ));
        }

        let input = graph.constant(lift(&batch.packed));
        let state = if state_size > 0 {
            let mut state = carry_state(graph, carried.as_ref(), &batch.present, state_size);
            if let Some(w) = window {
                if t > 0 && t % w == 0 {
                    state = graph.detach(state).ok_or_else(|| {
                        NpgError::invalid_state("recurrent state missing from graph")
                    })?;
                }
            }
            Some(state)
        } else {
            None
        };

        let out = policy.step(graph, vars, input, state)?;
        if state_size > 0 {
            let node = out.state.ok_or_else(|| {
                NpgError::invalid_state("recurrent policy produced no next state")
            })?;
            carried = Some(CarriedState {
                node,
                present: batch.present.clone(),
            });
        }
        steps.push(PolicyStep {
            output: out.output,
            present: batch.present,
        });
    }

    trace!("unrolled policy over {} timesteps", steps.len());
    Ok(steps)
}

/// Builds the state rows for the slots present in `present`.
fn carry_state<T: Numeric>(
    graph: &Graph<T>,
    previous: Option<&CarriedState>,
    present: &[bool],
    state_size: usize,
) -> NodeId {
    let zero = graph.constant(DMatrix::from_element(1, state_size, T::zero()));
    let previous = match previous {
        Some(previous) => previous,
        None => {
            let n = present.iter().filter(|&&p| p).count();
            return graph.gather_rows(&[zero], vec![(0, 0); n], state_size);
        }
    };

    let mut rows = Vec::with_capacity(previous.present.len());
    let mut next_row = 0;
    for &p in &previous.present {
        if p {
            rows.push(Some(next_row));
            next_row += 1;
        } else {
            rows.push(None);
        }
    }

    let sources = present
        .iter()
        .enumerate()
        .filter(|(_, &p)| p)
        .map(|(slot, _)| match rows.get(slot).copied().flatten() {
            Some(row) => (0, row),
            None => (1, 0),
        })
        .collect();
    graph.gather_rows(&[previous.node, zero], sources, state_size)
}

/// Mean over all present entries of per-timestep term columns.
///
/// Each entry of `terms` pairs a node holding one value per present
/// sequence with that count. Returns `None` when no entry is present.
pub fn sequence_mean<T: Numeric>(graph: &Graph<T>, terms: &[(NodeId, usize)]) -> Option<NodeId> {
    let total: usize = terms.iter().map(|&(_, n)| n).sum();
    if total == 0 {
        return None;
    }
    let sum = terms
        .iter()
        .filter(|&&(_, n)| n > 0)
        .map(|&(node, _)| graph.sum(node))
        .reduce(|acc, s| graph.add(acc, s))?;
    Some(graph.scale(sum, 1.0 / total as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{ElmanBlock, LayerBlock};
    use crate::layer::{Dense, Layer, Net};
    use pretty_assertions::assert_eq;
    use approx::assert_relative_eq;
    use npg_core::replay::ReferenceTape;
    use npg_core::Tensor;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn identity_block() -> LayerBlock {
        let dense = Dense::from_values(Tensor::identity(2, 2), Tensor::zeros(1, 2)).unwrap();
        LayerBlock::new(Net::new().with_layer(Layer::Dense(dense))).unwrap()
    }

    fn batches(masks: &[Vec<bool>], width: usize) -> Vec<RolloutBatch> {
        masks
            .iter()
            .enumerate()
            .map(|(t, m)| {
                let rows = m.iter().filter(|&&p| p).count();
                RolloutBatch::new(Tensor::from_element(rows, width, t as f64), m.clone()).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_feed_forward_unroll() {
        let block = identity_block();
        let graph = Graph::new();
        let vars = ParamVars::bind(&graph, &block.parameters());
        let masks = vec![vec![true, true], vec![true, false], vec![false, false]];
        let tape = ReferenceTape::from_batches(batches(&masks, 2)).unwrap();

        let steps = apply_to_tape(&graph, &block, &vars, &Bptt, &tape).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(graph.shape(steps[0].output), Some((2, 2)));
        assert_eq!(graph.get_value(steps[1].output).unwrap(), Tensor::from_element(1, 2, 1.0));
        assert_eq!(graph.shape(steps[2].output), Some((0, 2)));
        assert_eq!(steps[2].num_present(), 0);
    }

    #[test]
    fn test_input_width_checked() {
        let block = identity_block();
        let graph: Graph = Graph::new();
        let vars = ParamVars::bind(&graph, &block.parameters());
        let masks = vec![vec![true]];
        let result = Bptt.apply(&graph, &block, &vars, batches(&masks, 3).into_iter().map(Ok));
        assert!(matches!(result, Err(NpgError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_batch_size_change_rejected() {
        let block = identity_block();
        let graph: Graph = Graph::new();
        let vars = ParamVars::bind(&graph, &block.parameters());
        let mut all = batches(&[vec![true, true]], 2);
        all.extend(batches(&[vec![true]], 2));
        let result = Bptt.apply(&graph, &block, &vars, all.into_iter().map(Ok));
        assert!(result.unwrap_err().is_stream_error());
    }

    #[test]
    fn test_recurrent_state_follows_mask() {
        let mut rng = StdRng::seed_from_u64(9);
        let block = ElmanBlock::new(&mut rng, 2, 3, 2);
        let masks = vec![vec![true, false], vec![true, true], vec![false, true]];

        // Unrolling the batch must match unrolling each slot on its own.
        let graph: Graph = Graph::new();
        let vars = ParamVars::bind(&graph, &block.parameters());
        let steps = Bptt
            .apply(&graph, &block, &vars, batches(&masks, 2).into_iter().map(Ok))
            .unwrap();
        let last = graph.get_value(steps[2].output).unwrap();

        let solo_masks = vec![vec![false], vec![true], vec![true]];
        let solo_batches: Vec<RolloutBatch> = batches(&solo_masks, 2);
        let solo_graph = Graph::new();
        let solo_vars = ParamVars::bind(&solo_graph, &block.parameters());
        let solo = Bptt
            .apply(&solo_graph, &block, &solo_vars, solo_batches.into_iter().map(Ok))
            .unwrap();
        let expected = solo_graph.get_value(solo[2].output).unwrap();

        for (a, b) in last.iter().zip(expected.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_truncation_keeps_values() {
        let mut rng = StdRng::seed_from_u64(4);
        let block = ElmanBlock::new(&mut rng, 2, 2, 2);
        let masks = vec![vec![true]; 5];

        let full_graph: Graph = Graph::new();
        let vars = ParamVars::bind(&full_graph, &block.parameters());
        let full = Bptt
            .apply(&full_graph, &block, &vars, batches(&masks, 2).into_iter().map(Ok))
            .unwrap();

        let trunc_graph = Graph::new();
        let trunc_vars = ParamVars::bind(&trunc_graph, &block.parameters());
        let truncated = TruncatedBptt::new(2)
            .unwrap()
            .apply(&trunc_graph, &block, &trunc_vars, batches(&masks, 2).into_iter().map(Ok))
            .unwrap();

        assert_eq!(
            full_graph.get_value(full[4].output),
            trunc_graph.get_value(truncated[4].output)
        );
        assert!(TruncatedBptt::new(0).is_err());
    }

    #[test]
    fn test_sequence_mean() {
        let graph: Graph = Graph::new();
        let a = graph.constant(Tensor::from_row_slice(2, 1, &[1.0, 2.0]));
        let b = graph.constant(Tensor::from_row_slice(1, 1, &[6.0]));
        let empty = graph.constant(Tensor::zeros(0, 1));
        let mean = sequence_mean(&graph, &[(a, 2), (empty, 0), (b, 1)]).unwrap();
        assert_relative_eq!(graph.get_value(mean).unwrap()[(0, 0)], 3.0);
        assert!(sequence_mean(&graph, &[(empty, 0)]).is_none());
    }

    #[test]
    fn test_detached_dual_state_keeps_tangent() {
        let graph: Graph<npg_core::Dual> = Graph::new();
        let value = npg_core::Dual::new(0.5, 1.5);
        let state = graph.variable(DMatrix::from_element(1, 2, value));
        let detached = graph.detach(state.id).unwrap();
        assert_eq!(graph.get_value(detached).unwrap()[(0, 1)], value);
        assert!(!graph.requires_grad(detached));
    }
}
