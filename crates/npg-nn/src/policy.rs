//! The policy block contract and parameter binding.

use npg_autodiff::{Graph, NodeId};
use npg_core::error::{NpgError, Result};
use npg_core::gradient::{ParamId, Parameter};
use npg_core::types::{lift, Numeric};
use std::collections::btree_map::{self, BTreeMap};

/// Binding from parameter identity to the graph node carrying its value.
///
/// A policy never owns graph nodes. Each evaluation binds the parameters it
/// wants to differentiate (or perturb) and passes the binding to
/// [`Policy::step`].
#[derive(Debug, Clone, Default)]
pub struct ParamVars {
    nodes: BTreeMap<ParamId, NodeId>,
}

impl ParamVars {
    /// Creates an empty binding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds every parameter as a graph variable holding its value.
    pub fn bind<T: Numeric>(graph: &Graph<T>, params: &[&Parameter]) -> Self {
        let nodes = params
            .iter()
            .map(|p| {
                let var = match p.name() {
                    Some(name) => graph.named_variable(lift(p.value()), name),
                    None => graph.variable(lift(p.value())),
                };
                (p.id(), var.id)
            })
            .collect();
        Self { nodes }
    }

    /// Binds `id` to `node`, replacing any previous binding.
    pub fn insert(&mut self, id: ParamId, node: NodeId) -> Option<NodeId> {
        self.nodes.insert(id, node)
    }

    /// The node bound to `id`.
    pub fn get(&self, id: ParamId) -> Option<NodeId> {
        self.nodes.get(&id).copied()
    }

    /// The node bound to `param`, or `UnknownParameter`.
    pub fn node(&self, param: &Parameter) -> Result<NodeId> {
        self.get(param.id())
            .ok_or_else(|| NpgError::unknown_parameter(param.id()))
    }

    /// Number of bound parameters.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no parameter is bound.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over `(identity, node)` pairs in identity order.
    pub fn iter(&self) -> btree_map::Iter<'_, ParamId, NodeId> {
        self.nodes.iter()
    }
}

/// Nodes produced by one timestep of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutput {
    /// Distribution parameters, one row per present sequence
    pub output: NodeId,
    /// Next recurrent state, one row per present sequence
    pub state: Option<NodeId>,
}

/// A differentiable, possibly recurrent, sequence-to-distribution map.
///
/// Implementations describe one timestep. [`ApplyStrategy`] drives them
/// over a replayed input stream and keeps recurrent state aligned with the
/// presence masks.
///
/// [`ApplyStrategy`]: crate::apply::ApplyStrategy
pub trait Policy: Sized + Send + Sync {
    /// The learnable parameters in a deterministic order.
    fn parameters(&self) -> Vec<&Parameter>;

    /// Mutable access to the learnable parameters, same order as
    /// [`parameters`](Self::parameters).
    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Width of one input row.
    fn input_size(&self) -> usize;

    /// Width of one output row.
    fn output_size(&self) -> usize;

    /// Width of the recurrent state; 0 for feed-forward policies.
    fn state_size(&self) -> usize {
        0
    }

    /// Copies the policy with equal parameter values under fresh identities.
    ///
    /// The copy must enumerate its parameters in the same order as the
    /// original. Policies holding state outside their parameters fail with
    /// `NonClonablePolicy`.
    fn try_clone(&self) -> Result<Self>;

    /// Records one timestep on `graph`.
    ///
    /// `input` has one row per present sequence. `state` is `None` for
    /// feed-forward policies and otherwise holds one row per present
    /// sequence.
    fn step<T: Numeric>(
        &self,
        graph: &Graph<T>,
        vars: &ParamVars,
        input: NodeId,
        state: Option<NodeId>,
    ) -> Result<StepOutput>;
}

/// Identities of a policy's parameters, in enumeration order.
pub fn param_ids<P: Policy>(policy: &P) -> Vec<ParamId> {
    policy.parameters().iter().map(|p| p.id()).collect()
}
