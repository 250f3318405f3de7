//! Fisher-vector products.
//!
//! The product `F v` is the directional derivative, along `v`, of the
//! gradient of
//!
//! ```text
//! mean KL(old outputs || policy(theta) outputs)
//! ```
//!
//! evaluated at `theta` itself. The old outputs are frozen once per solve.
//! Each product clones the policy, gives every parameter the tangent `v`
//! (zero where `v` has no entry), applies the clone under dual arithmetic
//! and runs one reverse pass with dual adjoints. The tangent part of each
//! parameter's adjoint is `(F v)` for that parameter.
//!
//! Only the second argument of the divergence is differentiated, which is
//! what makes the curvature the Fisher matrix rather than a general Hessian.

use log::trace;
use npg_autodiff::{backward, Graph, NodeId};
use npg_core::dual::{dual_matrix, tangent_part, Dual};
use npg_core::error::{NpgError, Result};
use npg_core::gradient::{ParamId, ParameterGradient};
use npg_core::replay::{next_batch, ReferenceTape, RolloutBatch, Tape, TapeWriter};
use npg_core::types::{lift, DMatrix, Numeric, Tensor};
use npg_nn::action_space::{check_policy_output, ActionSpace};
use npg_nn::apply::{apply_to_tape, sequence_mean, ApplyStrategy, PolicyStep};
use npg_nn::policy::{ParamVars, Policy};
use std::collections::BTreeMap;

use crate::conjugate_gradient::LinearOperator;

/// Applies `policy` to `inputs` without tracking gradients and records the
/// output distribution parameters on an in-memory tape.
pub fn store_policy_outputs<P, S>(
    policy: &P,
    strategy: &S,
    inputs: &dyn Tape,
    capacity: usize,
) -> Result<ReferenceTape>
where
    P: Policy,
    S: ApplyStrategy,
{
    let graph: Graph = Graph::no_grad();
    let vars = ParamVars::bind(&graph, &policy.parameters());
    let steps = apply_to_tape(&graph, policy, &vars, strategy, inputs)?;

    let mut writer = TapeWriter::new().with_capacity(capacity);
    for step in steps {
        let packed = graph
            .get_value(step.output)
            .ok_or_else(|| NpgError::invalid_state("policy output missing from graph"))?;
        writer.write(RolloutBatch::new(packed, step.present)?)?;
    }
    trace!("stored {} timesteps of policy outputs", writer.len());
    Ok(writer.finish())
}

/// A policy copy whose parameters carry one tangent each.
#[derive(Debug)]
pub struct ForwardPolicy<P> {
    policy: P,
    new_to_old: BTreeMap<ParamId, ParamId>,
    tangents: BTreeMap<ParamId, Tensor>,
}

impl<P: Policy> ForwardPolicy<P> {
    /// The cloned policy.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Maps each parameter of the clone to the original it was copied from.
    pub fn new_to_old(&self) -> &BTreeMap<ParamId, ParamId> {
        &self.new_to_old
    }

    /// The original parameter the clone's parameter `new` was copied from.
    pub fn old_id(&self, new: ParamId) -> Option<ParamId> {
        self.new_to_old.get(&new).copied()
    }

    /// Tangent of the clone's parameter `new`, if any was given.
    pub fn tangent(&self, new: ParamId) -> Option<&Tensor> {
        self.tangents.get(&new)
    }

    /// Binds the clone's parameters on a dual graph, with their tangents.
    pub fn bind(&self, graph: &Graph<Dual>) -> ParamVars {
        let mut vars = ParamVars::new();
        for param in self.policy.parameters() {
            let (rows, cols) = param.shape();
            let value = match self.tangents.get(&param.id()) {
                Some(tangent) => dual_matrix(param.value(), tangent),
                None => dual_matrix(param.value(), &Tensor::zeros(rows, cols)),
            };
            let var = match param.name() {
                Some(name) => graph.named_variable(value, name),
                None => graph.variable(value),
            };
            vars.insert(param.id(), var.id);
        }
        vars
    }
}

/// Clones `policy` and attaches the entries of `direction` as tangents.
///
/// `direction` is keyed by the original parameters; parameters it omits get
/// a zero tangent. The clone must enumerate parameters of the same shapes
/// and values in the same order, otherwise the policy is reported as not
/// clonable.
pub fn make_fwd_diff<P: Policy>(policy: &P, direction: &ParameterGradient) -> Result<ForwardPolicy<P>> {
    let old_params = policy.parameters();
    direction.check_params(&old_params)?;

    let copy = policy.try_clone()?;
    let mut new_to_old = BTreeMap::new();
    let mut tangents = BTreeMap::new();
    {
        let new_params = copy.parameters();
        if new_params.len() != old_params.len() {
            return Err(NpgError::non_clonable(format!(
                "clone has {} parameters, original has {}",
                new_params.len(),
                old_params.len()
            )));
        }
        for (new, old) in new_params.iter().zip(&old_params) {
            if new.value() != old.value() {
                return Err(NpgError::non_clonable(format!(
                    "clone of parameter {} does not preserve its value",
                    old.id()
                )));
            }
            new_to_old.insert(new.id(), old.id());
            if let Some(tangent) = direction.get(old.id()) {
                tangents.insert(new.id(), tangent.clone());
            }
        }
    }

    Ok(ForwardPolicy {
        policy: copy,
        new_to_old,
        tangents,
    })
}

/// Per-timestep `KL(old || new)` columns paired with their presence counts.
fn kl_terms<T, A>(
    graph: &Graph<T>,
    space: &A,
    steps: &[PolicyStep],
    old_outputs: &dyn Tape,
) -> Result<Vec<(NodeId, usize)>>
where
    T: Numeric,
    A: ActionSpace,
{
    let mut old = old_outputs.read_all()?;
    let mut terms = Vec::with_capacity(steps.len());
    for (t, step) in steps.iter().enumerate() {
        let frozen = next_batch(&mut old, t)?;
        if frozen.present != step.present {
            return Err(NpgError::stream_read(format!(
                "stored outputs disagree with the inputs' presence mask at timestep {}",
                t
            )));
        }
        let n = step.num_present();
        if n == 0 {
            continue;
        }
        if graph.shape(step.output) != Some(frozen.packed.shape()) {
            return Err(NpgError::shape_mismatch(
                format!("{:?}", graph.shape(step.output)),
                format!("{:?} stored at timestep {}", frozen.packed.shape(), t),
            ));
        }
        let p = graph.constant(lift(&frozen.packed));
        terms.push((space.kl(graph, p, step.output), n));
    }
    if old.next().is_some() {
        return Err(NpgError::stream_read("stored outputs outlast the inputs"));
    }
    Ok(terms)
}

/// The Fisher matrix of a policy's output distribution over a set of
/// inputs, as an implicit linear operator.
pub struct FisherOperator<'a, P, A, S> {
    policy: &'a P,
    space: &'a A,
    strategy: &'a S,
    inputs: &'a dyn Tape,
    old_outputs: &'a dyn Tape,
}

impl<'a, P, A, S> FisherOperator<'a, P, A, S>
where
    P: Policy,
    A: ActionSpace,
    S: ApplyStrategy,
{
    /// Binds the operator to `inputs` and the policy outputs stored for
    /// them by [`store_policy_outputs`].
    pub fn new(
        policy: &'a P,
        space: &'a A,
        strategy: &'a S,
        inputs: &'a dyn Tape,
        old_outputs: &'a dyn Tape,
    ) -> Self {
        Self {
            policy,
            space,
            strategy,
            inputs,
            old_outputs,
        }
    }

    /// Computes `F v`, keyed like `direction`.
    pub fn apply(&self, direction: &ParameterGradient) -> Result<ParameterGradient> {
        check_policy_output(self.policy, self.space)?;
        let fwd = make_fwd_diff(self.policy, direction)?;
        let graph: Graph<Dual> = Graph::new();
        let vars = fwd.bind(&graph);

        let steps = apply_to_tape(&graph, fwd.policy(), &vars, self.strategy, self.inputs)?;
        let terms = kl_terms(&graph, self.space, &steps, self.old_outputs)?;
        let mean = match sequence_mean(&graph, &terms) {
            Some(mean) => mean,
            None => return Ok(direction.zeros_like()),
        };

        let seed = DMatrix::from_element(1, 1, Dual::new(1.0, 0.0));
        let grads = backward(&graph, mean, Some(seed));

        let mut out = ParameterGradient::new();
        for (&new_id, &old_id) in fwd.new_to_old() {
            let entry = match direction.get(old_id) {
                Some(entry) => entry,
                None => continue,
            };
            let product = vars
                .get(new_id)
                .and_then(|node| grads.get(&node))
                .map(tangent_part)
                .unwrap_or_else(|| Tensor::zeros(entry.nrows(), entry.ncols()));
            out.insert(old_id, product);
        }
        Ok(out)
    }

    /// Mean `KL(old || current)` computed by plain forward application.
    pub fn mean_kl(&self) -> Result<f64> {
        mean_kl(self.policy, self.space, self.strategy, self.inputs, self.old_outputs)
    }
}

impl<P, A, S> LinearOperator for FisherOperator<'_, P, A, S>
where
    P: Policy,
    A: ActionSpace,
    S: ApplyStrategy,
{
    fn apply(&self, v: &ParameterGradient) -> Result<ParameterGradient> {
        FisherOperator::apply(self, v)
    }
}

/// Mean `KL(old || policy outputs)` over every present entry, evaluated
/// literally. Zero when nothing is present.
pub fn mean_kl<P, A, S>(
    policy: &P,
    space: &A,
    strategy: &S,
    inputs: &dyn Tape,
    old_outputs: &dyn Tape,
) -> Result<f64>
where
    P: Policy,
    A: ActionSpace,
    S: ApplyStrategy,
{
    check_policy_output(policy, space)?;
    let graph: Graph = Graph::no_grad();
    let vars = ParamVars::bind(&graph, &policy.parameters());
    let steps = apply_to_tape(&graph, policy, &vars, strategy, inputs)?;
    let terms = kl_terms(&graph, space, &steps, old_outputs)?;
    match sequence_mean(&graph, &terms) {
        Some(mean) => graph
            .get_value(mean)
            .map(|v| v[(0, 0)])
            .ok_or_else(|| NpgError::invalid_state("divergence missing from graph")),
        None => Ok(0.0),
    }
}
