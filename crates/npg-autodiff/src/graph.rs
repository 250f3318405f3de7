//! Computation graph for automatic differentiation.
//!
//! This module implements a dynamic computation graph that tracks operations
//! and their dependencies for automatic differentiation. Nodes are evaluated
//! as soon as they are recorded, so node identifiers are already in
//! topological order.

use crate::broadcast::{BroadcastAdd, BroadcastMultiply};
use crate::ops::{
    Add, Columns, Exp, GatherRows, Log, LogSoftmax, MatMul, Mean, Multiply, Negate, Op, Pow,
    ReLU, Scale, Shift, Sigmoid, Sub, Sum, Tanh, Transpose,
};
use npg_core::types::{DMatrix, Numeric};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Unique identifier for nodes in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// Position of the node in recording order.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node{}", self.0)
    }
}

/// A variable in the computation graph.
#[derive(Debug, Clone)]
pub struct Variable {
    /// Unique identifier for this variable
    pub id: NodeId,
    /// Name of the variable (optional)
    pub name: Option<String>,
    /// Whether this variable requires gradient computation
    pub requires_grad: bool,
}

impl Variable {
    /// Creates a new variable with the given ID.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            name: None,
            requires_grad: true,
        }
    }

    /// Sets the name of the variable.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets whether the variable requires gradient.
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }
}

/// A node in the computation graph.
#[derive(Debug)]
pub struct Node<T: Numeric> {
    /// Unique identifier
    pub id: NodeId,
    /// The value computed at this node
    pub value: DMatrix<T>,
    /// The operation that produced this node
    pub op: Option<Box<dyn Op<T>>>,
    /// Input nodes to this operation
    pub inputs: Vec<NodeId>,
    /// Whether this node requires gradient
    pub requires_grad: bool,
    /// Optional name for debugging
    pub name: Option<String>,
}

impl<T: Numeric> Node<T> {
    /// Creates a new input node with a value.
    pub fn input(id: NodeId, value: DMatrix<T>) -> Self {
        Self {
            id,
            value,
            op: None,
            inputs: Vec::new(),
            requires_grad: false,
            name: None,
        }
    }

    /// Sets the name of the node.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Checks if this node is a leaf (has no operation).
    pub fn is_leaf(&self) -> bool {
        self.op.is_none()
    }
}

/// The computation graph structure.
///
/// `T` is the numeric mode every node is evaluated in.
#[derive(Debug)]
pub struct Graph<T: Numeric = f64> {
    /// All nodes in the graph, indexed by their ID
    nodes: RefCell<Vec<Rc<RefCell<Node<T>>>>>,
    /// Whether to track gradients
    track_gradients: bool,
}

impl<T: Numeric> Graph<T> {
    /// Creates a new empty computation graph.
    pub fn new() -> Self {
        Self {
            nodes: RefCell::new(Vec::new()),
            track_gradients: true,
        }
    }

    /// Creates a new graph with gradient tracking disabled.
    pub fn no_grad() -> Self {
        Self {
            nodes: RefCell::new(Vec::new()),
            track_gradients: false,
        }
    }

    /// Whether new variables require gradients.
    pub fn is_tracking(&self) -> bool {
        self.track_gradients
    }

    fn push(&self, node: Node<T>) {
        self.nodes.borrow_mut().push(Rc::new(RefCell::new(node)));
    }

    fn next_id(&self) -> NodeId {
        NodeId(self.nodes.borrow().len())
    }

    /// Creates a new variable (input node) in the graph.
    pub fn variable(&self, value: DMatrix<T>) -> Variable {
        let id = self.next_id();
        let mut node = Node::input(id, value);
        node.requires_grad = self.track_gradients;
        self.push(node);

        Variable::new(id).with_requires_grad(self.track_gradients)
    }

    /// Creates a new variable with a name.
    pub fn named_variable(&self, value: DMatrix<T>, name: impl Into<String>) -> Variable {
        let id = self.next_id();
        let name = name.into();
        let mut node = Node::input(id, value).with_name(name.clone());
        node.requires_grad = self.track_gradients;
        self.push(node);

        Variable::new(id)
            .with_name(name)
            .with_requires_grad(self.track_gradients)
    }

    /// Creates a constant (non-differentiable) node in the graph.
    pub fn constant(&self, value: DMatrix<T>) -> NodeId {
        let id = self.next_id();
        self.push(Node::input(id, value));
        id
    }

    /// Records an operation and evaluates it immediately.
    ///
    /// # Panics
    ///
    /// Panics if an input does not belong to this graph, or if the operation
    /// rejects the input shapes.
    pub fn apply_op(&self, op: Box<dyn Op<T>>, inputs: &[NodeId]) -> NodeId {
        let id = self.next_id();
        let mut requires_grad = false;
        let values: Vec<DMatrix<T>> = inputs
            .iter()
            .map(|&input| {
                let node = self
                    .get_node(input)
                    .unwrap_or_else(|| panic!("{} is not part of this graph", input));
                let node = node.borrow();
                requires_grad |= node.requires_grad;
                node.value.clone()
            })
            .collect();

        let value = op.forward(&values);
        self.push(Node {
            id,
            value,
            op: Some(op),
            inputs: inputs.to_vec(),
            requires_grad: self.track_gradients && requires_grad,
            name: None,
        });
        id
    }

    /// Gets a node by its ID.
    pub fn get_node(&self, id: NodeId) -> Option<Rc<RefCell<Node<T>>>> {
        self.nodes.borrow().get(id.0).cloned()
    }

    /// Gets the value of a node.
    pub fn get_value(&self, id: NodeId) -> Option<DMatrix<T>> {
        self.get_node(id).map(|node| node.borrow().value.clone())
    }

    /// `(rows, cols)` of a node's value.
    pub fn shape(&self, id: NodeId) -> Option<(usize, usize)> {
        self.get_node(id).map(|node| node.borrow().value.shape())
    }

    /// Whether gradients flow into `id`.
    pub fn requires_grad(&self, id: NodeId) -> bool {
        self.get_node(id)
            .map(|node| node.borrow().requires_grad)
            .unwrap_or(false)
    }

    /// Copies a node's value into a new constant, cutting gradient flow.
    pub fn detach(&self, id: NodeId) -> Option<NodeId> {
        self.get_value(id).map(|value| self.constant(value))
    }

    /// Gets all nodes in topological order.
    pub fn topological_order(&self) -> Vec<NodeId> {
        (0..self.num_nodes()).map(NodeId).collect()
    }

    /// Returns the number of nodes in the graph.
    pub fn num_nodes(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Enables gradient tracking.
    pub fn enable_grad(&mut self) {
        self.track_gradients = true;
    }

    /// Disables gradient tracking.
    pub fn disable_grad(&mut self) {
        self.track_gradients = false;
    }

    /// `a + b`
    pub fn add(&self, a: NodeId, b: NodeId) -> NodeId {
        self.apply_op(Box::new(Add), &[a, b])
    }

    /// `a - b`
    pub fn sub(&self, a: NodeId, b: NodeId) -> NodeId {
        self.apply_op(Box::new(Sub), &[a, b])
    }

    /// Element-wise `a * b`
    pub fn mul(&self, a: NodeId, b: NodeId) -> NodeId {
        self.apply_op(Box::new(Multiply), &[a, b])
    }

    /// Matrix product `a * b`
    pub fn matmul(&self, a: NodeId, b: NodeId) -> NodeId {
        self.apply_op(Box::new(MatMul), &[a, b])
    }

    /// Matrix transpose
    pub fn transpose(&self, a: NodeId) -> NodeId {
        self.apply_op(Box::new(Transpose), &[a])
    }

    /// Element-wise `-a`
    pub fn neg(&self, a: NodeId) -> NodeId {
        self.apply_op(Box::new(Negate), &[a])
    }

    /// Multiplies by a plain constant.
    pub fn scale(&self, a: NodeId, factor: f64) -> NodeId {
        self.apply_op(Box::new(Scale { factor }), &[a])
    }

    /// Adds a plain constant to every entry.
    pub fn shift(&self, a: NodeId, offset: f64) -> NodeId {
        self.apply_op(Box::new(Shift { offset }), &[a])
    }

    /// Element-wise exponential
    pub fn exp(&self, a: NodeId) -> NodeId {
        self.apply_op(Box::new(Exp), &[a])
    }

    /// Element-wise natural logarithm
    pub fn log(&self, a: NodeId) -> NodeId {
        self.apply_op(Box::new(Log), &[a])
    }

    /// Element-wise hyperbolic tangent
    pub fn tanh(&self, a: NodeId) -> NodeId {
        self.apply_op(Box::new(Tanh), &[a])
    }

    /// Element-wise logistic function
    pub fn sigmoid(&self, a: NodeId) -> NodeId {
        self.apply_op(Box::new(Sigmoid), &[a])
    }

    /// Element-wise `max(a, 0)`
    pub fn relu(&self, a: NodeId) -> NodeId {
        self.apply_op(Box::new(ReLU), &[a])
    }

    /// Element-wise `a^exponent`
    pub fn pow(&self, a: NodeId, exponent: f64) -> NodeId {
        self.apply_op(Box::new(Pow { exponent }), &[a])
    }

    /// Sum of all entries as a `1 x 1` node.
    pub fn sum(&self, a: NodeId) -> NodeId {
        self.apply_op(Box::new(Sum::all()), &[a])
    }

    /// Sum along `axis` (0 collapses rows, 1 collapses columns).
    pub fn sum_axis(&self, a: NodeId, axis: usize) -> NodeId {
        self.apply_op(Box::new(Sum::along_axis(axis)), &[a])
    }

    /// Mean of all entries as a `1 x 1` node.
    pub fn mean(&self, a: NodeId) -> NodeId {
        self.apply_op(Box::new(Mean::all()), &[a])
    }

    /// Row-wise log-softmax.
    pub fn log_softmax(&self, a: NodeId) -> NodeId {
        self.apply_op(Box::new(LogSoftmax), &[a])
    }

    /// Addition with row or column broadcasting.
    pub fn broadcast_add(&self, a: NodeId, b: NodeId) -> NodeId {
        self.apply_op(Box::new(BroadcastAdd), &[a, b])
    }

    /// Element-wise product with row or column broadcasting.
    pub fn broadcast_mul(&self, a: NodeId, b: NodeId) -> NodeId {
        self.apply_op(Box::new(BroadcastMultiply), &[a, b])
    }

    /// Builds a matrix from `(input position, row)` pairs over `inputs`.
    pub fn gather_rows(&self, inputs: &[NodeId], sources: Vec<(usize, usize)>, cols: usize) -> NodeId {
        self.apply_op(Box::new(GatherRows { sources, cols }), inputs)
    }

    /// Column block `start..start + len`.
    pub fn columns(&self, a: NodeId, start: usize, len: usize) -> NodeId {
        self.apply_op(Box::new(Columns { start, len }), &[a])
    }
}

impl<T: Numeric> Default for Graph<T> {
    fn default() -> Self {
        Self::new()
    }
}
