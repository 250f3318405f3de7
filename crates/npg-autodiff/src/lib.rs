//! Reverse-mode automatic differentiation for policy networks.
//!
//! The engine is written once over [`Numeric`](npg_core::Numeric). With plain
//! `f64` values it computes ordinary gradients. With
//! [`Dual`](npg_core::Dual) values every node carries a tangent, so a single
//! backward pass yields both the gradient and its directional derivative:
//! this is forward-over-reverse differentiation, the building block of the
//! Fisher-vector product.
//!
//! # Architecture
//!
//! 1. **Graph**: records nodes and evaluates them eagerly
//! 2. **Operations**: forward and backward rules per operation
//! 3. **Backward**: backpropagation over the recorded graph

pub mod backward;
pub mod broadcast;
pub mod graph;
pub mod ops;

pub use backward::{backward, check_gradients, grad, GradientMap};
pub use broadcast::{broadcast_binary, broadcast_shape, unbroadcast, BroadcastAdd, BroadcastMultiply};
pub use graph::{Graph, Node, NodeId, Variable};
pub use ops::{Op, OpType};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backward::{backward, grad, GradientMap};
    pub use crate::broadcast::{BroadcastAdd, BroadcastMultiply};
    pub use crate::graph::{Graph, Node, NodeId, Variable};
    pub use crate::ops::{Op, OpType};
}
