//! Reverse-mode automatic differentiation.
//!
//! # Architecture
//!
//! ```text
//! Tensor (requires_grad, grad_fn: NodeId, grad)
//!     ↓ differentiable op (crate::operations)
//! Tape (thread-local, append-only)
//!     └── Node: edges to inputs, GradFn + SavedTensors, fan-out, state
//!     ↓ backward(root, seed)
//! Engine: discovery DFS → ready queue → leaf gradient commit
//! ```
//!
//! # Example
//!
//! ```
//! use ndgrad::Tensor;
//! use ndgrad::operations::{matmul, sum};
//!
//! let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap()
//!     .requires_grad_(true).unwrap();
//! let b = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
//!
//! let loss = sum(&matmul(&a, &b).unwrap()).unwrap();
//! loss.backward().unwrap();
//!
//! // d(sum(A @ I))/dA = ones
//! assert_eq!(a.grad().unwrap().to_vec::<f64>().unwrap(), vec![1.0; 4]);
//! ```

mod backward;
mod grad_mode;
mod gradients;
mod graph;
mod saved_tensor;

pub use backward::{BackwardOptions, backward, backward_with, grad};
pub use grad_mode::{NoGradGuard, is_grad_enabled, no_grad};
pub use gradients::Gradients;
pub use graph::{
    GradFn, Node, NodeId, NodeState, Tape, clear_tape, tape_graph, tape_len, validate_tape,
    with_tape,
};
pub use saved_tensor::SavedTensor;

pub(crate) use graph::{record, release_output};
