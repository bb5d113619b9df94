//! Differentiable tensor operations.
//!
//! Every operation follows the same two steps:
//!
//! ```text
//! op(inputs)
//!     → dispatch(OpKind, inputs, attrs)   forward kernel
//!     → record(OpKind, inputs, output, || Box<XxxBackward>)
//!           (only if grad mode is on and an input requires grad)
//! ```
//!
//! Backward functions live next to their forward operation and are
//! themselves written in terms of these operations. The engine runs them
//! with recording disabled.

mod activation;
mod dropout;
mod elementwise;
mod matmul;
mod reduce;
mod shape;

pub use activation::{leaky_relu, relu, rrelu, sigmoid, tanh};
pub use dropout::{dropout, dropout2d, dropout3d, feature_dropout};
pub use elementwise::{add, add_scalar, div, exp, log, mul, mul_scalar, neg, sub};
pub use matmul::matmul;
pub use reduce::{mean, sum};
pub use shape::{as_strided, contiguous, permute, reshape, transpose};
