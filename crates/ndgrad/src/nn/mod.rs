//! Neural network layers.
//!
//! A layer is an immutable configuration plus a pure `forward`. Stochastic
//! layers carry their training flag in the configuration; [`Module::with_training`]
//! and the inherent `train` methods return an updated copy instead of
//! mutating shared state.
//!
//! ```
//! use ndgrad::{DType, Device, Tensor};
//! use ndgrad::nn::{Dropout3d, Module};
//!
//! let layer = Dropout3d::default().train(false);
//! let x = Tensor::ones(&[1, 2, 2, 2, 2], DType::F32, Device::Cpu).unwrap();
//! let y = layer.forward(&x).unwrap();
//! assert_eq!(y.to_vec::<f32>().unwrap(), x.to_vec::<f32>().unwrap());
//! ```

mod activation;
mod dropout;
pub mod functional;

pub use activation::{LeakyReLU, RReLU, ReLU, Sigmoid, Tanh};
pub use dropout::{Dropout, Dropout2d, Dropout3d};

use crate::error::TensorError;
use crate::tensor::Tensor;
use std::fmt;

/// A layer mapping one tensor to another.
pub trait Module: fmt::Debug {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError>;

    /// Layer type name, e.g. `"RReLU"`.
    fn name(&self) -> &'static str;

    /// Copy of this layer in training (`true`) or evaluation mode.
    ///
    /// Layers without mode-dependent behaviour return an identical copy.
    fn with_training(&self, training: bool) -> Box<dyn Module>;
}
