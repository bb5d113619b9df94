//! ndgrad - tensor runtime with operator dispatch and reverse-mode autodiff.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Layers (nn module)
//!     → RReLU, Dropout3d, ... and their functional forms
//!
//! Level 2: Differentiable operations (operations module)
//!     → forward via dispatch, record a node on the tape
//!
//! Level 3: Dispatch (dispatch module)
//!     → (op, dtypes, device kinds) → kernel
//!
//! Level 4: Storage and devices
//!     → typed buffers, views, per-device memory accounting
//! ```
//!
//! Gradients are computed by [`autodiff::backward`], which walks the
//! thread-local tape from the root's producing node in reverse topological
//! order.
//!
//! # Example
//!
//! ```
//! use ndgrad::Tensor;
//! use ndgrad::operations::{mul, sum};
//!
//! let x = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3])
//!     .unwrap()
//!     .requires_grad_(true)
//!     .unwrap();
//! let loss = sum(&mul(&x, &x).unwrap()).unwrap();
//! loss.backward().unwrap();
//!
//! // d/dx sum(x^2) = 2x
//! assert_eq!(x.grad().unwrap().to_vec::<f64>().unwrap(), vec![2.0, 4.0, 6.0]);
//! ```

pub mod autodiff;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod nn;
pub mod operations;
pub mod random;
pub mod scalar;
pub mod storage;
pub mod tensor;
pub mod transfer;

pub use config::RuntimeConfig;
pub use device::{Device, DeviceKind};
pub use dtype::DType;
pub use error::{ErrorKind, TensorError};
pub use random::manual_seed;
pub use scalar::{Element, Scalar};
pub use storage::{Buffer, Storage};
pub use tensor::{Tensor, TensorId};
pub use transfer::Transfer;
