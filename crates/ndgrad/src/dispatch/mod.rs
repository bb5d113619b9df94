//! Operator dispatch.
//!
//! Kernels are keyed by (operation, input dtypes, input device kinds). A miss
//! is an error: there is no fallback kernel and no implicit dtype promotion.
//!
//! ```text
//! dispatch(op, inputs, attrs)
//!     → device check      (all inputs on one device)
//!     → select(key)       (pure registry lookup)
//!     → kernel(inputs, attrs)
//! ```

mod kernels;

use crate::device::{Device, DeviceKind};
use crate::dtype::DType;
use crate::error::TensorError;
use crate::layout::Layout;
use crate::tensor::Tensor;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::{LazyLock, PoisonError, RwLock};

/// Operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Exp,
    Log,
    Tanh,
    Sigmoid,
    Relu,
    LeakyRelu,
    RRelu,
    Dropout,
    AddScalar,
    MulScalar,
    Sum,
    Matmul,
    Copy,
    Expand,
    TanhBackward,
    SigmoidBackward,
    LeakyReluBackward,
    AsStrided,
    Restride,
    Reshape,
    Permute,
    ToDevice,
    /// Operation provided by a user-registered kernel.
    Custom(&'static str),
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Neg => "neg",
            OpKind::Exp => "exp",
            OpKind::Log => "log",
            OpKind::Tanh => "tanh",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Relu => "relu",
            OpKind::LeakyRelu => "leaky_relu",
            OpKind::RRelu => "rrelu",
            OpKind::Dropout => "dropout",
            OpKind::AddScalar => "add_scalar",
            OpKind::MulScalar => "mul_scalar",
            OpKind::Sum => "sum",
            OpKind::Matmul => "matmul",
            OpKind::Copy => "copy",
            OpKind::Expand => "expand",
            OpKind::TanhBackward => "tanh_backward",
            OpKind::SigmoidBackward => "sigmoid_backward",
            OpKind::LeakyReluBackward => "leaky_relu_backward",
            OpKind::AsStrided => "as_strided",
            OpKind::Restride => "restride",
            OpKind::Reshape => "reshape",
            OpKind::Permute => "permute",
            OpKind::ToDevice => "to_device",
            OpKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Non-tensor arguments of an operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OpAttrs {
    #[default]
    None,
    Scalar(f64),
    LeakyRelu {
        negative_slope: f64,
    },
    RRelu {
        lower: f64,
        upper: f64,
        training: bool,
    },
    /// Mask drawn per element (`feature_dims == 0`) or shared across all
    /// elements of each index into the leading `feature_dims` dimensions.
    Dropout {
        p: f64,
        feature_dims: usize,
    },
    Expand {
        shape: Vec<usize>,
    },
    /// Scatter a gradient of `view` back onto the elements of `source`,
    /// both addressing a storage of `storage_len` elements.
    Restride {
        source: Layout,
        view: Layout,
        storage_len: usize,
    },
}

/// Kernel entry point. Returns the operation's outputs.
pub type KernelFn = fn(&[&Tensor], &OpAttrs) -> Result<Vec<Tensor>, TensorError>;

/// Registry lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub op: OpKind,
    pub dtypes: SmallVec<[DType; 4]>,
    pub devices: SmallVec<[DeviceKind; 4]>,
}

impl KernelKey {
    pub fn new(op: OpKind, dtypes: &[DType], devices: &[DeviceKind]) -> Self {
        Self {
            op,
            dtypes: SmallVec::from_slice(dtypes),
            devices: SmallVec::from_slice(devices),
        }
    }

    /// Key matching the dtypes and device kinds of `inputs`.
    pub fn for_inputs(op: OpKind, inputs: &[&Tensor]) -> Self {
        Self {
            op,
            dtypes: inputs.iter().map(|t| t.dtype()).collect(),
            devices: inputs.iter().map(|t| t.device().kind()).collect(),
        }
    }
}

/// Table of kernels.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    kernels: HashMap<KernelKey, KernelFn>,
}

impl KernelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in kernels.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        kernels::register_defaults(&mut registry);
        registry
    }

    /// Register `kernel`, replacing any previous kernel for the same key.
    pub fn register(&mut self, key: KernelKey, kernel: KernelFn) {
        if self.kernels.insert(key.clone(), kernel).is_some() {
            log::debug!("replaced kernel for {} {:?} {:?}", key.op, key.dtypes, key.devices);
        }
    }

    /// Look up the kernel for `key`.
    pub fn select(&self, key: &KernelKey) -> Option<KernelFn> {
        self.kernels.get(key).copied()
    }

    pub fn contains(&self, key: &KernelKey) -> bool {
        self.kernels.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

static REGISTRY: LazyLock<RwLock<KernelRegistry>> =
    LazyLock::new(|| RwLock::new(KernelRegistry::with_defaults()));

/// Register a kernel in the global registry.
pub fn register_kernel(key: KernelKey, kernel: KernelFn) {
    REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(key, kernel);
}

/// Check if the global registry has a kernel for `key`.
pub fn has_kernel(key: &KernelKey) -> bool {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(key)
}

/// Select the kernel for `key` from the global registry.
///
/// # Errors
/// `UnsupportedOperation` if no kernel is registered for the combination.
pub fn select(key: &KernelKey, devices: &[Device]) -> Result<KernelFn, TensorError> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .select(key)
        .ok_or_else(|| TensorError::UnsupportedOperation {
            op: key.op.to_string(),
            dtypes: key.dtypes.to_vec(),
            devices: devices.to_vec(),
        })
}

/// Run `op` on `inputs` with the kernel matching their dtypes and devices.
///
/// Does not record anything on the autograd tape; see [`crate::operations`]
/// for the differentiable wrappers.
///
/// # Errors
/// - `DeviceMismatch` if the inputs live on different devices.
/// - `UnsupportedOperation` if no kernel matches.
/// - Whatever the kernel itself reports.
pub fn dispatch(
    op: OpKind,
    inputs: &[&Tensor],
    attrs: &OpAttrs,
) -> Result<Vec<Tensor>, TensorError> {
    let devices: Vec<Device> = inputs.iter().map(|t| t.device()).collect();
    if devices.windows(2).any(|w| w[0] != w[1]) {
        return Err(TensorError::DeviceMismatch {
            op: op.to_string(),
            devices,
        });
    }

    let key = KernelKey::for_inputs(op, inputs);
    let kernel = select(&key, &devices)?;

    for input in inputs {
        input.mark_used();
    }
    log::trace!("dispatch {op} dtypes={:?} devices={:?}", key.dtypes, devices);
    kernel(inputs, attrs)
}

/// Dispatch and take the single output.
pub(crate) fn dispatch_one(
    op: OpKind,
    inputs: &[&Tensor],
    attrs: &OpAttrs,
) -> Result<Tensor, TensorError> {
    dispatch(op, inputs, attrs)?
        .into_iter()
        .next()
        .ok_or_else(|| TensorError::invalid_argument(format!("kernel for {op} produced no output")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_float_on_both_devices() {
        let registry = KernelRegistry::with_defaults();
        for dtype in [DType::F32, DType::F64] {
            for kind in [DeviceKind::Cpu, DeviceKind::Accelerator] {
                let key = KernelKey::new(OpKind::Add, &[dtype, dtype], &[kind, kind]);
                assert!(registry.contains(&key));
            }
        }
    }

    #[test]
    fn test_no_integer_relu() {
        let registry = KernelRegistry::with_defaults();
        let key = KernelKey::new(OpKind::Relu, &[DType::I64], &[DeviceKind::Cpu]);
        assert!(registry.select(&key).is_none());
    }

    #[test]
    fn test_mixed_dtypes_miss() {
        let a = Tensor::from_vec(vec![1.0f32], &[1]).unwrap();
        let b = Tensor::from_vec(vec![1.0f64], &[1]).unwrap();
        let err = dispatch(OpKind::Add, &[&a, &b], &OpAttrs::None).unwrap_err();
        assert!(matches!(err, TensorError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_device_mismatch() {
        let a = Tensor::from_vec_on(vec![1.0f32], &[1], Device::Cpu).unwrap();
        let b = Tensor::from_vec_on(vec![1.0f32], &[1], Device::Accelerator(0)).unwrap();
        let err = dispatch(OpKind::Add, &[&a, &b], &OpAttrs::None).unwrap_err();
        assert!(matches!(err, TensorError::DeviceMismatch { .. }));
    }

    #[test]
    fn test_register_custom() {
        fn double(inputs: &[&Tensor], _: &OpAttrs) -> Result<Vec<Tensor>, TensorError> {
            let x: Vec<f64> = inputs[0].to_vec()?;
            let out = x.iter().map(|v| v * 2.0).collect();
            Ok(vec![Tensor::from_vec(out, inputs[0].shape())?])
        }

        let op = OpKind::Custom("double_dispatch_test");
        register_kernel(KernelKey::new(op, &[DType::F64], &[DeviceKind::Cpu]), double);
        let x = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let y = dispatch_one(op, &[&x], &OpAttrs::None).unwrap();
        assert_eq!(y.to_vec::<f64>().unwrap(), vec![2.0, 4.0]);
    }
}
