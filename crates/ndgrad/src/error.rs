//! Error types for ndgrad.

use crate::autodiff::NodeId;
use crate::device::Device;
use crate::dtype::DType;
use crate::tensor::TensorId;
use thiserror::Error;

/// Coarse classification of a [`TensorError`].
///
/// The C API maps each kind to a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Resource exhaustion (device memory, transfer workers).
    Allocation,
    /// Shape, rank, or index invariant violated.
    Shape,
    /// Invalid lifecycle transition (gradient tracking, in-place writes).
    State,
    /// No kernel for the requested operation/dtype/device combination.
    UnsupportedOperation,
    /// Tape integrity violation during backward.
    Graph,
    /// Invalid hyperparameter, configuration value, or typed access.
    InvalidArgument,
}

/// Errors that can occur in tensor operations.
#[derive(Debug, Error)]
pub enum TensorError {
    /// Device byte budget would be exceeded.
    #[error(
        "allocation of {requested} bytes on {device} failed: {in_use} of {limit} bytes in use"
    )]
    AllocationFailed {
        device: Device,
        requested: usize,
        in_use: usize,
        limit: usize,
    },

    /// Device transfer worker did not deliver its buffer.
    #[error("transfer to {device} failed: {message}")]
    TransferFailed { device: Device, message: String },

    /// Shape mismatch between data length and expected size.
    #[error("shape mismatch: expected {expected} elements, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Operand shapes are not compatible for an operation.
    #[error("incompatible shapes for {op}: {lhs:?} and {rhs:?}")]
    IncompatibleShapes {
        op: String,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    /// A view addresses elements beyond the storage capacity.
    #[error("view requires {required} storage elements, storage holds {capacity}")]
    ViewOutOfBounds { required: usize, capacity: usize },

    /// Index out of bounds.
    #[error("index out of bounds: index {index} is out of range for dimension {dim_size}")]
    IndexOutOfBounds { index: usize, dim_size: usize },

    /// Wrong number of indices provided.
    #[error("wrong number of indices: expected {expected}, got {actual}")]
    WrongNumberOfIndices { expected: usize, actual: usize },

    /// Invalid permutation.
    #[error("invalid permutation {perm:?} for tensor with {ndim} dimensions")]
    InvalidPermutation { perm: Vec<usize>, ndim: usize },

    /// Operation requires specific tensor rank.
    #[error("expected tensor of rank {expected}, got rank {actual}")]
    RankMismatch { expected: usize, actual: usize },

    /// `requires_grad` toggled on a tensor produced by an operation.
    #[error("requires_grad can only be changed on leaf tensors ({tensor} is not a leaf)")]
    NonLeafRequiresGrad { tensor: TensorId },

    /// `requires_grad` toggled after the tensor took part in an operation.
    #[error("requires_grad cannot be changed on {tensor} after it was used in an operation")]
    RequiresGradAfterUse { tensor: TensorId },

    /// In-place write into a tensor that tracks gradients.
    #[error("in-place modification of {tensor}, which requires grad, is not allowed")]
    InPlaceOnTracked { tensor: TensorId },

    /// In-place write into a storage whose values are saved for backward.
    #[error("storage is saved by {pins} pending backward node(s) and cannot be modified in place")]
    StoragePinned { pins: usize },

    /// No kernel registered for the requested combination.
    #[error("no kernel for {op} with dtypes {dtypes:?} on devices {devices:?}")]
    UnsupportedOperation {
        op: String,
        dtypes: Vec<DType>,
        devices: Vec<Device>,
    },

    /// Inputs of one operation live on different devices.
    #[error("{op} received inputs on different devices: {devices:?}")]
    DeviceMismatch { op: String, devices: Vec<Device> },

    /// Accelerator ordinal outside the configured range.
    #[error("device {device} is not available ({available} accelerator(s) configured)")]
    UnknownDevice { device: Device, available: usize },

    /// Only floating point tensors can track gradients.
    #[error("only floating point tensors can require grad, got {dtype}")]
    NonFloatGrad { dtype: DType },

    /// A cycle was found while walking the tape.
    #[error("cycle detected in autograd tape at node {node}")]
    CycleDetected { node: NodeId },

    /// A non-leaf tensor's producing node is no longer on the tape.
    #[error("tensor {tensor} is not a leaf but its producing node {node} is not on the tape")]
    MissingProducer { tensor: TensorId, node: NodeId },

    /// A node was executed twice, or its saved state was already released.
    #[error(
        "node {node} ({op}) was already executed and its saved state freed; \
         pass retain_graph to backward through it again"
    )]
    NodeAlreadyExecuted { node: NodeId, op: String },

    /// A backward function returned the wrong number of gradients.
    #[error("backward of node {node} returned {actual} gradients for {expected} inputs")]
    GradientArity {
        node: NodeId,
        expected: usize,
        actual: usize,
    },

    /// Element type does not match the requested type.
    #[error("dtype mismatch: expected {expected}, got {actual}")]
    DTypeMismatch { expected: DType, actual: DType },

    /// Invalid hyperparameter value.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Invalid configuration value.
    #[error("invalid value {value:?} for configuration key {key}")]
    InvalidConfig { key: String, value: String },
}

impl TensorError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AllocationFailed { .. } | Self::TransferFailed { .. } => ErrorKind::Allocation,
            Self::ShapeMismatch { .. }
            | Self::IncompatibleShapes { .. }
            | Self::ViewOutOfBounds { .. }
            | Self::IndexOutOfBounds { .. }
            | Self::WrongNumberOfIndices { .. }
            | Self::InvalidPermutation { .. }
            | Self::RankMismatch { .. } => ErrorKind::Shape,
            Self::NonLeafRequiresGrad { .. }
            | Self::RequiresGradAfterUse { .. }
            | Self::InPlaceOnTracked { .. }
            | Self::StoragePinned { .. } => ErrorKind::State,
            Self::UnsupportedOperation { .. }
            | Self::DeviceMismatch { .. }
            | Self::UnknownDevice { .. }
            | Self::NonFloatGrad { .. } => ErrorKind::UnsupportedOperation,
            Self::CycleDetected { .. }
            | Self::MissingProducer { .. }
            | Self::NodeAlreadyExecuted { .. }
            | Self::GradientArity { .. } => ErrorKind::Graph,
            Self::DTypeMismatch { .. } | Self::InvalidArgument { .. } | Self::InvalidConfig { .. } => {
                ErrorKind::InvalidArgument
            }
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}
