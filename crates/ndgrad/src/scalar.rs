//! Element and scalar traits for tensor element types.

use crate::dtype::DType;
use crate::storage::Buffer;
use num_traits::Float;
use std::fmt::Debug;

/// Trait for types that can be stored in a [`Buffer`].
///
/// Connects a Rust type to its runtime [`DType`] tag and to the matching
/// buffer variant.
pub trait Element: Copy + Debug + Default + PartialEq + Send + 'static {
    /// Runtime tag of this element type.
    const DTYPE: DType;

    /// Borrow the buffer contents if it holds this element type.
    fn slice(buffer: &Buffer) -> Option<&[Self]>;

    /// Mutably borrow the buffer contents if it holds this element type.
    fn slice_mut(buffer: &mut Buffer) -> Option<&mut [Self]>;

    /// Wrap a vector into a buffer.
    fn into_buffer(data: Vec<Self>) -> Buffer;

    /// Lossy conversion from `f64`.
    fn from_f64(value: f64) -> Self;

    /// Lossy conversion to `f64`.
    fn to_f64(self) -> f64;
}

/// Floating point element types. Kernels and gradients are defined over these.
pub trait Scalar: Element + Float {}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn slice(buffer: &Buffer) -> Option<&[Self]> {
        match buffer {
            Buffer::F32(data) => Some(data),
            _ => None,
        }
    }

    fn slice_mut(buffer: &mut Buffer) -> Option<&mut [Self]> {
        match buffer {
            Buffer::F32(data) => Some(data),
            _ => None,
        }
    }

    fn into_buffer(data: Vec<Self>) -> Buffer {
        Buffer::F32(data)
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn slice(buffer: &Buffer) -> Option<&[Self]> {
        match buffer {
            Buffer::F64(data) => Some(data),
            _ => None,
        }
    }

    fn slice_mut(buffer: &mut Buffer) -> Option<&mut [Self]> {
        match buffer {
            Buffer::F64(data) => Some(data),
            _ => None,
        }
    }

    fn into_buffer(data: Vec<Self>) -> Buffer {
        Buffer::F64(data)
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }
}

impl Element for i64 {
    const DTYPE: DType = DType::I64;

    fn slice(buffer: &Buffer) -> Option<&[Self]> {
        match buffer {
            Buffer::I64(data) => Some(data),
            _ => None,
        }
    }

    fn slice_mut(buffer: &mut Buffer) -> Option<&mut [Self]> {
        match buffer {
            Buffer::I64(data) => Some(data),
            _ => None,
        }
    }

    fn into_buffer(data: Vec<Self>) -> Buffer {
        Buffer::I64(data)
    }

    fn from_f64(value: f64) -> Self {
        value as i64
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Scalar for f32 {}
impl Scalar for f64 {}
