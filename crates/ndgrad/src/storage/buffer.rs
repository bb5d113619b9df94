//! Typed element buffers.

use crate::dtype::DType;
use crate::scalar::Element;
use std::collections::TryReserveError;

/// Contiguous element buffer tagged with its element type.
///
/// This is the raw payload of a [`Storage`](super::Storage). Each variant
/// owns a `Vec` of the matching Rust type, so typed access is a match on the
/// variant rather than a byte reinterpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl Buffer {
    /// Create a zero-initialized buffer.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Buffer::F32(vec![0.0; len]),
            DType::F64 => Buffer::F64(vec![0.0; len]),
            DType::I64 => Buffer::I64(vec![0; len]),
        }
    }

    /// Create a buffer filled with `value` (converted to the element type).
    pub fn full(dtype: DType, len: usize, value: f64) -> Self {
        match dtype {
            DType::F32 => Buffer::F32(vec![value as f32; len]),
            DType::F64 => Buffer::F64(vec![value; len]),
            DType::I64 => Buffer::I64(vec![value as i64; len]),
        }
    }

    /// Like [`Buffer::full`], but reports a length the host cannot hold
    /// instead of aborting.
    pub fn try_full(dtype: DType, len: usize, value: f64) -> Result<Self, TryReserveError> {
        fn filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>, TryReserveError> {
            let mut data = Vec::new();
            data.try_reserve_exact(len)?;
            data.resize(len, value);
            Ok(data)
        }
        Ok(match dtype {
            DType::F32 => Buffer::F32(filled(len, value as f32)?),
            DType::F64 => Buffer::F64(filled(len, value)?),
            DType::I64 => Buffer::I64(filled(len, value as i64)?),
        })
    }

    /// Create a buffer from a typed vector.
    pub fn from_vec<T: Element>(data: Vec<T>) -> Self {
        T::into_buffer(data)
    }

    /// Element type of this buffer.
    pub fn dtype(&self) -> DType {
        match self {
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
            Buffer::I64(_) => DType::I64,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(d) => d.len(),
            Buffer::F64(d) => d.len(),
            Buffer::I64(d) => d.len(),
        }
    }

    /// Check if buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the payload in bytes.
    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }

    /// Typed view of the elements, `None` on dtype mismatch.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    /// Typed mutable view of the elements, `None` on dtype mismatch.
    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        T::slice_mut(self)
    }

    /// Gather elements at the given positions into a new buffer.
    pub(crate) fn gather(&self, positions: &[usize]) -> Buffer {
        match self {
            Buffer::F32(d) => Buffer::F32(positions.iter().map(|&p| d[p]).collect()),
            Buffer::F64(d) => Buffer::F64(positions.iter().map(|&p| d[p]).collect()),
            Buffer::I64(d) => Buffer::I64(positions.iter().map(|&p| d[p]).collect()),
        }
    }

    /// Scatter `src` element `i` to position `positions[i]`.
    ///
    /// Returns `false` without writing on dtype mismatch.
    pub(crate) fn scatter(&mut self, positions: &[usize], src: &Buffer) -> bool {
        match (self, src) {
            (Buffer::F32(d), Buffer::F32(s)) => scatter_into(d, positions, s),
            (Buffer::F64(d), Buffer::F64(s)) => scatter_into(d, positions, s),
            (Buffer::I64(d), Buffer::I64(s)) => scatter_into(d, positions, s),
            _ => return false,
        }
        true
    }

    /// Lossy conversion of every element to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Buffer::F32(d) => d.iter().map(|&x| x as f64).collect(),
            Buffer::F64(d) => d.clone(),
            Buffer::I64(d) => d.iter().map(|&x| x as f64).collect(),
        }
    }
}

fn scatter_into<T: Copy>(dest: &mut [T], positions: &[usize], src: &[T]) {
    for (&p, &v) in positions.iter().zip(src.iter()) {
        dest[p] = v;
    }
}
