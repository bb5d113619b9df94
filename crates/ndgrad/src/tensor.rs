//! N-dimensional tensor handle over shared storage.
//!
//! ```text
//! Tensor (Rc<TensorImpl>)
//! ├── Storage  - shared with every view of the same data
//! ├── Layout   - shape, strides, offset
//! └── AutogradMeta
//!     ├── requires_grad
//!     ├── grad_fn  - producing tape node (None for leaves)
//!     └── grad     - accumulated gradient (leaves)
//! ```
//!
//! Cloning a `Tensor` clones the handle: both clones have the same
//! [`TensorId`] and the same gradient slot. Views create new tensors that
//! share only the storage.

use crate::autodiff::{self, NodeId, is_grad_enabled};
use crate::device::Device;
use crate::dtype::DType;
use crate::error::TensorError;
use crate::layout::{Layout, numel};
use crate::operations;
use crate::scalar::Element;
use crate::storage::{Buffer, Storage};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Unique identity of a tensor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor#{}", self.0)
    }
}

static TENSOR_COUNTER: AtomicUsize = AtomicUsize::new(1);

fn next_tensor_id() -> TensorId {
    TensorId(TENSOR_COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Default)]
pub(crate) struct AutogradMeta {
    requires_grad: bool,
    grad_fn: Option<NodeId>,
    grad: Option<Tensor>,
    used: bool,
}

#[derive(Debug)]
pub(crate) struct TensorImpl {
    id: TensorId,
    storage: Storage,
    layout: Layout,
    autograd: RefCell<AutogradMeta>,
}

impl Drop for TensorImpl {
    fn drop(&mut self) {
        if let Some(node) = self.autograd.get_mut().grad_fn {
            autodiff::release_output(node);
        }
    }
}

/// A strided view over a [`Storage`] with optional gradient tracking.
#[derive(Clone)]
pub struct Tensor {
    inner: Rc<TensorImpl>,
}

impl Tensor {
    pub(crate) fn from_parts(storage: Storage, layout: Layout) -> Self {
        Self {
            inner: Rc::new(TensorImpl {
                id: next_tensor_id(),
                storage,
                layout,
                autograd: RefCell::new(AutogradMeta::default()),
            }),
        }
    }

    /// Wrap a storage with an explicit layout.
    ///
    /// # Errors
    /// `ViewOutOfBounds` if the layout addresses elements past the storage end,
    /// or so many that its extent does not fit in `usize`.
    pub fn from_storage(storage: Storage, layout: Layout) -> Result<Self, TensorError> {
        let required = layout.required_len().unwrap_or(usize::MAX);
        if required > storage.len() {
            return Err(TensorError::ViewOutOfBounds {
                required,
                capacity: storage.len(),
            });
        }
        Ok(Self::from_parts(storage, layout))
    }

    /// Create a contiguous tensor owning `buffer`.
    ///
    /// # Errors
    /// `ShapeMismatch` if the buffer length does not match the shape.
    pub fn from_buffer(buffer: Buffer, shape: &[usize], device: Device) -> Result<Self, TensorError> {
        let expected = numel(shape);
        if buffer.len() != expected {
            return Err(TensorError::ShapeMismatch {
                expected,
                actual: buffer.len(),
            });
        }
        let storage = Storage::from_buffer(buffer, device)?;
        Ok(Self::from_parts(storage, Layout::contiguous(shape)))
    }

    /// Create a zero-initialized tensor.
    ///
    /// # Examples
    ///
    /// ```
    /// use ndgrad::{DType, Device, Tensor};
    ///
    /// let t = Tensor::zeros(&[2, 3, 4], DType::F32, Device::Cpu).unwrap();
    /// assert_eq!(t.shape(), &[2, 3, 4]);
    /// assert_eq!(t.numel(), 24);
    /// ```
    pub fn zeros(shape: &[usize], dtype: DType, device: Device) -> Result<Self, TensorError> {
        let storage = Storage::allocate(numel(shape), dtype, device)?;
        Ok(Self::from_parts(storage, Layout::contiguous(shape)))
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: &[usize], dtype: DType, device: Device) -> Result<Self, TensorError> {
        Self::full(shape, 1.0, dtype, device)
    }

    /// Create a tensor filled with `value`.
    pub fn full(
        shape: &[usize],
        value: f64,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorError> {
        let storage = Storage::allocate_full(numel(shape), value, dtype, device)?;
        Ok(Self::from_parts(storage, Layout::contiguous(shape)))
    }

    /// Create a CPU tensor from row-major data.
    ///
    /// # Examples
    ///
    /// ```
    /// use ndgrad::Tensor;
    ///
    /// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// assert_eq!(t.get::<f64>(&[0, 1]).unwrap(), 2.0);
    /// assert_eq!(t.get::<f64>(&[1, 0]).unwrap(), 4.0);
    /// ```
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Self, TensorError> {
        Self::from_vec_on(data, shape, Device::Cpu)
    }

    /// Create a tensor on `device` from row-major data.
    pub fn from_vec_on<T: Element>(
        data: Vec<T>,
        shape: &[usize],
        device: Device,
    ) -> Result<Self, TensorError> {
        Self::from_buffer(Buffer::from_vec(data), shape, device)
    }

    /// Create a 0-dimensional CPU tensor.
    pub fn scalar<T: Element>(value: T) -> Result<Self, TensorError> {
        Self::from_vec(vec![value], &[])
    }

    #[inline]
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.inner.layout.shape()
    }

    /// Element strides.
    #[inline]
    pub fn strides(&self) -> &[usize] {
        self.inner.layout.strides()
    }

    /// Strides in bytes.
    pub fn byte_strides(&self) -> Vec<usize> {
        let size = self.dtype().size_in_bytes();
        self.strides().iter().map(|&s| s.saturating_mul(size)).collect()
    }

    /// Offset of the first element in the storage, in elements.
    #[inline]
    pub fn offset(&self) -> usize {
        self.inner.layout.offset()
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.inner.layout.ndim()
    }

    /// Number of logical elements.
    #[inline]
    pub fn numel(&self) -> usize {
        self.inner.layout.numel()
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.inner.storage.dtype()
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.inner.storage.device()
    }

    #[inline]
    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// Check if this tensor shares storage with another tensor.
    pub fn shares_storage_with(&self, other: &Tensor) -> bool {
        self.inner.storage.shares_with(&other.inner.storage)
    }

    /// Copy the logical elements, in row-major order, into a new buffer.
    pub fn to_buffer(&self) -> Buffer {
        if self.is_contiguous() && self.offset() == 0 && self.numel() == self.storage().len() {
            return self.inner.storage.snapshot();
        }
        self.inner.storage.gather(&self.inner.layout.positions())
    }

    /// Copy the logical elements into a typed vector.
    ///
    /// # Errors
    /// `DTypeMismatch` if `T` is not the tensor's element type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, TensorError> {
        let positions = self.inner.layout.positions();
        self.inner
            .storage
            .with_slice(|data: &[T]| positions.iter().map(|&p| data[p]).collect())
    }

    /// Copy the logical elements, converted to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.to_buffer().to_f64_vec()
    }

    /// Value of a single-element tensor.
    pub fn item<T: Element>(&self) -> Result<T, TensorError> {
        if self.numel() != 1 {
            return Err(TensorError::ShapeMismatch {
                expected: 1,
                actual: self.numel(),
            });
        }
        self.inner.storage.read(self.inner.layout.position(&vec![0; self.ndim()]))
    }

    /// Get element by cartesian indices.
    pub fn get<T: Element>(&self, indices: &[usize]) -> Result<T, TensorError> {
        let position = self.checked_position(indices)?;
        self.inner.storage.read(position)
    }

    /// Set element by cartesian indices (in-place write).
    ///
    /// # Errors
    /// `InPlaceOnTracked` if this tensor requires grad while grad mode is on,
    /// `StoragePinned` if the storage is saved for backward.
    pub fn set<T: Element>(&self, indices: &[usize], value: T) -> Result<(), TensorError> {
        self.check_inplace()?;
        let position = self.checked_position(indices)?;
        self.inner.storage.write(position, value)
    }

    /// Fill all elements with a value (in-place write).
    pub fn fill_(&self, value: f64) -> Result<(), TensorError> {
        self.check_inplace()?;
        let positions = self.inner.layout.positions();
        let src = Buffer::full(self.dtype(), positions.len(), value);
        self.inner.storage.scatter(&positions, &src)
    }

    /// Copy `src` element-wise into this tensor (in-place write).
    ///
    /// The write goes through this tensor's layout, so it is visible through
    /// every view aliasing the same storage.
    pub fn copy_(&self, src: &Tensor) -> Result<(), TensorError> {
        self.check_inplace()?;
        if src.shape() != self.shape() {
            return Err(TensorError::IncompatibleShapes {
                op: "copy_".to_string(),
                lhs: self.shape().to_vec(),
                rhs: src.shape().to_vec(),
            });
        }
        if src.dtype() != self.dtype() {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype(),
                actual: src.dtype(),
            });
        }
        let data = src.to_buffer();
        self.inner
            .storage
            .scatter(&self.inner.layout.positions(), &data)
    }

    pub(crate) fn check_inplace(&self) -> Result<(), TensorError> {
        if is_grad_enabled() && self.requires_grad() {
            return Err(TensorError::InPlaceOnTracked { tensor: self.id() });
        }
        Ok(())
    }

    fn checked_position(&self, indices: &[usize]) -> Result<usize, TensorError> {
        if indices.len() != self.ndim() {
            return Err(TensorError::WrongNumberOfIndices {
                expected: self.ndim(),
                actual: indices.len(),
            });
        }
        for (&idx, &dim) in indices.iter().zip(self.shape().iter()) {
            if idx >= dim {
                return Err(TensorError::IndexOutOfBounds {
                    index: idx,
                    dim_size: dim,
                });
            }
        }
        Ok(self.inner.layout.position(indices))
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// View the same storage with a new shape and element strides.
    ///
    /// # Errors
    /// `ViewOutOfBounds` if the view would read past the end of the storage.
    pub fn view(&self, shape: &[usize], strides: &[usize]) -> Result<Tensor, TensorError> {
        self.view_with_offset(shape, strides, self.offset())
    }

    /// Like [`Tensor::view`] with an explicit storage offset.
    pub fn view_with_offset(
        &self,
        shape: &[usize],
        strides: &[usize],
        offset: usize,
    ) -> Result<Tensor, TensorError> {
        operations::as_strided(self, Layout::new(shape, strides, offset)?)
    }

    /// Reshape, sharing storage when the tensor is contiguous.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor, TensorError> {
        operations::reshape(self, shape)
    }

    /// Permute dimensions without copying.
    pub fn permute(&self, perm: &[usize]) -> Result<Tensor, TensorError> {
        operations::permute(self, perm)
    }

    /// Transpose a 2-D tensor without copying.
    pub fn t(&self) -> Result<Tensor, TensorError> {
        operations::transpose(self)
    }

    /// Contiguous tensor with the same values; `self` if already contiguous.
    pub fn contiguous(&self) -> Result<Tensor, TensorError> {
        operations::contiguous(self)
    }

    // ------------------------------------------------------------------
    // Autograd
    // ------------------------------------------------------------------

    /// Check if this tensor tracks gradients.
    pub fn requires_grad(&self) -> bool {
        self.inner.autograd.borrow().requires_grad
    }

    /// Check if this tensor has no producing node.
    pub fn is_leaf(&self) -> bool {
        self.inner.autograd.borrow().grad_fn.is_none()
    }

    /// Producing tape node, if any.
    pub fn grad_fn(&self) -> Option<NodeId> {
        self.inner.autograd.borrow().grad_fn
    }

    /// Enable or disable gradient tracking on a leaf.
    ///
    /// # Errors
    /// - `NonLeafRequiresGrad` if the tensor was produced by an operation.
    /// - `RequiresGradAfterUse` if the tensor already fed an operation.
    /// - `NonFloatGrad` when enabling on an integer tensor.
    pub fn set_requires_grad(&self, requires_grad: bool) -> Result<(), TensorError> {
        let mut meta = self.inner.autograd.borrow_mut();
        if meta.grad_fn.is_some() {
            return Err(TensorError::NonLeafRequiresGrad { tensor: self.id() });
        }
        if meta.requires_grad == requires_grad {
            return Ok(());
        }
        if meta.used {
            return Err(TensorError::RequiresGradAfterUse { tensor: self.id() });
        }
        if requires_grad && !self.dtype().is_float() {
            return Err(TensorError::NonFloatGrad {
                dtype: self.dtype(),
            });
        }
        meta.requires_grad = requires_grad;
        Ok(())
    }

    /// Chainable form of [`Tensor::set_requires_grad`].
    pub fn requires_grad_(self, requires_grad: bool) -> Result<Self, TensorError> {
        self.set_requires_grad(requires_grad)?;
        Ok(self)
    }

    /// Accumulated gradient of a leaf.
    pub fn grad(&self) -> Option<Tensor> {
        self.inner.autograd.borrow().grad.clone()
    }

    /// Drop the accumulated gradient.
    pub fn zero_grad(&self) {
        self.inner.autograd.borrow_mut().grad = None;
    }

    /// New tensor sharing storage, without gradient tracking.
    pub fn detach(&self) -> Tensor {
        Self::from_parts(self.inner.storage.clone(), self.inner.layout.clone())
    }

    /// Run backward from this tensor with the default seed.
    pub fn backward(&self) -> Result<(), TensorError> {
        autodiff::backward(self, None)
    }

    pub(crate) fn mark_used(&self) {
        self.inner.autograd.borrow_mut().used = true;
    }

    pub(crate) fn set_grad_fn(&self, node: NodeId) {
        let mut meta = self.inner.autograd.borrow_mut();
        meta.requires_grad = true;
        meta.grad_fn = Some(node);
    }

    pub(crate) fn set_grad(&self, grad: Option<Tensor>) {
        self.inner.autograd.borrow_mut().grad = grad;
    }

    pub(crate) fn downgrade(&self) -> Weak<TensorImpl> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<TensorImpl>) -> Option<Tensor> {
        weak.upgrade().map(|inner| Tensor { inner })
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.inner.autograd.borrow();
        f.debug_struct("Tensor")
            .field("id", &self.inner.id)
            .field("shape", &self.shape())
            .field("strides", &self.strides())
            .field("dtype", &self.dtype())
            .field("device", &self.device())
            .field("requires_grad", &meta.requires_grad)
            .field("grad_fn", &meta.grad_fn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros() {
        let t = Tensor::zeros(&[2, 3], DType::F64, Device::Cpu).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.strides(), &[3, 1]);
        assert_eq!(t.byte_strides(), vec![24, 8]);
        assert_eq!(t.to_vec::<f64>().unwrap(), vec![0.0; 6]);
    }

    #[test]
    fn test_from_vec_shape_mismatch() {
        let result = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[2, 2]);
        assert!(matches!(
            result,
            Err(TensorError::ShapeMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_scalar_item() {
        let t = Tensor::scalar(3.5f32).unwrap();
        assert_eq!(t.ndim(), 0);
        assert_eq!(t.numel(), 1);
        assert_eq!(t.item::<f32>().unwrap(), 3.5);
    }

    #[test]
    fn test_get_set() {
        let t = Tensor::zeros(&[2, 3], DType::F64, Device::Cpu).unwrap();
        t.set(&[1, 2], 5.0f64).unwrap();
        assert_eq!(t.get::<f64>(&[1, 2]).unwrap(), 5.0);
        assert!(t.get::<f64>(&[2, 0]).is_err());
        assert!(t.get::<f64>(&[0]).is_err());
    }

    #[test]
    fn test_clone_shares_identity() {
        let t = Tensor::zeros(&[2], DType::F32, Device::Cpu).unwrap();
        let c = t.clone();
        assert_eq!(t.id(), c.id());
        let d = t.detach();
        assert_ne!(t.id(), d.id());
        assert!(t.shares_storage_with(&d));
    }

    #[test]
    fn test_requires_grad_leaf_only_before_use() {
        let t = Tensor::zeros(&[2], DType::F64, Device::Cpu).unwrap();
        t.set_requires_grad(true).unwrap();
        assert!(t.requires_grad());
        assert!(t.is_leaf());

        t.mark_used();
        assert!(matches!(
            t.set_requires_grad(false),
            Err(TensorError::RequiresGradAfterUse { .. })
        ));
        // Setting the current value again is not a transition.
        t.set_requires_grad(true).unwrap();
    }

    #[test]
    fn test_requires_grad_rejects_integers() {
        let t = Tensor::from_vec(vec![1i64, 2], &[2]).unwrap();
        assert!(matches!(
            t.set_requires_grad(true),
            Err(TensorError::NonFloatGrad { .. })
        ));
    }

    #[test]
    fn test_inplace_on_tracked_rejected() {
        let t = Tensor::zeros(&[2], DType::F64, Device::Cpu)
            .unwrap()
            .requires_grad_(true)
            .unwrap();
        assert!(matches!(
            t.fill_(1.0),
            Err(TensorError::InPlaceOnTracked { .. })
        ));
        autodiff::no_grad(|| t.fill_(1.0)).unwrap();
        assert_eq!(t.to_vec::<f64>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_copy_into_strided() {
        let base = Tensor::zeros(&[2, 2], DType::F64, Device::Cpu).unwrap();
        let col = base.view(&[2], &[2]).unwrap();
        col.copy_(&Tensor::from_vec(vec![7.0, 8.0], &[2]).unwrap())
            .unwrap();
        assert_eq!(base.to_vec::<f64>().unwrap(), vec![7.0, 0.0, 8.0, 0.0]);
    }
}
